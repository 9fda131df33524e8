//! Runs a JSON batch request against the in-memory reference domain.
//!
//! ```text
//! batch-runner request.json --seed seed.json --log-format json
//! ```
//!
//! The response is printed to stdout as JSON; logs go to stderr. Ctrl-C
//! cancels the running job between chunks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use bulkops_core::{validate_json, BatchRequest, BatchStatus, ProgressSnapshot};
use bulkops_engine::domain::{memory_router, MemoryStore, RulePolicy};
use bulkops_engine::{init_tracing, BatchEngine, EngineConfig, LogFormat, LogNotifier};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "batch-runner", about = "Execute a bulk operation request")]
struct Args {
    /// Path to a JSON `BatchRequest`.
    request: PathBuf,

    /// JSON file with records and templates to load before running.
    #[arg(long, env = "BULKOPS_SEED")]
    seed: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "BULKOPS_LOG_FORMAT")]
    log_format: LogFormat,

    /// Only validate the request and print the report.
    #[arg(long)]
    validate_only: bool,

    /// Undo the batch right after it settles.
    #[arg(long)]
    undo: bool,

    /// Reject assignments with more assignees than this.
    #[arg(long, env = "BULKOPS_MAX_ASSIGNEES")]
    max_assignees: Option<usize>,

    #[arg(long, env = "BULKOPS_UNDO_TTL_MS", default_value_t = EngineConfig::default().undo_ttl_ms)]
    undo_ttl_ms: u64,
}

/// Seed file layout: `{"records": {entity: {id: record}}, "templates": {id: body}}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Seed {
    records: HashMap<String, HashMap<String, Value>>,
    templates: HashMap<String, Value>,
}

async fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn load_seed(store: &MemoryStore, path: &Path) -> anyhow::Result<()> {
    let seed: Seed = serde_json::from_value(read_json(path).await?)
        .with_context(|| format!("decoding seed {}", path.display()))?;
    for (entity, records) in seed.records {
        for (id, record) in records {
            store.put(&entity, &id, record);
        }
    }
    for (id, body) in seed.templates {
        store.define_template(id, body);
    }
    tracing::info!(records = store.len(), "seed loaded");
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_format, "info")?;

    let document = read_json(&args.request).await?;
    let report = validate_json(&document);
    if args.validate_only || !report.valid {
        print_json(&report)?;
        return Ok(if report.valid {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }
    let mut request: BatchRequest =
        serde_json::from_value(document).context("decoding batch request")?;

    let store = Arc::new(MemoryStore::new());
    if let Some(seed) = &args.seed {
        load_seed(&store, seed).await?;
    }

    let config = EngineConfig {
        undo_ttl_ms: args.undo_ttl_ms,
        ..EngineConfig::default()
    };
    let engine = Arc::new(
        BatchEngine::new(config, memory_router(&store)).with_notifier(Arc::new(LogNotifier)),
    );

    if let Some(max) = args.max_assignees {
        request.options.policy_check = Some(Arc::new(RulePolicy::new().with_max_assignees(max)));
    }
    request.options.progress_observer = Some(Arc::new(|snapshot: &ProgressSnapshot| {
        tracing::info!(
            percent = snapshot.percent_complete,
            completed = snapshot.completed,
            failed = snapshot.failed,
            eta_ms = snapshot.eta_ms,
            "progress"
        );
    }));

    let request_id = request.request_id().to_string();
    let interrupt = {
        let engine = Arc::clone(&engine);
        let request_id = request_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(err) = engine.cancel(&request_id) {
                    tracing::warn!(code = err.code(), "cancel ignored: {err}");
                }
            }
        })
    };

    let mut sweeper = engine.spawn_undo_sweeper();
    let response = engine
        .execute(request)
        .await
        .with_context(|| format!("request {request_id} rejected"))?;
    interrupt.abort();
    print_json(&response)?;

    let mut exit = if response.status == BatchStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };

    if args.undo {
        let undone = engine
            .undo(&request_id)
            .await
            .with_context(|| format!("undoing {request_id}"))?;
        print_json(&undone)?;
        if undone.status != BatchStatus::Completed {
            exit = ExitCode::FAILURE;
        }
    }

    sweeper.stop().await;
    Ok(exit)
}
