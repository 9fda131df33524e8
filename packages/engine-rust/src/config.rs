/// Engine-level configuration shared by every batch the engine runs.
///
/// Per-request switches (concurrency, chunk size, error policy) live in
/// `bulkops_core::BatchOptions`; this struct holds what outlives a request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an undo context stays usable after its batch settles.
    pub undo_ttl_ms: u64,
    /// Interval between expired-undo sweeps in milliseconds.
    pub undo_sweep_interval_ms: u64,
    /// Delay before a retry, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
    /// Requests with more operations are rejected before a job is created.
    pub max_operations_per_request: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            undo_ttl_ms: 24 * 60 * 60 * 1000,
            undo_sweep_interval_ms: 60_000,
            retry_backoff_ms: 50,
            max_operations_per_request: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.undo_ttl_ms, 86_400_000);
        assert_eq!(config.undo_sweep_interval_ms, 60_000);
        assert_eq!(config.retry_backoff_ms, 50);
        assert_eq!(config.max_operations_per_request, 10_000);
    }
}
