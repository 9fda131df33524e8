//! Dependency ordering of the operations in a request.
//!
//! Depth-first topological sort with three-colour marking. An operation is
//! emitted only after every operation it depends on; operations with no
//! ordering constraint between them keep their submission order.

use std::collections::HashMap;

use crate::result::codes;
use crate::types::Operation;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// `path` starts and ends with the same operation id.
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },
}

impl ResolveError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::CircularDependency { .. } => codes::CIRCULAR_DEPENDENCY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Returns the positions of `operations` in dependency order.
///
/// Dependencies naming ids that are not part of `operations` are ignored; the
/// validator reports them. When ids are duplicated, dependencies bind to the
/// first operation carrying the id.
///
/// # Errors
///
/// Returns [`ResolveError::CircularDependency`] if the graph has a cycle. No
/// partial order is produced in that case.
pub fn resolve_order(operations: &[Operation]) -> Result<Vec<usize>, ResolveError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(operations.len());
    for (pos, op) in operations.iter().enumerate() {
        index.entry(op.id.as_str()).or_insert(pos);
    }

    let mut marks = vec![Mark::Unvisited; operations.len()];
    let mut order = Vec::with_capacity(operations.len());
    // (operation position, next dependency to inspect)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..operations.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::Visiting;
        stack.push((root, 0));

        while let Some(&(node, cursor)) = stack.last() {
            let deps = &operations[node].dependencies;
            if cursor == deps.len() {
                marks[node] = Mark::Visited;
                order.push(node);
                stack.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let Some(&dep) = index.get(deps[cursor].as_str()) else {
                tracing::debug!(
                    operation = %operations[node].id,
                    dependency = %deps[cursor],
                    "ignoring dependency outside the request"
                );
                continue;
            };
            match marks[dep] {
                Mark::Visited => {}
                Mark::Unvisited => {
                    marks[dep] = Mark::Visiting;
                    stack.push((dep, 0));
                }
                Mark::Visiting => {
                    let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|&(n, _)| operations[n].id.clone())
                        .collect();
                    path.push(operations[dep].id.clone());
                    return Err(ResolveError::CircularDependency { path });
                }
            }
        }
    }

    Ok(order)
}

/// Reorders owned operations into dependency order.
///
/// # Errors
///
/// Returns [`ResolveError::CircularDependency`] if the graph has a cycle.
pub fn order_operations(operations: Vec<Operation>) -> Result<Vec<Operation>, ResolveError> {
    let order = resolve_order(&operations)?;
    let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|pos| slots[pos].take())
        .collect())
}
