use std::sync::Arc;

use thiserror::Error;

/// Errors raised by property cells during wiring or resolution.
#[derive(Debug, Error, Clone)]
pub enum PropertyError {
    #[error("property '{path}' was read before being given a value")]
    Unset { path: String },

    #[error("property '{path}' is finalized and can no longer be set")]
    AlreadyFinalized { path: String },

    #[error(
        "type mismatch: cannot wire '{to}' ({to_type}) to '{from}' ({from_type})"
    )]
    TypeMismatch {
        from: String,
        from_type: &'static str,
        to: String,
        to_type: &'static str,
    },

    #[error("task '{task}' has no property named '{name}'")]
    NoSuchProperty { task: String, name: String },

    #[error("task '{task}' may not access property '{path}' of another task")]
    NotOwned { task: String, path: String },

    #[error("failed to derive value for property '{path}': {error}")]
    Derivation {
        path: String,
        error: Arc<anyhow::Error>,
    },
}

/// Errors raised while assembling the project/task model.
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    #[error("name '{name}' is already taken in project '{project}'")]
    DuplicateName { project: String, name: String },

    #[error("name '{name}' is already taken on task '{task}'")]
    DuplicateProperty { task: String, name: String },

    #[error("no task exists at path '{0}'")]
    NoSuchTask(String),
}

/// Errors raised by the graph builder, before any task executes.
#[derive(Debug, Error, Clone)]
pub enum GraphError {
    /// The dependency graph contains a cycle. The payload lists the task
    /// paths on the cycle, in order, with the first task repeated at the end.
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("no task matches target '{0}'")]
    UnknownTarget(String),
}

/// Errors raised by the result cache layer. These never surface to callers;
/// the executor and the cache itself downgrade them to warnings, since the
/// cache may change build performance but never build outcome.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to write cache file '{path}': {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to encode cached value: {0}")]
    Encode(String),

    #[error("failed to decode cached value: {0}")]
    Decode(String),
}

/// Structural failures that abort the build before any task executes.
///
/// Individual task failures are not part of this enum; they are recorded in
/// the [`BuildReport`](crate::BuildReport) and propagate only to the failed
/// task's transitive successors.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
