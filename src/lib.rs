#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod cache;
mod core;
mod error;
mod executor;
mod graph;
mod model;
mod property;
mod report;

use std::sync::Arc;

pub use crate::blueprint::Blueprint;
pub use crate::core::PropertyValue;
pub use crate::error::{BuildError, GraphError, ModelError, PropertyError};
pub use crate::executor::{ActionContext, CancelToken, Options};
pub use crate::graph::{EdgeKind, Targets, TaskGraph};
pub use crate::model::{ProjectId, TaskId};
pub use crate::property::{Property, PropertyId, PropertyKind, Upstream};
pub use crate::report::{BuildReport, SkipReason, TaskReport, TaskState};

use crate::cache::ResultCache;
use crate::model::Model;

/// A frozen build description, ready to be inspected or executed.
///
/// Produced by [`Blueprint::finish`]. The task and property structure can no
/// longer change; running the build only advances property resolution state.
pub struct Build {
    model: Model,
}

impl Build {
    pub(crate) fn new(model: Model) -> Self {
        Self { model }
    }

    pub(crate) fn model(&self) -> &Model {
        &self.model
    }

    /// Builds and validates the dependency graph for a target selection
    /// without executing anything. Fails on dependency cycles and unknown
    /// target paths.
    pub fn graph(&self, targets: &Targets) -> Result<TaskGraph, GraphError> {
        TaskGraph::build(&self.model, targets)
    }

    /// Runs the build: validates the graph, executes the scheduled tasks in
    /// parallel, and returns the per-task outcomes.
    ///
    /// Errors are structural problems found before execution starts. Once
    /// tasks run, individual failures do not abort the build; they are
    /// recorded in the [`BuildReport`] and skip their transitive dependents.
    /// Cache I/O problems are logged, never propagated — with caching
    /// enabled, the outcome of a build stays the same, only its speed
    /// changes.
    pub fn run(&self, options: Options) -> Result<BuildReport, BuildError> {
        let graph = self.graph(&options.targets)?;
        tracing::info!(tasks = graph.len(), "starting build");

        let mut cache = options
            .cache_path
            .as_deref()
            .map(ResultCache::load);

        let report =
            executor::run(&self.model, &graph, &options, cache.as_mut());

        if let (Some(cache), Some(path)) = (&cache, &options.cache_path) {
            if let Err(err) = cache.save(path) {
                tracing::warn!("failed to persist result cache: {err}");
            }
        }
        Ok(report)
    }

    /// Reads a property after a run, e.g. to extract a task's output value.
    /// Fails if the property never resolved.
    pub fn value<T: PropertyValue>(
        &self,
        prop: Property<T>,
    ) -> Result<Arc<T>, PropertyError> {
        let value = self.model.resolve(prop.id())?;
        Ok(value
            .data
            .downcast::<T>()
            .ok()
            .expect("property value type was checked when the property was wired"))
    }

    /// Looks a task up by its full path, e.g. `app/dockerBuild`.
    pub fn task_by_path(&self, path: &str) -> Option<TaskId> {
        self.model.task_by_path(path)
    }

    /// The full path of a task.
    pub fn task_path(&self, task: TaskId) -> &str {
        self.model.task_path(task)
    }
}

/// Installs the default `tracing` subscriber, reading the filter from
/// `RUST_LOG`. Call once, before running builds.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}
