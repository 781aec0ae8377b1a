//! Terminal per-task results and the aggregated build report.

use std::sync::Arc;
use std::time::Duration;

use console::style;

/// Why a task was skipped without running.
#[derive(Clone, Debug)]
pub enum SkipReason {
    /// A strict predecessor failed or was itself skipped.
    UpstreamFailed { predecessor: String },
    /// The build was cancelled before the task started.
    Aborted,
}

/// The terminal state a task reached.
#[derive(Clone, Debug)]
pub enum TaskState {
    /// The action ran to completion.
    Succeeded,
    /// Nothing to do: a cache hit restored the recorded outputs, or the task
    /// has no action (e.g. a group task).
    UpToDate,
    /// The action returned an error.
    Failed { error: Arc<anyhow::Error> },
    /// The task never ran.
    Skipped { reason: SkipReason },
}

impl TaskState {
    /// Whether successors may read this task's outputs.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::UpToDate)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskState::Skipped { .. })
    }
}

/// The record of one scheduled task after the build finished.
#[derive(Clone, Debug)]
pub struct TaskReport {
    pub path: String,
    pub state: TaskState,
    pub duration: Duration,
}

/// The outcome of a whole build run, in execution order.
///
/// A `BuildReport` only exists for builds that actually executed; structural
/// problems (cycles, duplicate names, static type mismatches) abort earlier
/// and surface as a [`BuildError`](crate::BuildError) instead.
#[derive(Clone, Debug)]
pub struct BuildReport {
    pub tasks: Vec<TaskReport>,
    pub(crate) aborted: bool,
}

impl BuildReport {
    /// True when no task failed. Skipped and up-to-date tasks do not count
    /// against success, but a cancelled build is never successful.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.tasks.iter().all(|t| !t.state.is_failed())
    }

    /// Whether the run was cancelled before completing.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// Every failed task, in execution order.
    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state.is_failed())
    }

    /// Looks up the report of a single task by path.
    pub fn task(&self, path: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.path == path)
    }

    /// Renders a human-readable summary: one line per task, then the list of
    /// failures with their errors and skips with their triggers.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for task in &self.tasks {
            let label = match &task.state {
                TaskState::Succeeded => style("ok      ").green(),
                TaskState::UpToDate => style("up-to-date").cyan(),
                TaskState::Failed { .. } => style("failed  ").red(),
                TaskState::Skipped { .. } => style("skipped ").yellow(),
            };
            let _ = writeln!(
                out,
                "{label} {} ({:.2?})",
                task.path, task.duration
            );
        }

        let failures: Vec<&TaskReport> = self.failures().collect();
        if !failures.is_empty() {
            let _ = writeln!(
                out,
                "\n{} task(s) failed:",
                style(failures.len()).red().bold()
            );
            for task in failures {
                if let TaskState::Failed { error } = &task.state {
                    let _ = writeln!(out, "  {}: {error:#}", task.path);
                }
            }
            for task in &self.tasks {
                if let TaskState::Skipped {
                    reason: SkipReason::UpstreamFailed { predecessor },
                } = &task.state
                {
                    let _ = writeln!(
                        out,
                        "  {} skipped because of {predecessor}",
                        task.path
                    );
                }
            }
        }

        if self.aborted {
            let _ = writeln!(out, "{}", style("build aborted").red().bold());
        } else if self.is_success() {
            let _ = writeln!(out, "{}", style("build successful").green());
        }
        out
    }
}
