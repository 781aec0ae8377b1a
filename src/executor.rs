//! Parallel wavefront execution of the task graph.
//!
//! The scheduler seeds every task whose predecessors are all complete, then
//! sits in a loop consuming completions: workers on a bounded rayon pool run
//! task actions and send results back over a channel, and each completion
//! decrements the dependency counts of its successors, releasing new tasks
//! as soon as their last predecessor finishes. Tasks that never need a
//! worker — skips, cache hits, action-less groups — complete inline on the
//! scheduler thread.
//!
//! All status transitions happen on the scheduler thread, so each task's
//! state is written by exactly one writer. Workers only execute actions and
//! mutate property cells, which serialize themselves.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::{self, ResultCache};
use crate::core::{Hash32, PropertyValue};
use crate::error::PropertyError;
use crate::graph::{TaskGraph, Targets};
use crate::model::{Model, TaskId};
use crate::property::{Property, PropertyId};
use crate::report::{BuildReport, SkipReason, TaskReport, TaskState};

/// Cooperative cancellation flag shared between the caller, the scheduler,
/// and running actions.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Running actions are allowed to finish; tasks
    /// that have not started are skipped with an abort reason.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for one build run.
#[derive(Clone, Debug)]
pub struct Options {
    /// Which tasks to run; predecessors are always included.
    pub targets: Targets,
    /// Worker pool size. `None` uses one worker per logical CPU.
    pub workers: Option<usize>,
    /// Location of the persistent result cache. `None` disables caching.
    pub cache_path: Option<Utf8PathBuf>,
    /// Render a progress bar while running.
    pub progress: bool,
    /// Cancellation flag; keep a clone to abort the build externally.
    pub cancel: CancelToken,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            targets: Targets::default(),
            workers: None,
            cache_path: None,
            progress: false,
            cancel: CancelToken::new(),
        }
    }
}

/// What a running action sees: the resolved properties of its own task.
///
/// Access is limited to properties owned by the executing task. Data from
/// other tasks arrives through the task's own wired input properties, which
/// is exactly what the dependency graph was inferred from — reading a
/// foreign property directly would bypass the ordering guarantee.
pub struct ActionContext<'a> {
    model: &'a Model,
    task: TaskId,
    cancel: CancelToken,
}

impl ActionContext<'_> {
    fn check_owned(&self, id: PropertyId) -> Result<(), PropertyError> {
        if self.model.cell(id).owner != self.task {
            return Err(PropertyError::NotOwned {
                task: self.model.task_path(self.task).to_string(),
                path: self.model.property_path(id),
            });
        }
        Ok(())
    }

    /// Forces resolution of one of this task's properties and returns the
    /// concrete value. The first successful read finalizes the property.
    pub fn get<T: PropertyValue>(
        &self,
        prop: Property<T>,
    ) -> Result<Arc<T>, PropertyError> {
        self.check_owned(prop.id())?;
        let value = self.model.resolve(prop.id())?;
        Ok(value
            .data
            .downcast::<T>()
            .ok()
            .expect("property value type was checked when the property was wired"))
    }

    /// Assigns one of this task's properties, typically an output.
    pub fn set<T: PropertyValue>(
        &self,
        prop: Property<T>,
        value: T,
    ) -> Result<(), PropertyError> {
        self.check_owned(prop.id())?;
        self.model.set_value(prop, value)
    }

    pub fn task_path(&self) -> &str {
        self.model.task_path(self.task)
    }

    /// The directory of the nearest enclosing project that declared one via
    /// [`Blueprint::subproject_at`](crate::Blueprint::subproject_at), for
    /// actions that resolve relative paths.
    pub fn directory(&self) -> Option<&Utf8Path> {
        self.model.task_directory(self.task)
    }

    /// Long-running actions may poll this to stop cooperatively after the
    /// build was aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text
    } else {
        "unknown cause"
    }
}

pub(crate) fn run(
    model: &Model,
    graph: &TaskGraph,
    options: &Options,
    mut cache: Option<&mut ResultCache>,
) -> BuildReport {
    let order = graph.execution_order().to_vec();
    let total = order.len();

    let mut remaining: HashMap<TaskId, usize> = order
        .iter()
        .map(|&t| (t, graph.predecessor_count(t)))
        .collect();
    // Task -> path of the first strict predecessor that failed or was
    // skipped. Presence means the task must be skipped.
    let mut poisoned: HashMap<TaskId, String> = HashMap::new();
    let mut fingerprints: HashMap<TaskId, Hash32> = HashMap::new();
    let mut records: HashMap<TaskId, (TaskState, Duration)> = HashMap::new();

    let bar = options.progress.then(|| {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap()
                .progress_chars("=>-"),
        );
        bar
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.unwrap_or(0))
        .build()
        .expect("failed to build worker thread pool");
    let (sender, receiver) =
        unbounded::<(TaskId, anyhow::Result<()>, Duration)>();

    // The scheduler stays on the calling thread; only actions occupy pool
    // workers. A single-worker pool therefore still makes progress while the
    // scheduler blocks on results.
    pool.in_place_scope(|scope| {
        // Tasks whose predecessors have all completed, in declaration order.
        let mut ready: VecDeque<TaskId> = order
            .iter()
            .copied()
            .filter(|t| remaining[t] == 0)
            .collect();
        // Completions that never went through a worker.
        let mut done: VecDeque<(TaskId, TaskState, Duration)> = VecDeque::new();
        let mut completed = 0usize;

        while completed < total {
            while let Some(task) = ready.pop_front() {
                let data = model.task(task);
                if options.cancel.is_cancelled() {
                    tracing::debug!(task = %data.path, "skipped: build aborted");
                    done.push_back((
                        task,
                        TaskState::Skipped {
                            reason: SkipReason::Aborted,
                        },
                        Duration::ZERO,
                    ));
                    continue;
                }
                if let Some(predecessor) = poisoned.get(&task) {
                    tracing::debug!(
                        task = %data.path,
                        %predecessor,
                        "skipped: upstream failed"
                    );
                    done.push_back((
                        task,
                        TaskState::Skipped {
                            reason: SkipReason::UpstreamFailed {
                                predecessor: predecessor.clone(),
                            },
                        },
                        Duration::ZERO,
                    ));
                    continue;
                }

                // Result cache: fingerprint the resolved inputs and reuse a
                // recorded run if it matches.
                let mut restored = false;
                if let Some(cache) = cache.as_deref_mut() {
                    if let Some(fingerprint) = cache::fingerprint(model, task)
                    {
                        if let Some(entry) =
                            cache.lookup(&data.path, &fingerprint)
                        {
                            match cache::restore(model, task, entry) {
                                Ok(()) => restored = true,
                                Err(err) => tracing::warn!(
                                    task = %data.path,
                                    "discarding unusable cache entry: {err}"
                                ),
                            }
                        }
                        fingerprints.insert(task, fingerprint);
                    }
                }

                if restored {
                    tracing::debug!(task = %data.path, "up to date");
                    done.push_back((task, TaskState::UpToDate, Duration::ZERO));
                } else if let Some(action) = data.action.clone() {
                    tracing::debug!(task = %data.path, "running");
                    let sender = sender.clone();
                    let cancel = options.cancel.clone();
                    scope.spawn(move |_| {
                        let context = ActionContext {
                            model,
                            task,
                            cancel,
                        };
                        let start = Instant::now();
                        // A panicking action must still produce a result, or
                        // the scheduler would wait on the channel forever.
                        let result = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| {
                                (action)(&context)
                            }),
                        )
                        .unwrap_or_else(|panic| {
                            Err(anyhow::anyhow!(
                                "action panicked: {}",
                                panic_text(panic.as_ref())
                            ))
                        });
                        sender.send((task, result, start.elapsed())).unwrap();
                    });
                } else {
                    // Nothing to execute, e.g. a group task.
                    done.push_back((task, TaskState::UpToDate, Duration::ZERO));
                }
            }

            // Prefer inline completions; otherwise block on a worker result.
            let (task, state, duration) = match done.pop_front() {
                Some(entry) => entry,
                None => {
                    let (task, result, duration) = receiver.recv().unwrap();
                    let state = match result {
                        Ok(()) => TaskState::Succeeded,
                        Err(error) => TaskState::Failed {
                            error: Arc::new(error),
                        },
                    };
                    (task, state, duration)
                }
            };

            let data = model.task(task);
            match &state {
                TaskState::Succeeded => {
                    if let (Some(cache), Some(fingerprint)) =
                        (cache.as_deref_mut(), fingerprints.get(&task))
                    {
                        match cache::snapshot(model, task) {
                            Ok(outputs) => {
                                cache.insert(&data.path, *fingerprint, outputs)
                            }
                            Err(err) => tracing::warn!(
                                task = %data.path,
                                "failed to record cache entry: {err}"
                            ),
                        }
                    }
                }
                TaskState::Failed { error } => {
                    tracing::warn!(task = %data.path, "failed: {error:#}");
                }
                _ => {}
            }

            // Release successors. Poison is recorded before counts reach
            // zero, so a successor is never scheduled ahead of its skip
            // verdict.
            if !state.is_success() {
                for (successor, kind) in graph.successors_with_kind(task) {
                    if kind.is_strict() {
                        poisoned
                            .entry(successor)
                            .or_insert_with(|| data.path.to_string());
                    }
                }
            }
            for (successor, _) in graph.successors_with_kind(task) {
                let count = remaining.get_mut(&successor).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.push_back(successor);
                }
            }

            records.insert(task, (state, duration));
            completed += 1;
            if let Some(bar) = &bar {
                bar.inc(1);
                bar.set_message(data.path.to_string());
            }
        }
    });

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    BuildReport {
        tasks: order
            .iter()
            .map(|&task| {
                let (state, duration) = records
                    .remove(&task)
                    .expect("every scheduled task reaches a terminal state");
                TaskReport {
                    path: model.task_path(task).to_string(),
                    state,
                    duration,
                }
            })
            .collect(),
        aborted: options.cancel.is_cancelled(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::Blueprint;

    fn run_options() -> Options {
        Options {
            workers: Some(2),
            ..Options::default()
        }
    }

    #[test]
    fn test_wired_literal_flows_between_tasks_in_order() {
        const DOCKERFILE: &str = "FROM ubuntu:latest\nRUN echo Hello World";

        let mut bp = Blueprint::new();
        let root = bp.root();
        let started: Arc<Mutex<Vec<&'static str>>> =
            Arc::new(Mutex::new(Vec::new()));

        let write = bp.task(root, "writeDockerfile").unwrap();
        let written = bp.output::<String>(write, "dockerfile").unwrap();
        let log = started.clone();
        bp.action(write, move |ctx| {
            log.lock().unwrap().push("writeDockerfile");
            ctx.set(written, DOCKERFILE.to_string())?;
            Ok(())
        });

        let image = bp.task(root, "dockerBuild").unwrap();
        let dockerfile = bp.input::<String>(image, "dockerfile").unwrap();
        bp.wire(dockerfile, written).unwrap();
        let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen = observed.clone();
        let log = started.clone();
        bp.action(image, move |ctx| {
            log.lock().unwrap().push("dockerBuild");
            let contents = ctx.get(dockerfile)?;
            *seen.lock().unwrap() = Some(contents.as_ref().clone());
            Ok(())
        });

        let report = bp.finish().run(run_options()).unwrap();

        assert!(report.is_success());
        assert_eq!(
            *started.lock().unwrap(),
            vec!["writeDockerfile", "dockerBuild"]
        );
        assert_eq!(observed.lock().unwrap().as_deref(), Some(DOCKERFILE));
    }

    #[test]
    fn test_failure_skips_transitive_successors_only() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        let b = bp.task(root, "b").unwrap();
        let c = bp.task(root, "c").unwrap();
        let d = bp.task(root, "d").unwrap();
        bp.depends_on(b, a);
        bp.depends_on(c, b);

        bp.action(a, |_| anyhow::bail!("boom"));
        let b_ran = Arc::new(AtomicBool::new(false));
        let c_ran = Arc::new(AtomicBool::new(false));
        let d_ran = Arc::new(AtomicBool::new(false));
        for (task, ran) in [(b, &b_ran), (c, &c_ran), (d, &d_ran)] {
            let ran = ran.clone();
            bp.action(task, move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            });
        }

        let report = bp.finish().run(run_options()).unwrap();

        assert!(!report.is_success());
        assert!(report.task("a").unwrap().state.is_failed());
        assert!(report.task("b").unwrap().state.is_skipped());
        assert!(report.task("c").unwrap().state.is_skipped());
        assert!(report.task("d").unwrap().state.is_success());
        assert!(!b_ran.load(Ordering::SeqCst));
        assert!(!c_ran.load(Ordering::SeqCst));
        assert!(d_ran.load(Ordering::SeqCst));

        // The transitive skip names its immediate trigger.
        let crate::report::TaskState::Skipped {
            reason: crate::report::SkipReason::UpstreamFailed { predecessor },
        } = &report.task("c").unwrap().state
        else {
            panic!("expected upstream-failed skip");
        };
        assert_eq!(predecessor, "b");
    }

    #[test]
    fn test_independent_tasks_both_succeed() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        for name in ["left", "right"] {
            let task = bp.task(root, name).unwrap();
            bp.action(task, |_| Ok(()));
        }

        let report = bp.finish().run(run_options()).unwrap();
        assert!(report.is_success());
        assert!(report.task("left").unwrap().state.is_success());
        assert!(report.task("right").unwrap().state.is_success());
    }

    #[test]
    fn test_order_only_relationship_does_not_propagate_failure() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let first = bp.task(root, "first").unwrap();
        let second = bp.task(root, "second").unwrap();
        bp.runs_after(second, first);

        bp.action(first, |_| anyhow::bail!("nope"));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        bp.action(second, move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let report = bp.finish().run(run_options()).unwrap();
        assert!(report.task("first").unwrap().state.is_failed());
        assert!(report.task("second").unwrap().state.is_success());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancellation_skips_unstarted_tasks() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let first = bp.task(root, "first").unwrap();
        let second = bp.task(root, "second").unwrap();
        bp.depends_on(second, first);

        let cancel = CancelToken::new();
        let token = cancel.clone();
        bp.action(first, move |_| {
            token.cancel();
            Ok(())
        });
        bp.action(second, |_| Ok(()));

        let options = Options {
            cancel,
            ..run_options()
        };
        let report = bp.finish().run(options).unwrap();

        assert!(report.was_aborted());
        assert!(!report.is_success());
        assert!(report.task("first").unwrap().state.is_success());
        let TaskState::Skipped {
            reason: SkipReason::Aborted,
        } = &report.task("second").unwrap().state
        else {
            panic!("expected aborted skip");
        };
    }

    #[test]
    fn test_reading_unset_input_fails_the_task() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let task = bp.task(root, "needy").unwrap();
        let input = bp.input::<String>(task, "config").unwrap();
        bp.action(task, move |ctx| {
            let _ = ctx.get(input)?;
            Ok(())
        });

        let report = bp.finish().run(run_options()).unwrap();
        let state = &report.task("needy").unwrap().state;
        assert!(state.is_failed());
        let TaskState::Failed { error } = state else {
            unreachable!()
        };
        assert!(error.to_string().contains("before being given a value"));
    }

    #[test]
    fn test_foreign_property_access_is_rejected() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let owner = bp.task(root, "owner").unwrap();
        let secret = bp.output::<String>(owner, "secret").unwrap();
        bp.set(secret, "value".to_string()).unwrap();

        let intruder = bp.task(root, "intruder").unwrap();
        bp.action(intruder, move |ctx| {
            let _ = ctx.get(secret)?;
            Ok(())
        });

        let report = bp.finish().run(run_options()).unwrap();
        let state = &report.task("intruder").unwrap().state;
        assert!(state.is_failed());
    }

    #[test]
    fn test_panicking_action_fails_its_task_without_hanging() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let broken = bp.task(root, "broken").unwrap();
        let dependent = bp.task(root, "dependent").unwrap();
        let sibling = bp.task(root, "sibling").unwrap();
        bp.depends_on(dependent, broken);

        bp.action(broken, |_| panic!("kaboom"));
        bp.action(dependent, |_| Ok(()));
        bp.action(sibling, |_| Ok(()));

        let report = bp.finish().run(run_options()).unwrap();

        assert!(!report.is_success());
        let state = &report.task("broken").unwrap().state;
        let TaskState::Failed { error } = state else {
            panic!("expected the panic to surface as a failure");
        };
        assert!(error.to_string().contains("kaboom"));
        assert!(report.task("dependent").unwrap().state.is_skipped());
        assert!(report.task("sibling").unwrap().state.is_success());
    }

    #[test]
    fn test_action_sees_nearest_project_directory() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let app = bp.subproject_at(root, "app", "services/app").unwrap();
        let nested = bp.subproject(app, "docker").unwrap();

        let inner = bp.task(nested, "build").unwrap();
        let outer = bp.task(root, "lint").unwrap();

        let seen: Arc<Mutex<Option<Option<String>>>> =
            Arc::new(Mutex::new(None));
        let observed = seen.clone();
        bp.action(inner, move |ctx| {
            *observed.lock().unwrap() =
                Some(ctx.directory().map(|dir| dir.to_string()));
            Ok(())
        });
        let root_seen: Arc<Mutex<Option<Option<String>>>> =
            Arc::new(Mutex::new(None));
        let observed = root_seen.clone();
        bp.action(outer, move |ctx| {
            *observed.lock().unwrap() =
                Some(ctx.directory().map(|dir| dir.to_string()));
            Ok(())
        });

        let report = bp.finish().run(run_options()).unwrap();
        assert!(report.is_success());

        // The nested task inherits the directory from `app`; the root task
        // has none.
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(Some("services/app".to_string()))
        );
        assert_eq!(root_seen.lock().unwrap().clone(), Some(None));
    }

    #[test]
    fn test_group_completes_up_to_date_after_members() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        bp.action(a, |_| Ok(()));
        let b = bp.task(root, "b").unwrap();
        bp.action(b, |_| Ok(()));
        bp.group(root, "check", [a, b]).unwrap();

        let report = bp.finish().run(run_options()).unwrap();
        assert!(report.is_success());
        assert!(matches!(
            report.task("check").unwrap().state,
            TaskState::UpToDate
        ));
        // The group completes last.
        assert_eq!(report.tasks.last().unwrap().path, "check");
    }
}
