//! The declaration API for a build.
//!
//! A [`Blueprint`] is the explicit context through which the description
//! phase declares projects, tasks, and properties — there is no ambient
//! global registry; every lookup goes through the blueprint or the ids it
//! hands out. Once the description is complete, [`Blueprint::finish`] freezes
//! the model into a [`Build`]; no tasks or properties can be added
//! afterwards.
//!
//! Dependencies between tasks are never declared directly. Wiring an input
//! property of one task to an output property of another is what creates the
//! ordering, and the graph builder later recovers those edges by inspecting
//! the wiring structurally.
//!
//! # Example
//!
//! ```rust
//! use rigger::{Blueprint, Options};
//!
//! let mut bp = Blueprint::new();
//! let root = bp.root();
//!
//! let write = bp.task(root, "writeDockerfile").unwrap();
//! let written = bp.output::<String>(write, "dockerfile").unwrap();
//! bp.action(write, move |ctx| {
//!     ctx.set(written, "FROM ubuntu:latest".to_string())?;
//!     Ok(())
//! });
//!
//! let build_img = bp.task(root, "dockerBuild").unwrap();
//! let dockerfile = bp.input::<String>(build_img, "dockerfile").unwrap();
//! bp.wire(dockerfile, written).unwrap();
//! bp.action(build_img, move |ctx| {
//!     let contents = ctx.get(dockerfile)?;
//!     assert!(contents.starts_with("FROM"));
//!     Ok(())
//! });
//!
//! let report = bp.finish().run(Options::default()).unwrap();
//! assert!(report.is_success());
//! ```

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::Build;
use crate::core::{PropertyValue, Value};
use crate::error::{BuildError, ModelError, PropertyError};
use crate::executor::ActionContext;
use crate::model::{Model, ProjectId, TaskId};
use crate::property::{DeriveFn, Property, PropertyKind, Upstream};

/// Builder for the project tree, its tasks, and their property wiring.
pub struct Blueprint {
    model: Model,
}

impl Blueprint {
    /// Creates a blueprint holding only the root project.
    pub fn new() -> Self {
        Self {
            model: Model::new(),
        }
    }

    /// The root project. Its path is empty, so tasks declared directly on it
    /// have their bare name as path.
    pub fn root(&self) -> ProjectId {
        self.model.root()
    }

    /// Declares a sub-project. Fails if the name is already taken by a task
    /// or sub-project of `parent`.
    pub fn subproject(
        &mut self,
        parent: ProjectId,
        name: &str,
    ) -> Result<ProjectId, ModelError> {
        self.model.add_project(parent, name, None)
    }

    /// Declares a sub-project associated with a directory on disk.
    pub fn subproject_at(
        &mut self,
        parent: ProjectId,
        name: &str,
        directory: impl Into<Utf8PathBuf>,
    ) -> Result<ProjectId, ModelError> {
        self.model.add_project(parent, name, Some(directory.into()))
    }

    /// Declares a task in `project`.
    pub fn task(
        &mut self,
        project: ProjectId,
        name: &str,
    ) -> Result<TaskId, ModelError> {
        self.model.add_task(project, name)
    }

    /// Declares a group task: an action-less task that depends strictly on
    /// all of its members, so targeting the group runs them. Groups are not
    /// part of the default target set.
    pub fn group(
        &mut self,
        project: ProjectId,
        name: &str,
        members: impl IntoIterator<Item = TaskId>,
    ) -> Result<TaskId, ModelError> {
        let id = self.model.add_task(project, name)?;
        self.model.tasks[id.0].default = false;
        self.model.tasks[id.0].group = members.into_iter().collect();
        Ok(id)
    }

    /// Adds a member to an existing group task.
    pub fn add_to_group(&mut self, group: TaskId, member: TaskId) {
        self.model.tasks[group.0].group.push(member);
    }

    /// Declares a typed input property on a task.
    pub fn input<T: PropertyValue>(
        &mut self,
        task: TaskId,
        name: &str,
    ) -> Result<Property<T>, ModelError> {
        self.model.add_property(task, name, PropertyKind::Input)
    }

    /// Declares a typed output property on a task.
    pub fn output<T: PropertyValue>(
        &mut self,
        task: TaskId,
        name: &str,
    ) -> Result<Property<T>, ModelError> {
        self.model.add_property(task, name, PropertyKind::Output)
    }

    /// Sets the action executed when the task runs. The action reads the
    /// task's resolved inputs through the context and writes its outputs.
    pub fn action<F>(&mut self, task: TaskId, action: F)
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.model.tasks[task.0].action = Some(Arc::new(action));
    }

    /// Assigns a concrete value to a property.
    pub fn set<T: PropertyValue>(
        &mut self,
        prop: Property<T>,
        value: T,
    ) -> Result<(), PropertyError> {
        self.model.set_value(prop, value)
    }

    /// Wires `dst` as a lazy alias of `src`. Reading `dst` later resolves
    /// `src` first; if the two properties belong to different tasks, this is
    /// what makes `src`'s task a prerequisite of `dst`'s task.
    pub fn wire<T: PropertyValue>(
        &mut self,
        dst: Property<T>,
        src: Property<T>,
    ) -> Result<(), PropertyError> {
        self.model.set_reference(dst.id, src.id)
    }

    /// Untyped wiring by task path and property name, for callers that feed
    /// an evaluated build description into the model. Declared types are
    /// checked at wiring time.
    pub fn wire_path(
        &mut self,
        dst_task: &str,
        dst_prop: &str,
        src_task: &str,
        src_prop: &str,
    ) -> Result<(), BuildError> {
        let dst = self.lookup(dst_task, dst_prop)?;
        let src = self.lookup(src_task, src_prop)?;
        self.model.set_reference(dst, src)?;
        Ok(())
    }

    fn lookup(
        &self,
        task: &str,
        prop: &str,
    ) -> Result<crate::property::PropertyId, BuildError> {
        let task_id = self
            .model
            .task_by_path(task)
            .ok_or_else(|| ModelError::NoSuchTask(task.to_string()))?;
        Ok(self.model.property_by_name(task_id, prop)?)
    }

    /// Derives `dst` from one or more upstream properties. The closure runs
    /// once, after all upstreams have resolved, and its result is memoized.
    pub fn derive<T, U, F>(
        &mut self,
        dst: Property<T>,
        upstream: U,
        f: F,
    ) -> Result<(), PropertyError>
    where
        T: PropertyValue,
        U: Upstream,
        F: for<'a> Fn(U::Resolved<'a>) -> anyhow::Result<T>
            + Send
            + Sync
            + 'static,
    {
        let ids = upstream.ids();
        let apply: DeriveFn = Arc::new(move |values| {
            let resolved = upstream.resolve(values);
            f(resolved).map(Value::new)
        });
        self.model.set_derived(dst.id, ids, apply)
    }

    /// Derives `dst` by applying an infallible function to a single upstream
    /// property.
    pub fn map<T, U, F>(
        &mut self,
        dst: Property<T>,
        src: Property<U>,
        f: F,
    ) -> Result<(), PropertyError>
    where
        T: PropertyValue,
        U: PropertyValue,
        F: Fn(&U) -> T + Send + Sync + 'static,
    {
        self.derive(dst, src, move |value: &U| Ok(f(value)))
    }

    /// Declares an explicit strict dependency: `dependency` must complete
    /// successfully before `task` runs, and its failure skips `task`.
    /// Ordering inferred from property wiring does not need this; it exists
    /// for dependencies that carry no data.
    pub fn depends_on(&mut self, task: TaskId, dependency: TaskId) {
        self.model.add_relation(task, dependency, true);
    }

    /// Declares an order-only relationship: if both tasks are scheduled,
    /// `other` runs first, but its failure does not skip `task`.
    pub fn runs_after(&mut self, task: TaskId, other: TaskId) {
        self.model.add_relation(task, other, false);
    }

    /// Includes or excludes a task from the default target set. Tasks are
    /// included by default; groups are excluded by default.
    pub fn set_default(&mut self, task: TaskId, default: bool) {
        self.model.tasks[task.0].default = default;
    }

    /// Marks a task cacheable. `version` identifies the action; bump it to
    /// invalidate prior cache entries when the action's behavior changes.
    pub fn cached(&mut self, task: TaskId, version: &str) {
        self.model.tasks[task.0].cache_key = Some(version.into());
    }

    /// Freezes the description into an executable [`Build`]. After this, no
    /// tasks, projects, or properties can be added.
    pub fn finish(self) -> Build {
        Build::new(self.model)
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_declares_projects_tasks_and_properties() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let app = bp.subproject(root, "app").unwrap();
        let task = bp.task(app, "writeDockerfile").unwrap();
        let out = bp.output::<String>(task, "dockerfile").unwrap();
        bp.set(out, "FROM ubuntu:latest".to_string()).unwrap();

        let build = bp.finish();
        assert_eq!(
            build.model().task_by_path("app/writeDockerfile"),
            Some(task)
        );
    }

    #[test]
    fn test_wire_path_checks_types() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        let b = bp.task(root, "b").unwrap();
        bp.output::<String>(a, "text").unwrap();
        bp.input::<u32>(b, "number").unwrap();

        let err = bp.wire_path("b", "number", "a", "text").unwrap_err();
        assert!(matches!(
            err,
            BuildError::Property(PropertyError::TypeMismatch { .. })
        ));

        let err = bp.wire_path("missing", "x", "a", "text").unwrap_err();
        assert!(matches!(err, BuildError::Model(ModelError::NoSuchTask(_))));
    }

    #[test]
    fn test_derive_over_two_upstreams() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let task = bp.task(root, "combine").unwrap();
        let left = bp.input::<String>(task, "left").unwrap();
        let right = bp.input::<String>(task, "right").unwrap();
        let joined = bp.output::<String>(task, "joined").unwrap();

        bp.set(left, "a".to_string()).unwrap();
        bp.set(right, "b".to_string()).unwrap();
        bp.derive(joined, (left, right), |(l, r)| Ok(format!("{l}{r}")))
            .unwrap();

        let build = bp.finish();
        let value = build.model().resolve(joined.id()).unwrap();
        assert_eq!(value.data.downcast_ref::<String>().unwrap(), "ab");
    }
}
