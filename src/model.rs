//! The frozen project/task/property model.
//!
//! Projects, tasks, and property cells live in flat arenas indexed by
//! [`ProjectId`], [`TaskId`], and [`PropertyId`]. Back-references are plain
//! ids, so the parent/child and task/project relationships never form owning
//! cycles. The [`Blueprint`](crate::Blueprint) mutates the model during the
//! description phase; once `finish()` runs, structure is immutable and only
//! property resolution state changes.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{ArcStr, PropertyValue, Value, ValueVtable};
use crate::error::{ModelError, PropertyError};
use crate::executor::ActionContext;
use crate::property::{
    DeriveFn, Property, PropertyCell, PropertyId, PropertyKind, PropertyState,
    Wiring,
};

/// Index of a project in the model's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ProjectId(pub(crate) usize);

/// Index of a task in the model's arena. Arena order is declaration order,
/// which the scheduler uses to break ties deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(pub(crate) usize);

/// A task action: reads the task's resolved input properties through the
/// context and writes its output properties, or fails.
pub(crate) type ActionFn =
    Arc<dyn Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Tasks and sub-projects share one namespace within a project, so a task
/// cannot shadow a sub-project of the same name or vice versa.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Member {
    Task(TaskId),
    Project(ProjectId),
}

/// An explicitly declared relationship: `other` must run before the owning
/// task. Strict relationships also propagate failure as a skip; order-only
/// relationships constrain scheduling without coupling outcomes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Relation {
    pub(crate) other: TaskId,
    pub(crate) strict: bool,
}

#[derive(Debug)]
pub(crate) struct ProjectData {
    pub(crate) path: ArcStr,
    pub(crate) parent: Option<ProjectId>,
    pub(crate) directory: Option<Utf8PathBuf>,
    pub(crate) children: Vec<ProjectId>,
    pub(crate) tasks: Vec<TaskId>,
    pub(crate) members: HashMap<ArcStr, Member>,
}

pub(crate) struct TaskData {
    pub(crate) path: ArcStr,
    pub(crate) project: ProjectId,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) property_names: HashMap<ArcStr, PropertyId>,
    pub(crate) action: Option<ActionFn>,
    pub(crate) relations: Vec<Relation>,
    /// Members of a group task; each member gets a strict edge to the group.
    pub(crate) group: Vec<TaskId>,
    pub(crate) default: bool,
    /// Action identity/version. `Some` marks the task cacheable.
    pub(crate) cache_key: Option<ArcStr>,
}

impl std::fmt::Debug for TaskData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskData")
            .field("path", &self.path)
            .field("properties", &self.properties)
            .field("has_action", &self.action.is_some())
            .field("default", &self.default)
            .finish()
    }
}

/// Arena-backed storage for the whole build description.
#[derive(Debug, Default)]
pub struct Model {
    pub(crate) projects: Vec<ProjectData>,
    pub(crate) tasks: Vec<TaskData>,
    pub(crate) cells: Vec<PropertyCell>,
}

impl Model {
    /// Creates a model holding only the root project, whose path is empty.
    pub(crate) fn new() -> Self {
        let root = ProjectData {
            path: "".into(),
            parent: None,
            directory: None,
            children: Vec::new(),
            tasks: Vec::new(),
            members: HashMap::new(),
        };
        Self {
            projects: vec![root],
            tasks: Vec::new(),
            cells: Vec::new(),
        }
    }

    pub(crate) fn root(&self) -> ProjectId {
        ProjectId(0)
    }

    pub(crate) fn project(&self, id: ProjectId) -> &ProjectData {
        &self.projects[id.0]
    }

    pub(crate) fn task(&self, id: TaskId) -> &TaskData {
        &self.tasks[id.0]
    }

    pub(crate) fn cell(&self, id: PropertyId) -> &PropertyCell {
        &self.cells[id.0]
    }

    /// The path uniquely identifying a task: parent project path, `/`, name.
    pub fn task_path(&self, id: TaskId) -> &str {
        &self.tasks[id.0].path
    }

    /// The directory associated with a task: the nearest enclosing project
    /// that declared one. `None` when no project on the chain has a
    /// directory.
    pub(crate) fn task_directory(&self, task: TaskId) -> Option<&Utf8Path> {
        let mut project = Some(self.task(task).project);
        while let Some(id) = project {
            let data = self.project(id);
            if let Some(directory) = &data.directory {
                return Some(directory);
            }
            project = data.parent;
        }
        None
    }

    /// The path of a property, `task_path.property_name`.
    pub(crate) fn property_path(&self, id: PropertyId) -> String {
        let cell = self.cell(id);
        format!("{}.{}", self.task_path(cell.owner), cell.name)
    }

    /// Looks a task up by its full path, e.g. `app/dockerBuild`.
    pub fn task_by_path(&self, path: &str) -> Option<TaskId> {
        let mut project = self.root();
        let mut segments = path.split('/').peekable();

        while let Some(segment) = segments.next() {
            match self.project(project).members.get(segment)? {
                Member::Task(task) if segments.peek().is_none() => {
                    return Some(*task);
                }
                Member::Project(child) => project = *child,
                Member::Task(_) => return None,
            }
        }
        None
    }

    fn join_path(parent: &str, name: &str) -> ArcStr {
        if parent.is_empty() {
            name.into()
        } else {
            format!("{parent}/{name}").into()
        }
    }

    fn claim_name(
        &mut self,
        project: ProjectId,
        name: &str,
        member: Member,
    ) -> Result<ArcStr, ModelError> {
        let data = &self.projects[project.0];
        if data.members.contains_key(name) {
            return Err(ModelError::DuplicateName {
                project: data.path.to_string(),
                name: name.to_string(),
            });
        }
        let name: ArcStr = name.into();
        self.projects[project.0].members.insert(name.clone(), member);
        Ok(name)
    }

    pub(crate) fn add_project(
        &mut self,
        parent: ProjectId,
        name: &str,
        directory: Option<Utf8PathBuf>,
    ) -> Result<ProjectId, ModelError> {
        let id = ProjectId(self.projects.len());
        let name = self.claim_name(parent, name, Member::Project(id))?;
        let path = Self::join_path(&self.projects[parent.0].path, &name);

        self.projects.push(ProjectData {
            path,
            parent: Some(parent),
            directory,
            children: Vec::new(),
            tasks: Vec::new(),
            members: HashMap::new(),
        });
        self.projects[parent.0].children.push(id);
        Ok(id)
    }

    pub(crate) fn add_task(
        &mut self,
        project: ProjectId,
        name: &str,
    ) -> Result<TaskId, ModelError> {
        let id = TaskId(self.tasks.len());
        let name = self.claim_name(project, name, Member::Task(id))?;
        let path = Self::join_path(&self.projects[project.0].path, &name);

        self.tasks.push(TaskData {
            path,
            project,
            properties: Vec::new(),
            property_names: HashMap::new(),
            action: None,
            relations: Vec::new(),
            group: Vec::new(),
            default: true,
            cache_key: None,
        });
        self.projects[project.0].tasks.push(id);
        Ok(id)
    }

    pub(crate) fn add_property<T: PropertyValue>(
        &mut self,
        task: TaskId,
        name: &str,
        kind: PropertyKind,
    ) -> Result<Property<T>, ModelError> {
        let data = &self.tasks[task.0];
        if data.property_names.contains_key(name) {
            return Err(ModelError::DuplicateProperty {
                task: data.path.to_string(),
                name: name.to_string(),
            });
        }

        let id = PropertyId(self.cells.len());
        let name: ArcStr = name.into();
        let vtable = ValueVtable::of::<T>();
        self.cells.push(PropertyCell {
            name: name.clone(),
            owner: task,
            kind,
            type_id: vtable.type_id,
            type_name: vtable.type_name,
            vtable,
            state: Mutex::new(PropertyState::Unset),
        });

        let data = &mut self.tasks[task.0];
        data.properties.push(id);
        data.property_names.insert(name, id);
        Ok(Property::new(id))
    }

    pub(crate) fn property_by_name(
        &self,
        task: TaskId,
        name: &str,
    ) -> Result<PropertyId, PropertyError> {
        self.task(task)
            .property_names
            .get(name)
            .copied()
            .ok_or_else(|| PropertyError::NoSuchProperty {
                task: self.task_path(task).to_string(),
                name: name.to_string(),
            })
    }

    pub(crate) fn add_relation(
        &mut self,
        task: TaskId,
        other: TaskId,
        strict: bool,
    ) {
        self.tasks[task.0].relations.push(Relation { other, strict });
    }

    // Wiring operations. All of them refuse to touch a finalized cell.

    fn check_unfinalized(
        &self,
        id: PropertyId,
        state: &PropertyState,
    ) -> Result<(), PropertyError> {
        if state.is_finalized() {
            Err(PropertyError::AlreadyFinalized {
                path: self.property_path(id),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_value<T: PropertyValue>(
        &self,
        prop: Property<T>,
        value: T,
    ) -> Result<(), PropertyError> {
        debug_assert_eq!(self.cell(prop.id).type_id, TypeId::of::<T>());
        let mut state = self.cell(prop.id).state.lock().unwrap();
        self.check_unfinalized(prop.id, &state)?;
        *state = PropertyState::Value(Value::new(value));
        Ok(())
    }

    /// Aliases `dst` to `src`. Declared types must match exactly; the typed
    /// wiring API guarantees this, the path-based API checks it here.
    pub(crate) fn set_reference(
        &self,
        dst: PropertyId,
        src: PropertyId,
    ) -> Result<(), PropertyError> {
        let (dst_cell, src_cell) = (self.cell(dst), self.cell(src));
        if dst_cell.type_id != src_cell.type_id {
            return Err(PropertyError::TypeMismatch {
                from: self.property_path(src),
                from_type: src_cell.type_name,
                to: self.property_path(dst),
                to_type: dst_cell.type_name,
            });
        }

        let mut state = dst_cell.state.lock().unwrap();
        self.check_unfinalized(dst, &state)?;
        *state = PropertyState::Reference(src);
        Ok(())
    }

    pub(crate) fn set_derived(
        &self,
        dst: PropertyId,
        upstream: Vec<PropertyId>,
        apply: DeriveFn,
    ) -> Result<(), PropertyError> {
        let mut state = self.cell(dst).state.lock().unwrap();
        self.check_unfinalized(dst, &state)?;
        *state = PropertyState::Derived { upstream, apply };
        Ok(())
    }

    /// Extracts a cell's wiring without forcing resolution. Used by the graph
    /// builder for structural inspection only.
    pub(crate) fn wiring_of(&self, id: PropertyId) -> Wiring {
        match &*self.cell(id).state.lock().unwrap() {
            PropertyState::Reference(src) => Wiring::Reference(*src),
            PropertyState::Derived { upstream, .. } => {
                Wiring::Derived(upstream.clone())
            }
            _ => Wiring::Terminal,
        }
    }

    /// Forces resolution of a property to a concrete value and finalizes it.
    ///
    /// The cell's lock is held for the whole resolution, so concurrent
    /// readers either perform the resolution or block and observe the
    /// memoized result — a derivation runs at most once. Locks are acquired
    /// in reference direction only; the graph builder has proven the wiring
    /// acyclic before any concurrent resolution happens, so this cannot
    /// deadlock.
    pub(crate) fn resolve(
        &self,
        id: PropertyId,
    ) -> Result<Value, PropertyError> {
        let mut state = self.cell(id).state.lock().unwrap();
        match &*state {
            PropertyState::Resolved(value) => Ok(value.clone()),
            PropertyState::Value(value) => {
                let value = value.clone();
                *state = PropertyState::Resolved(value.clone());
                Ok(value)
            }
            PropertyState::Unset => Err(PropertyError::Unset {
                path: self.property_path(id),
            }),
            PropertyState::Reference(src) => {
                let value = self.resolve(*src)?;
                *state = PropertyState::Resolved(value.clone());
                Ok(value)
            }
            PropertyState::Derived { upstream, apply } => {
                let (upstream, apply) = (upstream.clone(), apply.clone());
                let mut values = Vec::with_capacity(upstream.len());
                for up in upstream {
                    values.push(self.resolve(up)?);
                }
                let value =
                    apply(&values).map_err(|err| PropertyError::Derivation {
                        path: self.property_path(id),
                        error: Arc::new(err),
                    })?;
                *state = PropertyState::Resolved(value.clone());
                Ok(value)
            }
        }
    }

    /// Overwrites a cell with an already-resolved value. Used by the result
    /// cache to restore recorded outputs without running the action.
    pub(crate) fn install(&self, id: PropertyId, value: Value) {
        let mut state = self.cell(id).state.lock().unwrap();
        *state = PropertyState::Resolved(value);
    }
}
