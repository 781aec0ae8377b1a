//! The task dependency graph.
//!
//! Edges are not authored directly. The builder walks every property of every
//! task and follows REFERENCE/DERIVED wiring to the owning tasks of the
//! upstream cells — structural inspection only, no value is computed.
//! Explicitly declared relationships and group memberships contribute the
//! remaining edges.
//!
//! Cycles — both property-level reference cycles and task-level dependency
//! cycles — are detected here, before any task executes, and reported with
//! the full ordered cycle. The builder also produces a stable topological
//! order: ties between independent tasks are broken by declaration order, so
//! identical inputs always schedule in the same sequence.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::GraphError;
use crate::model::{Model, TaskId};
use crate::property::Wiring;

/// Provenance of a dependency edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EdgeKind {
    /// Inferred from property wiring; strict.
    Wiring,
    /// Explicit `depends_on`; strict.
    Strict,
    /// Explicit `runs_after`; constrains order but does not propagate
    /// failure, and does not pull the predecessor into the schedule.
    Ordered,
}

impl EdgeKind {
    pub(crate) fn is_strict(self) -> bool {
        !matches!(self, EdgeKind::Ordered)
    }
}

/// Which tasks a build run is aimed at. The scheduled set is always the
/// targets plus their transitive strict predecessors.
#[derive(Clone, Debug, Default)]
pub enum Targets {
    /// Every declared task.
    #[default]
    All,
    /// Tasks carrying the default flag.
    Default,
    /// Tasks selected by full path.
    Paths(Vec<String>),
}

/// The validated, cycle-free dependency graph over scheduled tasks.
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<TaskId, EdgeKind>,
    nodes: HashMap<TaskId, NodeIndex>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    pub(crate) fn build(
        model: &Model,
        targets: &Targets,
    ) -> Result<Self, GraphError> {
        check_property_cycles(model)?;

        let edges = collect_edges(model);
        check_task_cycles(model, &edges)?;

        let scheduled = scheduled_set(model, targets, &edges)?;

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut ids: Vec<TaskId> = scheduled.iter().copied().collect();
        ids.sort();
        for id in &ids {
            nodes.insert(*id, graph.add_node(*id));
        }
        for (&(from, to), &kind) in &edges {
            if scheduled.contains(&from) && scheduled.contains(&to) {
                graph.add_edge(nodes[&from], nodes[&to], kind);
            }
        }

        let order = stable_topological_order(&graph, &nodes, &ids);
        Ok(Self {
            graph,
            nodes,
            order,
        })
    }

    /// Tasks in a valid execution order: every task appears after all of its
    /// predecessors, ties broken by declaration order.
    pub fn execution_order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.nodes.contains_key(&task)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tasks that must complete before `task` may run, in declaration order.
    pub fn predecessors(&self, task: TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Tasks that depend on `task`, in declaration order.
    pub fn successors(&self, task: TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.nodes.get(&task) else {
            return Vec::new();
        };
        let mut out: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n])
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub(crate) fn successors_with_kind(
        &self,
        task: TaskId,
    ) -> Vec<(TaskId, EdgeKind)> {
        let Some(&node) = self.nodes.get(&task) else {
            return Vec::new();
        };
        let mut out: Vec<(TaskId, EdgeKind)> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|edge| (self.graph[edge.target()], *edge.weight()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub(crate) fn predecessor_count(&self, task: TaskId) -> usize {
        self.predecessors(task).len()
    }
}

/// Full edge relation over all declared tasks, keyed `(prerequisite,
/// dependent)`. A strict edge wins over an order-only edge between the same
/// pair.
fn collect_edges(model: &Model) -> HashMap<(TaskId, TaskId), EdgeKind> {
    let mut edges: HashMap<(TaskId, TaskId), EdgeKind> = HashMap::new();
    let mut add = |from: TaskId, to: TaskId, kind: EdgeKind| {
        if from == to {
            return;
        }
        edges
            .entry((from, to))
            .and_modify(|existing| {
                if kind.is_strict() {
                    *existing = kind;
                }
            })
            .or_insert(kind);
    };

    for (index, task) in model.tasks.iter().enumerate() {
        let id = TaskId(index);
        for &prop in &task.properties {
            match model.wiring_of(prop) {
                Wiring::Terminal => {}
                Wiring::Reference(src) => {
                    add(model.cell(src).owner, id, EdgeKind::Wiring);
                }
                Wiring::Derived(upstream) => {
                    for src in upstream {
                        add(model.cell(src).owner, id, EdgeKind::Wiring);
                    }
                }
            }
        }
        for relation in &task.relations {
            let kind = if relation.strict {
                EdgeKind::Strict
            } else {
                EdgeKind::Ordered
            };
            add(relation.other, id, kind);
        }
        for &member in &task.group {
            add(member, id, EdgeKind::Strict);
        }
    }
    edges
}

/// Depth-first cycle search over an arbitrary successor relation. Returns the
/// node indices on the first cycle found, in order, with the entry node
/// repeated at the end.
fn find_cycle(
    count: usize,
    successors: impl Fn(usize) -> Vec<usize>,
) -> Option<Vec<usize>> {
    const WHITE: u8 = 0;
    const GREY: u8 = 1;
    const BLACK: u8 = 2;

    fn visit(
        node: usize,
        colors: &mut [u8],
        stack: &mut Vec<usize>,
        successors: &impl Fn(usize) -> Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = GREY;
        stack.push(node);

        for next in successors(node) {
            match colors[next] {
                GREY => {
                    let start =
                        stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                WHITE => {
                    if let Some(cycle) =
                        visit(next, colors, stack, successors)
                    {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        stack.pop();
        colors[node] = BLACK;
        None
    }

    let mut colors = vec![WHITE; count];
    for node in 0..count {
        if colors[node] == WHITE {
            let mut stack = Vec::new();
            if let Some(cycle) =
                visit(node, &mut colors, &mut stack, &successors)
            {
                return Some(cycle);
            }
        }
    }
    None
}

/// Rejects reference/derivation cycles between property cells. Resolution
/// assumes acyclic wiring, so this must run before anything reads a property
/// concurrently.
fn check_property_cycles(model: &Model) -> Result<(), GraphError> {
    let upstream_of = |cell: usize| -> Vec<usize> {
        match model.wiring_of(crate::property::PropertyId(cell)) {
            Wiring::Terminal => Vec::new(),
            Wiring::Reference(src) => vec![src.0],
            Wiring::Derived(upstream) => {
                upstream.into_iter().map(|id| id.0).collect()
            }
        }
    };

    if let Some(cycle) = find_cycle(model.cells.len(), upstream_of) {
        let mut paths: Vec<String> = Vec::new();
        for cell in cycle {
            let path = model
                .task_path(model.cell(crate::property::PropertyId(cell)).owner)
                .to_string();
            if paths.last() != Some(&path) {
                paths.push(path);
            }
        }
        if paths.len() == 1 {
            let only = paths[0].clone();
            paths.push(only);
        }
        return Err(GraphError::Cycle(paths));
    }
    Ok(())
}

fn check_task_cycles(
    model: &Model,
    edges: &HashMap<(TaskId, TaskId), EdgeKind>,
) -> Result<(), GraphError> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); model.tasks.len()];
    for &(from, to) in edges.keys() {
        successors[from.0].push(to.0);
    }
    for list in &mut successors {
        list.sort();
    }

    if let Some(cycle) =
        find_cycle(model.tasks.len(), |task| successors[task].clone())
    {
        let paths = cycle
            .into_iter()
            .map(|task| model.task_path(TaskId(task)).to_string())
            .collect();
        return Err(GraphError::Cycle(paths));
    }
    Ok(())
}

/// Resolves the target selection to the set of tasks to schedule: the
/// targets themselves plus every transitive strict predecessor.
fn scheduled_set(
    model: &Model,
    targets: &Targets,
    edges: &HashMap<(TaskId, TaskId), EdgeKind>,
) -> Result<HashSet<TaskId>, GraphError> {
    let roots: Vec<TaskId> = match targets {
        Targets::All => (0..model.tasks.len()).map(TaskId).collect(),
        Targets::Default => (0..model.tasks.len())
            .map(TaskId)
            .filter(|id| model.task(*id).default)
            .collect(),
        Targets::Paths(paths) => {
            let mut roots = Vec::new();
            for path in paths {
                let id = model.task_by_path(path).ok_or_else(|| {
                    GraphError::UnknownTarget(path.clone())
                })?;
                roots.push(id);
            }
            roots
        }
    };

    let mut strict_predecessors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for (&(from, to), kind) in edges {
        if kind.is_strict() {
            strict_predecessors.entry(to).or_default().push(from);
        }
    }

    let mut scheduled: HashSet<TaskId> = HashSet::new();
    let mut frontier = roots;
    while let Some(task) = frontier.pop() {
        if scheduled.insert(task) {
            if let Some(predecessors) = strict_predecessors.get(&task) {
                frontier.extend(predecessors.iter().copied());
            }
        }
    }
    Ok(scheduled)
}

/// Kahn's algorithm with a min-heap over task ids, so that independent tasks
/// always appear in declaration order.
fn stable_topological_order(
    graph: &DiGraph<TaskId, EdgeKind>,
    nodes: &HashMap<TaskId, NodeIndex>,
    ids: &[TaskId],
) -> Vec<TaskId> {
    let mut in_degree: HashMap<TaskId, usize> = ids
        .iter()
        .map(|id| {
            (
                *id,
                graph
                    .neighbors_directed(nodes[id], Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let mut heap: BinaryHeap<Reverse<TaskId>> = ids
        .iter()
        .filter(|id| in_degree[id] == 0)
        .map(|id| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(task)) = heap.pop() {
        order.push(task);
        for next in graph.neighbors_directed(nodes[&task], Direction::Outgoing)
        {
            let next = graph[next];
            let degree = in_degree.get_mut(&next).unwrap();
            *degree -= 1;
            if *degree == 0 {
                heap.push(Reverse(next));
            }
        }
    }
    // Cycles were rejected earlier, so the order is always complete.
    debug_assert_eq!(order.len(), ids.len());
    order
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Blueprint;

    fn position(order: &[TaskId], task: TaskId) -> usize {
        order.iter().position(|&t| t == task).unwrap()
    }

    #[test]
    fn test_wiring_infers_edges_and_order() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let write = bp.task(root, "writeDockerfile").unwrap();
        let image = bp.task(root, "dockerBuild").unwrap();
        let out = bp.output::<String>(write, "dockerfile").unwrap();
        let inp = bp.input::<String>(image, "dockerfile").unwrap();
        bp.wire(inp, out).unwrap();

        let build = bp.finish();
        let graph = build.graph(&Targets::All).unwrap();

        assert_eq!(graph.predecessors(image), vec![write]);
        assert_eq!(graph.successors(write), vec![image]);
        let order = graph.execution_order();
        assert!(position(order, write) < position(order, image));
    }

    #[test]
    fn test_diamond_is_topologically_valid_and_deterministic() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let top = bp.task(root, "top").unwrap();
        let left = bp.task(root, "left").unwrap();
        let right = bp.task(root, "right").unwrap();
        let bottom = bp.task(root, "bottom").unwrap();

        let src = bp.output::<u32>(top, "n").unwrap();
        let l_in = bp.input::<u32>(left, "n").unwrap();
        let r_in = bp.input::<u32>(right, "n").unwrap();
        bp.wire(l_in, src).unwrap();
        bp.wire(r_in, src).unwrap();
        let l_out = bp.output::<u32>(left, "n2").unwrap();
        let r_out = bp.output::<u32>(right, "n2").unwrap();
        let sum = bp.output::<u32>(bottom, "sum").unwrap();
        bp.derive(sum, (l_out, r_out), |(l, r)| Ok(l + r)).unwrap();

        let build = bp.finish();
        let graph = build.graph(&Targets::All).unwrap();
        let order = graph.execution_order().to_vec();

        for task in [left, right] {
            assert!(position(&order, top) < position(&order, task));
            assert!(position(&order, task) < position(&order, bottom));
        }
        // Independent siblings appear in declaration order.
        assert!(position(&order, left) < position(&order, right));
        assert_eq!(graph.predecessors(bottom), vec![left, right]);
    }

    #[test]
    fn test_task_cycle_is_reported_with_full_path() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        let b = bp.task(root, "b").unwrap();
        let a_in = bp.input::<String>(a, "in").unwrap();
        let a_out = bp.output::<String>(a, "out").unwrap();
        let b_in = bp.input::<String>(b, "in").unwrap();
        let b_out = bp.output::<String>(b, "out").unwrap();
        bp.wire(a_in, b_out).unwrap();
        bp.wire(b_in, a_out).unwrap();

        let build = bp.finish();
        let err = build.graph(&Targets::All).unwrap_err();
        let GraphError::Cycle(paths) = err else {
            panic!("expected cycle error");
        };
        assert_eq!(paths.first(), paths.last());
        assert!(paths.contains(&"a".to_string()));
        assert!(paths.contains(&"b".to_string()));
    }

    #[test]
    fn test_property_reference_cycle_is_rejected() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let task = bp.task(root, "loop").unwrap();
        let x = bp.input::<String>(task, "x").unwrap();
        let y = bp.input::<String>(task, "y").unwrap();
        bp.wire(x, y).unwrap();
        bp.wire(y, x).unwrap();

        let build = bp.finish();
        let err = build.graph(&Targets::All).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_targets_schedule_transitive_predecessors_only() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        let b = bp.task(root, "b").unwrap();
        let unrelated = bp.task(root, "unrelated").unwrap();
        bp.depends_on(b, a);

        let build = bp.finish();
        let graph = build
            .graph(&Targets::Paths(vec!["b".to_string()]))
            .unwrap();
        assert!(graph.contains(a));
        assert!(graph.contains(b));
        assert!(!graph.contains(unrelated));

        let err = build
            .graph(&Targets::Paths(vec!["nope".to_string()]))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownTarget(_)));
    }

    #[test]
    fn test_order_only_predecessor_is_not_pulled_into_schedule() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let first = bp.task(root, "first").unwrap();
        let second = bp.task(root, "second").unwrap();
        bp.runs_after(second, first);

        let build = bp.finish();

        // Targeting `second` alone leaves `first` out entirely.
        let graph = build
            .graph(&Targets::Paths(vec!["second".to_string()]))
            .unwrap();
        assert!(!graph.contains(first));

        // When both are scheduled, the order-only edge applies.
        let graph = build.graph(&Targets::All).unwrap();
        let order = graph.execution_order();
        assert!(position(order, first) < position(order, second));
    }

    #[test]
    fn test_group_runs_after_members_and_is_not_default() {
        let mut bp = Blueprint::new();
        let root = bp.root();
        let a = bp.task(root, "a").unwrap();
        let b = bp.task(root, "b").unwrap();
        let check = bp.group(root, "check", [a, b]).unwrap();

        let build = bp.finish();
        let graph = build.graph(&Targets::All).unwrap();
        let order = graph.execution_order();
        assert!(position(order, a) < position(order, check));
        assert!(position(order, b) < position(order, check));

        // `Default` leaves the group out, while targeting it pulls in the
        // members.
        let graph = build.graph(&Targets::Default).unwrap();
        assert!(!graph.contains(check));
        let graph = build
            .graph(&Targets::Paths(vec!["check".to_string()]))
            .unwrap();
        assert_eq!(graph.len(), 3);
    }
}
