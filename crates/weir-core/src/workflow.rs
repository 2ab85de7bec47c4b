//! Job catalogs, workflow DAGs, and topological task planning.
//!
//! A job is submitted as a *catalog* (a list of task descriptors) plus a
//! *workflow* (a nested map-of-maps describing a DAG of task names). Planning
//! turns the pair into concrete task specs: each task gets a phase equal to
//! its distance from the workflow roots, input tasks read from the queue the
//! catalog declares, output tasks write to the catalog's queue, and every
//! workflow edge gets a fresh internal queue stitched between its endpoints.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a submitted job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocates a fresh job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of a planned task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Allocates a fresh task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Direction of a queue-typed catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDirection {
    /// The task consumes from the declared queue.
    Input,
    /// The task produces to the declared queue.
    Output,
}

/// What a catalog entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEntryKind {
    /// A queue endpoint: the job's boundary with the outside world.
    Queue {
        /// Whether the task reads or writes the queue.
        direction: QueueDirection,
        /// The queue medium (broker family); opaque to the coordinator.
        medium: String,
        /// The externally-declared queue name.
        queue: String,
    },
    /// A pure transformation task.
    Transformer,
}

/// One task descriptor from a submitted catalog.
///
/// The coordinator inspects only the name and kind; `consumption` is carried
/// opaquely for the task runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Task name; must match a node in the workflow.
    pub name: String,
    /// Queue or transformer.
    #[serde(flatten)]
    pub kind: CatalogEntryKind,
    /// Opaque consumption settings, passed through to the executing peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumption: Option<serde_json::Value>,
}

/// A submitted catalog: the job's task descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog(pub Vec<CatalogEntry>);

impl Catalog {
    /// Finds the entry for a task name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.0.iter().find(|e| e.name == name)
    }
}

/// A node in the nested map-of-maps workflow form.
///
/// `{"in": {"inc": "out"}}` reads: `in → inc → out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowNode {
    /// A terminal successor.
    Leaf(String),
    /// Successors, each with its own continuation.
    Branch(BTreeMap<String, WorkflowNode>),
}

/// A workflow DAG in the submitted map-of-maps form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow(pub BTreeMap<String, WorkflowNode>);

impl Workflow {
    /// Collects the directed edge set of the DAG.
    #[must_use]
    pub fn edges(&self) -> BTreeSet<(String, String)> {
        fn collect(src: &str, node: &WorkflowNode, edges: &mut BTreeSet<(String, String)>) {
            match node {
                WorkflowNode::Leaf(dst) => {
                    edges.insert((src.to_owned(), dst.clone()));
                }
                WorkflowNode::Branch(children) => {
                    for (dst, rest) in children {
                        edges.insert((src.to_owned(), dst.clone()));
                        collect(dst, rest, edges);
                    }
                }
            }
        }

        let mut edges = BTreeSet::new();
        for (src, node) in &self.0 {
            collect(src, node, &mut edges);
        }
        edges
    }

    /// Collects every task name appearing in the DAG.
    #[must_use]
    pub fn task_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for (src, dst) in self.edges() {
            names.insert(src);
            names.insert(dst);
        }
        names
    }
}

/// A fully planned task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique id of this task.
    pub id: TaskId,
    /// The job this task belongs to.
    pub job: JobId,
    /// Task name from the workflow.
    pub name: String,
    /// Topological rank: distance from the workflow roots (inputs = 0).
    pub phase: u32,
    /// Queues this task consumes from.
    pub ingress_queues: BTreeSet<String>,
    /// Queues this task produces to.
    pub egress_queues: BTreeSet<String>,
}

/// Errors raised while planning a job.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The workflow has no edges.
    #[error("workflow is empty")]
    EmptyWorkflow,

    /// A workflow task has no catalog entry.
    #[error("workflow task has no catalog entry: {0}")]
    UnknownTask(String),

    /// The workflow contains a cycle and cannot be ranked.
    #[error("workflow contains a cycle through: {0}")]
    Cycle(String),

    /// A workflow root is not an input queue in the catalog.
    #[error("workflow root '{0}' is not declared as an input queue")]
    RootNotInput(String),

    /// A workflow sink is not an output queue in the catalog.
    #[error("workflow sink '{0}' is not declared as an output queue")]
    SinkNotOutput(String),
}

/// Plans the tasks of a job from its catalog and workflow.
///
/// Phases are topological ranks (longest distance from a root). Roots take
/// their ingress queue from the catalog's input declaration; sinks take their
/// egress queue from the catalog's output declaration; every workflow edge
/// `a → b` gets a fresh internal queue appended to `a`'s egress and `b`'s
/// ingress sets.
///
/// # Errors
///
/// Returns [`PlanError`] for an empty or cyclic workflow, a task missing from
/// the catalog, or a root/sink whose catalog entry is not the matching queue
/// direction.
pub fn plan_tasks(
    job: JobId,
    catalog: &Catalog,
    workflow: &Workflow,
) -> Result<Vec<TaskSpec>, PlanError> {
    let edges = workflow.edges();
    if edges.is_empty() {
        return Err(PlanError::EmptyWorkflow);
    }
    let names = workflow.task_names();
    for name in &names {
        if catalog.entry(name).is_none() {
            return Err(PlanError::UnknownTask(name.clone()));
        }
    }

    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut indegree: BTreeMap<&str, u32> = names.iter().map(|n| (n.as_str(), 0)).collect();
    for (src, dst) in &edges {
        successors.entry(src.as_str()).or_default().push(dst.as_str());
        *indegree.get_mut(dst.as_str()).expect("dst is a known task") += 1;
    }

    // Kahn's algorithm; rank = longest distance from any root.
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut phases: BTreeMap<&str, u32> = ready.iter().map(|n| (*n, 0)).collect();
    let mut visited = 0usize;
    while let Some(name) = ready.pop() {
        visited += 1;
        let phase = phases[name];
        for &succ in successors.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            let entry = phases.entry(succ).or_insert(0);
            *entry = (*entry).max(phase + 1);
            let degree = indegree.get_mut(succ).expect("succ is a known task");
            *degree -= 1;
            if *degree == 0 {
                ready.push(succ);
            }
        }
    }
    if visited != names.len() {
        let stuck = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(n, _)| (*n).to_owned())
            .unwrap_or_default();
        return Err(PlanError::Cycle(stuck));
    }

    let mut ingress: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut egress: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();

    for name in &names {
        let entry = catalog.entry(name).expect("checked above");
        let is_root = phases[name.as_str()] == 0;
        let is_sink = !successors.contains_key(name.as_str());
        match &entry.kind {
            CatalogEntryKind::Queue {
                direction: QueueDirection::Input,
                queue,
                ..
            } if is_root => {
                ingress.entry(name.as_str()).or_default().insert(queue.clone());
            }
            CatalogEntryKind::Queue {
                direction: QueueDirection::Output,
                queue,
                ..
            } if is_sink => {
                egress.entry(name.as_str()).or_default().insert(queue.clone());
            }
            CatalogEntryKind::Transformer => {}
            CatalogEntryKind::Queue { .. } if is_root => {
                return Err(PlanError::RootNotInput(name.clone()));
            }
            CatalogEntryKind::Queue { .. } => {
                return Err(PlanError::SinkNotOutput(name.clone()));
            }
        }
    }

    // One fresh internal queue per workflow edge.
    for (src, dst) in &edges {
        let queue = Uuid::new_v4().to_string();
        egress.entry(src.as_str()).or_default().insert(queue.clone());
        ingress.entry(dst.as_str()).or_default().insert(queue);
    }

    let mut by_name: HashMap<&str, TaskSpec> = HashMap::new();
    for name in &names {
        by_name.insert(
            name.as_str(),
            TaskSpec {
                id: TaskId::new(),
                job,
                name: name.clone(),
                phase: phases[name.as_str()],
                ingress_queues: ingress.remove(name.as_str()).unwrap_or_default(),
                egress_queues: egress.remove(name.as_str()).unwrap_or_default(),
            },
        );
    }

    let mut tasks: Vec<TaskSpec> = by_name.into_values().collect();
    tasks.sort_by(|a, b| (a.phase, a.name.as_str()).cmp(&(b.phase, b.name.as_str())));
    Ok(tasks)
}

/// Longest root-to-sink path length, in tasks.
///
/// Drives the barrier coordinator's checkpointed-epoch lag.
#[must_use]
pub fn workflow_depth(tasks: &[TaskSpec]) -> u32 {
    tasks.iter().map(|t| t.phase + 1).max().unwrap_or(0)
}
