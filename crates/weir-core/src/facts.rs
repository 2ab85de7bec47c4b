//! Durable cluster facts behind a transactional, time-travel-capable store.
//!
//! The fact store is the authoritative record of peers, jobs, and tasks.
//! Every mutation is a transaction stamped with a monotone [`TxId`]; readers
//! get consistent snapshots, can rewind to any committed transaction, and
//! can ask for a history view that also sees retracted peers.
//!
//! Writers are serialized; readers never block writers.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::sync::SyncPath;
use crate::workflow::{Catalog, JobId, TaskId, TaskSpec, Workflow};

/// Monotone transaction identifier.
pub type TxId = u64;

/// Peer lifecycle status.
///
/// `idle → acking` on offer, `acking → active` on ack, `active → idle` on
/// completion. Death retracts the peer fact entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Registered, no task assigned.
    Idle,
    /// Offered a task, not yet acknowledged.
    Acking,
    /// Executing its assigned task.
    Active,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Acking => f.write_str("acking"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// The four sync places allocated for a peer at offer time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerNodes {
    /// Where the task assignment payload is written.
    pub payload: SyncPath,
    /// Touched by the peer to accept the offer.
    pub ack: SyncPath,
    /// Task status place.
    pub status: SyncPath,
    /// Touched by the peer when the task is done.
    pub completion: SyncPath,
}

/// A live peer fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFact {
    /// The peer's registration place; its identity.
    pub peer: SyncPath,
    /// Current lifecycle status.
    pub status: PeerStatus,
    /// Assigned task, if any.
    pub task: Option<TaskId>,
    /// Offer-time sync places, present while a task is assigned.
    pub nodes: Option<PeerNodes>,
}

/// A planned job fact.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFact {
    /// The job's id.
    pub id: JobId,
    /// The submitted catalog.
    pub catalog: Catalog,
    /// The submitted workflow.
    pub workflow: Workflow,
    /// Sync place holding the serialized catalog.
    pub catalog_node: SyncPath,
    /// Sync place holding the serialized workflow.
    pub workflow_node: SyncPath,
    /// Bumped on every reallocation.
    pub allocation_version: u64,
    /// Set once every task of the job has completed. Monotone.
    pub completed: bool,
}

/// A planned task plus its completion flag.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// The planned task.
    pub spec: TaskSpec,
    /// Monotone false → true, flipped by [`FactStore::complete`].
    pub complete: bool,
}

/// A consistent read snapshot of the fact store.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// The transaction this snapshot reflects.
    pub tx: TxId,
    /// Live peers by registration place.
    pub peers: BTreeMap<SyncPath, PeerFact>,
    /// Jobs by id.
    pub jobs: BTreeMap<JobId, JobFact>,
    /// Tasks by id.
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

impl ClusterSnapshot {
    /// Finds the peer owning the given ack place.
    #[must_use]
    pub fn peer_by_ack(&self, ack: &SyncPath) -> Option<&PeerFact> {
        self.peers
            .values()
            .find(|p| p.nodes.as_ref().is_some_and(|n| &n.ack == ack))
    }

    /// Finds the peer owning the given completion place.
    #[must_use]
    pub fn peer_by_completion(&self, completion: &SyncPath) -> Option<&PeerFact> {
        self.peers
            .values()
            .find(|p| p.nodes.as_ref().is_some_and(|n| &n.completion == completion))
    }

    /// Finds the peer currently holding a task, in any assigned status.
    #[must_use]
    pub fn peer_for_task(&self, task: TaskId) -> Option<&PeerFact> {
        self.peers.values().find(|p| p.task == Some(task))
    }
}

/// A snapshot that also sees retracted peers.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// The live view.
    pub current: ClusterSnapshot,
    /// Peers retracted by death, with the retracting transaction.
    pub retracted_peers: Vec<(TxId, PeerFact)>,
}

/// Errors from fact store transactions.
#[derive(Debug, Error)]
pub enum FactError {
    /// The peer is already registered.
    #[error("peer already registered: {0}")]
    Duplicate(SyncPath),

    /// The peer is unknown or already dead.
    #[error("no such peer: {0}")]
    NotFound(SyncPath),

    /// The transition is not legal from the current state.
    #[error("invalid transition: {0}")]
    Invalid(String),
}

/// Outcome of a successful ack transaction.
#[derive(Debug, Clone)]
pub struct AckOutcome {
    /// The committing transaction.
    pub tx: TxId,
    /// The acknowledging peer.
    pub peer: SyncPath,
    /// The task the peer is now actively executing.
    pub task: TaskId,
}

/// Outcome of a successful completion transaction.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// The committing transaction.
    pub tx: TxId,
    /// The peer returned to idle.
    pub peer: SyncPath,
    /// The completed task.
    pub task: TaskId,
    /// The peer's retracted offer-time places, for sync-store cleanup.
    pub nodes: PeerNodes,
    /// Set when this completion finished the whole job.
    pub job_completed: Option<JobId>,
}

/// Outcome of a successful peer-death transaction.
#[derive(Debug, Clone)]
pub struct DeathOutcome {
    /// The committing transaction.
    pub tx: TxId,
    /// The retracted peer fact, as of just before death.
    pub peer: PeerFact,
}

/// The durable fact capability.
///
/// Alternative adapters (in-memory, remote) implement this one set; callers
/// depend only on the capability.
pub trait FactStore: Send + Sync {
    /// Registers a peer with status idle.
    ///
    /// # Errors
    ///
    /// [`FactError::Duplicate`] if the peer is already present.
    fn mark_peer_born(&self, peer: &SyncPath) -> Result<TxId, FactError>;

    /// Retracts a peer. Its assigned task, if any, becomes assignable again.
    ///
    /// # Errors
    ///
    /// [`FactError::NotFound`] if the peer is absent.
    fn mark_peer_dead(&self, peer: &SyncPath) -> Result<DeathOutcome, FactError>;

    /// Atomically inserts a job and its planned tasks.
    ///
    /// # Errors
    ///
    /// [`FactError::Invalid`] if the job id is already planned.
    fn plan_job(&self, job: JobFact, tasks: Vec<TaskSpec>) -> Result<TxId, FactError>;

    /// The next incomplete, unassigned task in ascending phase order, if any.
    ///
    /// Tasks of completed jobs are never returned.
    fn next_task(&self) -> Option<TaskSpec>;

    /// Any peer with status idle.
    fn idle_peer(&self) -> Option<SyncPath>;

    /// Atomically moves a peer to `acking`, assigns it the task, and stores
    /// the offer-time places.
    ///
    /// # Errors
    ///
    /// [`FactError::NotFound`] if the peer is absent; [`FactError::Invalid`]
    /// if the peer is not idle, the task is unknown or complete, or the task
    /// already has an assigned peer.
    fn mark_offered(
        &self,
        task: TaskId,
        peer: &SyncPath,
        nodes: PeerNodes,
    ) -> Result<TxId, FactError>;

    /// Moves the peer owning `ack_path` from `acking` to `active`.
    ///
    /// # Errors
    ///
    /// [`FactError::Invalid`] if no peer owns the path, the peer is not in
    /// `acking`, or its task is already complete.
    fn ack(&self, ack_path: &SyncPath) -> Result<AckOutcome, FactError>;

    /// Marks the task of the peer owning `completion_path` complete and
    /// returns the peer to idle, retracting its offer-time places.
    ///
    /// # Errors
    ///
    /// [`FactError::Invalid`] if no peer owns the path, the peer is not in
    /// `active`, or the task is already complete.
    fn complete(&self, completion_path: &SyncPath) -> Result<CompletionOutcome, FactError>;

    /// A consistent snapshot of current facts.
    fn snapshot(&self) -> ClusterSnapshot;

    /// A snapshot that also sees retracted peers.
    fn history(&self) -> HistorySnapshot;

    /// The view as of a committed transaction, if it exists.
    fn as_of(&self, tx: TxId) -> Option<ClusterSnapshot>;
}

#[derive(Default)]
struct FactState {
    next_tx: TxId,
    current: ClusterSnapshot,
    retracted_peers: Vec<(TxId, PeerFact)>,
    log: BTreeMap<TxId, ClusterSnapshot>,
}

impl FactState {
    /// Stamps the pending mutation with the next tx and records the snapshot.
    fn commit(&mut self) -> TxId {
        self.next_tx += 1;
        let tx = self.next_tx;
        self.current.tx = tx;
        self.log.insert(tx, self.current.clone());
        tx
    }
}

/// In-process [`FactStore`] used by the development runtime and tests.
#[derive(Default)]
pub struct MemoryFactStore {
    state: RwLock<FactState>,
}

impl MemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryFactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryFactStore")
            .field("tx", &state.current.tx)
            .field("peers", &state.current.peers.len())
            .field("jobs", &state.current.jobs.len())
            .field("tasks", &state.current.tasks.len())
            .finish()
    }
}

impl FactStore for MemoryFactStore {
    fn mark_peer_born(&self, peer: &SyncPath) -> Result<TxId, FactError> {
        let mut state = self.state.write();
        if state.current.peers.contains_key(peer) {
            return Err(FactError::Duplicate(peer.clone()));
        }
        state.current.peers.insert(
            peer.clone(),
            PeerFact {
                peer: peer.clone(),
                status: PeerStatus::Idle,
                task: None,
                nodes: None,
            },
        );
        Ok(state.commit())
    }

    fn mark_peer_dead(&self, peer: &SyncPath) -> Result<DeathOutcome, FactError> {
        let mut state = self.state.write();
        let fact = state
            .current
            .peers
            .remove(peer)
            .ok_or_else(|| FactError::NotFound(peer.clone()))?;
        let tx = state.commit();
        state.retracted_peers.push((tx, fact.clone()));
        Ok(DeathOutcome { tx, peer: fact })
    }

    fn plan_job(&self, job: JobFact, tasks: Vec<TaskSpec>) -> Result<TxId, FactError> {
        let mut state = self.state.write();
        if state.current.jobs.contains_key(&job.id) {
            return Err(FactError::Invalid(format!("job already planned: {}", job.id)));
        }
        for task in tasks {
            state.current.tasks.insert(
                task.id,
                TaskRecord {
                    spec: task,
                    complete: false,
                },
            );
        }
        state.current.jobs.insert(job.id, job);
        Ok(state.commit())
    }

    fn next_task(&self) -> Option<TaskSpec> {
        let state = self.state.read();
        let snapshot = &state.current;
        snapshot
            .tasks
            .values()
            .filter(|record| !record.complete)
            .filter(|record| {
                snapshot
                    .jobs
                    .get(&record.spec.job)
                    .is_some_and(|job| !job.completed)
            })
            .filter(|record| snapshot.peer_for_task(record.spec.id).is_none())
            .min_by(|a, b| {
                (a.spec.phase, &a.spec.job, &a.spec.name)
                    .cmp(&(b.spec.phase, &b.spec.job, &b.spec.name))
            })
            .map(|record| record.spec.clone())
    }

    fn idle_peer(&self) -> Option<SyncPath> {
        let state = self.state.read();
        state
            .current
            .peers
            .values()
            .find(|p| p.status == PeerStatus::Idle)
            .map(|p| p.peer.clone())
    }

    fn mark_offered(
        &self,
        task: TaskId,
        peer: &SyncPath,
        nodes: PeerNodes,
    ) -> Result<TxId, FactError> {
        let mut state = self.state.write();
        let record = state
            .current
            .tasks
            .get(&task)
            .ok_or_else(|| FactError::Invalid(format!("unknown task: {task}")))?;
        if record.complete {
            return Err(FactError::Invalid(format!("task already complete: {task}")));
        }
        if state.current.peer_for_task(task).is_some() {
            return Err(FactError::Invalid(format!("task already assigned: {task}")));
        }
        let fact = state
            .current
            .peers
            .get_mut(peer)
            .ok_or_else(|| FactError::NotFound(peer.clone()))?;
        if fact.status != PeerStatus::Idle {
            return Err(FactError::Invalid(format!(
                "peer {peer} is {} and cannot be offered a task",
                fact.status
            )));
        }
        fact.status = PeerStatus::Acking;
        fact.task = Some(task);
        fact.nodes = Some(nodes);
        Ok(state.commit())
    }

    fn ack(&self, ack_path: &SyncPath) -> Result<AckOutcome, FactError> {
        let mut state = self.state.write();
        let peer_path = state
            .current
            .peer_by_ack(ack_path)
            .map(|p| p.peer.clone())
            .ok_or_else(|| FactError::Invalid(format!("no peer for ack place: {ack_path}")))?;
        let task = {
            let fact = state.current.peers.get(&peer_path).expect("found above");
            if fact.status != PeerStatus::Acking {
                return Err(FactError::Invalid(format!(
                    "peer {peer_path} is {}, expected acking",
                    fact.status
                )));
            }
            fact.task.expect("acking peer always has a task")
        };
        if state.current.tasks.get(&task).is_some_and(|r| r.complete) {
            return Err(FactError::Invalid(format!("task already complete: {task}")));
        }
        state
            .current
            .peers
            .get_mut(&peer_path)
            .expect("found above")
            .status = PeerStatus::Active;
        let tx = state.commit();
        Ok(AckOutcome {
            tx,
            peer: peer_path,
            task,
        })
    }

    fn complete(&self, completion_path: &SyncPath) -> Result<CompletionOutcome, FactError> {
        let mut state = self.state.write();
        let peer_path = state
            .current
            .peer_by_completion(completion_path)
            .map(|p| p.peer.clone())
            .ok_or_else(|| {
                FactError::Invalid(format!("no peer for completion place: {completion_path}"))
            })?;
        let (task, nodes) = {
            let fact = state.current.peers.get(&peer_path).expect("found above");
            if fact.status != PeerStatus::Active {
                return Err(FactError::Invalid(format!(
                    "peer {peer_path} is {}, expected active",
                    fact.status
                )));
            }
            (
                fact.task.expect("active peer always has a task"),
                fact.nodes.clone().expect("active peer always has nodes"),
            )
        };
        let record = state
            .current
            .tasks
            .get_mut(&task)
            .ok_or_else(|| FactError::Invalid(format!("unknown task: {task}")))?;
        if record.complete {
            return Err(FactError::Invalid(format!("task already complete: {task}")));
        }
        record.complete = true;
        let job_id = record.spec.job;

        let fact = state.current.peers.get_mut(&peer_path).expect("found above");
        fact.status = PeerStatus::Idle;
        fact.task = None;
        fact.nodes = None;

        let job_done = state
            .current
            .tasks
            .values()
            .filter(|r| r.spec.job == job_id)
            .all(|r| r.complete);
        if job_done {
            if let Some(job) = state.current.jobs.get_mut(&job_id) {
                job.completed = true;
            }
        }

        let tx = state.commit();
        Ok(CompletionOutcome {
            tx,
            peer: peer_path,
            task,
            nodes,
            job_completed: job_done.then_some(job_id),
        })
    }

    fn snapshot(&self) -> ClusterSnapshot {
        self.state.read().current.clone()
    }

    fn history(&self) -> HistorySnapshot {
        let state = self.state.read();
        HistorySnapshot {
            current: state.current.clone(),
            retracted_peers: state.retracted_peers.clone(),
        }
    }

    fn as_of(&self, tx: TxId) -> Option<ClusterSnapshot> {
        self.state.read().log.get(&tx).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{plan_tasks, Catalog, CatalogEntry, CatalogEntryKind, QueueDirection,
        Workflow, WorkflowNode};
    use std::collections::BTreeMap;

    fn peer(n: u32) -> SyncPath {
        SyncPath::new(format!("/weir/peer/{n:010}"))
    }

    fn nodes(n: u32) -> PeerNodes {
        PeerNodes {
            payload: SyncPath::new(format!("/weir/payload/{n:010}")),
            ack: SyncPath::new(format!("/weir/ack/{n:010}")),
            status: SyncPath::new(format!("/weir/status/{n:010}")),
            completion: SyncPath::new(format!("/weir/completion/{n:010}")),
        }
    }

    fn plan_linear(store: &MemoryFactStore) -> (JobId, Vec<TaskSpec>) {
        let catalog = Catalog(vec![
            CatalogEntry {
                name: "in".into(),
                kind: CatalogEntryKind::Queue {
                    direction: QueueDirection::Input,
                    medium: "hornetq".into(),
                    queue: "in-queue".into(),
                },
                consumption: None,
            },
            CatalogEntry {
                name: "inc".into(),
                kind: CatalogEntryKind::Transformer,
                consumption: None,
            },
            CatalogEntry {
                name: "out".into(),
                kind: CatalogEntryKind::Queue {
                    direction: QueueDirection::Output,
                    medium: "hornetq".into(),
                    queue: "out-queue".into(),
                },
                consumption: None,
            },
        ]);
        let mut branch = BTreeMap::new();
        branch.insert("inc".to_owned(), WorkflowNode::Leaf("out".to_owned()));
        let mut roots = BTreeMap::new();
        roots.insert("in".to_owned(), WorkflowNode::Branch(branch));
        let workflow = Workflow(roots);

        let job = JobId::new();
        let tasks = plan_tasks(job, &catalog, &workflow).unwrap();
        store
            .plan_job(
                JobFact {
                    id: job,
                    catalog,
                    workflow,
                    catalog_node: SyncPath::new("/weir/catalog/0000000001"),
                    workflow_node: SyncPath::new("/weir/workflow/0000000001"),
                    allocation_version: 0,
                    completed: false,
                },
                tasks.clone(),
            )
            .unwrap();
        (job, tasks)
    }

    #[test]
    fn test_birth_is_idle_and_duplicate_rejected() {
        let store = MemoryFactStore::new();
        store.mark_peer_born(&peer(1)).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.peers[&peer(1)].status, PeerStatus::Idle);

        assert!(matches!(
            store.mark_peer_born(&peer(1)),
            Err(FactError::Duplicate(_))
        ));
    }

    #[test]
    fn test_death_retracts_and_history_still_sees_peer() {
        let store = MemoryFactStore::new();
        store.mark_peer_born(&peer(1)).unwrap();
        let death = store.mark_peer_dead(&peer(1)).unwrap();

        assert!(store.snapshot().peers.is_empty());
        let history = store.history();
        assert_eq!(history.retracted_peers.len(), 1);
        assert_eq!(history.retracted_peers[0].0, death.tx);

        assert!(matches!(
            store.mark_peer_dead(&peer(1)),
            Err(FactError::NotFound(_))
        ));
    }

    #[test]
    fn test_next_task_ascending_phase_and_assignment_excluded() {
        let store = MemoryFactStore::new();
        let (_, tasks) = plan_linear(&store);

        let first = store.next_task().unwrap();
        assert_eq!(first.name, "in");
        assert_eq!(first.phase, 0);

        store.mark_peer_born(&peer(1)).unwrap();
        store.mark_offered(first.id, &peer(1), nodes(1)).unwrap();

        // The assigned task is skipped; the next phase surfaces.
        let second = store.next_task().unwrap();
        assert_eq!(second.name, "inc");
        assert_eq!(tasks.len(), 3);
    }

    #[test]
    fn test_offer_requires_idle_peer_and_unassigned_task() {
        let store = MemoryFactStore::new();
        let (_, tasks) = plan_linear(&store);
        store.mark_peer_born(&peer(1)).unwrap();
        store.mark_peer_born(&peer(2)).unwrap();

        store.mark_offered(tasks[0].id, &peer(1), nodes(1)).unwrap();

        // Same task to another peer: rejected.
        assert!(matches!(
            store.mark_offered(tasks[0].id, &peer(2), nodes(2)),
            Err(FactError::Invalid(_))
        ));
        // Acking peer offered again: rejected.
        assert!(matches!(
            store.mark_offered(tasks[1].id, &peer(1), nodes(3)),
            Err(FactError::Invalid(_))
        ));
    }

    #[test]
    fn test_ack_transitions_acking_to_active() {
        let store = MemoryFactStore::new();
        let (_, tasks) = plan_linear(&store);
        store.mark_peer_born(&peer(1)).unwrap();
        let offer_nodes = nodes(1);
        store
            .mark_offered(tasks[0].id, &peer(1), offer_nodes.clone())
            .unwrap();

        // Pre-image: acking, task incomplete.
        let pre = store.snapshot();
        assert_eq!(pre.peers[&peer(1)].status, PeerStatus::Acking);
        assert!(!pre.tasks[&tasks[0].id].complete);

        let outcome = store.ack(&offer_nodes.ack).unwrap();
        assert_eq!(outcome.task, tasks[0].id);

        // Post-image: active.
        let post = store.snapshot();
        assert_eq!(post.peers[&peer(1)].status, PeerStatus::Active);

        // Second ack: peer no longer acking.
        assert!(matches!(
            store.ack(&offer_nodes.ack),
            Err(FactError::Invalid(_))
        ));
        // Unknown path.
        assert!(matches!(
            store.ack(&SyncPath::new("/weir/ack/none")),
            Err(FactError::Invalid(_))
        ));
    }

    #[test]
    fn test_complete_retracts_nodes_and_is_monotone() {
        let store = MemoryFactStore::new();
        let (_, tasks) = plan_linear(&store);
        store.mark_peer_born(&peer(1)).unwrap();
        let offer_nodes = nodes(1);
        store
            .mark_offered(tasks[0].id, &peer(1), offer_nodes.clone())
            .unwrap();
        store.ack(&offer_nodes.ack).unwrap();

        let outcome = store.complete(&offer_nodes.completion).unwrap();
        assert_eq!(outcome.task, tasks[0].id);
        assert_eq!(outcome.nodes, offer_nodes);
        assert!(outcome.job_completed.is_none());

        // Post-image: task complete, peer idle with node places retracted.
        let snap = store.as_of(outcome.tx).unwrap();
        assert!(snap.tasks[&tasks[0].id].complete);
        let fact = &snap.peers[&peer(1)];
        assert_eq!(fact.status, PeerStatus::Idle);
        assert!(fact.task.is_none());
        assert!(fact.nodes.is_none());

        // Completion place is gone; a second completion is invalid.
        assert!(matches!(
            store.complete(&offer_nodes.completion),
            Err(FactError::Invalid(_))
        ));
    }

    #[test]
    fn test_completing_every_task_completes_the_job() {
        let store = MemoryFactStore::new();
        let (job, tasks) = plan_linear(&store);
        store.mark_peer_born(&peer(1)).unwrap();

        for (i, task) in tasks.iter().enumerate() {
            let offer_nodes = nodes(u32::try_from(i).unwrap() + 1);
            store
                .mark_offered(task.id, &peer(1), offer_nodes.clone())
                .unwrap();
            store.ack(&offer_nodes.ack).unwrap();
            let outcome = store.complete(&offer_nodes.completion).unwrap();
            if i + 1 == tasks.len() {
                assert_eq!(outcome.job_completed, Some(job));
            } else {
                assert!(outcome.job_completed.is_none());
            }
        }

        assert!(store.snapshot().jobs[&job].completed);
        assert!(store.next_task().is_none());
    }

    #[test]
    fn test_as_of_rewinds_to_committed_tx() {
        let store = MemoryFactStore::new();
        let birth_tx = store.mark_peer_born(&peer(1)).unwrap();
        store.mark_peer_dead(&peer(1)).unwrap();

        let then = store.as_of(birth_tx).unwrap();
        assert!(then.peers.contains_key(&peer(1)));
        assert!(store.snapshot().peers.is_empty());
        assert!(store.as_of(birth_tx + 10).is_none());
    }

    #[test]
    fn test_at_most_one_peer_per_task_across_statuses() {
        let store = MemoryFactStore::new();
        let (_, tasks) = plan_linear(&store);
        store.mark_peer_born(&peer(1)).unwrap();
        store.mark_peer_born(&peer(2)).unwrap();
        let offer_nodes = nodes(1);
        store
            .mark_offered(tasks[0].id, &peer(1), offer_nodes.clone())
            .unwrap();
        store.ack(&offer_nodes.ack).unwrap();

        // Active assignment still blocks a second offer of the same task.
        assert!(store.mark_offered(tasks[0].id, &peer(2), nodes(2)).is_err());

        let snap = store.snapshot();
        let holders = snap
            .peers
            .values()
            .filter(|p| p.task == Some(tasks[0].id))
            .count();
        assert_eq!(holders, 1);
    }
}
