//! The process-wide cluster coordinator.
//!
//! Owns peer lifecycle, job planning, task offering, acking, completion,
//! eviction, and failure reporting. Each input channel is drained by its own
//! cooperative worker; every durable effect is a fact-store transaction; and
//! every state transition is fanned out on a broadcast channel in commit
//! order. Transaction failures are reported on the failure fan-out and never
//! propagate; the loop always continues.
//!
//! ## Peer state machine
//!
//! ```text
//! idle ──offer──► acking ──ack──► active ──complete──► idle
//!   │               │               │
//!   └── pulse lost / revoke ────────┴──► dead (fact retracted)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weir_core::facts::{FactStore, PeerNodes, PeerStatus, TxId};
use weir_core::sync::{ChangeKind, NodeKind, SyncPath, SyncStore, WatchMode};
use weir_core::workflow::{plan_tasks, Catalog, JobId, TaskId, TaskSpec, Workflow};

use crate::config::CoordinatorConfig;
use crate::error::ClusterError;

/// Contents of a peer's registration place, written by the peer process
/// before it announces itself on the born-peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    /// The peer's liveness place; its deletion triggers eviction.
    pub pulse: SyncPath,
    /// Written to signal the peer to stop.
    pub shutdown: SyncPath,
}

/// A job submission from the client API.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningRequest {
    /// Task descriptors.
    pub catalog: Catalog,
    /// The task DAG.
    pub workflow: Workflow,
}

/// The places named inside an offered payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadNodes {
    /// Where this payload lives.
    pub payload: SyncPath,
    /// Touched by the peer to accept.
    pub ack: SyncPath,
    /// Touched by the peer when done.
    pub completion: SyncPath,
    /// Task status place.
    pub status: SyncPath,
    /// The job's serialized catalog.
    pub catalog: SyncPath,
    /// The job's serialized workflow.
    pub workflow: SyncPath,
    /// The peer's own registration place.
    pub peer: SyncPath,
}

/// What the coordinator writes to a peer's payload place on offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntry {
    /// The assigned task.
    pub task: TaskSpec,
    /// All places the peer needs to execute and report.
    pub nodes: PayloadNodes,
}

/// Emitted on the offer fan-out after any state change that might allow
/// offering a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEvent {
    /// A peer registered.
    PeerBorn {
        /// The registering transaction.
        tx: TxId,
    },
    /// A peer died; its task (if any) is assignable again.
    PeerDead {
        /// The retracting transaction.
        tx: TxId,
    },
    /// A job was planned.
    JobPlanned {
        /// The new job.
        job_id: JobId,
        /// The planning transaction.
        tx: TxId,
    },
    /// A task was offered to a peer.
    TaskOffered {
        /// The offering transaction.
        tx: TxId,
    },
    /// A task completed and its peer is idle again.
    TaskCompleted {
        /// The completing transaction.
        tx: TxId,
    },
}

/// Emitted on the ack fan-out when a peer accepts its offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    /// The acknowledging peer.
    pub peer: SyncPath,
    /// The task it now actively executes.
    pub task: TaskId,
    /// The committing transaction.
    pub tx: TxId,
}

/// Emitted on the completion fan-out when a peer finishes its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// The completing peer, idle again.
    pub peer: SyncPath,
    /// The completed task.
    pub task: TaskId,
    /// The committing transaction; its snapshot shows the peer's offer-time
    /// places retracted.
    pub tx: TxId,
    /// Set when this completion finished the whole job.
    pub job_completed: Option<JobId>,
}

/// Emitted on the evict fan-out when a peer is removed from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictEvent {
    /// The evicted peer.
    pub peer: SyncPath,
}

/// Emitted on the shutdown fan-out to tell a peer process to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerShutdownEvent {
    /// The peer being stopped.
    pub peer: SyncPath,
}

/// Which handler rejected a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Duplicate peer registration.
    PeerBirth,
    /// Death of an unknown or already-dead peer.
    PeerDeath,
    /// Ack of an unknown place, a non-acking peer, or a complete task.
    Ack,
    /// Completion of an unknown place, a non-active peer, or a complete task.
    Complete,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerBirth => f.write_str("peer-birth"),
            Self::PeerDeath => f.write_str("peer-death"),
            Self::Ack => f.write_str("ack"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

/// Emitted on the failure fan-out; one event per rejected transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureEvent {
    /// The rejecting handler.
    pub kind: FailureKind,
}

struct Inner {
    facts: Arc<dyn FactStore>,
    sync: Arc<dyn SyncStore>,
    config: CoordinatorConfig,
    offer_mult: broadcast::Sender<OfferEvent>,
    ack_mult: broadcast::Sender<AckEvent>,
    completion_mult: broadcast::Sender<CompletionEvent>,
    evict_mult: broadcast::Sender<EvictEvent>,
    shutdown_mult: broadcast::Sender<PeerShutdownEvent>,
    failure_mult: broadcast::Sender<FailureEvent>,
    /// Feeds the dead-peer worker; cloned into pulse watches.
    dead_peer_tx: mpsc::Sender<SyncPath>,
    /// Feeds the ack worker; cloned into ack-place watches.
    ack_tx: mpsc::Sender<SyncPath>,
    /// Feeds the completion worker; cloned into completion-place watches.
    completion_tx: mpsc::Sender<SyncPath>,
    /// Feeds the revoke worker from expired offer timers.
    revoke_tx: mpsc::Sender<SyncPath>,
    /// Wakes the offer worker.
    offer_wake: Notify,
    /// Pending revoke timers by peer; aborted on ack, death, or completion.
    revokes: Mutex<HashMap<SyncPath, JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Inner {
    fn fail(&self, kind: FailureKind) {
        let _ = self.failure_mult.send(FailureEvent { kind });
    }

    fn signal_offer(&self, event: OfferEvent) {
        let _ = self.offer_mult.send(event);
        self.offer_wake.notify_one();
    }

    fn registration(&self, peer: &SyncPath) -> Option<PeerRegistration> {
        let raw = self.sync.read_place(peer).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    // ── Peer birth ──

    fn handle_birth(&self, peer: SyncPath) {
        match self.facts.mark_peer_born(&peer) {
            Ok(tx) => {
                self.watch_pulse(&peer);
                info!(%peer, tx, "peer registered");
                self.signal_offer(OfferEvent::PeerBorn { tx });
            }
            Err(error) => {
                warn!(%peer, %error, "peer birth rejected");
                self.fail(FailureKind::PeerBirth);
            }
        }
    }

    /// Forwards the disappearance of the peer's pulse to the dead-peer
    /// channel.
    fn watch_pulse(&self, peer: &SyncPath) {
        let Some(registration) = self.registration(peer) else {
            warn!(%peer, "peer registered without readable registration; pulse unwatched");
            return;
        };
        let dead_peer_tx = self.dead_peer_tx.clone();
        let peer = peer.clone();
        self.sync.on_change(
            &registration.pulse,
            WatchMode::Repeated,
            Arc::new(move |event| {
                if event.kind == ChangeKind::Deleted {
                    let _ = dead_peer_tx.try_send(peer.clone());
                }
            }),
        );
    }

    // ── Peer death ──

    fn handle_death(&self, peer: SyncPath) {
        self.cancel_revoke(&peer);
        match self.facts.mark_peer_dead(&peer) {
            Ok(outcome) => {
                info!(%peer, tx = outcome.tx, "peer retracted");
                if let Some(nodes) = &outcome.peer.nodes {
                    self.release_places(nodes);
                }
                self.signal_peer_stop(&peer);
                let _ = self.evict_mult.send(EvictEvent { peer: peer.clone() });
                let _ = self.shutdown_mult.send(PeerShutdownEvent { peer });
                self.signal_offer(OfferEvent::PeerDead { tx: outcome.tx });
            }
            Err(error) => {
                warn!(%peer, %error, "peer death rejected");
                self.fail(FailureKind::PeerDeath);
            }
        }
    }

    /// Deletes a peer's offer-time places; already-gone places are fine.
    fn release_places(&self, nodes: &PeerNodes) {
        for place in [&nodes.payload, &nodes.ack, &nodes.status, &nodes.completion] {
            let _ = self.sync.delete(place);
        }
    }

    /// Writes a durable stop marker to the peer's shutdown place.
    fn signal_peer_stop(&self, peer: &SyncPath) {
        if let Some(registration) = self.registration(peer) {
            self.sync
                .write_place(&registration.shutdown, Bytes::from_static(b"stop"));
        }
    }

    // ── Planning ──

    fn handle_planning(&self, request: PlanningRequest) {
        let job_id = JobId::new();
        let tasks = match plan_tasks(job_id, &request.catalog, &request.workflow) {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!(%job_id, %error, "planning rejected");
                return;
            }
        };

        let catalog_node = self.sync.create(NodeKind::Catalog);
        let workflow_node = self.sync.create(NodeKind::Workflow);
        match (
            serde_json::to_vec(&request.catalog),
            serde_json::to_vec(&request.workflow),
        ) {
            (Ok(catalog_raw), Ok(workflow_raw)) => {
                self.sync.write_place(&catalog_node, Bytes::from(catalog_raw));
                self.sync.write_place(&workflow_node, Bytes::from(workflow_raw));
            }
            (catalog_res, workflow_res) => {
                let error = catalog_res.err().or_else(|| workflow_res.err());
                warn!(%job_id, ?error, "planning rejected: unserializable submission");
                return;
            }
        }

        let job = weir_core::facts::JobFact {
            id: job_id,
            catalog: request.catalog,
            workflow: request.workflow,
            catalog_node,
            workflow_node,
            allocation_version: 0,
            completed: false,
        };
        let task_count = tasks.len();
        match self.facts.plan_job(job, tasks) {
            Ok(tx) => {
                info!(%job_id, tx, tasks = task_count, "job planned");
                self.signal_offer(OfferEvent::JobPlanned { job_id, tx });
            }
            Err(error) => warn!(%job_id, %error, "planning transaction rejected"),
        }
    }

    // ── Ack ──

    fn handle_ack(&self, path: SyncPath) {
        match self.facts.ack(&path) {
            Ok(outcome) => {
                self.cancel_revoke(&outcome.peer);
                debug!(peer = %outcome.peer, task = %outcome.task, tx = outcome.tx, "offer acknowledged");
                let _ = self.ack_mult.send(AckEvent {
                    peer: outcome.peer,
                    task: outcome.task,
                    tx: outcome.tx,
                });
            }
            Err(error) => {
                debug!(%path, %error, "ack rejected");
                self.fail(FailureKind::Ack);
            }
        }
    }

    // ── Completion ──

    fn handle_completion(&self, path: SyncPath) {
        match self.facts.complete(&path) {
            Ok(outcome) => {
                self.release_places(&outcome.nodes);
                info!(
                    peer = %outcome.peer,
                    task = %outcome.task,
                    tx = outcome.tx,
                    job_completed = outcome.job_completed.is_some(),
                    "task completed"
                );
                let tx = outcome.tx;
                let _ = self.completion_mult.send(CompletionEvent {
                    peer: outcome.peer,
                    task: outcome.task,
                    tx,
                    job_completed: outcome.job_completed,
                });
                self.signal_offer(OfferEvent::TaskCompleted { tx });
            }
            Err(error) => {
                debug!(%path, %error, "completion rejected");
                self.fail(FailureKind::Complete);
            }
        }
    }

    // ── Revoke ──

    /// Evicts a peer that was offered a task and never acked.
    ///
    /// Eviction has no direct durable effect and emits nothing here: the
    /// pulse deletion fires the peer's watch, which feeds the dead-peer
    /// channel, and the death handler retracts the peer and emits the single
    /// evict and shutdown event for the transition.
    fn handle_revoke(&self, peer: SyncPath) {
        let snapshot = self.facts.snapshot();
        let still_acking = snapshot
            .peers
            .get(&peer)
            .is_some_and(|fact| fact.status == PeerStatus::Acking);
        if !still_acking {
            return;
        }

        info!(%peer, "revoking unacked offer");
        match self.registration(&peer) {
            Some(registration) => {
                let _ = self.sync.delete(&registration.pulse);
            }
            // No pulse to delete; feed the cascade directly.
            None => {
                let _ = self.dead_peer_tx.try_send(peer);
            }
        }
    }

    fn schedule_revoke(&self, peer: SyncPath) {
        let delay = self.config.revoke_delay;
        let revoke_tx = self.revoke_tx.clone();
        let cancel = self.cancel.clone();
        let target = peer.clone();
        let timer = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            let _ = revoke_tx.send(target).await;
        });
        if let Some(previous) = self.revokes.lock().insert(peer, timer) {
            previous.abort();
        }
    }

    fn cancel_revoke(&self, peer: &SyncPath) {
        if let Some(timer) = self.revokes.lock().remove(peer) {
            timer.abort();
        }
    }

    // ── Offer ──

    /// Pairs tasks with idle peers until no further progress is possible.
    fn offer_all(&self) {
        loop {
            let (Some(task), Some(peer)) = (self.facts.next_task(), self.facts.idle_peer())
            else {
                break;
            };
            match self.offer_one(task, peer) {
                Ok(tx) => {
                    let _ = self.offer_mult.send(OfferEvent::TaskOffered { tx });
                }
                // A concurrent death or completion changed the picture; the
                // handler that changed it re-signals the offer channel.
                Err(error) => {
                    debug!(%error, "offer superseded");
                    break;
                }
            }
        }
    }

    fn offer_one(&self, task: TaskSpec, peer: SyncPath) -> Result<TxId, ClusterError> {
        let job = self
            .facts
            .snapshot()
            .jobs
            .get(&task.job)
            .cloned()
            .ok_or_else(|| {
                weir_core::facts::FactError::Invalid(format!(
                    "task {} belongs to unknown job {}",
                    task.id, task.job
                ))
            })?;

        let nodes = PeerNodes {
            payload: self.sync.create(NodeKind::Payload),
            ack: self.sync.create(NodeKind::Ack),
            status: self.sync.create(NodeKind::Status),
            completion: self.sync.create(NodeKind::Completion),
        };
        let tx = self.facts.mark_offered(task.id, &peer, nodes.clone())?;

        // Touch watches feed the ack and completion input channels.
        let ack_tx = self.ack_tx.clone();
        self.sync.on_change(
            &nodes.ack,
            WatchMode::Once,
            Arc::new(move |event| {
                if event.kind == ChangeKind::Touched {
                    let _ = ack_tx.try_send(event.path);
                }
            }),
        );
        let completion_tx = self.completion_tx.clone();
        self.sync.on_change(
            &nodes.completion,
            WatchMode::Once,
            Arc::new(move |event| {
                if event.kind == ChangeKind::Touched {
                    let _ = completion_tx.try_send(event.path);
                }
            }),
        );

        let entry = PayloadEntry {
            nodes: PayloadNodes {
                payload: nodes.payload.clone(),
                ack: nodes.ack,
                completion: nodes.completion,
                status: nodes.status,
                catalog: job.catalog_node,
                workflow: job.workflow_node,
                peer: peer.clone(),
            },
            task,
        };
        self.sync
            .write_place(&nodes.payload, Bytes::from(serde_json::to_vec(&entry)?));
        self.schedule_revoke(peer.clone());
        info!(task = %entry.task.name, %peer, tx, "task offered");
        Ok(tx)
    }
}

/// Spawns the coordinator's workers and returns the handle that feeds and
/// observes them.
pub struct ClusterCoordinator;

impl ClusterCoordinator {
    /// Starts one worker per input channel plus the offer worker.
    #[must_use]
    pub fn spawn(
        facts: Arc<dyn FactStore>,
        sync: Arc<dyn SyncStore>,
        config: CoordinatorConfig,
    ) -> ClusterHandle {
        let capacity = config.channel_capacity;
        let fanout = config.broadcast_capacity;
        let (born_peer_tx, born_peer_rx) = mpsc::channel(capacity);
        let (dead_peer_tx, dead_peer_rx) = mpsc::channel(capacity);
        let (planning_tx, planning_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity);
        let (revoke_tx, revoke_rx) = mpsc::channel(capacity);

        let inner = Arc::new(Inner {
            facts,
            sync,
            config,
            offer_mult: broadcast::channel(fanout).0,
            ack_mult: broadcast::channel(fanout).0,
            completion_mult: broadcast::channel(fanout).0,
            evict_mult: broadcast::channel(fanout).0,
            shutdown_mult: broadcast::channel(fanout).0,
            failure_mult: broadcast::channel(fanout).0,
            dead_peer_tx: dead_peer_tx.clone(),
            ack_tx: ack_tx.clone(),
            completion_tx: completion_tx.clone(),
            revoke_tx,
            offer_wake: Notify::new(),
            revokes: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let workers = vec![
            spawn_worker(Arc::clone(&inner), born_peer_rx, Inner::handle_birth),
            spawn_worker(Arc::clone(&inner), dead_peer_rx, Inner::handle_death),
            spawn_worker(Arc::clone(&inner), planning_rx, Inner::handle_planning),
            spawn_worker(Arc::clone(&inner), ack_rx, Inner::handle_ack),
            spawn_worker(Arc::clone(&inner), completion_rx, Inner::handle_completion),
            spawn_worker(Arc::clone(&inner), revoke_rx, Inner::handle_revoke),
            spawn_offer_worker(Arc::clone(&inner)),
        ];

        ClusterHandle {
            born_peer_tx,
            dead_peer_tx,
            planning_tx,
            ack_tx,
            completion_tx,
            inner,
            workers,
        }
    }
}

fn spawn_worker<T, F>(inner: Arc<Inner>, mut rx: mpsc::Receiver<T>, handle: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(&Inner, T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => handle(&inner, message),
                    None => break,
                },
            }
        }
    })
}

fn spawn_offer_worker(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = inner.offer_wake.notified() => inner.offer_all(),
            }
        }
    })
}

/// Feeds and observes a running [`ClusterCoordinator`].
///
/// Input senders enqueue events for the coordinator's workers; the
/// `subscribe_*` methods attach to the broadcast fan-outs. Dropping or
/// shutting down the handle stops every worker.
pub struct ClusterHandle {
    born_peer_tx: mpsc::Sender<SyncPath>,
    dead_peer_tx: mpsc::Sender<SyncPath>,
    planning_tx: mpsc::Sender<PlanningRequest>,
    ack_tx: mpsc::Sender<SyncPath>,
    completion_tx: mpsc::Sender<SyncPath>,
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ClusterHandle {
    /// Sender for peer registration places.
    #[must_use]
    pub fn born_peer_tx(&self) -> mpsc::Sender<SyncPath> {
        self.born_peer_tx.clone()
    }

    /// Sender for vanished-pulse peer places.
    #[must_use]
    pub fn dead_peer_tx(&self) -> mpsc::Sender<SyncPath> {
        self.dead_peer_tx.clone()
    }

    /// Sender for job submissions.
    #[must_use]
    pub fn planning_tx(&self) -> mpsc::Sender<PlanningRequest> {
        self.planning_tx.clone()
    }

    /// Sender for touched ack places.
    #[must_use]
    pub fn ack_tx(&self) -> mpsc::Sender<SyncPath> {
        self.ack_tx.clone()
    }

    /// Sender for touched completion places.
    #[must_use]
    pub fn completion_tx(&self) -> mpsc::Sender<SyncPath> {
        self.completion_tx.clone()
    }

    /// Attaches to the offer fan-out.
    #[must_use]
    pub fn subscribe_offers(&self) -> broadcast::Receiver<OfferEvent> {
        self.inner.offer_mult.subscribe()
    }

    /// Attaches to the ack fan-out.
    #[must_use]
    pub fn subscribe_acks(&self) -> broadcast::Receiver<AckEvent> {
        self.inner.ack_mult.subscribe()
    }

    /// Attaches to the completion fan-out.
    #[must_use]
    pub fn subscribe_completions(&self) -> broadcast::Receiver<CompletionEvent> {
        self.inner.completion_mult.subscribe()
    }

    /// Attaches to the evict fan-out.
    #[must_use]
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<EvictEvent> {
        self.inner.evict_mult.subscribe()
    }

    /// Attaches to the peer-shutdown fan-out.
    #[must_use]
    pub fn subscribe_peer_shutdowns(&self) -> broadcast::Receiver<PeerShutdownEvent> {
        self.inner.shutdown_mult.subscribe()
    }

    /// Attaches to the failure fan-out.
    #[must_use]
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureEvent> {
        self.inner.failure_mult.subscribe()
    }

    /// Stops every worker and cancels pending revoke timers.
    pub async fn shutdown(mut self) {
        self.inner.cancel.cancel();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        for (_, timer) in self.inner.revokes.lock().drain() {
            timer.abort();
        }
        info!("cluster coordinator stopped");
    }
}
