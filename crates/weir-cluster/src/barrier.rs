//! The per-job barrier coordinator.
//!
//! One elected peer per job drives the barrier/epoch protocol across the
//! job's input publications. The loop evaluates, in priority order: shutdown,
//! reallocation, heartbeat, resuming an in-flight barrier offer, starting a
//! periodic barrier, and finally parking for at most the configured
//! max-sleep.
//!
//! Coordinate writes are optimistic: the loop holds the version stamp it
//! last observed and a lost CAS is benign: logged and forgotten, the
//! winner's stamp is picked up on the next reallocation. Any other failure
//! is fatal to the coordinator, which requests a restart from its group
//! supervisor and exits.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use weir_core::checkpoint::{
    Barrier, BarrierOpts, CheckpointCoordinate, CheckpointError, CheckpointStore, Messenger,
    Publication,
};
use weir_core::replica::{PeerId, PeerType, Replica, ShortIdKey, SiteId, COORDINATOR_SLOT};
use weir_core::workflow::JobId;

use crate::config::CoordinatorConfig;
use crate::error::ClusterError;

/// The first epoch eligible for a coordinate write within a replica version.
///
/// Epoch 1 is the recovery barrier; checkpointable rounds start after it.
pub const FIRST_SNAPSHOT_EPOCH: u64 = 2;

/// Why a barrier coordinator was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Another peer was elected coordinator for the job.
    Rescheduled,
    /// The job finished.
    JobCompleted,
    /// The hosting peer is stopping.
    PeerStopped,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rescheduled => f.write_str("rescheduled"),
            Self::JobCompleted => f.write_str("job-completed"),
            Self::PeerStopped => f.write_str("peer-stopped"),
        }
    }
}

/// Posted on the group control channel when a coordinator dies unexpectedly.
#[derive(Debug, Clone)]
pub struct RestartRequest {
    /// The job whose coordinator failed.
    pub job_id: JobId,
    /// The hosting peer.
    pub peer_id: PeerId,
    /// The failure, stringified.
    pub reason: String,
}

/// Derives the coordinator's publication set from a replica.
///
/// One publication per (input task, site): the allocated peers of each input
/// task are grouped by their co-location site, and each group becomes a
/// route sourced from the coordinator at slot [`COORDINATOR_SLOT`]. The
/// result is a set, so duplicates collapse.
#[must_use]
pub fn derive_publications(
    replica: &Replica,
    job_id: JobId,
    peer_id: &PeerId,
) -> BTreeSet<Publication> {
    let mut publications = BTreeSet::new();
    let Some(input_tasks) = replica.input_tasks.get(&job_id) else {
        return publications;
    };
    let allocations = replica.allocations.get(&job_id);

    for task_id in input_tasks {
        let Some(peers) = allocations.and_then(|tasks| tasks.get(task_id)) else {
            continue;
        };
        let mut by_site: BTreeMap<SiteId, BTreeSet<PeerId>> = BTreeMap::new();
        for peer in peers {
            let Some(site) = replica.peer_sites.get(peer) else {
                continue;
            };
            by_site.entry(site.clone()).or_default().insert(peer.clone());
        }
        for (site, dst_peers) in by_site {
            let short_id = replica
                .message_short_ids
                .get(&ShortIdKey {
                    peer_type: PeerType::Coordinator,
                    peer_id: peer_id.clone(),
                    job_id,
                    task_id: *task_id,
                    slot_id: COORDINATOR_SLOT,
                })
                .copied();
            publications.insert(Publication {
                job_id,
                task_id: *task_id,
                site,
                src_peer: (PeerType::Coordinator, peer_id.clone()),
                slot_id: COORDINATOR_SLOT,
                dst_peers,
                short_id,
            });
        }
    }
    publications
}

/// The single-threaded cooperative loop driving one job's barriers.
pub struct BarrierCoordinator {
    job_id: JobId,
    peer_id: PeerId,
    workflow_depth: u32,
    config: CoordinatorConfig,
    messenger: Box<dyn Messenger>,
    checkpoints: Arc<dyn CheckpointStore>,
    control_tx: mpsc::Sender<RestartRequest>,
    /// Latest-wins replica input; older pending replicas are discarded.
    allocation_rx: watch::Receiver<Replica>,
    shutdown_rx: oneshot::Receiver<ShutdownReason>,
    replica_version: u64,
    epoch: u64,
    /// Version stamp held against the checkpoint store.
    store_version: u64,
    /// Set by the first reallocation; barriers never precede it.
    allocated: bool,
    job_completed: bool,
    last_barrier: Instant,
    last_heartbeat: Instant,
    offering: bool,
    rem_barriers: Vec<Publication>,
    barrier_opts: BarrierOpts,
}

impl BarrierCoordinator {
    /// Builds a coordinator; it does nothing until [`run`](Self::run) is
    /// spawned and a replica arrives on the allocation channel.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        job_id: JobId,
        peer_id: PeerId,
        workflow_depth: u32,
        config: CoordinatorConfig,
        messenger: Box<dyn Messenger>,
        checkpoints: Arc<dyn CheckpointStore>,
        control_tx: mpsc::Sender<RestartRequest>,
        allocation_rx: watch::Receiver<Replica>,
        shutdown_rx: oneshot::Receiver<ShutdownReason>,
    ) -> Self {
        let now = Instant::now();
        Self {
            job_id,
            peer_id,
            workflow_depth,
            config,
            messenger,
            checkpoints,
            control_tx,
            allocation_rx,
            shutdown_rx,
            replica_version: 0,
            epoch: 0,
            store_version: 0,
            allocated: false,
            job_completed: false,
            last_barrier: now,
            last_heartbeat: now,
            offering: false,
            rem_barriers: Vec::new(),
            barrier_opts: BarrierOpts::default(),
        }
    }

    /// Drives the loop until shutdown or a fatal error.
    ///
    /// On a fatal error the messenger is stopped, a [`RestartRequest`] is
    /// posted on the group control channel, and the task exits; state is not
    /// salvaged.
    pub async fn run(mut self) {
        info!(job = %self.job_id, peer = %self.peer_id, "barrier coordinator started");
        loop {
            match self.step().await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(reason)) => {
                    self.messenger.stop();
                    info!(job = %self.job_id, %reason, "barrier coordinator stopped");
                    return;
                }
                Err(err) => {
                    error!(job = %self.job_id, error = %err, "barrier coordinator failed; requesting restart");
                    self.messenger.stop();
                    let _ = self
                        .control_tx
                        .send(RestartRequest {
                            job_id: self.job_id,
                            peer_id: self.peer_id.clone(),
                            reason: err.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }

    /// One loop iteration, in priority order.
    async fn step(&mut self) -> Result<ControlFlow<ShutdownReason>, ClusterError> {
        match self.shutdown_rx.try_recv() {
            Ok(reason) => return Ok(ControlFlow::Break(reason)),
            Err(oneshot::error::TryRecvError::Closed) => {
                return Ok(ControlFlow::Break(ShutdownReason::PeerStopped));
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }

        match self.allocation_rx.has_changed() {
            Ok(true) => {
                let replica = self.allocation_rx.borrow_and_update().clone();
                self.reallocate(&replica).await?;
                return Ok(ControlFlow::Continue(()));
            }
            Ok(false) => {}
            Err(_) => return Ok(ControlFlow::Break(ShutdownReason::PeerStopped)),
        }

        let now = Instant::now();
        if now >= self.last_heartbeat + self.config.heartbeat {
            for publication in self.messenger.publications() {
                self.messenger.offer_heartbeat(&publication);
            }
            self.last_heartbeat = now;
            return Ok(ControlFlow::Continue(()));
        }

        if self.offering {
            let progressed = self.resume_offer();
            if self.offering && !progressed {
                // Every remaining publisher refused; give them a tick.
                if let Some(reason) = self.park(self.config.coordinator_max_sleep).await {
                    return Ok(ControlFlow::Break(reason));
                }
            }
            return Ok(ControlFlow::Continue(()));
        }

        if self.allocated && now >= self.last_barrier + self.config.coordinator_barrier_period {
            self.begin_barrier().await?;
            return Ok(ControlFlow::Continue(()));
        }

        let mut due = self.last_heartbeat + self.config.heartbeat;
        if self.allocated {
            due = due.min(self.last_barrier + self.config.coordinator_barrier_period);
        }
        let until = due
            .saturating_duration_since(now)
            .min(self.config.coordinator_max_sleep);
        if let Some(reason) = self.park(until).await {
            return Ok(ControlFlow::Break(reason));
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Parks for at most the given bound.
    ///
    /// Wakes early on shutdown; a replica arriving mid-park is picked up on
    /// the next iteration.
    async fn park(&mut self, bound: std::time::Duration) -> Option<ShutdownReason> {
        tokio::select! {
            biased;
            reason = &mut self.shutdown_rx => {
                Some(reason.unwrap_or(ShutdownReason::PeerStopped))
            }
            () = tokio::time::sleep(bound) => None,
        }
    }

    /// Reacts to a new replica: rebuild publications, restart the epoch
    /// sequence, and stage the recovery barrier.
    async fn reallocate(&mut self, replica: &Replica) -> Result<(), ClusterError> {
        let publications = derive_publications(replica, self.job_id, &self.peer_id);
        self.messenger.update_publications(publications);
        self.replica_version = replica.allocation_version(self.job_id);
        self.job_completed = replica.completed_jobs.contains(&self.job_id);
        self.allocated = true;

        // Epoch restarts per replica version: reset, read the persisted
        // coordinates, then advance to 1 for the recovery barrier.
        self.epoch = 0;
        let (coordinates, version) = self
            .checkpoints
            .read(&self.config.tenancy_id, self.job_id)
            .await?;
        self.store_version = version;
        self.epoch += 1;

        self.barrier_opts = BarrierOpts {
            recover_coordinates: coordinates,
            checkpointed_epoch: None,
        };
        self.rem_barriers = self.messenger.publications();
        self.offering = true;
        info!(
            job = %self.job_id,
            replica_version = self.replica_version,
            publications = self.rem_barriers.len(),
            "reallocated; offering recovery barrier"
        );
        Ok(())
    }

    /// Starts a periodic barrier round, writing coordinates once the epoch
    /// has cleared the workflow depth.
    async fn begin_barrier(&mut self) -> Result<(), ClusterError> {
        self.epoch += 1;
        let depth = u64::from(self.workflow_depth);
        let mut write_attempted = false;

        if !self.job_completed && self.epoch >= FIRST_SNAPSHOT_EPOCH + depth {
            let checkpointed_epoch = self.epoch - depth;
            write_attempted = true;
            let coordinate = CheckpointCoordinate {
                tenancy_id: self.config.tenancy_id.clone(),
                job_id: self.job_id,
                replica_version: self.replica_version,
                epoch: checkpointed_epoch,
            };
            match self.checkpoints.write(coordinate, self.store_version).await {
                Ok(version) => {
                    self.store_version = version;
                    debug!(
                        job = %self.job_id,
                        epoch = checkpointed_epoch,
                        version,
                        "coordinates written"
                    );
                }
                Err(CheckpointError::BadVersion { held, .. }) => {
                    info!(job = %self.job_id, held, "coordinate write lost the version race");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.barrier_opts = BarrierOpts {
            recover_coordinates: None,
            checkpointed_epoch: write_attempted.then_some(self.epoch),
        };
        self.rem_barriers = self.messenger.publications();
        self.offering = true;
        Ok(())
    }

    /// Offers the current barrier to every remaining publisher.
    ///
    /// A strictly positive offer return removes the publisher for this
    /// round; non-positive returns keep it for the next tick. Returns
    /// whether any publisher accepted.
    fn resume_offer(&mut self) -> bool {
        self.messenger.poll_heartbeats();
        let barrier = Barrier {
            replica_version: self.replica_version,
            epoch: self.epoch,
            opts: self.barrier_opts.clone(),
        };
        let before = self.rem_barriers.len();
        let messenger = &mut self.messenger;
        self.rem_barriers
            .retain(|publication| messenger.offer_barrier(publication, &barrier) <= 0);
        let progressed = self.rem_barriers.len() < before;

        if self.rem_barriers.is_empty() {
            self.offering = false;
            self.barrier_opts = BarrierOpts::default();
            self.last_barrier = Instant::now();
            debug!(job = %self.job_id, epoch = self.epoch, "barrier round complete");
        }
        progressed || before == 0
    }
}

/// Election and handoff of a job's barrier coordinator on this peer.
///
/// Replica changes drive the transitions: this peer starts a coordinator
/// when it becomes `coordinators[job]`, stops it (rescheduled) when it no
/// longer is, and forwards the replica when it stays coordinator across an
/// allocation-version change.
pub struct PeerCoordinator {
    job_id: JobId,
    peer_id: PeerId,
    workflow_depth: u32,
    config: CoordinatorConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    control_tx: mpsc::Sender<RestartRequest>,
    messenger_factory: MessengerFactory,
    running: Option<RunningCoordinator>,
}

/// Builds a fresh messenger for each elected coordinator.
pub type MessengerFactory = Box<dyn Fn() -> Box<dyn Messenger> + Send + Sync>;

struct RunningCoordinator {
    allocation_tx: watch::Sender<Replica>,
    shutdown_tx: oneshot::Sender<ShutdownReason>,
    join: JoinHandle<()>,
    allocation_version: u64,
}

impl PeerCoordinator {
    /// Creates the election state for one (job, peer) pair.
    #[must_use]
    pub fn new(
        job_id: JobId,
        peer_id: PeerId,
        workflow_depth: u32,
        config: CoordinatorConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        control_tx: mpsc::Sender<RestartRequest>,
        messenger_factory: MessengerFactory,
    ) -> Self {
        Self {
            job_id,
            peer_id,
            workflow_depth,
            config,
            checkpoints,
            control_tx,
            messenger_factory,
            running: None,
        }
    }

    /// Whether this peer currently runs the job's coordinator.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Applies one replica transition.
    pub async fn replica_updated(&mut self, old: &Replica, new: &Replica) {
        let started = old.is_coordinator(self.job_id, &self.peer_id);
        let start = new.is_coordinator(self.job_id, &self.peer_id);
        match (started, start) {
            (false, true) => self.start(new).await,
            (true, false) => self.stop(ShutdownReason::Rescheduled).await,
            (true, true) => {
                let version = new.allocation_version(self.job_id);
                if let Some(running) = &mut self.running {
                    if version != running.allocation_version {
                        running.allocation_version = version;
                        let _ = running.allocation_tx.send(new.clone());
                    }
                }
            }
            (false, false) => {}
        }
    }

    async fn start(&mut self, replica: &Replica) {
        if self.running.is_some() {
            self.stop(ShutdownReason::Rescheduled).await;
        }

        // Seed with an empty replica so the real one registers as a change.
        let (allocation_tx, allocation_rx) = watch::channel(Replica::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let coordinator = BarrierCoordinator::new(
            self.job_id,
            self.peer_id.clone(),
            self.workflow_depth,
            self.config.clone(),
            (self.messenger_factory)(),
            Arc::clone(&self.checkpoints),
            self.control_tx.clone(),
            allocation_rx,
            shutdown_rx,
        );
        let join = tokio::spawn(coordinator.run());
        let allocation_version = replica.allocation_version(self.job_id);
        let _ = allocation_tx.send(replica.clone());

        info!(job = %self.job_id, peer = %self.peer_id, "elected barrier coordinator");
        self.running = Some(RunningCoordinator {
            allocation_tx,
            shutdown_tx,
            join,
            allocation_version,
        });
    }

    /// Stops the running coordinator, if any, and waits for it to exit.
    pub async fn stop(&mut self, reason: ShutdownReason) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(reason);
            let _ = running.join.await;
            info!(job = %self.job_id, %reason, "barrier coordinator handed off");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use weir_core::checkpoint::MemoryCheckpointStore;
    use weir_core::workflow::TaskId;

    /// Messenger that records offers and accepts or refuses per a shared
    /// switch.
    #[derive(Default)]
    struct RecordingState {
        publications: BTreeSet<Publication>,
        offers: Vec<(Publication, Barrier)>,
        heartbeats: usize,
        accept: bool,
        stopped: bool,
    }

    #[derive(Clone, Default)]
    struct RecordingMessenger {
        state: Arc<Mutex<RecordingState>>,
    }

    impl RecordingMessenger {
        fn accepting() -> Self {
            let messenger = Self::default();
            messenger.state.lock().accept = true;
            messenger
        }

        fn barriers(&self) -> Vec<Barrier> {
            self.state.lock().offers.iter().map(|(_, b)| b.clone()).collect()
        }
    }

    impl Messenger for RecordingMessenger {
        fn update_publications(&mut self, publications: BTreeSet<Publication>) {
            self.state.lock().publications = publications;
        }

        fn publications(&self) -> Vec<Publication> {
            self.state.lock().publications.iter().cloned().collect()
        }

        fn offer_barrier(&mut self, publication: &Publication, barrier: &Barrier) -> i64 {
            let mut state = self.state.lock();
            state.offers.push((publication.clone(), barrier.clone()));
            if state.accept {
                1
            } else {
                0
            }
        }

        fn offer_heartbeat(&mut self, _publication: &Publication) {
            self.state.lock().heartbeats += 1;
        }

        fn poll_heartbeats(&mut self) {}

        fn stop(&mut self) {
            self.state.lock().stopped = true;
        }
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            coordinator_barrier_period: Duration::from_millis(5),
            coordinator_max_sleep: Duration::from_millis(2),
            heartbeat: Duration::from_secs(3600),
            tenancy_id: "test".into(),
            ..CoordinatorConfig::default()
        }
    }

    fn one_peer_replica(job: JobId, task: TaskId, coordinator: &str) -> Replica {
        let mut replica = Replica::default();
        let peer = PeerId(coordinator.to_owned());
        replica.peers.insert(peer.clone());
        replica
            .peer_sites
            .insert(peer.clone(), SiteId("site-a".into()));
        replica.coordinators.insert(job, peer);
        replica.allocation_versions.insert(job, 1);
        replica.allocations.insert(
            job,
            BTreeMap::from([(task, BTreeSet::from([PeerId(coordinator.to_owned())]))]),
        );
        replica.input_tasks.insert(job, BTreeSet::from([task]));
        replica
    }

    fn spawn_coordinator(
        job: JobId,
        depth: u32,
        messenger: RecordingMessenger,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> (
        watch::Sender<Replica>,
        oneshot::Sender<ShutdownReason>,
        JoinHandle<()>,
    ) {
        let (allocation_tx, allocation_rx) = watch::channel(Replica::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (control_tx, _control_rx) = mpsc::channel(4);
        let coordinator = BarrierCoordinator::new(
            job,
            PeerId("coord".into()),
            depth,
            test_config(),
            Box::new(messenger),
            checkpoints,
            control_tx,
            allocation_rx,
            shutdown_rx,
        );
        (allocation_tx, shutdown_tx, tokio::spawn(coordinator.run()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn test_publications_group_by_site_and_dedup() {
        let job = JobId::new();
        let task = TaskId::new();
        let coordinator = PeerId("coord".into());

        let mut replica = Replica::default();
        for (peer, site) in [("p1", "a"), ("p2", "a"), ("p3", "b")] {
            replica
                .peer_sites
                .insert(PeerId(peer.into()), SiteId(site.into()));
        }
        replica.allocations.insert(
            job,
            BTreeMap::from([(
                task,
                BTreeSet::from([PeerId("p1".into()), PeerId("p2".into()), PeerId("p3".into())]),
            )]),
        );
        replica.input_tasks.insert(job, BTreeSet::from([task]));
        replica.message_short_ids.insert(
            ShortIdKey {
                peer_type: PeerType::Coordinator,
                peer_id: coordinator.clone(),
                job_id: job,
                task_id: task,
                slot_id: COORDINATOR_SLOT,
            },
            7,
        );

        let publications = derive_publications(&replica, job, &coordinator);
        assert_eq!(publications.len(), 2);
        let site_a = publications
            .iter()
            .find(|p| p.site == SiteId("a".into()))
            .unwrap();
        assert_eq!(site_a.dst_peers.len(), 2);
        assert_eq!(site_a.slot_id, COORDINATOR_SLOT);
        assert_eq!(site_a.short_id, Some(7));
        // Site b resolves the same route key, so it gets the same short id.
        let site_b = publications
            .iter()
            .find(|p| p.site == SiteId("b".into()))
            .unwrap();
        assert_eq!(site_b.short_id, Some(7));
    }

    #[test]
    fn test_publications_empty_without_input_tasks() {
        let replica = Replica::default();
        let publications = derive_publications(&replica, JobId::new(), &PeerId("c".into()));
        assert!(publications.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_barrier_is_epoch_one_with_coordinates() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        // Persisted under the previous replica version; the new allocation
        // version is strictly higher.
        checkpoints
            .write(
                CheckpointCoordinate {
                    tenancy_id: "test".into(),
                    job_id: job,
                    replica_version: 0,
                    epoch: 4,
                },
                0,
            )
            .await
            .unwrap();

        let messenger = RecordingMessenger::accepting();
        let probe = messenger.clone();
        let (allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 3, messenger, Arc::clone(&checkpoints));

        allocation_tx
            .send(one_peer_replica(job, task, "coord"))
            .unwrap();
        settle().await;

        let barriers = probe.barriers();
        let recovery = barriers.first().expect("recovery barrier offered");
        assert_eq!(recovery.epoch, 1);
        assert_eq!(recovery.replica_version, 1);
        assert_eq!(
            recovery.opts.recover_coordinates.as_ref().map(|c| c.epoch),
            Some(4)
        );
        assert!(recovery.opts.checkpointed_epoch.is_none());

        let _ = shutdown_tx.send(ShutdownReason::PeerStopped);
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_epochs_increase_and_coordinates_lag_by_depth() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let messenger = RecordingMessenger::accepting();
        let probe = messenger.clone();
        let (allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 2, messenger, Arc::clone(&checkpoints));

        allocation_tx
            .send(one_peer_replica(job, task, "coord"))
            .unwrap();
        // Enough ticks for several periodic barriers past epoch 4.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let _ = shutdown_tx.send(ShutdownReason::PeerStopped);
        let _ = join.await;

        let barriers = probe.barriers();
        assert!(barriers.len() >= 4, "expected several rounds, got {barriers:?}");
        for pair in barriers.windows(2) {
            assert_eq!(pair[1].epoch, pair[0].epoch + 1, "epochs must be contiguous");
        }

        // Rounds below FIRST_SNAPSHOT_EPOCH + depth carry no checkpoint.
        for barrier in &barriers {
            if barrier.epoch < FIRST_SNAPSHOT_EPOCH + 2 {
                assert!(barrier.opts.checkpointed_epoch.is_none());
            } else {
                assert_eq!(barrier.opts.checkpointed_epoch, Some(barrier.epoch));
            }
        }

        // The stored coordinate lags the newest barrier by the depth. A
        // final write may have landed just before shutdown without its
        // barrier being offered, hence the one-epoch slack.
        let (coords, version) = checkpoints.read("test", job).await.unwrap();
        let coords = coords.expect("coordinates written");
        assert!(version >= 1);
        let newest = barriers.last().unwrap().epoch;
        assert!(coords.epoch == newest - 2 || coords.epoch == newest - 1);
        assert_eq!(coords.replica_version, 1);
    }

    #[tokio::test]
    async fn test_lost_version_race_is_benign() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let messenger = RecordingMessenger::accepting();
        let probe = messenger.clone();
        let (allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 1, messenger, Arc::clone(&checkpoints));

        allocation_tx
            .send(one_peer_replica(job, task, "coord"))
            .unwrap();
        settle().await;

        // A competing coordinator moves the stamp; our held version is stale.
        checkpoints
            .write(
                CheckpointCoordinate {
                    tenancy_id: "test".into(),
                    job_id: job,
                    replica_version: 9,
                    epoch: 100,
                },
                checkpoints.read("test", job).await.unwrap().1,
            )
            .await
            .unwrap();
        settle().await;

        // The loop keeps emitting barriers despite the lost races.
        let before = probe.barriers().len();
        settle().await;
        assert!(probe.barriers().len() > before);

        let _ = shutdown_tx.send(ShutdownReason::PeerStopped);
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_reallocation_resets_epoch_to_one() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let messenger = RecordingMessenger::accepting();
        let probe = messenger.clone();
        let (allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 1, messenger, checkpoints);

        allocation_tx
            .send(one_peer_replica(job, task, "coord"))
            .unwrap();
        settle().await;

        let mut second = one_peer_replica(job, task, "coord");
        second.allocation_versions.insert(job, 2);
        allocation_tx.send(second).unwrap();
        settle().await;

        let _ = shutdown_tx.send(ShutdownReason::PeerStopped);
        let _ = join.await;

        let barriers = probe.barriers();
        let second_recovery = barriers
            .iter()
            .find(|b| b.replica_version == 2)
            .expect("barrier at the new replica version");
        assert_eq!(second_recovery.epoch, 1);

        // Epochs within each replica version are monotone.
        for version in [1, 2] {
            let epochs: Vec<u64> = barriers
                .iter()
                .filter(|b| b.replica_version == version)
                .map(|b| b.epoch)
                .collect();
            assert!(epochs.windows(2).all(|w| w[1] > w[0]));
            assert_eq!(epochs.first().copied(), Some(1));
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_messenger() {
        let job = JobId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let messenger = RecordingMessenger::accepting();
        let probe = messenger.clone();
        let (_allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 1, messenger, checkpoints);

        shutdown_tx.send(ShutdownReason::JobCompleted).unwrap();
        let _ = join.await;
        assert!(probe.state.lock().stopped);
    }

    #[tokio::test]
    async fn test_refusing_publisher_is_retried_next_round() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let messenger = RecordingMessenger::default(); // refuses all offers
        let probe = messenger.clone();
        let (allocation_tx, shutdown_tx, join) =
            spawn_coordinator(job, 1, messenger, checkpoints);

        allocation_tx
            .send(one_peer_replica(job, task, "coord"))
            .unwrap();
        settle().await;

        // The same epoch-1 recovery barrier is re-offered, never advanced.
        let barriers = probe.barriers();
        assert!(barriers.len() >= 2);
        assert!(barriers.iter().all(|b| b.epoch == 1));

        // Flip the switch: the round completes and epochs advance.
        probe.state.lock().accept = true;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(probe.barriers().iter().any(|b| b.epoch > 1));

        let _ = shutdown_tx.send(ShutdownReason::PeerStopped);
        let _ = join.await;
    }

    #[tokio::test]
    async fn test_election_starts_stops_and_forwards() {
        let job = JobId::new();
        let task = TaskId::new();
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let (control_tx, _control_rx) = mpsc::channel(4);
        let shared = Arc::new(Mutex::new(Vec::new()));

        let recordings = Arc::clone(&shared);
        let mut election = PeerCoordinator::new(
            job,
            PeerId("me".into()),
            1,
            test_config(),
            checkpoints,
            control_tx,
            Box::new(move || {
                let messenger = RecordingMessenger::accepting();
                recordings.lock().push(messenger.clone());
                Box::new(messenger) as Box<dyn Messenger>
            }),
        );

        let empty = Replica::default();
        let elected = one_peer_replica(job, task, "me");
        election.replica_updated(&empty, &elected).await;
        assert!(election.is_running());

        settle().await;
        let first = shared.lock().first().cloned().unwrap();
        assert!(!first.barriers().is_empty());

        // Allocation version bump while still coordinator: forwarded.
        let mut bumped = elected.clone();
        bumped.allocation_versions.insert(job, 2);
        election.replica_updated(&elected, &bumped).await;
        settle().await;
        assert!(first.barriers().iter().any(|b| b.replica_version == 2));

        // Another peer takes over: stopped with rescheduled.
        let handed_off = one_peer_replica(job, task, "other");
        election.replica_updated(&bumped, &handed_off).await;
        assert!(!election.is_running());
        assert!(first.state.lock().stopped);
    }
}
