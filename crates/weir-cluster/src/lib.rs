//! Cluster coordinator and per-job barrier coordinator for the weir
//! coordination core.
//!
//! The [`Coordination`] composition root constructs the store adapters,
//! wires the coordinator's channels, and provides a symmetric teardown; no
//! process-wide mutable state is involved. Peer processes interact through
//! the sync store and the input senders on [`coordinator::ClusterHandle`];
//! elected peers drive jobs through [`barrier::PeerCoordinator`].

pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod error;

use std::sync::Arc;

use tokio::sync::mpsc;

use weir_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use weir_core::facts::{FactStore, MemoryFactStore};
use weir_core::replica::PeerId;
use weir_core::sync::{MemorySyncStore, SyncStore};
use weir_core::workflow::JobId;

use crate::barrier::{MessengerFactory, PeerCoordinator, RestartRequest};
use crate::config::CoordinatorConfig;
use crate::coordinator::{ClusterCoordinator, ClusterHandle};

/// Capacity of the group control channel carrying restart requests.
const CONTROL_CAPACITY: usize = 64;

/// The assembled coordination runtime.
///
/// Owns the stores, the running cluster coordinator, and the group control
/// channel that barrier coordinators post restart requests to.
pub struct Coordination {
    facts: Arc<dyn FactStore>,
    sync: Arc<dyn SyncStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: CoordinatorConfig,
    cluster: ClusterHandle,
    control_tx: mpsc::Sender<RestartRequest>,
    control_rx: Option<mpsc::Receiver<RestartRequest>>,
}

impl Coordination {
    /// Starts a runtime backed by the in-process store adapters.
    #[must_use]
    pub fn start(config: CoordinatorConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryFactStore::new()),
            Arc::new(MemorySyncStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
        )
    }

    /// Starts a runtime over caller-provided store adapters.
    #[must_use]
    pub fn with_stores(
        config: CoordinatorConfig,
        facts: Arc<dyn FactStore>,
        sync: Arc<dyn SyncStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let cluster =
            ClusterCoordinator::spawn(Arc::clone(&facts), Arc::clone(&sync), config.clone());
        Self {
            facts,
            sync,
            checkpoints,
            config,
            cluster,
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    /// The durable fact store.
    #[must_use]
    pub fn facts(&self) -> Arc<dyn FactStore> {
        Arc::clone(&self.facts)
    }

    /// The ephemeral sync store.
    #[must_use]
    pub fn sync(&self) -> Arc<dyn SyncStore> {
        Arc::clone(&self.sync)
    }

    /// The checkpoint coordinate store.
    #[must_use]
    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.checkpoints)
    }

    /// The running cluster coordinator.
    #[must_use]
    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// Takes the receiving end of the group control channel.
    ///
    /// Returns `None` after the first call; there is exactly one supervisor.
    pub fn take_restart_requests(&mut self) -> Option<mpsc::Receiver<RestartRequest>> {
        self.control_rx.take()
    }

    /// Builds the election state for hosting a job's barrier coordinator on
    /// this peer, wired to the runtime's checkpoint store and control
    /// channel.
    #[must_use]
    pub fn peer_coordinator(
        &self,
        job_id: JobId,
        peer_id: PeerId,
        workflow_depth: u32,
        messenger_factory: MessengerFactory,
    ) -> PeerCoordinator {
        PeerCoordinator::new(
            job_id,
            peer_id,
            workflow_depth,
            self.config.clone(),
            Arc::clone(&self.checkpoints),
            self.control_tx.clone(),
            messenger_factory,
        )
    }

    /// Stops the cluster coordinator and closes the control channel.
    pub async fn shutdown(self) {
        self.cluster.shutdown().await;
    }
}
