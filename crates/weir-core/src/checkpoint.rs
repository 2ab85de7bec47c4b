//! Checkpoint coordinates, barriers, and the publication/messenger contract.
//!
//! A barrier is a control message injected at every input publication of a
//! job, carrying `(replica_version, epoch)` plus optional recovery or
//! checkpoint options. Coordinates are persisted to a strongly-consistent
//! store with optimistic concurrency: every write carries the version stamp
//! the writer last observed, and a stale stamp raises
//! [`CheckpointError::BadVersion`]; the loser takes no action.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replica::{PeerId, PeerType, SiteId};
use crate::workflow::{JobId, TaskId};

/// The tuple identifying from where a job resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCoordinate {
    /// Namespace under which coordinates are stored.
    pub tenancy_id: String,
    /// The job.
    pub job_id: JobId,
    /// Replica version the epoch belongs to.
    pub replica_version: u64,
    /// The checkpointed epoch.
    pub epoch: u64,
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The held version stamp is stale; another writer won.
    #[error("stale version stamp {held} writing coordinates for job {job}")]
    BadVersion {
        /// The job whose write lost.
        job: JobId,
        /// The stamp the writer held.
        held: u64,
    },

    /// The store could not be reached.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Strongly-consistent coordinate storage with CAS-versioned writes.
///
/// Keys are `(tenancy_id, job_id)`. Every successful write returns a new
/// monotone version stamp; reads return the stamp to CAS against. A missing
/// key reads as `(None, 0)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the coordinate and current version stamp for a job.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Unavailable`] if the store cannot be
    /// reached.
    async fn read(
        &self,
        tenancy_id: &str,
        job_id: JobId,
    ) -> Result<(Option<CheckpointCoordinate>, u64), CheckpointError>;

    /// Writes a coordinate, compare-and-swapping against `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::BadVersion`] if the stamp is stale.
    async fn write(
        &self,
        coordinate: CheckpointCoordinate,
        expected_version: u64,
    ) -> Result<u64, CheckpointError>;
}

/// In-process [`CheckpointStore`] used by the development runtime and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, JobId), (CheckpointCoordinate, u64)>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(
        &self,
        tenancy_id: &str,
        job_id: JobId,
    ) -> Result<(Option<CheckpointCoordinate>, u64), CheckpointError> {
        let entries = self.entries.lock();
        Ok(entries
            .get(&(tenancy_id.to_owned(), job_id))
            .map_or((None, 0), |(coord, version)| {
                (Some(coord.clone()), *version)
            }))
    }

    async fn write(
        &self,
        coordinate: CheckpointCoordinate,
        expected_version: u64,
    ) -> Result<u64, CheckpointError> {
        let mut entries = self.entries.lock();
        let key = (coordinate.tenancy_id.clone(), coordinate.job_id);
        let current = entries.get(&key).map_or(0, |(_, version)| *version);
        if current != expected_version {
            return Err(CheckpointError::BadVersion {
                job: coordinate.job_id,
                held: expected_version,
            });
        }
        if let Some((previous, _)) = entries.get(&key) {
            // A winning write never moves coordinates backwards.
            debug_assert!(
                (coordinate.replica_version, coordinate.epoch)
                    >= (previous.replica_version, previous.epoch),
                "coordinate regression for job {}",
                coordinate.job_id
            );
        }
        let next = current + 1;
        entries.insert(key, (coordinate, next));
        Ok(next)
    }
}

/// Options attached to a barrier round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarrierOpts {
    /// Coordinates to recover from; set on the first barrier of a
    /// replica version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover_coordinates: Option<CheckpointCoordinate>,
    /// The epoch whose coordinates were written this round, when a write
    /// was attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpointed_epoch: Option<u64>,
}

/// An epoch-stamped control message delimiting checkpointable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
    /// Replica version the epoch belongs to.
    pub replica_version: u64,
    /// Epoch within the replica version; starts at 1.
    pub epoch: u64,
    /// Recovery or checkpoint options for this round.
    pub opts: BarrierOpts,
}

/// One (input task, site) barrier route owned by a job's coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Publication {
    /// The job.
    pub job_id: JobId,
    /// The input task barriers are injected into.
    pub task_id: TaskId,
    /// The co-location site of the destination peers.
    pub site: SiteId,
    /// The sending peer, in its coordinator role.
    pub src_peer: (PeerType, PeerId),
    /// Always [`crate::replica::COORDINATOR_SLOT`] for coordinators.
    pub slot_id: i32,
    /// Peers allocated to the task at this site.
    pub dst_peers: BTreeSet<PeerId>,
    /// Wire short id for the route, when the replica has assigned one.
    pub short_id: Option<u16>,
}

/// The publisher set a barrier coordinator drives.
///
/// `offer_barrier` follows the claim contract of the transport: a strictly
/// positive return means the barrier was accepted for the publication and
/// the route is done for this round; zero or negative means try again next
/// tick.
pub trait Messenger: Send {
    /// Replaces the publisher set from a freshly derived publication set.
    fn update_publications(&mut self, publications: BTreeSet<Publication>);

    /// The current publication set.
    fn publications(&self) -> Vec<Publication>;

    /// Attempts to place `barrier` on one publication's route.
    fn offer_barrier(&mut self, publication: &Publication, barrier: &Barrier) -> i64;

    /// Emits a liveness heartbeat on one publication's route.
    fn offer_heartbeat(&mut self, publication: &Publication);

    /// Collects heartbeats from remote ends.
    fn poll_heartbeats(&mut self);

    /// Stops the publisher set; the messenger is unusable afterwards.
    fn stop(&mut self);
}
