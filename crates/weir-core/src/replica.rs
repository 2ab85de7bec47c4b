//! The replica: a deterministic view of cluster state derived from a
//! replicated command log.
//!
//! Every peer applies the same ordered [`LogEntry`] stream and arrives at the
//! same [`Replica`]. The barrier coordinator is elected and re-elected purely
//! from this view; stale reallocation commands are rejected by
//! allocation-version comparison so replays are harmless.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workflow::{JobId, TaskId};

/// Opaque identifier of a worker process in the replica's coordinate system.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Co-location key: peers at the same site share a transport endpoint.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The role a peer id plays in a message route.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    /// The job's elected barrier coordinator.
    Coordinator,
    /// An ordinary task-executing peer.
    Worker,
}

/// Key into the replica's message short-id map.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShortIdKey {
    /// Role of the source peer.
    pub peer_type: PeerType,
    /// The source peer.
    pub peer_id: PeerId,
    /// The job the route belongs to.
    pub job_id: JobId,
    /// The destination task.
    pub task_id: TaskId,
    /// Slot within the task; coordinators use [`COORDINATOR_SLOT`].
    pub slot_id: i32,
}

/// Slot id used by barrier-coordinator publications.
pub const COORDINATOR_SLOT: i32 = -1;

/// Deterministic cluster view produced by applying the command log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    /// Log position: number of commands applied.
    pub version: u64,
    /// Known peers.
    pub peers: BTreeSet<PeerId>,
    /// Peer → co-location site.
    pub peer_sites: BTreeMap<PeerId, SiteId>,
    /// Job → elected barrier coordinator.
    pub coordinators: BTreeMap<JobId, PeerId>,
    /// Job → allocation version, bumped on every reallocation.
    pub allocation_versions: BTreeMap<JobId, u64>,
    /// Job → task → allocated peers.
    pub allocations: BTreeMap<JobId, BTreeMap<TaskId, BTreeSet<PeerId>>>,
    /// Job → its input (phase-zero) tasks.
    pub input_tasks: BTreeMap<JobId, BTreeSet<TaskId>>,
    /// Jobs whose every task has completed.
    pub completed_jobs: BTreeSet<JobId>,
    /// Route → wire short id.
    pub message_short_ids: BTreeMap<ShortIdKey, u16>,
}

impl Replica {
    /// The allocation version of a job; zero before its first allocation.
    #[must_use]
    pub fn allocation_version(&self, job: JobId) -> u64 {
        self.allocation_versions.get(&job).copied().unwrap_or(0)
    }

    /// Whether `peer` is the elected coordinator of `job`.
    #[must_use]
    pub fn is_coordinator(&self, job: JobId, peer: &PeerId) -> bool {
        self.coordinators.get(&job) == Some(peer)
    }

    /// Applies one command, advancing the log position.
    ///
    /// Stale reallocations (allocation version not greater than the current
    /// one) are ignored; the log position still advances so replicas stay in
    /// step.
    pub fn apply(&mut self, entry: &LogEntry) {
        self.version += 1;
        match entry {
            LogEntry::PeerJoined { peer, site } => {
                self.peers.insert(peer.clone());
                self.peer_sites.insert(peer.clone(), site.clone());
            }

            LogEntry::PeerLeft { peer } => {
                self.peers.remove(peer);
                self.peer_sites.remove(peer);
                for tasks in self.allocations.values_mut() {
                    for peers in tasks.values_mut() {
                        peers.remove(peer);
                    }
                }
            }

            LogEntry::CoordinatorElected { job, peer } => {
                self.coordinators.insert(*job, peer.clone());
            }

            LogEntry::Reallocated {
                job,
                allocation_version,
                allocations,
                input_tasks,
            } => {
                if *allocation_version <= self.allocation_version(*job) {
                    return; // stale command, already superseded
                }
                self.allocation_versions.insert(*job, *allocation_version);
                self.allocations.insert(*job, allocations.clone());
                self.input_tasks.insert(*job, input_tasks.clone());
            }

            LogEntry::ShortIdAssigned { key, short_id } => {
                self.message_short_ids.insert(key.clone(), *short_id);
            }

            LogEntry::JobCompleted { job } => {
                self.completed_jobs.insert(*job);
            }
        }
    }
}

/// Commands applied to the replica state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntry {
    /// A peer registered with the cluster.
    PeerJoined {
        /// The joining peer.
        peer: PeerId,
        /// Its co-location site.
        site: SiteId,
    },
    /// A peer left or was evicted.
    PeerLeft {
        /// The departing peer.
        peer: PeerId,
    },
    /// A coordinator was (re-)elected for a job.
    CoordinatorElected {
        /// The job.
        job: JobId,
        /// The elected peer.
        peer: PeerId,
    },
    /// The scheduler produced a new task allocation for a job.
    Reallocated {
        /// The job.
        job: JobId,
        /// The new allocation version; stale versions are ignored.
        allocation_version: u64,
        /// Task → allocated peers.
        allocations: BTreeMap<TaskId, BTreeSet<PeerId>>,
        /// The job's input tasks under this allocation.
        input_tasks: BTreeSet<TaskId>,
    },
    /// A wire short id was assigned to a message route.
    ShortIdAssigned {
        /// The route.
        key: ShortIdKey,
        /// Its short id.
        short_id: u16,
    },
    /// Every task of a job has completed.
    JobCompleted {
        /// The job.
        job: JobId,
    },
}
