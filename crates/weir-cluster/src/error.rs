//! Error types for the coordination runtime.

use thiserror::Error;

use weir_core::checkpoint::CheckpointError;
use weir_core::facts::FactError;
use weir_core::sync::SyncError;
use weir_core::workflow::PlanError;

/// Errors from the cluster and barrier coordinators.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Sync store operation failed.
    #[error("sync store: {0}")]
    Sync(#[from] SyncError),

    /// Fact store transaction failed.
    #[error("fact store: {0}")]
    Facts(#[from] FactError),

    /// Checkpoint store operation failed.
    #[error("checkpoint store: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Job planning failed.
    #[error("planning: {0}")]
    Plan(#[from] PlanError),

    /// A payload or registration value could not be (de)serialized.
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// A coordination channel closed while the component was running.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
