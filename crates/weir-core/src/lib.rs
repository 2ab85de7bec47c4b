//! Store adapters, data model, replica log, and workflow planning for the
//! weir coordination core.
//!
//! This crate holds the leaves of the dependency order: the sync-store and
//! fact-store capabilities with their in-process adapters, the checkpoint
//! coordinate store, the replica command log, and topological job planning.
//! The coordinators that drive them live in `weir-cluster`.

pub mod checkpoint;
pub mod facts;
pub mod replica;
pub mod sync;
pub mod workflow;
