//! Ephemeral, watchable key-value namespace shared with worker processes.
//!
//! The sync store holds the cluster's ephemeral coordination state: peer
//! registration places, pulse (liveness) places, and the per-offer
//! payload/ack/status/completion places. Values are opaque bytes; structure
//! is the caller's concern. Every place carries a version that is bumped on
//! write and touch, and watches on a place are delivered in write order.
//! There is no ordering between distinct places.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of place a path was allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A peer's registration place.
    Peer,
    /// A peer's liveness place; existence means the peer is alive.
    Pulse,
    /// A peer's stop-signal place.
    Shutdown,
    /// A task-assignment payload place.
    Payload,
    /// An ack place, touched by the peer to accept an offer.
    Ack,
    /// A task status place.
    Status,
    /// A completion place, touched by the peer when its task is done.
    Completion,
    /// A job's serialized catalog.
    Catalog,
    /// A job's serialized workflow.
    Workflow,
}

impl NodeKind {
    /// Path segment for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Pulse => "pulse",
            Self::Shutdown => "shutdown",
            Self::Payload => "payload",
            Self::Ack => "ack",
            Self::Status => "status",
            Self::Completion => "completion",
            Self::Catalog => "catalog",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque path into the sync store namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPath(String);

impl SyncPath {
    /// Wraps an already-formed path string.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to a watched place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The place's value was (re)written.
    Written,
    /// The place's version was bumped without a value change.
    Touched,
    /// The place was deleted.
    Deleted,
}

/// Delivered to watch callbacks on every change to a watched place.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The place that changed.
    pub path: SyncPath,
    /// The kind of change.
    pub kind: ChangeKind,
}

/// Errors from sync store operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The place does not exist (never created, or deleted).
    #[error("no such place: {0}")]
    NotFound(SyncPath),

    /// A competing writer owns the place.
    #[error("conflicting write to place: {0}")]
    Conflict(SyncPath),
}

/// Whether a watch fires once or on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Deregistered after the first delivery.
    Once,
    /// Fires on every change until the place is deleted.
    Repeated,
}

/// A watch callback. Invoked outside store locks, in write order per path.
pub type WatchFn = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// The ephemeral coordination namespace contract.
///
/// Implementations must deliver watches for a given path in write order;
/// no ordering is guaranteed between paths.
pub trait SyncStore: Send + Sync {
    /// Allocates a fresh unique path tagged with `kind`.
    fn create(&self, kind: NodeKind) -> SyncPath;

    /// Idempotently writes an opaque value. Creates the place if absent.
    fn write_place(&self, path: &SyncPath, value: Bytes);

    /// Reads the value of a place.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the place is absent or has no value.
    fn read_place(&self, path: &SyncPath) -> Result<Bytes, SyncError>;

    /// Bumps the place's version without changing its value; fires watches.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the place is absent.
    fn touch_place(&self, path: &SyncPath) -> Result<(), SyncError>;

    /// Deletes a place. Watchers observe a [`ChangeKind::Deleted`] event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the place is absent.
    fn delete(&self, path: &SyncPath) -> Result<(), SyncError>;

    /// Registers a watch on a place.
    fn on_change(&self, path: &SyncPath, mode: WatchMode, watch: WatchFn);
}

struct Place {
    value: Option<Bytes>,
    version: u64,
}

struct WatchEntry {
    mode: WatchMode,
    watch: WatchFn,
}

#[derive(Default)]
struct SyncState {
    counter: u64,
    places: HashMap<SyncPath, Place>,
    watches: HashMap<SyncPath, Vec<WatchEntry>>,
}

/// In-process [`SyncStore`] used by the development runtime and tests.
///
/// Watch callbacks are invoked after the store lock is released, so a
/// callback may safely call back into the store. Per-path delivery order
/// follows commit order; the cluster's places are single-writer, which is
/// what makes that order meaningful.
#[derive(Default)]
pub struct MemorySyncStore {
    state: Mutex<SyncState>,
}

impl MemorySyncStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the watches to fire for `path`, consuming one-shot entries.
    /// Deletion drops every watch on the path.
    fn take_watches(state: &mut SyncState, path: &SyncPath, deleted: bool) -> Vec<WatchFn> {
        if deleted {
            return state
                .watches
                .remove(path)
                .map(|entries| entries.into_iter().map(|e| e.watch).collect())
                .unwrap_or_default();
        }
        let Some(entries) = state.watches.get_mut(path) else {
            return Vec::new();
        };
        let fired: Vec<WatchFn> = entries.iter().map(|e| Arc::clone(&e.watch)).collect();
        entries.retain(|e| e.mode == WatchMode::Repeated);
        fired
    }
}

impl fmt::Debug for MemorySyncStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemorySyncStore")
            .field("places", &state.places.len())
            .field("watched", &state.watches.len())
            .finish()
    }
}

impl SyncStore for MemorySyncStore {
    fn create(&self, kind: NodeKind) -> SyncPath {
        let mut state = self.state.lock();
        state.counter += 1;
        let path = SyncPath(format!("/weir/{}/{:010}", kind, state.counter));
        state.places.insert(
            path.clone(),
            Place {
                value: None,
                version: 0,
            },
        );
        path
    }

    fn write_place(&self, path: &SyncPath, value: Bytes) {
        let fired = {
            let mut state = self.state.lock();
            let place = state.places.entry(path.clone()).or_insert(Place {
                value: None,
                version: 0,
            });
            place.value = Some(value);
            place.version += 1;
            Self::take_watches(&mut state, path, false)
        };
        for watch in fired {
            watch(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Written,
            });
        }
    }

    fn read_place(&self, path: &SyncPath) -> Result<Bytes, SyncError> {
        let state = self.state.lock();
        state
            .places
            .get(path)
            .and_then(|p| p.value.clone())
            .ok_or_else(|| SyncError::NotFound(path.clone()))
    }

    fn touch_place(&self, path: &SyncPath) -> Result<(), SyncError> {
        let fired = {
            let mut state = self.state.lock();
            let place = state
                .places
                .get_mut(path)
                .ok_or_else(|| SyncError::NotFound(path.clone()))?;
            place.version += 1;
            Self::take_watches(&mut state, path, false)
        };
        for watch in fired {
            watch(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Touched,
            });
        }
        Ok(())
    }

    fn delete(&self, path: &SyncPath) -> Result<(), SyncError> {
        let fired = {
            let mut state = self.state.lock();
            if state.places.remove(path).is_none() {
                return Err(SyncError::NotFound(path.clone()));
            }
            Self::take_watches(&mut state, path, true)
        };
        for watch in fired {
            watch(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Deleted,
            });
        }
        Ok(())
    }

    fn on_change(&self, path: &SyncPath, mode: WatchMode, watch: WatchFn) {
        let mut state = self.state.lock();
        state
            .watches
            .entry(path.clone())
            .or_default()
            .push(WatchEntry { mode, watch });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_allocates_unique_tagged_paths() {
        let store = MemorySyncStore::new();
        let a = store.create(NodeKind::Peer);
        let b = store.create(NodeKind::Peer);
        let c = store.create(NodeKind::Pulse);

        assert_ne!(a, b);
        assert!(a.as_str().contains("/peer/"));
        assert!(c.as_str().contains("/pulse/"));
    }

    #[test]
    fn test_read_absent_value_is_not_found() {
        let store = MemorySyncStore::new();
        let path = store.create(NodeKind::Payload);

        // Allocated but never written.
        assert!(matches!(
            store.read_place(&path),
            Err(SyncError::NotFound(_))
        ));

        store.write_place(&path, Bytes::from_static(b"x"));
        assert_eq!(store.read_place(&path).unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn test_touch_and_delete_missing_place_fail() {
        let store = MemorySyncStore::new();
        let ghost = SyncPath::new("/weir/ack/none");

        assert!(store.touch_place(&ghost).is_err());
        assert!(store.delete(&ghost).is_err());
    }

    #[test]
    fn test_watches_fire_in_write_order() {
        let store = MemorySyncStore::new();
        let path = store.create(NodeKind::Status);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        store.on_change(
            &path,
            WatchMode::Repeated,
            Arc::new(move |event| sink.lock().push(event.kind)),
        );

        store.write_place(&path, Bytes::from_static(b"1"));
        store.touch_place(&path).unwrap();
        store.delete(&path).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![ChangeKind::Written, ChangeKind::Touched, ChangeKind::Deleted]
        );
    }

    #[test]
    fn test_one_shot_watch_fires_once() {
        let store = MemorySyncStore::new();
        let path = store.create(NodeKind::Ack);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        store.on_change(
            &path,
            WatchMode::Once,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.touch_place(&path).unwrap();
        store.touch_place(&path).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_callback_may_reenter_store() {
        let store = Arc::new(MemorySyncStore::new());
        let path = store.create(NodeKind::Pulse);
        let other = store.create(NodeKind::Shutdown);

        let inner = Arc::clone(&store);
        let target = other.clone();
        store.on_change(
            &path,
            WatchMode::Once,
            Arc::new(move |_| {
                inner.write_place(&target, Bytes::from_static(b"stop"));
            }),
        );

        store.delete(&path).unwrap();
        assert_eq!(
            store.read_place(&other).unwrap(),
            Bytes::from_static(b"stop")
        );
    }
}
