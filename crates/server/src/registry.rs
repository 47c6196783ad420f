//! Connection registry.
//!
//! Tracks every live WebSocket connection. The registry is the only shared
//! mutable state in the relay: connection tasks admit and remove themselves,
//! and the hub takes snapshots to fan out frames.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One outbound JSON text frame. Cheap to clone across recipients.
pub type Frame = Utf8Bytes;

/// Opaque identifier assigned when a connection is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Liveness of a connection.
///
/// `Connecting` is never stored: a handle only exists after the upgrade
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Why a frame could not be queued for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The recipient's outbound queue is full; the frame is dropped.
    Full,
    /// The recipient is closing or already gone.
    Closed,
}

/// Handle to one admitted connection.
///
/// Clones share the same liveness state and the same outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    state: Arc<AtomicU8>,
}

impl ConnectionHandle {
    fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
            state: Arc::new(AtomicU8::new(STATE_OPEN)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// OPEN -> CLOSING. Has no effect on a connection that is already
    /// closing or closed.
    pub fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Queue a frame without waiting.
    ///
    /// Never blocks on a slow recipient: a full queue drops the frame.
    pub fn try_send(&self, frame: Frame) -> Result<(), SendFailure> {
        if self.state() != ConnectionState::Open {
            return Err(SendFailure::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }
}

struct Member {
    /// Admission order, used to keep snapshots stable.
    seq: u64,
    handle: ConnectionHandle,
}

/// The authoritative set of open connections.
pub struct ConnectionRegistry {
    members: RwLock<HashMap<ConnectionId, Member>>,
    next_seq: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a newly accepted transport and return its handle.
    ///
    /// A transport that is already closed is not kept: the returned handle
    /// is `Closed` and the connection never shows up in a snapshot.
    pub async fn admit(&self, outbound: mpsc::Sender<Frame>) -> ConnectionHandle {
        let handle = ConnectionHandle::new(outbound);

        if handle.outbound.is_closed() {
            handle.mark_closed();
            tracing::debug!("Transport {} closed before admission", handle.id);
            return handle;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.members.write().await.insert(
            handle.id,
            Member {
                seq,
                handle: handle.clone(),
            },
        );

        handle
    }

    /// Evict a connection and mark it closed.
    ///
    /// Returns `false` if it was not a member (already removed, or never
    /// admitted). That case is not an error.
    pub async fn remove(&self, handle: &ConnectionHandle) -> bool {
        let removed = self.members.write().await.remove(&handle.id).is_some();
        handle.mark_closed();
        removed
    }

    /// Current members in admission order.
    ///
    /// The lock is released before this returns, so callers can send to the
    /// snapshot while other connections come and go.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        let members = self.members.read().await;
        let mut entries: Vec<_> = members
            .values()
            .map(|m| (m.seq, m.handle.clone()))
            .collect();
        drop(members);

        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Remove every member, marking each closed. Used on shutdown.
    pub async fn drain(&self) -> Vec<ConnectionHandle> {
        let mut entries: Vec<_> = self
            .members
            .write()
            .await
            .drain()
            .map(|(_, m)| (m.seq, m.handle))
            .collect();

        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries
            .into_iter()
            .map(|(_, handle)| {
                handle.mark_closed();
                handle
            })
            .collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::from(text.to_string())
    }

    #[tokio::test]
    async fn admit_registers_open_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);

        let handle = registry.admit(tx).await;

        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(registry.contains(handle.id()).await);
        assert_eq!(registry.len().await, 1);

        handle.try_send(frame("hello")).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn admit_assigns_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let a = registry.admit(tx1).await;
        let b = registry.admit(tx2).await;

        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn admit_of_closed_transport_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let handle = registry.admit(tx).await;

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(registry.is_empty().await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let a = registry.admit(tx1).await;
        let b = registry.admit(tx2).await;

        assert!(registry.remove(&a).await);
        assert!(!registry.remove(&a).await);

        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(b.id()).await);
    }

    #[tokio::test]
    async fn remove_of_never_admitted_handle_is_benign() {
        let registry = ConnectionRegistry::new();
        let other = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let foreign = other.admit(tx).await;

        assert!(!registry.remove(&foreign).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_is_in_admission_order() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..8 {
            let (tx, rx) = mpsc::channel(4);
            receivers.push(rx);
            ids.push(registry.admit(tx).await.id());
        }

        let snapshot: Vec<_> = registry.snapshot().await.iter().map(|h| h.id()).collect();

        assert_eq!(snapshot, ids);
    }

    #[tokio::test]
    async fn snapshot_does_not_see_later_admissions() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        registry.admit(tx1).await;

        let snapshot = registry.snapshot().await;
        let (tx2, _rx2) = mpsc::channel(4);
        registry.admit(tx2).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = registry.admit(tx).await;

        handle.try_send(frame("one")).unwrap();

        assert_eq!(handle.try_send(frame("two")), Err(SendFailure::Full));
    }

    #[tokio::test]
    async fn try_send_reports_closed_receiver() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        let handle = registry.admit(tx).await;
        drop(rx);

        assert_eq!(handle.try_send(frame("x")), Err(SendFailure::Closed));
    }

    #[tokio::test]
    async fn closing_connection_refuses_frames() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = registry.admit(tx).await;

        handle.mark_closing();

        assert_eq!(handle.state(), ConnectionState::Closing);
        assert_eq!(handle.try_send(frame("x")), Err(SendFailure::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mark_closing_does_not_reopen_closed_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.admit(tx).await;
        registry.remove(&handle).await;

        handle.mark_closing();

        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn drain_empties_registry_and_closes_members() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let a = registry.admit(tx1).await;
        let b = registry.admit(tx2).await;

        let drained = registry.drain().await;

        assert_eq!(
            drained.iter().map(|h| h.id()).collect::<Vec<_>>(),
            vec![a.id(), b.id()]
        );
        assert!(registry.is_empty().await);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn concurrent_admit_and_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(4);
                let handle = registry.admit(tx).await;
                if i % 2 == 0 {
                    registry.remove(&handle).await;
                }
                (handle, rx)
            }));
        }

        let mut kept = Vec::new();
        for task in tasks {
            kept.push(task.await.unwrap());
        }

        assert_eq!(registry.len().await, 16);
        for (handle, _rx) in &kept {
            let open = handle.state() == ConnectionState::Open;
            assert_eq!(registry.contains(handle.id()).await, open);
        }
    }
}
