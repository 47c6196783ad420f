//! Broadcast hub.
//!
//! Classifies inbound frames and relays the valid ones to every live
//! connection, the sender included. Clients rely on seeing their own echo to
//! keep a consistent rendering order.

use chat_relay_shared::{DecodeError, Envelope};
use tokio::sync::{mpsc, watch};

use crate::registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionState, Frame, SendFailure,
};

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Per-recipient results of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames queued for delivery.
    pub delivered: usize,
    /// Recipients whose queue was full; their copy was dropped.
    pub dropped: usize,
    /// Recipients that were already closing.
    pub closed: usize,
}

impl BroadcastReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}

/// What the hub did with an inbound frame.
#[derive(Debug)]
pub enum Dispatch {
    Broadcast(BroadcastReport),
    Discarded(DecodeError),
}

pub struct Hub {
    registry: ConnectionRegistry,
    outbound_capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl Hub {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            outbound_capacity: outbound_capacity.max(1),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Create the bounded outbound queue for a new connection.
    ///
    /// The sender is the transport handed to [`Hub::on_connect`]; the
    /// receiver feeds the socket writer.
    pub fn open_transport(&self) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        mpsc::channel(self.outbound_capacity)
    }

    /// Admit a connection. It receives only frames broadcast from now on.
    pub async fn on_connect(&self, transport: mpsc::Sender<Frame>) -> ConnectionHandle {
        let handle = self.registry.admit(transport).await;
        if handle.state() == ConnectionState::Open {
            tracing::info!(
                conn = %handle.id(),
                "Client connected ({} live)",
                self.registry.len().await
            );
        }
        handle
    }

    /// Decode a raw frame and, if it is a known event, relay it as-is.
    ///
    /// Frames that fail to decode are dropped without telling the sender.
    pub async fn on_message(&self, handle: &ConnectionHandle, raw: Frame) -> Dispatch {
        let envelope = match Envelope::decode(raw.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(
                    conn = %handle.id(),
                    reason = e.label(),
                    "Discarding frame: {}",
                    e
                );
                return Dispatch::Discarded(e);
            }
        };

        tracing::debug!(
            conn = %handle.id(),
            kind = envelope.kind(),
            sender = envelope.sender(),
            sent_at = ?envelope.sent_at(),
            "Relaying event"
        );

        Dispatch::Broadcast(self.broadcast(raw).await)
    }

    /// Queue `frame` for every connection in the current snapshot.
    ///
    /// One recipient failing never stops delivery to the rest.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for recipient in self.registry.snapshot().await {
            match recipient.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(SendFailure::Full) => {
                    tracing::warn!(
                        conn = %recipient.id(),
                        "Outbound queue full, dropping frame"
                    );
                    report.dropped += 1;
                }
                Err(SendFailure::Closed) => {
                    tracing::debug!(conn = %recipient.id(), "Skipping closed connection");
                    report.closed += 1;
                }
            }
        }

        report
    }

    /// Remove a connection. Safe to call more than once.
    pub async fn on_disconnect(&self, handle: &ConnectionHandle) {
        if self.registry.remove(handle).await {
            tracing::info!(
                conn = %handle.id(),
                "Client disconnected ({} live)",
                self.registry.len().await
            );
        }
    }

    /// Receiver that flips to `true` once [`Hub::shutdown`] runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Close every connection. Returns how many were live.
    pub async fn shutdown(&self) -> usize {
        let drained = self.registry.drain().await;
        self.shutdown.send_replace(true);
        drained.len()
    }
}
