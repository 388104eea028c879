//! Event delivery.
//!
//! The engine pushes [`UploadEvent`]s into an [`EventSink`] and never waits
//! for an answer. A channel, a closure or nothing at all can sit behind it.

use chunkwise_protocol::UploadEvent;
use tokio::sync::mpsc;
use tracing::trace;

/// Consumer of upload lifecycle events.
///
/// `emit` runs outside the per-upload state lock, so a sink may query the
/// manager. Events of one upload are delivered one at a time; `emit` must
/// not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: UploadEvent);
}

impl<F> EventSink for F
where
    F: Fn(UploadEvent) + Send + Sync,
{
    fn emit(&self, event: UploadEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: UploadEvent) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: UploadEvent) {}
}
