//! Downstream consumers of stream payloads and session events.

use std::net::SocketAddr;

use posestream_wire::StreamPayload;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::session::{Registration, SessionId};

/// A stream payload together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub from: SocketAddr,
    /// Session registered at `from`, if any.
    pub session_id: Option<SessionId>,
    pub payload: StreamPayload,
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered {
        session_id: SessionId,
        addr: SocketAddr,
        registration: Registration,
    },
    Evicted {
        session_id: SessionId,
        addr: SocketAddr,
    },
}

/// Receives everything the dispatcher routes out of the receive loop.
///
/// Called inline on the receive loop, so implementations must not block.
pub trait PayloadSink: Send {
    fn on_stream(&mut self, frame: StreamFrame);

    fn on_session(&mut self, _event: SessionEvent) {}
}

/// Item delivered through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkItem {
    Stream(StreamFrame),
    Session(SessionEvent),
}

/// Forwards into a bounded channel. Items are dropped when the consumer
/// falls behind, like any other UDP loss.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkItem>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    /// Items dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn forward(&mut self, item: SinkItem) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    warn!(dropped = self.dropped, "sink channel full, dropping items");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped += 1;
            }
        }
    }
}

impl PayloadSink for ChannelSink {
    fn on_stream(&mut self, frame: StreamFrame) {
        self.forward(SinkItem::Stream(frame));
    }

    fn on_session(&mut self, event: SessionEvent) {
        self.forward(SinkItem::Session(event));
    }
}

/// Writes everything to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl PayloadSink for LogSink {
    fn on_stream(&mut self, frame: StreamFrame) {
        match &frame.session_id {
            Some(session_id) => trace!(
                %session_id,
                from = %frame.from,
                frame_data = frame.payload.is_frame_data(),
                fields = frame.payload.fields.len(),
                "stream payload"
            ),
            None => debug!(
                from = %frame.from,
                fields = frame.payload.fields.len(),
                "stream payload from unregistered address"
            ),
        }
    }

    fn on_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Registered {
                session_id,
                addr,
                registration,
            } => info!(%session_id, %addr, registration = registration.as_str(), "session registered"),
            SessionEvent::Evicted { session_id, addr } => {
                info!(%session_id, %addr, "session evicted after idle timeout")
            }
        }
    }
}
