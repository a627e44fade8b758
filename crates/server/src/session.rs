//! Session state for connected pose camera apps.

use std::net::SocketAddr;
use std::time::Instant;

use posestream_wire::HandshakeRequest;

/// Session identifier, opaque and chosen by the app (`sessionUUID`).
pub type SessionId = String;

/// Client session state.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Address of the most recent handshake for this session.
    pub peer_addr: SocketAddr,
    pub user_name: Option<String>,
    pub app_version: Option<String>,
    pub device_name: Option<String>,
    pub connected_at: Instant,
    /// Last handshake or attributed stream payload.
    pub last_seen: Instant,
    /// Handshake replies issued since the session was created.
    pub handshakes: u64,
}

impl Session {
    /// Create a new session from its first handshake.
    pub fn new(request: HandshakeRequest, peer_addr: SocketAddr, now: Instant) -> Self {
        Self {
            id: request.session_id,
            peer_addr,
            user_name: request.user_name,
            app_version: request.app_version,
            device_name: request.device_name,
            connected_at: now,
            last_seen: now,
            handshakes: 1,
        }
    }

    /// Apply a repeated handshake. Metadata the app omits this time is kept.
    pub(crate) fn refresh(&mut self, request: HandshakeRequest, peer_addr: SocketAddr, now: Instant) {
        self.peer_addr = peer_addr;
        self.last_seen = now;
        self.handshakes += 1;
        if request.user_name.is_some() {
            self.user_name = request.user_name;
        }
        if request.app_version.is_some() {
            self.app_version = request.app_version;
        }
        if request.device_name.is_some() {
            self.device_name = request.device_name;
        }
    }

    /// `userName@ip`, the name shown in logs.
    pub fn connection_name(&self) -> String {
        format!(
            "{}@{}",
            self.user_name.as_deref().unwrap_or("Unknown"),
            self.peer_addr.ip()
        )
    }

    /// Time since the session was last heard from.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// How a handshake changed the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First handshake for this session id.
    New,
    /// Same session id, same address.
    Refreshed,
    /// Same session id from a different address.
    Moved { previous: SocketAddr },
}

impl Registration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Refreshed => "refreshed",
            Self::Moved { .. } => "moved",
        }
    }
}
