//! Pose Stream Session Server
//!
//! Accepts pose streams from mobile camera apps over a single UDP socket.
//! It owns:
//! - Session registration (hello → `HANDSHAKE` reply)
//! - Attribution of stream payloads to sessions by peer address
//! - Optional idle eviction and minimum app version gating
//!
//! # Architecture
//!
//! [`Server`] is the sans-I/O core: it takes one datagram and returns an
//! [`Outcome`] describing what to send and what to forward. The
//! [`Dispatcher`] owns the socket and runs the receive loop around it, so the
//! registry is only ever touched from that one task.

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;
pub mod sink;
pub mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use posestream_wire::{AppVersion, EncodedHandshake, HandshakeConfig, InboundMessage};
use tracing::{debug, info, warn};

pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use registry::SessionRegistry;
pub use session::{Registration, Session, SessionId};
pub use sink::{ChannelSink, LogSink, PayloadSink, SessionEvent, SinkItem, StreamFrame};
pub use transport::Transport;

// ============================================================================
// Defaults
// ============================================================================

/// Port the app is pointed at unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8080;

/// How often idle sessions are swept and stats logged.
pub const SWEEP_INTERVAL_MS: u64 = 1000;

/// Idle timeout used when eviction is enabled without an explicit value.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub handshake: HandshakeConfig,
    /// Evict sessions silent for this long. `None` keeps them forever.
    pub session_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    /// Reject hellos from apps older than this.
    pub min_app_version: Option<AppVersion>,
    /// Ask every registered app to disconnect when the server stops.
    pub disconnect_on_shutdown: bool,
    pub max_datagram_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            handshake: HandshakeConfig::default(),
            session_timeout: None,
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MS),
            min_app_version: None,
            disconnect_on_shutdown: true,
            max_datagram_size: posestream_wire::MAX_DATAGRAM_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why a datagram produced no reply and no forwarded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not UTF-8 JSON object.
    Malformed,
    /// Hello from an app below `min_app_version`.
    VersionRejected { version: Option<String> },
}

/// Result of handling one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send `reply` to `to`. The registry has already been updated.
    Handshake {
        to: SocketAddr,
        reply: Bytes,
        session_id: SessionId,
        registration: Registration,
    },
    /// Forward to the sink. With idle eviction on, the session's `last_seen`
    /// was refreshed; otherwise the registry is untouched.
    Stream(StreamFrame),
    Dropped(DropReason),
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub datagrams: u64,
    pub handshakes: u64,
    pub sessions_created: u64,
    pub stream_payloads: u64,
    /// Stream payloads from addresses with no registered session.
    pub unattributed_payloads: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub send_failures: u64,
    pub evicted: u64,
}

// ============================================================================
// Server
// ============================================================================

/// Session state for one listening socket.
pub struct Server {
    config: ServerConfig,
    /// Serialized once; every hello gets these exact bytes.
    handshake: EncodedHandshake,
    registry: SessionRegistry,
    stats: ServerStats,
}

impl Server {
    /// Create a new server. Fails if the handshake configuration is invalid
    /// or the receive buffer would be empty.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        if config.max_datagram_size == 0 {
            return Err(ServerError::ZeroDatagramSize);
        }
        let handshake = EncodedHandshake::new(config.handshake.clone())?;
        Ok(Self {
            config,
            handshake,
            registry: SessionRegistry::new(),
            stats: ServerStats::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Get number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// The cached handshake reply.
    pub fn handshake_bytes(&self) -> Bytes {
        self.handshake.bytes()
    }

    /// Decode, classify and apply one datagram.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Outcome {
        self.stats.datagrams += 1;
        match posestream_wire::decode_message(bytes) {
            Ok(message) => self.handle_message(message, from, now),
            Err(e) => {
                self.stats.malformed += 1;
                debug!(%from, len = bytes.len(), error = %e, "dropping malformed datagram");
                Outcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Apply an already classified message.
    pub fn handle_message(
        &mut self,
        message: InboundMessage,
        from: SocketAddr,
        now: Instant,
    ) -> Outcome {
        match message {
            InboundMessage::HandshakeRequest(request) => {
                if let Some(min) = self.config.min_app_version {
                    let accepted = request
                        .app_version
                        .as_deref()
                        .and_then(|v| v.parse::<AppVersion>().ok())
                        .is_some_and(|v| v >= min);
                    if !accepted {
                        self.stats.rejected += 1;
                        warn!(
                            %from,
                            version = request.app_version.as_deref().unwrap_or("none"),
                            required = %min,
                            "rejecting hello from outdated app"
                        );
                        return Outcome::Dropped(DropReason::VersionRejected {
                            version: request.app_version,
                        });
                    }
                }

                let session_id = request.session_id.clone();
                let registration = self.registry.upsert(request, from, now);
                self.stats.handshakes += 1;
                if registration == Registration::New {
                    self.stats.sessions_created += 1;
                }

                if let Some(session) = self.registry.get(&session_id) {
                    info!(
                        %session_id,
                        name = %session.connection_name(),
                        port = from.port(),
                        registration = registration.as_str(),
                        "received hello"
                    );
                }

                Outcome::Handshake {
                    to: from,
                    reply: self.handshake.bytes(),
                    session_id,
                    registration,
                }
            }
            InboundMessage::StreamPayload(payload) => {
                self.stats.stream_payloads += 1;
                // last_seen only matters when idle eviction is on.
                let session_id = if self.config.session_timeout.is_some() {
                    self.registry.touch_addr(&from, now)
                } else {
                    self.registry
                        .session_for_addr(&from)
                        .map(|session| session.id.clone())
                };
                if session_id.is_none() {
                    self.stats.unattributed_payloads += 1;
                }
                Outcome::Stream(StreamFrame {
                    from,
                    session_id,
                    payload,
                })
            }
        }
    }

    /// Record a reply that could not be sent. Registration stands.
    pub fn record_send_failure(&mut self) {
        self.stats.send_failures += 1;
    }

    /// Evict sessions idle past `session_timeout`. No-op without a timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<Session> {
        let Some(timeout) = self.config.session_timeout else {
            return Vec::new();
        };
        let evicted = self.registry.evict_idle(now, timeout);
        self.stats.evicted += evicted.len() as u64;
        evicted
    }

    /// Explicitly forget a session.
    pub fn remove_session(&mut self, session_id: &str) -> Option<Session> {
        self.registry.remove(session_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
