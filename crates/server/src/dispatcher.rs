//! Receive loop: transport → [`Server`] → reply / sink.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sink::{PayloadSink, SessionEvent};
use crate::transport::{self, Transport};
use crate::{Outcome, Server, ServerConfig, ServerError, ServerStats};

/// Owns the socket, the [`Server`] and the sink; runs the receive loop.
pub struct Dispatcher<T, S> {
    transport: T,
    server: Server,
    sink: S,
    buf: Vec<u8>,
    last_stats: ServerStats,
}

impl<S: PayloadSink> Dispatcher<UdpSocket, S> {
    /// Bind the configured UDP address.
    pub async fn bind(config: ServerConfig, sink: S) -> Result<Self, ServerError> {
        let server = Server::new(config)?;
        let addr = server.config().bind_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%addr, "listening for pose apps");
        Ok(Self::new(socket, server, sink))
    }
}

impl<T: Transport, S: PayloadSink> Dispatcher<T, S> {
    pub fn new(transport: T, server: Server, sink: S) -> Self {
        let buf = vec![0u8; server.config().max_datagram_size];
        Self {
            transport,
            server,
            sink,
            buf,
            last_stats: ServerStats::default(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn stats(&self) -> ServerStats {
        self.server.stats()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_parts(self) -> (T, Server, S) {
        (self.transport, self.server, self.sink)
    }

    /// Run until `cancel` fires or the transport fails.
    ///
    /// Returns `Ok(())` on cancellation. Per-datagram failures are logged
    /// and never end the loop.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        let period = self.server.config().sweep_interval.max(Duration::from_millis(1));
        let mut sweep = time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                received = self.transport.recv_from(&mut self.buf) => match received {
                    Ok((len, from)) => self.dispatch(len, from).await,
                    Err(e) if transport::is_transient(&e) => {
                        warn!(error = %e, "transient receive error");
                    }
                    Err(e) => {
                        error!(error = %e, "receive failed, stopping dispatcher");
                        return Err(ServerError::Transport(e));
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn dispatch(&mut self, len: usize, from: SocketAddr) {
        if len == self.buf.len() {
            debug!(%from, len, "datagram filled the receive buffer and may be truncated");
        }

        let outcome = self
            .server
            .handle_datagram(&self.buf[..len], from, Instant::now());

        match outcome {
            Outcome::Handshake {
                to,
                reply,
                session_id,
                registration,
            } => {
                match self.transport.send_to(&reply, to).await {
                    Ok(_) => debug!(%session_id, %to, "sent handshake"),
                    Err(e) => {
                        self.server.record_send_failure();
                        warn!(%session_id, %to, error = %e, "unable to send handshake");
                    }
                }
                self.sink.on_session(SessionEvent::Registered {
                    session_id,
                    addr: to,
                    registration,
                });
            }
            Outcome::Stream(frame) => self.sink.on_stream(frame),
            Outcome::Dropped(_) => {}
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        for session in self.server.evict_idle(now) {
            info!(
                session_id = %session.id,
                name = %session.connection_name(),
                idle_ms = session.idle_for(now).as_millis() as u64,
                "evicting idle session"
            );
            self.sink.on_session(SessionEvent::Evicted {
                session_id: session.id,
                addr: session.peer_addr,
            });
        }

        let stats = self.server.stats();
        if stats != self.last_stats {
            debug!(
                sessions = self.server.session_count(),
                datagrams = stats.datagrams,
                handshakes = stats.handshakes,
                stream_payloads = stats.stream_payloads,
                unattributed = stats.unattributed_payloads,
                malformed = stats.malformed,
                send_failures = stats.send_failures,
                "dispatcher stats"
            );
            self.last_stats = stats;
        }
    }

    /// Best-effort disconnect request to every registered app.
    async fn shutdown(&mut self) {
        info!(
            sessions = self.server.session_count(),
            "dispatcher shutting down"
        );
        if !self.server.config().disconnect_on_shutdown {
            return;
        }

        let request = posestream_wire::encode_disconnect();
        for addr in self.server.registry().peer_addrs() {
            match self.transport.send_to(&request, addr).await {
                Ok(_) => debug!(%addr, "sent disconnect request"),
                Err(e) => debug!(%addr, error = %e, "unable to send disconnect request"),
            }
        }
    }
}
