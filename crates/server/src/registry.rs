//! Session registry.
//!
//! - Keyed by session id; one entry per id, upsert on every handshake
//! - Reverse index by peer address so stream payloads can be attributed
//! - An address belongs to the session that most recently handshook from it
//! - Entries are only removed explicitly or by idle eviction

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use posestream_wire::HandshakeRequest;

use crate::session::{Registration, Session, SessionId};

/// Registry of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    /// Peer address → session id.
    by_addr: HashMap<SocketAddr, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Session currently reachable at `addr`.
    pub fn session_for_addr(&self, addr: &SocketAddr) -> Option<&Session> {
        self.by_addr
            .get(addr)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Register or re-register a session at `addr`.
    pub fn upsert(
        &mut self,
        request: HandshakeRequest,
        addr: SocketAddr,
        now: Instant,
    ) -> Registration {
        let id = request.session_id.clone();

        let registration = match self.sessions.get_mut(&id) {
            Some(session) => {
                let previous = session.peer_addr;
                session.refresh(request, addr, now);
                if previous == addr {
                    Registration::Refreshed
                } else {
                    if self.by_addr.get(&previous) == Some(&id) {
                        self.by_addr.remove(&previous);
                    }
                    Registration::Moved { previous }
                }
            }
            None => {
                self.sessions
                    .insert(id.clone(), Session::new(request, addr, now));
                Registration::New
            }
        };

        // Newest claimant of an address wins.
        self.by_addr.insert(addr, id);
        registration
    }

    /// Resolve the session at `addr` and mark it as seen.
    pub fn touch_addr(&mut self, addr: &SocketAddr, now: Instant) -> Option<SessionId> {
        let id = self.by_addr.get(addr)?;
        let session = self.sessions.get_mut(id)?;
        session.last_seen = now;
        Some(session.id.clone())
    }

    /// Remove a session and its address mapping.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if self
            .by_addr
            .get(&session.peer_addr)
            .is_some_and(|id| id == session_id)
        {
            self.by_addr.remove(&session.peer_addr);
        }
        Some(session)
    }

    /// Remove every session idle for at least `timeout`.
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> Vec<Session> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.idle_for(now) >= timeout)
            .map(|s| s.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Distinct addresses of all sessions. Sessions sharing an address
    /// yield it once.
    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        let addrs: HashSet<SocketAddr> = self.sessions.values().map(|s| s.peer_addr).collect();
        addrs.into_iter().collect()
    }
}
