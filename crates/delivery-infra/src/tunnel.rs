//! In-process tunnel endpoint.
//!
//! `MemoryTunnelEndpoint` stands in for a network endpoint: remote peers are
//! simulated sessions that receive payloads on a channel and inject payloads
//! with [`MemoryTunnelEndpoint::inject`]. The server role enforces the
//! configured client limit; both roles cap sessions per peer address at
//! `max_connections_per_address`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use delivery_core::tunnel::{TunnelEndpoint, TunnelInbound};
use delivery_types::DeliveryError;
use delivery_types::config::{TunnelConfig, TunnelRole};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiving side of a simulated remote peer.
pub type SessionReceiver = mpsc::UnboundedReceiver<String>;

struct Session {
    peer_address: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct MemoryTunnelEndpoint {
    inbound: RwLock<Option<Arc<dyn TunnelInbound>>>,
    config: RwLock<Option<TunnelConfig>>,
    sessions: DashMap<String, Session>,
    /// Serializes limit checks with the insert that follows them.
    connecting: Mutex<()>,
    closed: AtomicBool,
}

impl MemoryTunnelEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_started(&self) -> bool {
        self.inbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Option<TunnelRole> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|config| config.role)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Attach a remote peer at `peer_address` under `session_id`.
    ///
    /// Reconnecting an existing session id replaces it. Returns the channel on
    /// which the peer receives payloads.
    pub fn connect_session(
        &self,
        session_id: &str,
        peer_address: &str,
    ) -> Result<SessionReceiver, DeliveryError> {
        if !self.is_started() || self.is_closed() {
            return Err(DeliveryError::Tunnel(format!(
                "endpoint not running, session {session_id} refused"
            )));
        }
        let (session_limit, per_address_limit) = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|config| {
                let sessions = match config.role {
                    TunnelRole::Server => config.max_clients,
                    TunnelRole::Client => Some(1),
                };
                (sessions, config.max_connections_per_address)
            })
            .unwrap_or((None, u32::MAX));

        let _connecting = self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let others = |keep: &dyn Fn(&Session) -> bool| {
            self.sessions
                .iter()
                .filter(|entry| entry.key() != session_id && keep(entry.value()))
                .count()
        };
        if let Some(limit) = session_limit {
            if others(&|_: &Session| true) >= limit as usize {
                return Err(DeliveryError::Tunnel(format!(
                    "session limit {limit} reached, session {session_id} refused"
                )));
            }
        }
        let from_peer = others(&|session: &Session| session.peer_address == peer_address);
        if from_peer >= per_address_limit as usize {
            return Err(DeliveryError::Tunnel(format!(
                "{peer_address} already holds {per_address_limit} sessions, session {session_id} refused"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id.to_string(),
            Session {
                peer_address: peer_address.to_string(),
                tx,
            },
        );
        debug!(session_id, peer_address, "tunnel session connected");
        Ok(rx)
    }

    /// Sessions currently held by `peer_address`.
    pub fn sessions_from(&self, peer_address: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().peer_address == peer_address)
            .count()
    }

    pub fn disconnect_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Deliver `payload` as if the peer on `session_id` had sent it.
    pub fn inject(&self, session_id: &str, payload: &str) -> Result<(), DeliveryError> {
        if !self.sessions.contains_key(session_id) {
            return Err(DeliveryError::Tunnel(format!(
                "unknown session {session_id}"
            )));
        }
        let inbound = self
            .inbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DeliveryError::Tunnel("endpoint not started".to_string()))?;
        inbound.on_payload(session_id, payload);
        Ok(())
    }
}

impl TunnelEndpoint for MemoryTunnelEndpoint {
    fn start(
        &self,
        config: &TunnelConfig,
        inbound: Arc<dyn TunnelInbound>,
    ) -> Result<(), DeliveryError> {
        config.validate()?;
        if self.is_closed() {
            return Err(DeliveryError::Tunnel("endpoint already closed".to_string()));
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        *self.inbound.write().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        info!(
            role = %config.role,
            address = %config.address,
            directory = %config.base_directory.display(),
            "memory tunnel endpoint started"
        );
        Ok(())
    }

    fn send(&self, session_id: Option<&str>, payload: String) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Tunnel("endpoint closed".to_string()));
        }
        match session_id {
            Some(session_id) => {
                let session = self.sessions.get(session_id).ok_or_else(|| {
                    DeliveryError::Tunnel(format!("unknown session {session_id}"))
                })?;
                session
                    .tx
                    .send(payload)
                    .map_err(|_| DeliveryError::Tunnel(format!("session {session_id} hung up")))
            }
            None => {
                let mut delivered = 0;
                for session in self.sessions.iter() {
                    if session.value().tx.send(payload.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                debug!(delivered, "tunnel payload sent to every session");
                Ok(())
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sessions.clear();
        self.inbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("memory tunnel endpoint closed");
    }
}

impl std::fmt::Debug for MemoryTunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTunnelEndpoint")
            .field("role", &self.role())
            .field("sessions", &self.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
