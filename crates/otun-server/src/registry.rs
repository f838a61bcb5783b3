//! Live tunnel registry keyed by subdomain.
//!
//! The registry is the only shared mutable state on the edge. Contention
//! is asymmetric (every public request reads, only registration and
//! removal write), so it sits behind a readers-writer lock rather than
//! anything coarser.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use otun_mux::MuxSession;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subdomain '{0}' is already in use")]
    SubdomainTaken(String),
}

/// A live tunnel registration owned by the edge.
pub struct Tunnel {
    pub subdomain: String,
    pub session: MuxSession,
    pub registered_at: Instant,
    /// The API key the agent authenticated with, when auth is enabled.
    pub auth_principal: Option<String>,
    /// Updated only by the tunnel's control loop.
    last_heartbeat: Mutex<Instant>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("subdomain", &self.subdomain)
            .field("registered_at", &self.registered_at)
            .field("auth_principal", &self.auth_principal)
            .finish()
    }
}

impl Tunnel {
    pub fn new(subdomain: String, session: MuxSession, auth_principal: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            subdomain,
            session,
            registered_at: now,
            auth_principal,
            last_heartbeat: Mutex::new(now),
        }
    }

    /// Records a heartbeat.
    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    /// Time since the last heartbeat (or registration).
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }
}

/// Maps each live subdomain to exactly one tunnel.
///
/// Check-and-insert runs as a single critical section under the write
/// lock, so two agents racing for one subdomain cannot both win.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tunnel, failing if its subdomain is already live.
    pub fn register(
        &self,
        tunnel: Tunnel,
    ) -> Result<Arc<Tunnel>, RegistryError> {
        let mut tunnels = self.tunnels.write().unwrap();
        if tunnels.contains_key(&tunnel.subdomain) {
            return Err(RegistryError::SubdomainTaken(tunnel.subdomain));
        }
        let tunnel = Arc::new(tunnel);
        tunnels.insert(tunnel.subdomain.clone(), tunnel.clone());
        Ok(tunnel)
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().unwrap().get(subdomain).cloned()
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.tunnels.read().unwrap().contains_key(subdomain)
    }

    pub fn remove(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.write().unwrap().remove(subdomain);
        if removed.is_some() {
            info!(subdomain, "tunnel unregistered");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }

    /// Closes the session of every tunnel whose heartbeat is older than
    /// `timeout`. The control loop observing the dead session completes
    /// the registry removal. Returns how many tunnels were evicted.
    pub fn evict_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<Arc<Tunnel>> = {
            let tunnels = self.tunnels.read().unwrap();
            tunnels
                .values()
                .filter(|t| t.heartbeat_age() > timeout)
                .cloned()
                .collect()
        };

        for tunnel in &stale {
            warn!(
                subdomain = %tunnel.subdomain,
                age_secs = tunnel.heartbeat_age().as_secs(),
                "heartbeat timeout, evicting tunnel"
            );
            tunnel.session.close();
        }
        stale.len()
    }

    /// Closes every session; used on edge shutdown.
    pub fn close_all(&self) {
        let tunnels = self.tunnels.read().unwrap();
        for tunnel in tunnels.values() {
            tunnel.session.close();
        }
    }
}
