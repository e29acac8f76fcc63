//! Host registry for the rendezvous server
//!
//! One record per host identity. Hosts re-register periodically; a record
//! that misses its heartbeat for longer than `interval + grace` is evicted
//! by the next [`HostRegistry::trim`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use peer_session::PeerId;

// ============================================================================
// Registry Structure
// ============================================================================

/// A live host as last reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub identity: PeerId,
    /// Address the host sees for itself on its own network
    pub internal: SocketAddr,
    /// Address the registration datagram arrived from
    pub external: SocketAddr,
    /// Game-defined description, handed to searching clients untouched
    pub public_info: Vec<u8>,
    pub last_update: Instant,
}

pub struct HostRegistry {
    hosts: HashMap<PeerId, HostRecord>,
    /// How long a record survives without a refresh
    ttl: Duration,
}

impl HostRegistry {
    pub fn new(registration_interval: Duration, grace: Duration) -> Self {
        HostRegistry {
            hosts: HashMap::new(),
            ttl: registration_interval + grace,
        }
    }

    /// Insert or overwrite the record for `identity`, resetting its clock
    ///
    /// Returns `true` when the host was not known before.
    pub fn register_or_update(
        &mut self,
        identity: PeerId,
        internal: SocketAddr,
        external: SocketAddr,
        public_info: Vec<u8>,
        now: Instant,
    ) -> bool {
        let record = HostRecord {
            identity,
            internal,
            external,
            public_info,
            last_update: now,
        };
        let is_new = self.hosts.insert(identity, record).is_none();
        if is_new {
            log::info!(
                "Registered host {} (internal={}, external={})",
                identity,
                internal,
                external
            );
        } else {
            log::debug!("Refreshed host {}", identity);
        }
        is_new
    }

    pub fn unregister(&mut self, identity: PeerId) -> bool {
        match self.hosts.remove(&identity) {
            Some(record) => {
                log::info!("Unregistered host {} ({})", identity, record.external);
                true
            }
            None => false,
        }
    }

    pub fn find(&self, identity: PeerId) -> Option<&HostRecord> {
        self.hosts.get(&identity)
    }

    pub fn list_hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    /// Evict every record older than the TTL, returning how many went
    pub fn trim(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.hosts.len();
        self.hosts.retain(|identity, record| {
            let alive = now.saturating_duration_since(record.last_update) <= ttl;
            if !alive {
                log::info!("Host {} expired (no refresh for {:?})", identity, ttl);
            }
            alive
        });
        before - self.hosts.len()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
