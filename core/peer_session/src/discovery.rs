//! Blocking host search
//!
//! Used when looking for a session to join, never from inside a tick. The
//! request goes out once; every reply that arrives inside the discovery window
//! is parsed and returned.
//!
//! ```text
//! Broadcast(port) / Address(addr)   discovery request  → DiscoveryResponse(listing)
//! MasterServer(addr)                RequestHosts       → UnconnectedData(listing)  × hosts
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::master::{HostListing, MasterMessage};
use crate::session::SessionSearch;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Where to look for hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTarget {
    /// Local network broadcast to the given port
    Broadcast(u16),
    /// A single known address
    Address(SocketAddr),
    /// The master server at the given address
    MasterServer(SocketAddr),
}

impl DiscoveryTarget {
    fn request_address(&self) -> SocketAddr {
        match *self {
            DiscoveryTarget::Broadcast(port) => SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            DiscoveryTarget::Address(addr) | DiscoveryTarget::MasterServer(addr) => addr,
        }
    }
}

/// How a discovered host is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRoute {
    /// Answered a LAN request from this address
    Direct(SocketAddr),
    /// Listed by the master server; needs an introduction
    Introduced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableHost {
    pub listing: HostListing,
    pub route: HostRoute,
}

impl AvailableHost {
    pub fn identity(&self) -> PeerId {
        self.listing.identity
    }
}

/// Send a discovery request, wait out `window` and return every host that
/// answered. Replies are deduplicated by identity; malformed ones are logged
/// and skipped. With a `search`, hosts that do not match it are left out.
pub fn find_hosts(
    transport: &mut dyn Transport,
    target: &DiscoveryTarget,
    app_id: &str,
    window: Duration,
    search: Option<&SessionSearch>,
) -> Result<Vec<AvailableHost>, TransportError> {
    let addr = target.request_address();
    match target {
        DiscoveryTarget::Broadcast(_) | DiscoveryTarget::Address(_) => transport.discover(addr)?,
        DiscoveryTarget::MasterServer(_) => {
            let request = MasterMessage::RequestHosts.encode(app_id)?;
            transport.send_unconnected(addr, &request)?;
        }
    }
    log::debug!("Discovery request sent to {} ({:?} window)", addr, window);

    let deadline = Instant::now() + window;
    let mut hosts: Vec<AvailableHost> = Vec::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        transport.pump(Some(deadline - now))?;
        collect_replies(transport, target, search, &mut hosts);
    }

    // Anything that landed with the last pump
    transport.pump(Some(Duration::ZERO))?;
    collect_replies(transport, target, search, &mut hosts);

    log::info!("Discovery found {} host(s)", hosts.len());
    Ok(hosts)
}

fn collect_replies(
    transport: &mut dyn Transport,
    target: &DiscoveryTarget,
    search: Option<&SessionSearch>,
    hosts: &mut Vec<AvailableHost>,
) {
    while let Some(event) = transport.next_event() {
        let Some(host) = parse_reply(target, event) else {
            continue;
        };
        if hosts.iter().any(|h| h.identity() == host.identity()) {
            continue;
        }
        if let Some(search) = search {
            if !search.matches_listing(&host.listing) {
                log::debug!("Host {} does not match the search", host.identity());
                continue;
            }
        }
        hosts.push(host);
    }
}

fn parse_reply(target: &DiscoveryTarget, event: TransportEvent) -> Option<AvailableHost> {
    let (from, payload, route) = match (target, event) {
        (DiscoveryTarget::MasterServer(master), TransportEvent::UnconnectedData { from, payload }) => {
            if from != *master {
                log::debug!("Unconnected data from {} during master search ignored", from);
                return None;
            }
            (from, payload, HostRoute::Introduced)
        }
        (
            DiscoveryTarget::Broadcast(_) | DiscoveryTarget::Address(_),
            TransportEvent::DiscoveryResponse { from, payload },
        ) => (from, payload, HostRoute::Direct(from)),
        (_, TransportEvent::Diagnostic { level, message }) => {
            log::log!(level, "Transport: {}", message);
            return None;
        }
        (_, other) => {
            log::debug!("Event during discovery dropped: {:?}", other);
            return None;
        }
    };

    match HostListing::decode(&payload) {
        Ok(listing) => Some(AvailableHost { listing, route }),
        Err(e) => {
            log::debug!("Malformed discovery reply from {}: {}", from, e);
            None
        }
    }
}
