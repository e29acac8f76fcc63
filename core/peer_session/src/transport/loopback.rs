//! In-memory transport
//!
//! Endpoints bind to `127.0.0.1:<port>` on a shared [`LoopbackNetwork`].
//! Sends are delivered straight into the destination's inbox and become
//! visible to it on its next `pump`, so several endpoints can be ticked from
//! one thread (or several) with deterministic ordering. Events about the
//! caller's own action (approve, deny, disconnect) are readable at once.
//! A broadcast discovery request reaches the endpoint bound to the target
//! port.
//!
//! Simulated conditions apply to connected sends only. Delayed messages sit
//! in the destination's delay queue, released in send order once due.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ring::rand::SystemRandom;

use super::control::PunchTokens;
use super::{
    ConnectionHandle, ConnectionStatus, Reliability, SimulatedConditions, Transport, TransportError,
    TransportEvent, TransportStats,
};

/// First port handed out when binding to port 0
const EPHEMERAL_PORT_START: u16 = 49152;

/// Granularity of waits inside `pump`
const WAIT_STEP: Duration = Duration::from_millis(1);

const LOOPBACK_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ============================================================================
// Shared network state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Client side, waiting for the host's decision
    Connecting,
    /// Host side, waiting for approve/deny
    AwaitingApproval,
    Connected,
}

#[derive(Debug)]
struct Link {
    remote: SocketAddr,
    remote_handle: ConnectionHandle,
    state: LinkState,
    /// Client hail, kept by the host until it approves
    remote_hail: Vec<u8>,
}

#[derive(Debug)]
struct Endpoint {
    app_id: String,
    accepts_incoming: bool,
    inbox: VecDeque<TransportEvent>,
    /// Delivery time and event, due times never decreasing
    delayed: VecDeque<(Instant, TransportEvent)>,
    links: HashMap<ConnectionHandle, Link>,
    next_handle: u64,
    reported_tokens: PunchTokens,
    stats: TransportStats,
}

impl Endpoint {
    fn new(app_id: &str, accepts_incoming: bool) -> Self {
        Endpoint {
            app_id: app_id.to_string(),
            accepts_incoming,
            inbox: VecDeque::new(),
            delayed: VecDeque::new(),
            links: HashMap::new(),
            next_handle: 1,
            reported_tokens: PunchTokens::new(),
            stats: TransportStats::default(),
        }
    }

    fn allocate_handle(&mut self) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn record_sent(&mut self, len: usize) {
        self.stats.bytes_sent += len as u64;
        self.stats.packets_sent += 1;
    }

    fn record_received(&mut self, len: usize) {
        self.stats.bytes_received += len as u64;
        self.stats.packets_received += 1;
    }

    fn deliver_after(&mut self, delay: Duration, event: TransportEvent) {
        if delay.is_zero() && self.delayed.is_empty() {
            self.inbox.push_back(event);
            return;
        }
        let mut due = Instant::now() + delay;
        if let Some((last, _)) = self.delayed.back() {
            due = due.max(*last);
        }
        self.delayed.push_back((due, event));
    }

    /// Move delayed events that are due into the inbox
    fn release_due(&mut self, now: Instant) {
        while matches!(self.delayed.front(), Some((due, _)) if *due <= now) {
            if let Some((_, event)) = self.delayed.pop_front() {
                self.inbox.push_back(event);
            }
        }
    }

    fn status_changed(&mut self, connection: ConnectionHandle, status: ConnectionStatus, reason: &str) {
        self.inbox.push_back(TransportEvent::StatusChanged {
            connection,
            status,
            reason: reason.to_string(),
        });
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, Endpoint>,
    next_port: u16,
}

impl NetworkState {
    fn allocate_port(&mut self) -> Option<u16> {
        if self.next_port < EPHEMERAL_PORT_START {
            self.next_port = EPHEMERAL_PORT_START;
        }
        while self.next_port < u16::MAX {
            let port = self.next_port;
            self.next_port += 1;
            if !self.endpoints.contains_key(&SocketAddr::new(LOOPBACK_IP, port)) {
                return Some(port);
            }
        }
        None
    }

    /// Drop the far end of a link and tell it why
    fn sever_remote(&mut self, remote: SocketAddr, remote_handle: ConnectionHandle, reason: &str) {
        if let Some(endpoint) = self.endpoints.get_mut(&remote) {
            if endpoint.links.remove(&remote_handle).is_some() {
                endpoint.status_changed(remote_handle, ConnectionStatus::Disconnected, reason);
            }
        }
    }

    /// Deliver a connectionless event, counting bytes on both ends
    fn deliver_unconnected(&mut self, from: SocketAddr, to: SocketAddr, len: usize, event: TransportEvent) {
        if let Some(sender) = self.endpoints.get_mut(&from) {
            sender.record_sent(len);
        }
        match self.endpoints.get_mut(&to) {
            Some(target) => {
                target.record_received(len);
                target.inbox.push_back(event);
            }
            None => log::trace!("Loopback: dropped {} bytes to unbound {}", len, to),
        }
    }
}

/// Handle to an in-memory network; clones share the same endpoints
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an endpoint; port 0 picks a free ephemeral port
    pub fn bind(&self, port: u16, app_id: &str) -> Result<LoopbackTransport, TransportError> {
        self.bind_endpoint(port, app_id, true)
    }

    /// Bind an endpoint that can connect out but refuses every inbound
    /// connection
    pub fn bind_outgoing_only(&self, port: u16, app_id: &str) -> Result<LoopbackTransport, TransportError> {
        self.bind_endpoint(port, app_id, false)
    }

    fn bind_endpoint(&self, port: u16, app_id: &str, accepts_incoming: bool) -> Result<LoopbackTransport, TransportError> {
        let mut state = self.lock();

        let port = if port == 0 {
            state.allocate_port().ok_or_else(|| TransportError::Bind {
                addr: SocketAddr::new(LOOPBACK_IP, 0),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no free loopback port"),
            })?
        } else {
            port
        };

        let addr = SocketAddr::new(LOOPBACK_IP, port);
        if state.endpoints.contains_key(&addr) {
            return Err(TransportError::Bind {
                addr,
                source: io::Error::new(io::ErrorKind::AddrInUse, "loopback port in use"),
            });
        }
        state.endpoints.insert(addr, Endpoint::new(app_id, accepts_incoming));
        log::debug!("Loopback endpoint bound at {} (accepting: {})", addr, accepts_incoming);

        Ok(LoopbackTransport {
            network: self.clone(),
            addr,
            ready: VecDeque::new(),
            conditions: SimulatedConditions::default(),
            rng: SystemRandom::new(),
            shut_down: false,
        })
    }

    /// Number of endpoints currently bound
    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }
}

// ============================================================================
// Endpoint handle
// ============================================================================

/// One bound endpoint on a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    addr: SocketAddr,
    /// Events moved out of the shared inbox by `pump`
    ready: VecDeque<TransportEvent>,
    conditions: SimulatedConditions,
    rng: SystemRandom,
    shut_down: bool,
}

impl LoopbackTransport {
    fn take_inbox(&mut self) {
        let now = Instant::now();
        let mut state = self.network.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.addr) {
            endpoint.release_due(now);
            endpoint.reported_tokens.trim(now);
            self.ready.extend(endpoint.inbox.drain(..));
        }
    }

    fn connected_link(&self, connection: ConnectionHandle) -> Result<(SocketAddr, ConnectionHandle), TransportError> {
        let state = self.network.lock();
        let endpoint = state.endpoints.get(&self.addr).ok_or(TransportError::ShutDown)?;
        let link = endpoint
            .links
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if link.state != LinkState::Connected {
            return Err(TransportError::NotConnected(connection));
        }
        Ok((link.remote, link.remote_handle))
    }

    /// Resolve a broadcast or unspecified address to the endpoint on its port
    fn discovery_target(addr: SocketAddr) -> SocketAddr {
        match addr.ip() {
            IpAddr::V4(ip) if ip.is_broadcast() || ip.is_unspecified() => SocketAddr::new(LOOPBACK_IP, addr.port()),
            _ => addr,
        }
    }
}

impl Transport for LoopbackTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn internal_addr(&self) -> SocketAddr {
        self.addr
    }

    fn accepts_incoming(&self) -> bool {
        let state = self.network.lock();
        state
            .endpoints
            .get(&self.addr)
            .is_some_and(|endpoint| endpoint.accepts_incoming)
    }

    fn pump(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.take_inbox();
            if !self.ready.is_empty() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    std::thread::sleep(WAIT_STEP.min(deadline - now));
                }
                None => std::thread::sleep(WAIT_STEP),
            }
        }
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.ready.pop_front()
    }

    fn connect(&mut self, addr: SocketAddr, hail: &[u8]) -> Result<ConnectionHandle, TransportError> {
        let local_addr = self.addr;
        let mut state = self.network.lock();

        let handle = state
            .endpoints
            .get_mut(&local_addr)
            .ok_or(TransportError::ShutDown)?
            .allocate_handle();

        let remote_handle = match state.endpoints.get_mut(&addr) {
            Some(remote) if !remote.accepts_incoming => {
                log::debug!("Loopback {} refused connection from {}", addr, local_addr);
                None
            }
            Some(remote) => {
                let remote_handle = remote.allocate_handle();
                remote.links.insert(
                    remote_handle,
                    Link {
                        remote: local_addr,
                        remote_handle: handle,
                        state: LinkState::AwaitingApproval,
                        remote_hail: hail.to_vec(),
                    },
                );
                remote.record_received(hail.len());
                remote.inbox.push_back(TransportEvent::ConnectionApproval {
                    connection: remote_handle,
                    hail: hail.to_vec(),
                });
                Some(remote_handle)
            }
            None => None,
        };

        let local = state.endpoints.get_mut(&local_addr).ok_or(TransportError::ShutDown)?;
        match remote_handle {
            Some(remote_handle) => {
                local.record_sent(hail.len());
                local.links.insert(
                    handle,
                    Link {
                        remote: addr,
                        remote_handle,
                        state: LinkState::Connecting,
                        remote_hail: Vec::new(),
                    },
                );
                log::debug!("Loopback {} connecting to {} ({})", local_addr, addr, handle);
            }
            None => self.ready.push_back(TransportEvent::StatusChanged {
                connection: handle,
                status: ConnectionStatus::Disconnected,
                reason: "no endpoint accepting connections at remote address".to_string(),
            }),
        }

        Ok(handle)
    }

    fn connection_to(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        let state = self.network.lock();
        state
            .endpoints
            .get(&self.addr)?
            .links
            .iter()
            .find(|(_, link)| link.remote == addr)
            .map(|(handle, _)| *handle)
    }

    fn approve(&mut self, connection: ConnectionHandle, hail: &[u8]) -> Result<(), TransportError> {
        let local_addr = self.addr;
        let mut state = self.network.lock();

        let local = state.endpoints.get_mut(&local_addr).ok_or(TransportError::ShutDown)?;
        let link = local
            .links
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if link.state != LinkState::AwaitingApproval {
            return Err(TransportError::NotConnected(connection));
        }
        link.state = LinkState::Connected;
        let (remote, remote_handle) = (link.remote, link.remote_handle);
        let client_hail = std::mem::take(&mut link.remote_hail);
        local.record_sent(hail.len());

        let remote_up = match state.endpoints.get_mut(&remote) {
            Some(endpoint) => match endpoint.links.get_mut(&remote_handle) {
                Some(remote_link) => {
                    remote_link.state = LinkState::Connected;
                    endpoint.record_received(hail.len());
                    endpoint.status_changed(
                        remote_handle,
                        ConnectionStatus::Connected {
                            remote_hail: hail.to_vec(),
                        },
                        "approved",
                    );
                    true
                }
                None => false,
            },
            None => false,
        };

        let (status, reason) = if remote_up {
            (
                ConnectionStatus::Connected {
                    remote_hail: client_hail,
                },
                "approved",
            )
        } else {
            if let Some(local) = state.endpoints.get_mut(&local_addr) {
                local.links.remove(&connection);
            }
            (ConnectionStatus::Disconnected, "remote endpoint went away")
        };
        self.ready.push_back(TransportEvent::StatusChanged {
            connection,
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn deny(&mut self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let local = state.endpoints.get_mut(&self.addr).ok_or(TransportError::ShutDown)?;
        let link = local
            .links
            .remove(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        state.sever_remote(link.remote, link.remote_handle, reason);
        self.ready.push_back(TransportEvent::StatusChanged {
            connection,
            status: ConnectionStatus::Disconnected,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        reliability: Reliability,
        _channel: u8,
    ) -> Result<(), TransportError> {
        let (remote, remote_handle) = self.connected_link(connection)?;
        let dropped = reliability == Reliability::UnreliableSequenced && self.conditions.drops(&self.rng);
        let delay = self.conditions.delay(&self.rng);
        let mut state = self.network.lock();

        if let Some(local) = state.endpoints.get_mut(&self.addr) {
            local.record_sent(payload.len());
        }
        if dropped {
            log::trace!("Loopback {}: simulated loss on {}", self.addr, connection);
            return Ok(());
        }
        if let Some(endpoint) = state.endpoints.get_mut(&remote) {
            endpoint.record_received(payload.len());
            endpoint.deliver_after(
                delay,
                TransportEvent::Data {
                    connection: remote_handle,
                    payload: payload.to_vec(),
                },
            );
        }
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionHandle, reason: &str) {
        let mut state = self.network.lock();
        let Some(local) = state.endpoints.get_mut(&self.addr) else {
            return;
        };
        if let Some(link) = local.links.remove(&connection) {
            state.sever_remote(link.remote, link.remote_handle, reason);
            self.ready.push_back(TransportEvent::StatusChanged {
                connection,
                status: ConnectionStatus::Disconnected,
                reason: reason.to_string(),
            });
        }
    }

    fn send_unconnected(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        let event = TransportEvent::UnconnectedData {
            from: self.addr,
            payload: payload.to_vec(),
        };
        self.network
            .lock()
            .deliver_unconnected(self.addr, addr, payload.len(), event);
        Ok(())
    }

    fn discover(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let target = Self::discovery_target(addr);
        let mut state = self.network.lock();
        let app_id = state
            .endpoints
            .get(&self.addr)
            .ok_or(TransportError::ShutDown)?
            .app_id
            .clone();

        if target == self.addr {
            return Ok(());
        }
        let same_app = state.endpoints.get(&target).map(|e| e.app_id == app_id);
        if same_app == Some(true) {
            state.deliver_unconnected(self.addr, target, 0, TransportEvent::DiscoveryRequest { from: self.addr });
        } else {
            log::trace!("Loopback: no matching endpoint for discovery at {}", target);
        }
        Ok(())
    }

    fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        let event = TransportEvent::DiscoveryResponse {
            from: self.addr,
            payload: payload.to_vec(),
        };
        self.network
            .lock()
            .deliver_unconnected(self.addr, addr, payload.len(), event);
        Ok(())
    }

    fn introduce(
        &mut self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.network.lock();

        let host = [host_internal, host_external]
            .into_iter()
            .find(|addr| state.endpoints.contains_key(addr));
        let client = [client_internal, client_external]
            .into_iter()
            .find(|addr| state.endpoints.contains_key(addr));

        let (Some(host), Some(client)) = (host, client) else {
            log::debug!(
                "Loopback: introduction of {} and {} found no endpoint",
                host_external,
                client_external
            );
            return Ok(());
        };

        if let Some(endpoint) = state.endpoints.get_mut(&client) {
            if endpoint.reported_tokens.first_report(token, Instant::now()) {
                endpoint.inbox.push_back(TransportEvent::NatIntroductionSuccess {
                    from: host,
                    token: token.to_string(),
                });
            }
        }
        Ok(())
    }

    fn round_trip_time(&self, connection: ConnectionHandle) -> Option<Duration> {
        self.connected_link(connection).ok().map(|_| Duration::ZERO)
    }

    fn statistics(&self) -> TransportStats {
        let state = self.network.lock();
        state
            .endpoints
            .get(&self.addr)
            .map(|endpoint| endpoint.stats)
            .unwrap_or_default()
    }

    fn set_simulated_conditions(&mut self, conditions: SimulatedConditions) {
        log::debug!("Loopback {}: simulated conditions {:?}", self.addr, conditions);
        self.conditions = conditions;
    }

    fn shutdown(&mut self, reason: &str) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let mut state = self.network.lock();
        if let Some(endpoint) = state.endpoints.remove(&self.addr) {
            for link in endpoint.links.into_values() {
                state.sever_remote(link.remote, link.remote_handle, reason);
            }
        }
        log::debug!("Loopback endpoint {} shut down: {}", self.addr, reason);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shutdown("endpoint dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(transport: &mut LoopbackTransport) -> Vec<TransportEvent> {
        transport.pump(Some(Duration::ZERO)).unwrap();
        std::iter::from_fn(|| transport.next_event()).collect()
    }

    #[test]
    fn test_bind_conflict_and_ephemeral_ports() {
        let network = LoopbackNetwork::new();
        let _a = network.bind(4000, "app").unwrap();
        assert!(matches!(network.bind(4000, "app"), Err(TransportError::Bind { .. })));

        let b = network.bind(0, "app").unwrap();
        let c = network.bind(0, "app").unwrap();
        assert_ne!(b.local_addr(), c.local_addr());
        assert!(b.local_addr().port() >= EPHEMERAL_PORT_START);
        assert_eq!(network.endpoint_count(), 3);
    }

    #[test]
    fn test_connect_approve_send_disconnect() {
        let network = LoopbackNetwork::new();
        let mut host = network.bind(5000, "app").unwrap();
        let mut client = network.bind(0, "app").unwrap();

        let client_conn = client.connect(host.local_addr(), b"client-hail").unwrap();
        let events = drain(&mut host);
        let host_conn = match &events[..] {
            [TransportEvent::ConnectionApproval { connection, hail }] => {
                assert_eq!(hail, b"client-hail");
                *connection
            }
            other => panic!("unexpected events {:?}", other),
        };
        assert!(matches!(
            client.send(client_conn, b"early", Reliability::ReliableOrdered, 0),
            Err(TransportError::NotConnected(_))
        ));

        host.approve(host_conn, b"host-hail").unwrap();
        assert_eq!(
            drain(&mut host),
            vec![TransportEvent::StatusChanged {
                connection: host_conn,
                status: ConnectionStatus::Connected {
                    remote_hail: b"client-hail".to_vec()
                },
                reason: "approved".into(),
            }]
        );
        assert!(matches!(
            &drain(&mut client)[..],
            [TransportEvent::StatusChanged { status: ConnectionStatus::Connected { remote_hail }, .. }]
                if remote_hail == b"host-hail"
        ));

        client
            .send(client_conn, b"hello", Reliability::ReliableOrdered, 1)
            .unwrap();
        assert_eq!(
            drain(&mut host),
            vec![TransportEvent::Data {
                connection: host_conn,
                payload: b"hello".to_vec()
            }]
        );
        assert_eq!(client.connection_to(host.local_addr()), Some(client_conn));

        client.disconnect(client_conn, "bye");
        assert!(matches!(
            &drain(&mut host)[..],
            [TransportEvent::StatusChanged { status: ConnectionStatus::Disconnected, reason, .. }] if reason == "bye"
        ));
        assert_eq!(client.connection_to(host.local_addr()), None);
    }

    #[test]
    fn test_connect_to_nothing_reports_disconnect() {
        let network = LoopbackNetwork::new();
        let mut client = network.bind(0, "app").unwrap();
        let conn = client.connect("127.0.0.1:1".parse().unwrap(), b"hail").unwrap();
        assert!(matches!(
            &drain(&mut client)[..],
            [TransportEvent::StatusChanged { connection, status: ConnectionStatus::Disconnected, .. }] if *connection == conn
        ));
    }

    #[test]
    fn test_deny_reaches_client_with_reason() {
        let network = LoopbackNetwork::new();
        let mut host = network.bind(5001, "app").unwrap();
        let mut client = network.bind(0, "app").unwrap();

        client.connect(host.local_addr(), b"hail").unwrap();
        let host_conn = match drain(&mut host).pop() {
            Some(TransportEvent::ConnectionApproval { connection, .. }) => connection,
            other => panic!("unexpected {:?}", other),
        };
        host.deny(host_conn, "Connection denied").unwrap();
        assert!(matches!(
            &drain(&mut client)[..],
            [TransportEvent::StatusChanged { status: ConnectionStatus::Disconnected, reason, .. }]
                if reason == "Connection denied"
        ));
    }

    #[test]
    fn test_broadcast_discovery_filters_app_id() {
        let network = LoopbackNetwork::new();
        let mut host = network.bind(6000, "tanks").unwrap();
        let mut other = network.bind(6001, "racing").unwrap();
        let mut seeker = network.bind(0, "tanks").unwrap();

        seeker.discover("255.255.255.255:6000".parse().unwrap()).unwrap();
        seeker.discover("255.255.255.255:6001".parse().unwrap()).unwrap();
        assert_eq!(
            drain(&mut host),
            vec![TransportEvent::DiscoveryRequest {
                from: seeker.local_addr()
            }]
        );
        assert!(drain(&mut other).is_empty());

        host.send_discovery_response(seeker.local_addr(), b"info").unwrap();
        assert_eq!(
            drain(&mut seeker),
            vec![TransportEvent::DiscoveryResponse {
                from: host.local_addr(),
                payload: b"info".to_vec()
            }]
        );
    }

    #[test]
    fn test_introduction_reported_once_per_token() {
        let network = LoopbackNetwork::new();
        let mut mediator = network.bind(0, "app").unwrap();
        let host = network.bind(7000, "app").unwrap();
        let mut client = network.bind(7001, "app").unwrap();

        for _ in 0..2 {
            mediator
                .introduce(
                    host.local_addr(),
                    host.local_addr(),
                    client.local_addr(),
                    client.local_addr(),
                    "token-1",
                )
                .unwrap();
        }
        assert_eq!(
            drain(&mut client),
            vec![TransportEvent::NatIntroductionSuccess {
                from: host.local_addr(),
                token: "token-1".into()
            }]
        );
    }

    #[test]
    fn test_outgoing_only_endpoint_refuses_connections() {
        let network = LoopbackNetwork::new();
        let mut closed = network.bind_outgoing_only(5100, "app").unwrap();
        let mut open = network.bind(5101, "app").unwrap();
        assert!(!closed.accepts_incoming());
        assert!(open.accepts_incoming());

        let conn = open.connect(closed.local_addr(), b"hail").unwrap();
        assert!(matches!(
            &drain(&mut open)[..],
            [TransportEvent::StatusChanged { connection, status: ConnectionStatus::Disconnected, .. }] if *connection == conn
        ));
        assert!(drain(&mut closed).is_empty());

        closed.connect(open.local_addr(), b"hail").unwrap();
        assert!(matches!(
            &drain(&mut open)[..],
            [TransportEvent::ConnectionApproval { .. }]
        ));
    }

    /// Connected pair: (host, host side handle, client, client side handle)
    fn connected_pair(
        network: &LoopbackNetwork,
        port: u16,
    ) -> (LoopbackTransport, ConnectionHandle, LoopbackTransport, ConnectionHandle) {
        let mut host = network.bind(port, "app").unwrap();
        let mut client = network.bind(0, "app").unwrap();
        let client_conn = client.connect(host.local_addr(), b"hail").unwrap();
        let host_conn = match drain(&mut host).pop() {
            Some(TransportEvent::ConnectionApproval { connection, .. }) => connection,
            other => panic!("unexpected {:?}", other),
        };
        host.approve(host_conn, b"reply").unwrap();
        drain(&mut host);
        drain(&mut client);
        (host, host_conn, client, client_conn)
    }

    #[test]
    fn test_full_simulated_loss_drops_only_unreliable() {
        let network = LoopbackNetwork::new();
        let (mut host, host_conn, mut client, client_conn) = connected_pair(&network, 5200);
        client.set_simulated_conditions(SimulatedConditions {
            latency: Duration::ZERO,
            loss: 1.0,
        });

        for _ in 0..10 {
            client
                .send(client_conn, b"lossy", Reliability::UnreliableSequenced, 0)
                .unwrap();
        }
        client
            .send(client_conn, b"kept", Reliability::ReliableOrdered, 0)
            .unwrap();
        assert_eq!(
            drain(&mut host),
            vec![TransportEvent::Data {
                connection: host_conn,
                payload: b"kept".to_vec()
            }]
        );
        assert_eq!(client.statistics().packets_sent, 12);
    }

    #[test]
    fn test_simulated_latency_delays_in_send_order() {
        let network = LoopbackNetwork::new();
        let (mut host, _, mut client, client_conn) = connected_pair(&network, 5300);
        client.set_simulated_conditions(SimulatedConditions {
            latency: Duration::from_millis(30),
            loss: 0.0,
        });

        for payload in [b"one", b"two", b"six"] {
            client
                .send(client_conn, payload, Reliability::ReliableOrdered, 0)
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 3 && Instant::now() < deadline {
            host.pump(Some(Duration::from_millis(5))).unwrap();
            received.extend(std::iter::from_fn(|| host.next_event()).filter_map(|event| match event {
                TransportEvent::Data { payload, .. } => Some(payload),
                _ => None,
            }));
        }
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"six".to_vec()]);
    }

    #[test]
    fn test_shutdown_disconnects_peers_and_unbinds() {
        let network = LoopbackNetwork::new();
        let mut host = network.bind(8000, "app").unwrap();
        let mut client = network.bind(0, "app").unwrap();
        client.connect(host.local_addr(), b"hail").unwrap();
        drain(&mut host);

        host.shutdown("closing");
        host.shutdown("closing");
        assert!(matches!(
            &drain(&mut client)[..],
            [TransportEvent::StatusChanged { status: ConnectionStatus::Disconnected, .. }]
        ));
        assert_eq!(network.endpoint_count(), 1);
        assert!(matches!(host.pump(Some(Duration::ZERO)), Err(TransportError::ShutDown)));
    }

    #[test]
    fn test_statistics_count_both_ends() {
        let network = LoopbackNetwork::new();
        let mut a = network.bind(0, "app").unwrap();
        let b = network.bind(0, "app").unwrap();
        a.send_unconnected(b.local_addr(), &[0u8; 10]).unwrap();
        assert_eq!(a.statistics().bytes_sent, 10);
        assert_eq!(b.statistics().bytes_received, 10);
        assert_eq!(b.statistics().packets_received, 1);
    }
}
