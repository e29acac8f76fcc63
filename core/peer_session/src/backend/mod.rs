//! Peer backend
//!
//! Owns the local transport endpoint, the registry of connected remote peers
//! and the message pools. The session layer drives it with one [`Backend::poll`]
//! per tick and hears about everything through a [`SessionListener`].
//!
//! # Event handling
//!
//! ```text
//! DiscoveryRequest        → reply (identity, public info) if discoverable locally
//! NatIntroductionSuccess  → parse token, ask listener, try_connect(punched addr)
//! ConnectionApproval      → parse client hail, ask listener, approve or deny
//! Connected               → parse remote hail, register RemotePeer, peer_connected
//! Disconnected            → deregister RemotePeer (unknown handles ignored)
//! Data                    → pooled IncomingMessage → receive_message
//! Diagnostic              → log
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::discovery::{self, AvailableHost, DiscoveryTarget};
use crate::hail::{ClientHail, HostHail, RemoteHail};
use crate::identity::PeerId;
use crate::master::{HostListing, MasterMessage};
use crate::session::SessionSearch;
use crate::settings::NetworkSettings;
use crate::token::IntroductionToken;
use crate::transport::{
    ConnectionHandle, ConnectionStatus, Reliability, SimulatedConditions, Transport, TransportError, TransportEvent,
};
use crate::wire::WireError;

mod message;
mod peer;
mod stats;

pub use message::{IncomingMessage, OutgoingMessage, Recipient};
pub use peer::{LocalPeer, Peer, PeerMut, RemotePeer};
pub use stats::ThroughputSampler;

/// Reason given to clients the listener refuses
pub const DENY_REASON: &str = "Connection denied";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode: {0}")]
    Encode(#[from] WireError),
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("no master server endpoint: {0}")]
    MasterServer(String),
}

/// Callbacks from the backend into the session layer
pub trait SessionListener {
    fn is_discoverable_locally(&self) -> bool;

    fn is_discoverable_online(&self) -> bool;

    /// Opaque blob advertised through discovery and the master server
    fn session_public_info(&self) -> Vec<u8>;

    fn allow_connection_to_host_as_client(&mut self, host: PeerId) -> bool;

    fn allow_connection_from_client(&mut self, client: PeerId) -> bool;

    fn peer_connected(&mut self, peer: &RemotePeer);

    fn peer_disconnected(&mut self, peer: &RemotePeer);

    fn receive_message(&mut self, sender: PeerId, message: &IncomingMessage);

    /// Checked after every event; a reason stops the current poll and shuts
    /// the backend down
    fn take_shutdown_request(&mut self) -> Option<String> {
        None
    }
}

pub struct Backend {
    local: LocalPeer,
    remotes: Vec<RemotePeer>,
    /// Connection handle → peer identity
    peers_by_connection: HashMap<ConnectionHandle, PeerId>,
    settings: NetworkSettings,
    last_registration: Option<Instant>,
    registered_online: bool,
    throughput: ThroughputSampler,
}

impl Backend {
    pub fn new(mut transport: Box<dyn Transport>, settings: NetworkSettings) -> Result<Self, BackendError> {
        let identity = PeerId::generate().map_err(|_| TransportError::Random)?;
        log::info!(
            "Local peer {} on {} (internal {})",
            identity,
            transport.local_addr(),
            transport.internal_addr()
        );

        let conditions = settings.simulated_conditions();
        if !conditions.is_ideal() {
            log::warn!("Simulating network conditions: {:?}", conditions);
            transport.set_simulated_conditions(conditions);
        }

        Ok(Backend {
            local: LocalPeer::new(identity, transport),
            remotes: Vec::new(),
            peers_by_connection: HashMap::new(),
            settings,
            last_registration: None,
            registered_online: false,
            throughput: ThroughputSampler::new(Instant::now()),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn local_identity(&self) -> PeerId {
        self.local.identity
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Remote peers connected right now
    pub fn connected_peers(&self) -> &[RemotePeer] {
        &self.remotes
    }

    pub fn has_shutdown(&self) -> bool {
        self.local.has_shutdown
    }

    pub fn is_connected_to(&self, identity: PeerId) -> bool {
        self.find_remote_peer(identity).is_some()
    }

    pub fn find_remote_peer(&self, identity: PeerId) -> Option<&RemotePeer> {
        self.remotes.iter().find(|r| r.identity == identity)
    }

    pub fn peer(&self, identity: PeerId) -> Option<Peer<'_>> {
        if identity == self.local.identity {
            return Some(Peer::Local(&self.local));
        }
        self.find_remote_peer(identity)
            .map(|remote| Peer::Remote(remote, &self.local))
    }

    pub fn peer_mut(&mut self, identity: PeerId) -> Option<PeerMut<'_>> {
        if identity != self.local.identity && !self.is_connected_to(identity) {
            return None;
        }
        Some(PeerMut {
            backend: self,
            identity,
        })
    }

    /// Zero for the local peer; the transport's estimate for remote peers
    pub fn round_trip_time(&self, identity: PeerId) -> Option<Duration> {
        self.peer(identity)?.round_trip_time()
    }

    /// Whether other peers can connect in. Every session member needs this.
    pub fn accepts_incoming(&self) -> bool {
        self.local.transport.accepts_incoming()
    }

    /// Change simulated latency and loss on later sends
    pub fn set_simulated_conditions(&mut self, conditions: SimulatedConditions) {
        self.settings.simulated_latency_ms = conditions.latency.as_millis() as u64;
        self.settings.simulated_loss = conditions.loss;
        self.local.transport.set_simulated_conditions(conditions);
    }

    pub fn simulated_conditions(&self) -> SimulatedConditions {
        self.settings.simulated_conditions()
    }

    pub fn bytes_per_second_sent(&self) -> u64 {
        self.throughput.bytes_per_second_sent()
    }

    pub fn bytes_per_second_received(&self) -> u64 {
        self.throughput.bytes_per_second_received()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Take a buffer from the outgoing pool, addressed and classed
    pub fn acquire_message(&mut self, recipient: Recipient, reliability: Reliability, channel: u8) -> OutgoingMessage {
        let mut message = self.local.outgoing.acquire();
        message.recipient = recipient;
        message.reliability = reliability;
        message.channel = channel;
        message
    }

    /// Transmit and return the buffer to the outgoing pool. Per-peer
    /// failures are logged; an empty recipient set sends nothing.
    pub fn send(&mut self, message: OutgoingMessage) {
        match &message.recipient {
            Recipient::Broadcast => {
                for remote in &self.remotes {
                    Self::send_one(&mut self.local, remote, &message);
                }
            }
            Recipient::Peer(identity) => self.send_to_identity(*identity, &message),
            Recipient::Group(identities) => {
                for identity in identities {
                    self.send_to_identity(*identity, &message);
                }
            }
        }
        self.local.outgoing.release(message);
    }

    /// Copy `payload` into a pooled message and send it
    pub fn send_to(&mut self, recipient: Recipient, payload: &[u8], reliability: Reliability, channel: u8) {
        let mut message = self.acquire_message(recipient, reliability, channel);
        message.data.extend_from_slice(payload);
        self.send(message);
    }

    fn send_to_identity(&mut self, identity: PeerId, message: &OutgoingMessage) {
        match self.remotes.iter().find(|r| r.identity == identity) {
            Some(remote) => Self::send_one(&mut self.local, remote, message),
            None => log::debug!("Not connected to {}, message dropped", identity),
        }
    }

    fn send_one(local: &mut LocalPeer, remote: &RemotePeer, message: &OutgoingMessage) {
        if let Err(e) = local
            .transport
            .send(remote.connection, &message.data, message.reliability, message.channel)
        {
            log::debug!("Send to {} failed: {}", remote.identity, e);
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to a host. A no-op when a connection to `address` exists.
    pub fn try_connect(
        &mut self,
        address: SocketAddr,
        host_external: SocketAddr,
        observed_external: SocketAddr,
    ) -> Result<(), BackendError> {
        if let Some(existing) = self.local.transport.connection_to(address) {
            log::debug!("Already connected to {} ({})", address, existing);
            return Ok(());
        }

        let hail = ClientHail {
            identity: self.local.identity,
            internal: self.local.transport.internal_addr(),
            external: observed_external,
            host_external,
        };
        let connection = self.local.transport.connect(address, &hail.encode()?)?;
        log::info!("Connecting to host at {} ({})", address, connection);
        Ok(())
    }

    /// Mediate a NAT introduction between two connected peers; `client`
    /// ends up connecting to `host`
    pub fn introduce(&mut self, client: PeerId, host: PeerId) -> Result<(), BackendError> {
        let client = self
            .find_remote_peer(client)
            .cloned()
            .ok_or(BackendError::UnknownPeer(client))?;
        let host = self
            .find_remote_peer(host)
            .cloned()
            .ok_or(BackendError::UnknownPeer(host))?;

        let token = IntroductionToken::new(host.identity, host.external, client.external);
        self.local.transport.introduce(
            host.internal,
            host.external,
            client.internal,
            client.external,
            &token.serialize(),
        )?;
        log::info!("Introduced {} to host {}", client.identity, host.identity);
        Ok(())
    }

    /// Drop the connection to a remote peer. The peer is deregistered when
    /// the transport reports the disconnect.
    pub fn disconnect_peer(&mut self, identity: PeerId, reason: &str) {
        match self.remotes.iter().find(|r| r.identity == identity) {
            Some(remote) => self.local.transport.disconnect(remote.connection, reason),
            None => log::debug!("Disconnect of unknown peer {} ignored", identity),
        }
    }

    // ========================================================================
    // Master server
    // ========================================================================

    fn master_endpoint(&self) -> Result<SocketAddr, BackendError> {
        self.settings
            .master_server_endpoint()
            .map_err(|e| BackendError::MasterServer(e.to_string()))
    }

    fn send_master(&mut self, message: &MasterMessage) -> Result<(), BackendError> {
        let endpoint = self.master_endpoint()?;
        let bytes = message.encode(&self.settings.game_app_id)?;
        self.local.transport.send_unconnected(endpoint, &bytes)?;
        Ok(())
    }

    pub fn register_with_master_server(&mut self, public_info: Vec<u8>) -> Result<(), BackendError> {
        let message = MasterMessage::RegisterHost {
            identity: self.local.identity,
            internal: self.local.transport.internal_addr(),
            public_info,
        };
        self.send_master(&message)?;
        self.registered_online = true;
        log::debug!("Registered with master server");
        Ok(())
    }

    pub fn unregister_with_master_server(&mut self) -> Result<(), BackendError> {
        let message = MasterMessage::UnregisterHost {
            identity: self.local.identity,
        };
        self.send_master(&message)?;
        self.registered_online = false;
        log::debug!("Unregistered from master server");
        Ok(())
    }

    /// Ask the master server to introduce us to `host`
    pub fn request_introduction(&mut self, host: PeerId) -> Result<(), BackendError> {
        let message = MasterMessage::RequestIntroduction {
            host,
            client_internal: self.local.transport.internal_addr(),
        };
        self.send_master(&message)?;
        log::info!("Requested introduction to {}", host);
        Ok(())
    }

    /// Blocking host search over this backend's endpoint
    pub fn find_hosts(
        &mut self,
        target: DiscoveryTarget,
        search: Option<&SessionSearch>,
    ) -> Result<Vec<AvailableHost>, BackendError> {
        let window = self.settings.discovery_window();
        let app_id = self.settings.game_app_id.clone();
        Ok(discovery::find_hosts(
            self.local.transport.as_mut(),
            &target,
            &app_id,
            window,
            search,
        )?)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Drain every pending transport event, then run housekeeping. Never
    /// blocks.
    pub fn poll(&mut self, listener: &mut dyn SessionListener) -> Result<(), BackendError> {
        if self.local.has_shutdown {
            return Ok(());
        }

        self.local.transport.pump(Some(Duration::ZERO))?;

        while let Some(event) = self.local.transport.next_event() {
            self.handle_event(event, listener);

            if let Some(reason) = listener.take_shutdown_request() {
                self.shutdown(&reason);
            }
            if self.local.has_shutdown {
                return Ok(());
            }
        }

        self.update_master_server_registration(listener, Instant::now());
        self.update_statistics(Instant::now());
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent, listener: &mut dyn SessionListener) {
        match event {
            TransportEvent::DiscoveryRequest { from } => self.on_discovery_request(from, listener),
            TransportEvent::DiscoveryResponse { from, .. } => {
                log::debug!("Discovery response from {} outside a search ignored", from);
            }
            TransportEvent::UnconnectedData { from, payload } => {
                log::debug!("Unconnected data ({} bytes) from {} ignored", payload.len(), from);
            }
            TransportEvent::NatIntroductionSuccess { from, token } => {
                self.on_nat_introduction_success(from, &token, listener)
            }
            TransportEvent::ConnectionApproval { connection, hail } => {
                self.on_connection_approval(connection, &hail, listener)
            }
            TransportEvent::StatusChanged {
                connection,
                status: ConnectionStatus::Connected { remote_hail },
                ..
            } => self.on_connected(connection, &remote_hail, listener),
            TransportEvent::StatusChanged {
                connection,
                status: ConnectionStatus::Disconnected,
                reason,
            } => self.on_disconnected(connection, &reason, listener),
            TransportEvent::Data { connection, payload } => self.on_data(connection, payload, listener),
            TransportEvent::Diagnostic { level, message } => {
                log::log!(level, "Transport: {}", message);
            }
        }
    }

    fn on_discovery_request(&mut self, from: SocketAddr, listener: &mut dyn SessionListener) {
        if !listener.is_discoverable_locally() {
            return;
        }
        let listing = HostListing {
            identity: self.local.identity,
            public_info: listener.session_public_info(),
        };
        let result = listing
            .encode()
            .map_err(BackendError::from)
            .and_then(|bytes| Ok(self.local.transport.send_discovery_response(from, &bytes)?));
        match result {
            Ok(()) => log::debug!("Answered discovery request from {}", from),
            Err(e) => log::debug!("Discovery response to {} failed: {}", from, e),
        }
    }

    fn on_nat_introduction_success(&mut self, from: SocketAddr, token: &str, listener: &mut dyn SessionListener) {
        let Some(token) = IntroductionToken::parse(token) else {
            log::debug!("Malformed introduction token from {}: '{}'", from, token);
            return;
        };
        log::info!("NAT introduction to {} succeeded at {}", token.host, from);

        if !listener.allow_connection_to_host_as_client(token.host) {
            log::info!("Connection to host {} not allowed", token.host);
            return;
        }
        if let Err(e) = self.try_connect(from, token.host_external, token.client_external) {
            log::warn!("Connection to introduced host {} failed: {}", token.host, e);
        }
    }

    fn on_connection_approval(
        &mut self,
        connection: ConnectionHandle,
        hail: &[u8],
        listener: &mut dyn SessionListener,
    ) {
        let hail = match ClientHail::decode(hail) {
            Ok(hail) => hail,
            Err(e) => {
                log::debug!("Malformed hail on {}: {}", connection, e);
                self.deny(connection, DENY_REASON);
                return;
            }
        };

        if !listener.allow_connection_from_client(hail.identity) {
            log::info!("Connection from {} denied", hail.identity);
            self.deny(connection, DENY_REASON);
            return;
        }

        let reply = HostHail {
            identity: self.local.identity,
            internal: self.local.transport.internal_addr(),
            external: hail.host_external,
        };
        let result = reply
            .encode()
            .map_err(BackendError::from)
            .and_then(|bytes| Ok(self.local.transport.approve(connection, &bytes)?));
        match result {
            Ok(()) => log::info!("Approved connection from {}", hail.identity),
            Err(e) => log::warn!("Approval of {} failed: {}", hail.identity, e),
        }
    }

    fn deny(&mut self, connection: ConnectionHandle, reason: &str) {
        if let Err(e) = self.local.transport.deny(connection, reason) {
            log::debug!("Deny of {} failed: {}", connection, e);
        }
    }

    fn on_connected(&mut self, connection: ConnectionHandle, remote_hail: &[u8], listener: &mut dyn SessionListener) {
        let hail = match RemoteHail::decode(remote_hail) {
            Ok(hail) => hail,
            Err(e) => {
                log::debug!("Malformed remote hail on {}: {}", connection, e);
                self.local.transport.disconnect(connection, "malformed hail");
                return;
            }
        };

        if self.is_connected_to(hail.identity) {
            log::warn!("Duplicate connection from {} closed", hail.identity);
            self.local.transport.disconnect(connection, "duplicate connection");
            return;
        }

        let remote = RemotePeer {
            identity: hail.identity,
            internal: hail.internal,
            external: hail.external,
            connection,
        };
        log::info!(
            "Peer {} connected (internal {}, external {})",
            remote.identity,
            remote.internal,
            remote.external
        );
        self.peers_by_connection.insert(connection, remote.identity);
        self.remotes.push(remote.clone());
        listener.peer_connected(&remote);
    }

    fn on_disconnected(&mut self, connection: ConnectionHandle, reason: &str, listener: &mut dyn SessionListener) {
        let Some(identity) = self.peers_by_connection.remove(&connection) else {
            log::trace!("Disconnect of {} with no peer ignored ({})", connection, reason);
            return;
        };
        let Some(index) = self.remotes.iter().position(|r| r.identity == identity) else {
            return;
        };
        let remote = self.remotes.remove(index);
        log::info!("Peer {} disconnected: {}", remote.identity, reason);
        listener.peer_disconnected(&remote);
    }

    fn on_data(&mut self, connection: ConnectionHandle, payload: Vec<u8>, listener: &mut dyn SessionListener) {
        let Some(sender) = self.peers_by_connection.get(&connection).copied() else {
            log::debug!("Data from unknown connection {} dropped", connection);
            return;
        };

        let mut message = self.local.incoming.acquire();
        message.data.extend_from_slice(&payload);
        listener.receive_message(sender, &message);
        self.local.incoming.release(message);
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Re-register with the master server every registration interval while
    /// the session is discoverable online
    pub fn update_master_server_registration(&mut self, listener: &dyn SessionListener, now: Instant) {
        if !listener.is_discoverable_online() {
            return;
        }
        let due = match self.last_registration {
            Some(last) => now.saturating_duration_since(last) >= self.settings.registration_interval(),
            None => true,
        };
        if !due {
            return;
        }

        self.last_registration = Some(now);
        if let Err(e) = self.register_with_master_server(listener.session_public_info()) {
            log::warn!("Master server registration failed: {}", e);
        }
    }

    pub fn update_statistics(&mut self, now: Instant) {
        let stats = self.local.transport.statistics();
        if self.throughput.sample(now, &stats) {
            log::trace!(
                "Throughput: {} B/s sent, {} B/s received",
                self.throughput.bytes_per_second_sent(),
                self.throughput.bytes_per_second_received()
            );
        }
    }

    /// Shut down the local peer. Idempotent. Unregistering from the master
    /// server is best-effort and only attempted after a registration.
    pub fn shutdown(&mut self, reason: &str) {
        if self.local.has_shutdown {
            return;
        }
        self.local.has_shutdown = true;

        if self.registered_online {
            if let Err(e) = self.unregister_with_master_server() {
                log::debug!("Master server unregistration failed: {}", e);
            }
        }

        self.local.transport.shutdown(reason);
        self.remotes.clear();
        self.peers_by_connection.clear();
        log::info!("Local peer {} shut down: {}", self.local.identity, reason);
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shutdown("backend dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;

    #[derive(Default)]
    struct RecordingListener {
        discoverable: bool,
        online: bool,
        refuse_clients: bool,
        connected: Vec<PeerId>,
        disconnected: Vec<PeerId>,
        received: Vec<(PeerId, Vec<u8>)>,
        shutdown_after_message: bool,
        shutdown_request: Option<String>,
    }

    impl SessionListener for RecordingListener {
        fn is_discoverable_locally(&self) -> bool {
            self.discoverable
        }

        fn is_discoverable_online(&self) -> bool {
            self.online
        }

        fn session_public_info(&self) -> Vec<u8> {
            b"info".to_vec()
        }

        fn allow_connection_to_host_as_client(&mut self, _host: PeerId) -> bool {
            true
        }

        fn allow_connection_from_client(&mut self, _client: PeerId) -> bool {
            !self.refuse_clients
        }

        fn peer_connected(&mut self, peer: &RemotePeer) {
            self.connected.push(peer.identity);
        }

        fn peer_disconnected(&mut self, peer: &RemotePeer) {
            self.disconnected.push(peer.identity);
        }

        fn receive_message(&mut self, sender: PeerId, message: &IncomingMessage) {
            self.received.push((sender, message.data.clone()));
            if self.shutdown_after_message {
                self.shutdown_request = Some("asked to stop".into());
            }
        }

        fn take_shutdown_request(&mut self) -> Option<String> {
            self.shutdown_request.take()
        }
    }

    fn backend(network: &LoopbackNetwork, port: u16) -> Backend {
        let settings = NetworkSettings {
            master_server_port: 1,
            ..NetworkSettings::default()
        };
        let transport = network.bind(port, &settings.game_app_id).unwrap();
        Backend::new(Box::new(transport), settings).unwrap()
    }

    /// Connect `client` to `host` and tick both until connected
    fn connect(client: &mut Backend, cl: &mut RecordingListener, host: &mut Backend, hl: &mut RecordingListener) {
        let addr = host.local_peer().local_addr();
        client.try_connect(addr, addr, client.local_peer().local_addr()).unwrap();
        host.poll(hl).unwrap();
        client.poll(cl).unwrap();
    }

    #[test]
    fn test_connect_registers_both_sides() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9000);
        let mut client = backend(&network, 0);
        let (mut hl, mut cl) = (RecordingListener::default(), RecordingListener::default());

        connect(&mut client, &mut cl, &mut host, &mut hl);

        assert_eq!(hl.connected, vec![client.local_identity()]);
        assert_eq!(cl.connected, vec![host.local_identity()]);
        assert!(host.is_connected_to(client.local_identity()));
        let remote = client.find_remote_peer(host.local_identity()).unwrap();
        assert_eq!(remote.internal, host.local_peer().internal_addr());
        assert_eq!(client.round_trip_time(host.local_identity()), Some(Duration::ZERO));
        assert!(client.peer(client.local_identity()).unwrap().is_local());
    }

    #[test]
    fn test_peer_handles_reach_rtt_and_disconnect() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9010);
        let mut client = backend(&network, 0);
        let (mut hl, mut cl) = (RecordingListener::default(), RecordingListener::default());
        connect(&mut client, &mut cl, &mut host, &mut hl);

        let host_id = host.local_identity();
        let remote = client.peer(host_id).unwrap();
        assert!(!remote.is_local());
        assert_eq!(remote.round_trip_time(), Some(Duration::ZERO));
        assert_eq!(client.peer(client.local_identity()).unwrap().round_trip_time(), Some(Duration::ZERO));
        assert!(client.peer_mut(PeerId::generate().unwrap()).is_none());

        let handle = client.peer_mut(host_id).unwrap();
        assert_eq!(handle.round_trip_time(), Some(Duration::ZERO));
        handle.disconnect("leaving");
        client.poll(&mut cl).unwrap();
        host.poll(&mut hl).unwrap();
        assert_eq!(cl.disconnected, vec![host_id]);
        assert_eq!(hl.disconnected, vec![client.local_identity()]);

        let local = client.local_identity();
        let handle = client.peer_mut(local).unwrap();
        assert!(handle.is_local());
        handle.disconnect("done");
        assert!(client.has_shutdown());
    }

    #[test]
    fn test_settings_loss_applies_to_unreliable_sends() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9020);
        let settings = NetworkSettings {
            master_server_port: 1,
            simulated_loss: 1.0,
            ..NetworkSettings::default()
        };
        let transport = network.bind(0, &settings.game_app_id).unwrap();
        let mut client = Backend::new(Box::new(transport), settings).unwrap();
        let (mut hl, mut cl) = (RecordingListener::default(), RecordingListener::default());
        connect(&mut client, &mut cl, &mut host, &mut hl);

        let host_id = host.local_identity();
        client.send_to(Recipient::Peer(host_id), b"gone", Reliability::UnreliableSequenced, 0);
        client.send_to(Recipient::Peer(host_id), b"kept", Reliability::ReliableUnordered, 0);
        host.poll(&mut hl).unwrap();
        assert_eq!(hl.received, vec![(client.local_identity(), b"kept".to_vec())]);

        client.set_simulated_conditions(SimulatedConditions::default());
        assert!(client.simulated_conditions().is_ideal());
        client.send_to(Recipient::Peer(host_id), b"back", Reliability::UnreliableSequenced, 0);
        host.poll(&mut hl).unwrap();
        assert_eq!(hl.received.last(), Some(&(client.local_identity(), b"back".to_vec())));
    }

    #[test]
    fn test_try_connect_is_idempotent() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9001);
        let mut client = backend(&network, 0);
        let (mut hl, mut cl) = (RecordingListener::default(), RecordingListener::default());

        let addr = host.local_peer().local_addr();
        client.try_connect(addr, addr, addr).unwrap();
        client.try_connect(addr, addr, addr).unwrap();
        host.poll(&mut hl).unwrap();
        client.poll(&mut cl).unwrap();

        assert_eq!(hl.connected.len(), 1);
        assert_eq!(host.connected_peers().len(), 1);
    }

    #[test]
    fn test_refused_client_never_becomes_peer() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9002);
        let mut client = backend(&network, 0);
        let mut hl = RecordingListener {
            refuse_clients: true,
            ..RecordingListener::default()
        };
        let mut cl = RecordingListener::default();

        connect(&mut client, &mut cl, &mut host, &mut hl);

        assert!(hl.connected.is_empty());
        assert!(cl.connected.is_empty());
        assert!(cl.disconnected.is_empty());
        assert!(client.connected_peers().is_empty());
    }

    #[test]
    fn test_broadcast_to_no_peers_is_noop() {
        let network = LoopbackNetwork::new();
        let mut lonely = backend(&network, 0);
        lonely.send_to(Recipient::Broadcast, b"anyone?", Reliability::ReliableOrdered, 1);
        assert_eq!(lonely.local_peer().outgoing.available(), 1);
    }

    #[test]
    fn test_data_and_disconnect_reach_listener() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9003);
        let mut client = backend(&network, 0);
        let (mut hl, mut cl) = (RecordingListener::default(), RecordingListener::default());
        connect(&mut client, &mut cl, &mut host, &mut hl);

        client.send_to(
            Recipient::Peer(host.local_identity()),
            b"ping",
            Reliability::ReliableOrdered,
            1,
        );
        host.poll(&mut hl).unwrap();
        assert_eq!(hl.received, vec![(client.local_identity(), b"ping".to_vec())]);
        assert_eq!(host.local_peer().incoming.available(), 1);

        client.disconnect_peer(host.local_identity(), "leaving");
        client.poll(&mut cl).unwrap();
        host.poll(&mut hl).unwrap();
        assert_eq!(hl.disconnected, vec![client.local_identity()]);
        assert_eq!(cl.disconnected, vec![host.local_identity()]);
        assert!(host.connected_peers().is_empty());
    }

    #[test]
    fn test_shutdown_mid_poll_stops_processing() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9004);
        let mut client = backend(&network, 0);
        let mut hl = RecordingListener::default();
        let mut cl = RecordingListener::default();
        connect(&mut client, &mut cl, &mut host, &mut hl);

        for payload in [b"one", b"two"] {
            client.send_to(Recipient::Broadcast, payload, Reliability::ReliableOrdered, 1);
        }
        hl.shutdown_after_message = true;
        host.poll(&mut hl).unwrap();

        assert_eq!(hl.received.len(), 1);
        assert!(host.has_shutdown());
        host.shutdown("again");
        host.poll(&mut hl).unwrap();
        assert_eq!(hl.received.len(), 1);
    }

    #[test]
    fn test_discovery_request_answered_only_when_discoverable() {
        let network = LoopbackNetwork::new();
        let mut host = backend(&network, 9005);
        let mut seeker = network.bind(0, crate::settings::DEFAULT_GAME_APP_ID).unwrap();
        let mut hl = RecordingListener::default();

        seeker.discover(host.local_peer().local_addr()).unwrap();
        host.poll(&mut hl).unwrap();
        seeker.pump(Some(Duration::ZERO)).unwrap();
        assert!(seeker.next_event().is_none());

        hl.discoverable = true;
        seeker.discover(host.local_peer().local_addr()).unwrap();
        host.poll(&mut hl).unwrap();
        seeker.pump(Some(Duration::ZERO)).unwrap();
        match seeker.next_event() {
            Some(TransportEvent::DiscoveryResponse { payload, .. }) => {
                let listing = HostListing::decode(&payload).unwrap();
                assert_eq!(listing.identity, host.local_identity());
                assert_eq!(listing.public_info, b"info".to_vec());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_registration_on_interval_and_unregister_on_shutdown() {
        let network = LoopbackNetwork::new();
        let mut master = network.bind(1, crate::settings::DEFAULT_GAME_APP_ID).unwrap();
        let mut host = backend(&network, 9006);
        let hl = RecordingListener {
            online: true,
            ..RecordingListener::default()
        };

        let start = Instant::now();
        host.update_master_server_registration(&hl, start);
        host.update_master_server_registration(&hl, start + Duration::from_secs(30));
        host.update_master_server_registration(&hl, start + Duration::from_secs(60));
        host.shutdown("done");

        master.pump(Some(Duration::ZERO)).unwrap();
        let app = crate::settings::DEFAULT_GAME_APP_ID;
        let messages: Vec<MasterMessage> = std::iter::from_fn(|| master.next_event())
            .filter_map(|event| match event {
                TransportEvent::UnconnectedData { payload, .. } => MasterMessage::decode(&payload, app).ok(),
                _ => None,
            })
            .collect();

        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], MasterMessage::RegisterHost { .. }));
        assert!(matches!(messages[1], MasterMessage::RegisterHost { .. }));
        assert!(matches!(messages[2], MasterMessage::UnregisterHost { .. }));
    }

    #[test]
    fn test_shutdown_skips_unregister_when_never_online() {
        let network = LoopbackNetwork::new();
        let mut master = network.bind(1, crate::settings::DEFAULT_GAME_APP_ID).unwrap();
        let mut host = backend(&network, 9007);
        host.shutdown("done");
        master.pump(Some(Duration::ZERO)).unwrap();
        assert!(master.next_event().is_none());
    }

    #[test]
    fn test_introduce_connects_client_to_host() {
        let network = LoopbackNetwork::new();
        let mut mediator = backend(&network, 9100);
        let mut a = backend(&network, 0);
        let mut b = backend(&network, 0);
        let mut ml = RecordingListener::default();
        let (mut al, mut bl) = (RecordingListener::default(), RecordingListener::default());

        connect(&mut a, &mut al, &mut mediator, &mut ml);
        connect(&mut b, &mut bl, &mut mediator, &mut ml);

        mediator.introduce(b.local_identity(), a.local_identity()).unwrap();
        b.poll(&mut bl).unwrap();
        a.poll(&mut al).unwrap();
        b.poll(&mut bl).unwrap();

        assert!(a.is_connected_to(b.local_identity()));
        assert!(b.is_connected_to(a.local_identity()));
        assert!(matches!(
            mediator.introduce(b.local_identity(), PeerId::generate().unwrap()),
            Err(BackendError::UnknownPeer(_))
        ));
    }
}
