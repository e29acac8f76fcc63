//! Request handling for the rendezvous server
//!
//! Every request is an unconnected datagram; the server never accepts
//! connections. Each [`MasterServer::update`] drains what the transport has
//! queued, answers it, then sweeps expired hosts. [`MasterServer::run`]
//! repeats that until stopped; only a shut down transport ends it early.
//!
//! ```text
//! Host                        MasterServer                      Client
//!   │ RegisterHost (heartbeat)     │                               │
//!   │─────────────────────────────►│◄──────────── RequestHosts ────│
//!   │                              │──── HostListing × N ─────────►│
//!   │                              │◄──── RequestIntroduction ─────│
//!   │◄═══════ introduce(host, client, token) ═════════════════════►│
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use peer_session::{
    HostListing, IntroductionToken, MasterMessage, MasterProtocolError, NetworkSettings, PeerId, Transport,
    TransportError, TransportEvent,
};

use crate::registry::HostRegistry;

// ============================================================================
// Constants
// ============================================================================

/// How often the host count is written to the log
pub const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Server
// ============================================================================

pub struct MasterServer {
    transport: Box<dyn Transport>,
    app_id: String,
    registry: HostRegistry,
    last_status_report: Instant,
}

impl MasterServer {
    pub fn new(transport: Box<dyn Transport>, settings: &NetworkSettings) -> Self {
        log::info!(
            "Master server listening on {} (app id '{}')",
            transport.local_addr(),
            settings.game_app_id
        );
        MasterServer {
            transport,
            app_id: settings.game_app_id.clone(),
            registry: HostRegistry::new(settings.registration_interval(), settings.registration_grace()),
            last_status_report: Instant::now(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Wait up to `timeout` for traffic without handling it
    pub fn wait(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.transport.pump(Some(timeout))
    }

    /// Handle every queued request, then evict expired hosts
    pub fn update(&mut self) -> Result<(), TransportError> {
        self.update_at(Instant::now())
    }

    fn update_at(&mut self, now: Instant) -> Result<(), TransportError> {
        self.transport.pump(Some(Duration::ZERO))?;

        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::UnconnectedData { from, payload } => self.handle_datagram(from, &payload, now),
                TransportEvent::Diagnostic { level, message } => log::log!(level, "{}", message),
                other => log::debug!("Ignoring transport event {:?}", other),
            }
        }

        self.registry.trim(now);

        if now.saturating_duration_since(self.last_status_report) >= STATUS_REPORT_INTERVAL {
            self.last_status_report = now;
            log::info!("Status: {} registered host(s)", self.registry.len());
        }
        Ok(())
    }

    /// Serve until `stop` is set or the transport shuts down. Any other
    /// transport error is logged and the loop resumes after one `tick`.
    pub fn run(&mut self, stop: &AtomicBool, tick: Duration) {
        while !stop.load(Ordering::Relaxed) {
            match self.update().and_then(|()| self.wait(tick)) {
                Ok(()) => {}
                Err(TransportError::ShutDown) => {
                    log::info!("Transport shut down, leaving the serve loop");
                    break;
                }
                Err(e) => {
                    log::warn!("Transport error, continuing: {}", e);
                    std::thread::sleep(tick);
                }
            }
        }
    }

    pub fn shutdown(&mut self, reason: &str) {
        log::info!("Master server shutting down: {}", reason);
        self.transport.shutdown(reason);
    }

    fn handle_datagram(&mut self, from: SocketAddr, payload: &[u8], now: Instant) {
        let message = match MasterMessage::decode(payload, &self.app_id) {
            Ok(message) => message,
            Err(e @ MasterProtocolError::AppIdMismatch { .. }) => {
                log::warn!("Rejected datagram from {}: {}", from, e);
                return;
            }
            Err(e) => {
                log::debug!("Dropped malformed datagram from {}: {}", from, e);
                return;
            }
        };

        match message {
            MasterMessage::RegisterHost {
                identity,
                internal,
                public_info,
            } => {
                self.registry
                    .register_or_update(identity, internal, from, public_info, now);
            }
            MasterMessage::UnregisterHost { identity } => {
                if !self.registry.unregister(identity) {
                    log::info!("Unregister from {} for unknown host {}", from, identity);
                }
            }
            MasterMessage::RequestHosts => self.send_host_list(from),
            MasterMessage::RequestIntroduction { host, client_internal } => {
                self.introduce(host, client_internal, from);
            }
        }
    }

    fn send_host_list(&mut self, to: SocketAddr) {
        log::debug!("Sending {} host(s) to {}", self.registry.len(), to);
        for record in self.registry.list_hosts() {
            let listing = HostListing {
                identity: record.identity,
                public_info: record.public_info.clone(),
            };
            let result = listing
                .encode()
                .map_err(TransportError::from)
                .and_then(|payload| self.transport.send_unconnected(to, &payload));
            if let Err(e) = result {
                log::warn!("Failed to send host {} to {}: {}", record.identity, to, e);
            }
        }
    }

    fn introduce(&mut self, host: PeerId, client_internal: SocketAddr, client_external: SocketAddr) {
        let Some(record) = self.registry.find(host) else {
            log::warn!(
                "Introduction requested by {} for unknown host {}",
                client_external,
                host
            );
            return;
        };

        let token = IntroductionToken::new(record.identity, record.external, client_external);
        log::info!(
            "Introducing {} (internal {}) to host {} at {}",
            client_external,
            client_internal,
            host,
            record.external
        );
        if let Err(e) = self.transport.introduce(
            record.internal,
            record.external,
            client_internal,
            client_external,
            &token.serialize(),
        ) {
            log::warn!("Introduction of {} to {} failed: {}", client_external, host, e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    use peer_session::transport::{ConnectionHandle, Reliability, TransportStats};
    use peer_session::{LoopbackNetwork, LoopbackTransport, SimulatedConditions};

    const APP: &str = "registry-test";

    fn settings() -> NetworkSettings {
        NetworkSettings {
            game_app_id: APP.to_string(),
            ..NetworkSettings::default()
        }
    }

    fn server(network: &LoopbackNetwork, port: u16) -> MasterServer {
        let transport = network.bind(port, APP).unwrap();
        MasterServer::new(Box::new(transport), &settings())
    }

    fn send(from: &mut LoopbackTransport, to: SocketAddr, message: &MasterMessage, app_id: &str) {
        from.send_unconnected(to, &message.encode(app_id).unwrap()).unwrap();
    }

    fn drain(transport: &mut LoopbackTransport) -> Vec<TransportEvent> {
        transport.pump(Some(Duration::ZERO)).unwrap();
        std::iter::from_fn(|| transport.next_event()).collect()
    }

    fn register(host: &mut LoopbackTransport, master: SocketAddr, identity: PeerId, info: &[u8]) {
        let message = MasterMessage::RegisterHost {
            identity,
            internal: host.internal_addr(),
            public_info: info.to_vec(),
        };
        send(host, master, &message, APP);
    }

    #[test]
    fn test_register_and_list_hosts() {
        let _ = env_logger::builder().is_test(true).try_init();
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18000);
        let mut host = network.bind(0, APP).unwrap();
        let mut client = network.bind(0, APP).unwrap();
        let identity = PeerId::generate().unwrap();

        register(&mut host, master.local_addr(), identity, b"v1");
        register(&mut host, master.local_addr(), identity, b"v2");
        master.update().unwrap();
        assert_eq!(master.registry().len(), 1);
        assert_eq!(master.registry().find(identity).unwrap().external, host.local_addr());

        send(&mut client, master.local_addr(), &MasterMessage::RequestHosts, APP);
        master.update().unwrap();

        let listings: Vec<HostListing> = drain(&mut client)
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::UnconnectedData { from, payload } if from == master.local_addr() => {
                    HostListing::decode(&payload).ok()
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            listings,
            vec![HostListing {
                identity,
                public_info: b"v2".to_vec()
            }]
        );

        send(&mut host, master.local_addr(), &MasterMessage::UnregisterHost { identity }, APP);
        master.update().unwrap();
        assert!(master.registry().is_empty());
    }

    #[test]
    fn test_introduction_hands_token_to_client() {
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18100);
        let mut host = network.bind(0, APP).unwrap();
        let mut client = network.bind(0, APP).unwrap();
        let identity = PeerId::generate().unwrap();

        register(&mut host, master.local_addr(), identity, b"");
        let request = MasterMessage::RequestIntroduction {
            host: identity,
            client_internal: client.internal_addr(),
        };
        send(&mut client, master.local_addr(), &request, APP);
        master.update().unwrap();

        let token = drain(&mut client)
            .into_iter()
            .find_map(|event| match event {
                TransportEvent::NatIntroductionSuccess { from, token } => Some((from, token)),
                _ => None,
            })
            .expect("client should be introduced");
        assert_eq!(token.0, host.local_addr());

        let parsed = IntroductionToken::parse(&token.1).unwrap();
        assert_eq!(parsed.host, identity);
        assert_eq!(parsed.host_external, host.local_addr());
        assert_eq!(parsed.client_external, client.local_addr());
    }

    #[test]
    fn test_unknown_host_introduction_is_ignored() {
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18200);
        let mut client = network.bind(0, APP).unwrap();

        let request = MasterMessage::RequestIntroduction {
            host: PeerId::generate().unwrap(),
            client_internal: client.internal_addr(),
        };
        send(&mut client, master.local_addr(), &request, APP);
        master.update().unwrap();

        assert!(drain(&mut client)
            .iter()
            .all(|event| !matches!(event, TransportEvent::NatIntroductionSuccess { .. })));
    }

    #[test]
    fn test_foreign_app_and_garbage_dropped() {
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18300);
        let mut host = network.bind(0, "other-game").unwrap();

        let message = MasterMessage::RegisterHost {
            identity: PeerId::generate().unwrap(),
            internal: host.internal_addr(),
            public_info: vec![],
        };
        send(&mut host, master.local_addr(), &message, "other-game");
        host.send_unconnected(master.local_addr(), &[0xff, 0x01]).unwrap();
        master.update().unwrap();

        assert!(master.registry().is_empty());
    }

    /// Loopback endpoint whose first pumps fail with a socket error
    struct FlakyTransport {
        inner: LoopbackTransport,
        failures_left: usize,
    }

    impl Transport for FlakyTransport {
        fn local_addr(&self) -> SocketAddr {
            self.inner.local_addr()
        }

        fn internal_addr(&self) -> SocketAddr {
            self.inner.internal_addr()
        }

        fn accepts_incoming(&self) -> bool {
            self.inner.accepts_incoming()
        }

        fn pump(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "port unreachable").into());
            }
            self.inner.pump(timeout)
        }

        fn next_event(&mut self) -> Option<TransportEvent> {
            self.inner.next_event()
        }

        fn connect(&mut self, addr: SocketAddr, hail: &[u8]) -> Result<ConnectionHandle, TransportError> {
            self.inner.connect(addr, hail)
        }

        fn connection_to(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
            self.inner.connection_to(addr)
        }

        fn approve(&mut self, connection: ConnectionHandle, hail: &[u8]) -> Result<(), TransportError> {
            self.inner.approve(connection, hail)
        }

        fn deny(&mut self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
            self.inner.deny(connection, reason)
        }

        fn send(
            &mut self,
            connection: ConnectionHandle,
            payload: &[u8],
            reliability: Reliability,
            channel: u8,
        ) -> Result<(), TransportError> {
            self.inner.send(connection, payload, reliability, channel)
        }

        fn disconnect(&mut self, connection: ConnectionHandle, reason: &str) {
            self.inner.disconnect(connection, reason)
        }

        fn send_unconnected(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
            self.inner.send_unconnected(addr, payload)
        }

        fn discover(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
            self.inner.discover(addr)
        }

        fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
            self.inner.send_discovery_response(addr, payload)
        }

        fn introduce(
            &mut self,
            host_internal: SocketAddr,
            host_external: SocketAddr,
            client_internal: SocketAddr,
            client_external: SocketAddr,
            token: &str,
        ) -> Result<(), TransportError> {
            self.inner
                .introduce(host_internal, host_external, client_internal, client_external, token)
        }

        fn round_trip_time(&self, connection: ConnectionHandle) -> Option<Duration> {
            self.inner.round_trip_time(connection)
        }

        fn statistics(&self) -> TransportStats {
            self.inner.statistics()
        }

        fn set_simulated_conditions(&mut self, conditions: SimulatedConditions) {
            self.inner.set_simulated_conditions(conditions)
        }

        fn shutdown(&mut self, reason: &str) {
            self.inner.shutdown(reason)
        }
    }

    #[test]
    fn test_run_survives_transport_errors() {
        let _ = env_logger::builder().is_test(true).try_init();
        let network = LoopbackNetwork::new();
        let flaky = FlakyTransport {
            inner: network.bind(18500, APP).unwrap(),
            failures_left: 3,
        };
        let mut master = MasterServer::new(Box::new(flaky), &settings());
        let mut host = network.bind(0, APP).unwrap();
        let identity = PeerId::generate().unwrap();
        register(&mut host, master.local_addr(), identity, b"");

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let serving = thread::spawn(move || {
            master.run(&flag, Duration::from_millis(1));
            master
        });

        thread::sleep(Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        let master = serving.join().unwrap();
        assert_eq!(master.registry().len(), 1);
        assert!(master.registry().find(identity).is_some());
    }

    #[test]
    fn test_run_returns_once_transport_shut_down() {
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18600);
        master.shutdown("stopping");

        let stop = AtomicBool::new(false);
        master.run(&stop, Duration::from_millis(1));
        assert!(master.registry().is_empty());
    }

    #[test]
    fn test_silent_host_expires() {
        let network = LoopbackNetwork::new();
        let mut master = server(&network, 18400);
        let mut host = network.bind(0, APP).unwrap();
        let identity = PeerId::generate().unwrap();

        register(&mut host, master.local_addr(), identity, b"");
        let start = Instant::now();
        master.update_at(start).unwrap();
        assert_eq!(master.registry().len(), 1);

        let ttl = settings().registration_interval() + settings().registration_grace();
        master.update_at(start + ttl + Duration::from_secs(1)).unwrap();
        assert!(master.registry().is_empty());
    }
}
