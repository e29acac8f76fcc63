//! Multi-peer session scenarios over the in-memory loopback network

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use peer_session::discovery::HostRoute;
use peer_session::session::{SessionPhase, SessionPublicInfo};
use peer_session::{
    AvailableHost, Backend, DiscoveryTarget, HostListing, LoopbackNetwork, NetworkSession, NetworkSettings, PeerId,
    PendingGamer, SendDataOptions, SessionError, SessionEvent, SessionKind, SessionProperties, SessionSettings,
};

const APP: &str = "session-test";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(port: u16) -> NetworkSettings {
    NetworkSettings {
        game_app_id: APP.to_string(),
        port,
        discovery_time_ms: 150,
        fully_connected_polling_ms: 2,
        fully_connected_timeout_ms: 3000,
        ..NetworkSettings::default()
    }
}

fn backend(network: &LoopbackNetwork, port: u16) -> Backend {
    let settings = settings(port);
    let transport = network.bind(port, APP).unwrap();
    Backend::new(Box::new(transport), settings).unwrap()
}

fn gamer(name: &str) -> PendingGamer {
    PendingGamer {
        display_name: name.to_string(),
        gamertag: name.to_lowercase(),
    }
}

/// Keeps sessions ticking on a background thread until stopped
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Vec<NetworkSession>>,
}

impl Ticker {
    fn start(mut sessions: Vec<NetworkSession>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                for session in sessions.iter_mut() {
                    session.update().unwrap();
                }
                thread::sleep(Duration::from_millis(1));
            }
            sessions
        });
        Ticker { stop, handle }
    }

    fn stop(self) -> Vec<NetworkSession> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}

/// Tick every session until `done` holds or two seconds pass
fn tick_until(sessions: &mut [&mut NetworkSession], done: impl Fn(&[&mut NetworkSession]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done(sessions) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        for session in sessions.iter_mut() {
            session.update().unwrap();
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_discover_join_and_gamer_state_sync() {
    init_logging();
    let network = LoopbackNetwork::new();

    let host = NetworkSession::create(
        backend(&network, 17000),
        SessionKind::SystemLink,
        SessionSettings::default(),
        vec![gamer("Alpha")],
    )
    .unwrap();
    let host_id = host.local_identity();
    let ticker = Ticker::start(vec![host]);

    let mut client_backend = backend(&network, 0);
    let hosts = client_backend.find_hosts(DiscoveryTarget::Broadcast(17000), None).unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].identity(), host_id);
    assert_eq!(hosts[0].route, HostRoute::Direct("127.0.0.1:17000".parse().unwrap()));
    let info = SessionPublicInfo::decode(&hosts[0].listing.public_info).unwrap();
    assert_eq!(info.host_gamertag, "alpha");
    assert_eq!(info.current_gamer_count, 1);

    let mut client = NetworkSession::join(client_backend, &hosts[0], vec![]).unwrap();
    let mut host = ticker.stop().pop().unwrap();

    // Both sides see each other
    assert!(client.is_fully_connected());
    assert!(client.state().machine(host_id).is_some_and(|m| m.is_host));
    assert!(host.state().machine(client.local_identity()).is_some());
    assert!(host.backend().is_connected_to(client.local_identity()));
    assert_eq!(client.state().gamer(0).unwrap().display_name, "Alpha");
    client.take_events();

    host.update_local_gamer(0, |g| g.display_name = "Alpha Prime".to_string())
        .unwrap();
    host.update().unwrap();
    client.update().unwrap();
    client.update().unwrap();

    let renamed = client.state().gamer(0).unwrap();
    assert_eq!(renamed.display_name, "Alpha Prime");
    assert_eq!(renamed.gamertag, "alpha");
    let changes = client
        .take_events()
        .into_iter()
        .filter(|e| *e == SessionEvent::GamerStateChanged(0))
        .count();
    assert_eq!(changes, 1);
}

#[test]
fn test_three_machines_mesh_and_exchange_data() {
    init_logging();
    let network = LoopbackNetwork::new();

    let host = NetworkSession::create(
        backend(&network, 17100),
        SessionKind::SystemLink,
        SessionSettings::default(),
        vec![gamer("Alpha")],
    )
    .unwrap();
    let ticker = Ticker::start(vec![host]);

    let mut b_backend = backend(&network, 0);
    let hosts = b_backend
        .find_hosts(DiscoveryTarget::Address("127.0.0.1:17100".parse().unwrap()), None)
        .unwrap();
    let b = NetworkSession::join(b_backend, &hosts[0], vec![gamer("Bravo")]).unwrap();

    let mut sessions = ticker.stop();
    sessions.push(b);
    let ticker = Ticker::start(sessions);

    let mut c_backend = backend(&network, 0);
    let hosts = c_backend
        .find_hosts(DiscoveryTarget::Address("127.0.0.1:17100".parse().unwrap()), None)
        .unwrap();
    let mut c = NetworkSession::join(c_backend, &hosts[0], vec![gamer("Charlie")]).unwrap();

    let mut sessions = ticker.stop();
    let mut b = sessions.pop().unwrap();
    let mut a = sessions.pop().unwrap();

    tick_until(&mut [&mut a, &mut b, &mut c], |s| {
        s.iter().all(|session| session.state().gamers().len() == 3)
    });

    // C was introduced to B by the host
    assert!(c.backend().is_connected_to(b.local_identity()));
    assert!(b.backend().is_connected_to(c.local_identity()));
    assert_eq!(c.state().machines().len(), 3);

    let charlie = c.state().local_gamers().next().unwrap().id;
    c.send_data(charlie, None, b"hello all", SendDataOptions::ReliableInOrder)
        .unwrap();
    tick_until(&mut [&mut a, &mut b, &mut c], |s| {
        s[0].state().local_gamers().all(|g| !g.inbound.is_empty())
            && s[1].state().local_gamers().all(|g| !g.inbound.is_empty())
    });

    let alpha = a.state().local_gamers().next().unwrap().id;
    let packet = a.gamer_mut(alpha).unwrap().receive_data().unwrap();
    assert_eq!(packet.sender, charlie);
    assert_eq!(packet.data, b"hello all".to_vec());
    assert!(c.state().local_gamers().all(|g| g.inbound.is_empty()));
}

#[test]
fn test_host_controls_reach_clients_and_host_loss_ends_session() {
    init_logging();
    let network = LoopbackNetwork::new();

    let host = NetworkSession::create(
        backend(&network, 17200),
        SessionKind::SystemLink,
        SessionSettings::default(),
        vec![gamer("Alpha")],
    )
    .unwrap();
    let ticker = Ticker::start(vec![host]);

    let mut client_backend = backend(&network, 0);
    let hosts = client_backend.find_hosts(DiscoveryTarget::Broadcast(17200), None).unwrap();
    let mut client = NetworkSession::join(client_backend, &hosts[0], vec![]).unwrap();
    let mut host = ticker.stop().pop().unwrap();

    assert!(matches!(client.start_game(), Err(SessionError::NotHost(_))));

    host.update_settings(|s| s.properties.set(3, Some(77))).unwrap();
    host.start_game().unwrap();
    host.update().unwrap();
    tick_until(&mut [&mut client], |s| s[0].state().settings.phase == SessionPhase::Playing);
    assert_eq!(client.state().settings.properties.get(3), Some(77));

    host.shutdown("closing");
    tick_until(&mut [&mut client], |s| s[0].has_shutdown());
    assert!(client
        .take_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::SessionEnded { .. })));
    assert!(matches!(client.update(), Err(SessionError::ShutDown)));
}

#[test]
fn test_join_times_out_when_host_never_answers() {
    init_logging();
    let network = LoopbackNetwork::new();

    // Bound but never ticked, so the connection is never approved
    let _silent = network.bind(17300, APP).unwrap();
    let silent_host = AvailableHost {
        listing: HostListing {
            identity: PeerId::generate().unwrap(),
            public_info: Vec::new(),
        },
        route: HostRoute::Direct("127.0.0.1:17300".parse().unwrap()),
    };

    let settings = NetworkSettings {
        fully_connected_timeout_ms: 50,
        ..settings(0)
    };
    let transport = network.bind(0, APP).unwrap();
    let backend = Backend::new(Box::new(transport), settings).unwrap();
    assert_eq!(network.endpoint_count(), 2);

    let result = NetworkSession::join(backend, &silent_host, vec![]);
    assert!(matches!(result, Err(SessionError::Timeout(_))));
    assert_eq!(network.endpoint_count(), 1);
}

#[test]
fn test_find_filters_by_kind_and_properties() {
    init_logging();
    let network = LoopbackNetwork::new();

    let mut advertised = SessionSettings::default();
    advertised.properties.set(2, Some(5));
    let host = NetworkSession::create(
        backend(&network, 17400),
        SessionKind::SystemLink,
        advertised,
        vec![gamer("Alpha")],
    )
    .unwrap();
    let host_id = host.local_identity();
    let ticker = Ticker::start(vec![host]);

    let target = DiscoveryTarget::Address("127.0.0.1:17400".parse().unwrap());
    let mut client_backend = backend(&network, 0);

    let mut matching = SessionProperties::default();
    matching.set(2, Some(5));
    let hosts = NetworkSession::find(&mut client_backend, target, SessionKind::SystemLink, matching).unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].identity(), host_id);

    let unfiltered = SessionProperties::default();
    let hosts = NetworkSession::find(&mut client_backend, target, SessionKind::SystemLink, unfiltered).unwrap();
    assert_eq!(hosts.len(), 1);

    let hosts = NetworkSession::find(&mut client_backend, target, SessionKind::PlayerMatch, matching).unwrap();
    assert!(hosts.is_empty());

    let mut wrong_value = SessionProperties::default();
    wrong_value.set(2, Some(6));
    let hosts = NetworkSession::find(&mut client_backend, target, SessionKind::SystemLink, wrong_value).unwrap();
    assert!(hosts.is_empty());

    ticker.stop();
}

#[test]
fn test_outgoing_only_endpoint_cannot_create_or_join() {
    init_logging();
    let network = LoopbackNetwork::new();
    let reachable_host = AvailableHost {
        listing: HostListing {
            identity: PeerId::generate().unwrap(),
            public_info: Vec::new(),
        },
        route: HostRoute::Direct("127.0.0.1:17500".parse().unwrap()),
    };
    let _host = network.bind(17500, APP).unwrap();

    let transport = network.bind_outgoing_only(0, APP).unwrap();
    let backend = Backend::new(Box::new(transport), settings(0)).unwrap();
    assert!(!backend.accepts_incoming());
    assert_eq!(network.endpoint_count(), 2);

    let result = NetworkSession::join(backend, &reachable_host, vec![]);
    assert!(matches!(result, Err(SessionError::NotAcceptingConnections)));
    assert_eq!(network.endpoint_count(), 1);

    let transport = network.bind_outgoing_only(0, APP).unwrap();
    let backend = Backend::new(Box::new(transport), settings(0)).unwrap();
    let result = NetworkSession::create(backend, SessionKind::SystemLink, SessionSettings::default(), vec![]);
    assert!(matches!(result, Err(SessionError::NotAcceptingConnections)));
    assert_eq!(network.endpoint_count(), 1);
}
