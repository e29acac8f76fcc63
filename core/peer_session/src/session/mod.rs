//! Network session
//!
//! Wires the backend, the message dispatcher and the shared session state
//! into one object the game ticks:
//!
//! ```text
//!  update()
//!    │
//!    ├─ Backend::poll(&mut core) ── peer_connected ──► add machine, ConnectionAcknowledged
//!    │                            ── receive_message ─► Dispatcher → receivers → SessionState
//!    │                            ── peer_disconnected ► drop machine and its gamers
//!    │
//!    └─ Outbox::flush(&mut backend) ── queued messages, then introduce / disconnect / shutdown
//! ```
//!
//! A host creates the session and is fully connected from the start. A
//! client connects to the host, gets the session settings and the list of
//! other machines, is introduced to each of them, and is fully connected once
//! every one of those connections is up.

use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendError, IncomingMessage, Recipient, RemotePeer, SessionListener};
use crate::discovery::{AvailableHost, DiscoveryTarget, HostRoute};
use crate::identity::PeerId;
use crate::messages::{
    self, ConnectionAcknowledged, Dispatcher, GameEnded, GameStarted, GamerLeft, GamerStateChanged, MessageContext,
    Outbox, RemoveMachine, SendDataOptions, SessionStateChanged, UserMessage,
};

pub mod info;
pub mod state;

pub use info::{SessionKind, SessionPublicInfo, SessionSearch};
pub use state::{
    Gamer, GamerId, InboundPacket, Machine, MachineStatus, PendingGamer, SessionEvent, SessionPhase,
    SessionProperties, SessionSettings, SessionState,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("not fully connected after {0:?}")]
    Timeout(Duration),
    #[error("lost the connection to the host")]
    HostLost,
    #[error("session is full")]
    SessionFull,
    #[error("session has shut down")]
    ShutDown,
    #[error("only the host can {0}")]
    NotHost(&'static str),
    #[error("gamer {0} is not a local gamer")]
    NotLocalGamer(GamerId),
    #[error("local endpoint does not accept connections; set cert_path and key_path")]
    NotAcceptingConnections,
}

// ============================================================================
// Listener side
// ============================================================================

/// Everything the backend calls back into during a poll
struct SessionCore {
    kind: SessionKind,
    state: SessionState,
    dispatcher: Dispatcher,
    outbox: Outbox,
}

impl SessionCore {
    fn context(&mut self) -> MessageContext<'_> {
        MessageContext::new(&mut self.state, &mut self.outbox)
    }

    fn accepting_players(&self) -> bool {
        let settings = &self.state.settings;
        let open = settings.phase == SessionPhase::Lobby
            || (settings.phase == SessionPhase::Playing && settings.allow_join_in_progress);
        open && (self.state.gamers().len() as i32) < settings.max_gamers
    }
}

impl SessionListener for SessionCore {
    fn is_discoverable_locally(&self) -> bool {
        self.state.is_host() && self.kind == SessionKind::SystemLink && self.accepting_players()
    }

    fn is_discoverable_online(&self) -> bool {
        self.state.is_host() && self.kind == SessionKind::PlayerMatch && self.accepting_players()
    }

    fn session_public_info(&self) -> Vec<u8> {
        match SessionPublicInfo::from_state(self.kind, &self.state).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode session info: {}", e);
                Vec::new()
            }
        }
    }

    fn allow_connection_to_host_as_client(&mut self, host: PeerId) -> bool {
        if self.state.is_host() {
            log::debug!("Host refuses to connect out to {}", host);
            return false;
        }
        true
    }

    fn allow_connection_from_client(&mut self, client: PeerId) -> bool {
        if self.state.is_host() && !self.accepting_players() {
            log::info!("Session closed to new machines, refusing {}", client);
            return false;
        }
        true
    }

    fn peer_connected(&mut self, peer: &RemotePeer) {
        if !self.state.add_remote_machine(peer.identity) {
            return;
        }
        let mut ctx = self.context();
        ctx.send(&ConnectionAcknowledged, Recipient::Peer(peer.identity));
        messages::check_fully_connected(&mut ctx);
    }

    fn peer_disconnected(&mut self, peer: &RemotePeer) {
        let removed = self.state.remove_machine(peer.identity);
        log::info!("Machine {} left with {} gamer(s)", peer.identity, removed.len());

        if !self.state.is_host() && peer.identity == self.state.host_identity() {
            let reason = "host left the session".to_string();
            self.state.settings.phase = SessionPhase::Ended;
            self.state.push_event(SessionEvent::SessionEnded { reason: reason.clone() });
            self.outbox
                .push_command(messages::BackendCommand::Shutdown { reason });
            return;
        }
        messages::check_fully_connected(&mut self.context());
    }

    fn receive_message(&mut self, sender: PeerId, message: &IncomingMessage) {
        let mut ctx = MessageContext::new(&mut self.state, &mut self.outbox);
        self.dispatcher.dispatch_logged(&message.data, sender, &mut ctx);
    }

    fn take_shutdown_request(&mut self) -> Option<String> {
        self.outbox.take_shutdown_request()
    }
}

// ============================================================================
// NetworkSession
// ============================================================================

pub struct NetworkSession {
    backend: Backend,
    core: SessionCore,
}

impl NetworkSession {
    /// Host a new session on `backend`
    pub fn create(
        backend: Backend,
        kind: SessionKind,
        settings: SessionSettings,
        local_gamers: Vec<PendingGamer>,
    ) -> Result<Self, SessionError> {
        let backend = Self::require_accepting(backend)?;
        let state = SessionState::new_host(backend.local_identity(), settings);
        let mut session = NetworkSession::with_state(backend, kind, state);
        for gamer in local_gamers {
            session.add_local_gamer(gamer)?;
        }
        log::info!("Hosting {:?} session as {}", kind, session.local_identity());
        Ok(session)
    }

    /// Search `target` for sessions of `kind` whose properties agree with
    /// every property set in `properties`
    pub fn find(
        backend: &mut Backend,
        target: DiscoveryTarget,
        kind: SessionKind,
        properties: SessionProperties,
    ) -> Result<Vec<AvailableHost>, SessionError> {
        let search = SessionSearch::new(kind, properties);
        Ok(backend.find_hosts(target, Some(&search))?)
    }

    /// Join the session `host` advertises and wait until connected to every
    /// machine in it. On failure the endpoint is shut down.
    pub fn join(backend: Backend, host: &AvailableHost, local_gamers: Vec<PendingGamer>) -> Result<Self, SessionError> {
        let backend = Self::require_accepting(backend)?;
        let kind = SessionPublicInfo::decode(&host.listing.public_info)
            .map(|info| info.kind)
            .unwrap_or_default();
        let state = SessionState::new_client(backend.local_identity(), host.identity());
        let mut session = NetworkSession::with_state(backend, kind, state);
        for gamer in local_gamers {
            session.core.state.queue_pending_gamer(gamer);
        }

        let started = match host.route {
            HostRoute::Direct(addr) => {
                let internal = session.backend.local_peer().internal_addr();
                session.backend.try_connect(addr, addr, internal)
            }
            HostRoute::Introduced => session.backend.request_introduction(host.identity()),
        };
        if let Err(e) = started {
            session.backend.shutdown("join failed");
            return Err(e.into());
        }

        let polling = session.backend.settings().fully_connected_polling();
        let timeout = session.backend.settings().fully_connected_timeout();
        session.wait_until_fully_connected(polling, timeout)?;
        log::info!("Joined session hosted by {}", host.identity());
        Ok(session)
    }

    /// Every session member is connected to by later joiners
    fn require_accepting(mut backend: Backend) -> Result<Backend, SessionError> {
        if backend.accepts_incoming() {
            return Ok(backend);
        }
        log::error!("Endpoint {} cannot accept connections", backend.local_peer().local_addr());
        backend.shutdown("endpoint does not accept connections");
        Err(SessionError::NotAcceptingConnections)
    }

    fn with_state(backend: Backend, kind: SessionKind, state: SessionState) -> Self {
        NetworkSession {
            backend,
            core: SessionCore {
                kind,
                state,
                dispatcher: Dispatcher::default(),
                outbox: Outbox::new(),
            },
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn local_identity(&self) -> PeerId {
        self.backend.local_identity()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn state(&self) -> &SessionState {
        &self.core.state
    }

    pub fn kind(&self) -> SessionKind {
        self.core.kind
    }

    pub fn is_host(&self) -> bool {
        self.core.state.is_host()
    }

    pub fn is_fully_connected(&self) -> bool {
        self.core.state.is_fully_connected()
    }

    pub fn has_shutdown(&self) -> bool {
        self.backend.has_shutdown()
    }

    pub fn gamer_mut(&mut self, id: GamerId) -> Option<&mut Gamer> {
        self.core.state.gamer_mut(id)
    }

    /// Events since the last call
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.core.state.take_events()
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Drain the network, apply every received message, send what was queued
    pub fn update(&mut self) -> Result<(), SessionError> {
        if self.backend.has_shutdown() {
            return Err(SessionError::ShutDown);
        }
        self.backend.poll(&mut self.core)?;
        self.core.outbox.flush(&mut self.backend);
        Ok(())
    }

    /// Tick and sleep until fully connected. Times out after `timeout` and
    /// shuts the endpoint down.
    pub fn wait_until_fully_connected(&mut self, poll_interval: Duration, timeout: Duration) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            match self.update() {
                Ok(()) => {}
                Err(SessionError::ShutDown) => return Err(SessionError::HostLost),
                Err(e) => {
                    self.backend.shutdown("join failed");
                    return Err(e);
                }
            }
            if self.is_fully_connected() {
                return Ok(());
            }
            if self.backend.has_shutdown() {
                return Err(SessionError::HostLost);
            }
            if started.elapsed() >= timeout {
                log::warn!("Not fully connected after {:?}", timeout);
                self.backend.shutdown("timed out joining session");
                return Err(SessionError::Timeout(timeout));
            }
            thread::sleep(poll_interval);
        }
    }

    // ========================================================================
    // Gamers
    // ========================================================================

    /// Add a gamer on this machine. Its id comes from the host, so on a
    /// client it shows up after a round trip.
    pub fn add_local_gamer(&mut self, gamer: PendingGamer) -> Result<(), SessionError> {
        self.ensure_running()?;
        let state = &self.core.state;
        if state.is_host() && state.gamers().len() as i32 >= state.settings.max_gamers {
            return Err(SessionError::SessionFull);
        }
        messages::announce_local_gamer(&mut self.core.context(), gamer);
        Ok(())
    }

    pub fn remove_local_gamer(&mut self, id: GamerId) -> Result<(), SessionError> {
        self.ensure_running()?;
        if !self.core.state.is_local_gamer(id) {
            return Err(SessionError::NotLocalGamer(id));
        }
        let mut ctx = self.core.context();
        ctx.send(&GamerLeft { id }, Recipient::Broadcast);
        ctx.state.remove_gamer(id);
        Ok(())
    }

    /// Change a local gamer and tell everyone. Only the changed groups
    /// (names, flags) go on the wire.
    pub fn update_local_gamer(&mut self, id: GamerId, change: impl FnOnce(&mut Gamer)) -> Result<(), SessionError> {
        self.ensure_running()?;
        if !self.core.state.is_local_gamer(id) {
            return Err(SessionError::NotLocalGamer(id));
        }
        let Some(gamer) = self.core.state.gamer_mut(id) else {
            return Err(SessionError::NotLocalGamer(id));
        };
        let before = (
            gamer.display_name.clone(),
            gamer.gamertag.clone(),
            gamer.is_private_slot,
            gamer.is_ready,
        );
        change(gamer);
        gamer.id = id;
        let send_names = before.0 != gamer.display_name || before.1 != gamer.gamertag;
        let send_flags = before.2 != gamer.is_private_slot || before.3 != gamer.is_ready;

        if send_names || send_flags {
            self.core.context().send(
                &GamerStateChanged {
                    id,
                    send_names,
                    send_flags,
                },
                Recipient::Broadcast,
            );
        }
        Ok(())
    }

    /// Send game data from a local gamer to one gamer, or to every gamer
    /// when `recipient` is `None`. Local recipients get it immediately.
    pub fn send_data(
        &mut self,
        sender: GamerId,
        recipient: Option<GamerId>,
        data: &[u8],
        options: SendDataOptions,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        if !self.core.state.is_local_gamer(sender) {
            return Err(SessionError::NotLocalGamer(sender));
        }

        let remote_target = match recipient {
            None => {
                for gamer in self.core.state.local_gamers_mut().filter(|g| g.id != sender) {
                    gamer.inbound.push_back(InboundPacket {
                        sender,
                        data: data.to_vec(),
                    });
                }
                Some(Recipient::Broadcast)
            }
            Some(id) if self.core.state.is_local_gamer(id) => {
                if let Some(gamer) = self.core.state.gamer_mut(id) {
                    gamer.inbound.push_back(InboundPacket {
                        sender,
                        data: data.to_vec(),
                    });
                }
                None
            }
            Some(id) => match self.core.state.gamer(id) {
                Some(gamer) => Some(Recipient::Peer(gamer.machine)),
                None => {
                    log::debug!("Data for unknown gamer {} dropped", id);
                    None
                }
            },
        };

        if let Some(target) = remote_target {
            let message = UserMessage {
                sender,
                recipient,
                options,
                data: data.to_vec(),
            };
            self.core.context().send(&message, target);
        }
        Ok(())
    }

    // ========================================================================
    // Host controls
    // ========================================================================

    /// Change the session settings and broadcast them
    pub fn update_settings(&mut self, change: impl FnOnce(&mut SessionSettings)) -> Result<(), SessionError> {
        self.ensure_host("change session settings")?;
        change(&mut self.core.state.settings);
        self.core.state.push_event(SessionEvent::SessionStateChanged);
        self.core.context().send(&SessionStateChanged, Recipient::Broadcast);
        Ok(())
    }

    pub fn start_game(&mut self) -> Result<(), SessionError> {
        self.ensure_host("start the game")?;
        if self.core.state.settings.phase != SessionPhase::Lobby {
            return Ok(());
        }
        self.core.state.settings.phase = SessionPhase::Playing;
        self.core.state.push_event(SessionEvent::GameStarted);
        self.core.context().send(&GameStarted, Recipient::Broadcast);
        Ok(())
    }

    pub fn end_game(&mut self) -> Result<(), SessionError> {
        self.ensure_host("end the game")?;
        if self.core.state.settings.phase != SessionPhase::Playing {
            return Ok(());
        }
        messages::end_game(&mut self.core.state);
        self.core.context().send(&GameEnded, Recipient::Broadcast);
        Ok(())
    }

    /// Drop a machine from the session; every other machine disconnects it
    pub fn remove_machine(&mut self, machine: PeerId) -> Result<(), SessionError> {
        self.ensure_host("remove a machine")?;
        let mut ctx = self.core.context();
        ctx.send(&RemoveMachine { machine }, Recipient::Broadcast);
        ctx.command(messages::BackendCommand::Disconnect {
            peer: machine,
            reason: "removed from session".to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Leave the session and release the endpoint. Idempotent.
    pub fn shutdown(&mut self, reason: &str) {
        if self.backend.has_shutdown() {
            return;
        }
        self.core.outbox.flush(&mut self.backend);
        self.backend.shutdown(reason);
        self.core.state.settings.phase = SessionPhase::Ended;
        self.core.state.push_event(SessionEvent::SessionEnded {
            reason: reason.to_string(),
        });
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.backend.has_shutdown() {
            Err(SessionError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn ensure_host(&self, action: &'static str) -> Result<(), SessionError> {
        self.ensure_running()?;
        if self.core.state.is_host() {
            Ok(())
        } else {
            Err(SessionError::NotHost(action))
        }
    }
}
