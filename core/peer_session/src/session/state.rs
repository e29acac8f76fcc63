//! Shared session state
//!
//! Machines, gamers and session settings as this process sees them. Internal
//! message receivers are the only writers once a session is running; every
//! change they make is recorded as a [`SessionEvent`].

use std::collections::{HashMap, VecDeque};

use crate::identity::PeerId;
use crate::wire::{WireError, WireReader, WireWriter};

pub type GamerId = u8;

/// Highest assignable gamer id; 255 means "every gamer" on the wire
pub const MAX_GAMER_ID: GamerId = 254;

/// Wire value for "no specific gamer"
pub const ALL_GAMERS: u8 = 255;

pub const PROPERTY_COUNT: usize = 8;

pub const DEFAULT_MAX_GAMERS: i32 = 32;

// ============================================================================
// Machines and gamers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Connected but not yet meshed with every other machine
    Pending,
    FullyConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub identity: PeerId,
    pub is_local: bool,
    pub is_host: bool,
    pub status: MachineStatus,
    /// The host has sent its session settings to us
    pub has_sent_session_state: bool,
}

impl Machine {
    pub fn is_pending(&self) -> bool {
        self.status == MachineStatus::Pending
    }

    pub fn is_fully_connected(&self) -> bool {
        self.status == MachineStatus::FullyConnected
    }
}

/// Data one gamer sent to a local gamer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub sender: GamerId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gamer {
    pub id: GamerId,
    pub machine: PeerId,
    pub display_name: String,
    pub gamertag: String,
    pub is_private_slot: bool,
    pub is_ready: bool,
    /// Only filled for gamers on the local machine
    pub inbound: VecDeque<InboundPacket>,
}

impl Gamer {
    pub fn new(id: GamerId, machine: PeerId, display_name: String, gamertag: String) -> Self {
        Gamer {
            id,
            machine,
            display_name,
            gamertag,
            is_private_slot: false,
            is_ready: false,
            inbound: VecDeque::new(),
        }
    }

    pub fn receive_data(&mut self) -> Option<InboundPacket> {
        self.inbound.pop_front()
    }
}

/// A local gamer still waiting for the host to assign an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGamer {
    pub display_name: String,
    pub gamertag: String,
}

// ============================================================================
// Session settings
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Lobby,
    Playing,
    Ended,
}

impl SessionPhase {
    pub fn to_u8(self) -> u8 {
        match self {
            SessionPhase::Lobby => 0,
            SessionPhase::Playing => 1,
            SessionPhase::Ended => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SessionPhase::Lobby),
            1 => Some(SessionPhase::Playing),
            2 => Some(SessionPhase::Ended),
            _ => None,
        }
    }
}

/// Eight optional game-defined integers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionProperties([Option<i32>; PROPERTY_COUNT]);

impl SessionProperties {
    pub fn get(&self, index: usize) -> Option<i32> {
        self.0.get(index).copied().flatten()
    }

    /// Out-of-range indices are ignored
    pub fn set(&mut self, index: usize, value: Option<i32>) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = value;
        }
    }

    /// Presence mask byte, then each present value in index order
    pub fn pack(&self, w: &mut WireWriter<'_>) {
        let mask = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .fold(0u8, |mask, (i, _)| mask | (1 << i));
        w.write_u8(mask);
        for value in self.0.iter().flatten() {
            w.write_i32(*value);
        }
    }

    pub fn unpack(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let mask = r.read_u8()?;
        let mut properties = SessionProperties::default();
        for (i, slot) in properties.0.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *slot = Some(r.read_i32()?);
            }
        }
        Ok(properties)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub allow_host_migration: bool,
    pub allow_join_in_progress: bool,
    pub max_gamers: i32,
    pub private_gamer_slots: i32,
    pub properties: SessionProperties,
    pub phase: SessionPhase,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            allow_host_migration: false,
            allow_join_in_progress: true,
            max_gamers: DEFAULT_MAX_GAMERS,
            private_gamer_slots: 0,
            properties: SessionProperties::default(),
            phase: SessionPhase::Lobby,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Something the game may want to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    GamerJoined(GamerId),
    GamerLeft(GamerId),
    GamerStateChanged(GamerId),
    SessionStateChanged,
    GameStarted,
    GameEnded,
    /// The local machine is connected to every machine in the session
    FullyConnected,
    /// The host had no room for a local gamer
    GamerRejected { display_name: String },
    SessionEnded { reason: String },
}

// ============================================================================
// SessionState
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionState {
    local: PeerId,
    host: PeerId,
    machines: Vec<Machine>,
    gamers: Vec<Gamer>,
    pub settings: SessionSettings,
    /// Machines the host told us to connect to; `None` until it did
    expected_machines: Option<Vec<PeerId>>,
    pending_local_gamers: VecDeque<PendingGamer>,
    /// Host only: ids handed out but not yet announced
    allocated_ids: HashMap<GamerId, PeerId>,
    events: VecDeque<SessionEvent>,
}

impl SessionState {
    /// State for a session this process hosts
    pub fn new_host(local: PeerId, settings: SessionSettings) -> Self {
        let mut state = SessionState::with_local(local, local, settings);
        state.expected_machines = Some(Vec::new());
        state
    }

    /// State for a session hosted by `host`; settings arrive from the host
    pub fn new_client(local: PeerId, host: PeerId) -> Self {
        SessionState::with_local(local, host, SessionSettings::default())
    }

    fn with_local(local: PeerId, host: PeerId, settings: SessionSettings) -> Self {
        let is_host = local == host;
        SessionState {
            local,
            host,
            machines: vec![Machine {
                identity: local,
                is_local: true,
                is_host,
                status: if is_host {
                    MachineStatus::FullyConnected
                } else {
                    MachineStatus::Pending
                },
                has_sent_session_state: is_host,
            }],
            gamers: Vec::new(),
            settings,
            expected_machines: None,
            pending_local_gamers: VecDeque::new(),
            allocated_ids: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn local_identity(&self) -> PeerId {
        self.local
    }

    pub fn host_identity(&self) -> PeerId {
        self.host
    }

    pub fn is_host(&self) -> bool {
        self.local == self.host
    }

    pub fn local_machine(&self) -> &Machine {
        &self.machines[0]
    }

    pub fn is_fully_connected(&self) -> bool {
        self.local_machine().is_fully_connected()
    }

    pub fn mark_fully_connected(&mut self) {
        self.machines[0].status = MachineStatus::FullyConnected;
    }

    // ------------------------------------------------------------------------
    // Machines
    // ------------------------------------------------------------------------

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn machine(&self, identity: PeerId) -> Option<&Machine> {
        self.machines.iter().find(|m| m.identity == identity)
    }

    pub fn machine_mut(&mut self, identity: PeerId) -> Option<&mut Machine> {
        self.machines.iter_mut().find(|m| m.identity == identity)
    }

    /// Identities of every remote machine, in connection order
    pub fn remote_machine_ids(&self) -> Vec<PeerId> {
        self.machines
            .iter()
            .filter(|m| !m.is_local)
            .map(|m| m.identity)
            .collect()
    }

    /// Register a newly connected machine. Returns false if it was known.
    pub fn add_remote_machine(&mut self, identity: PeerId) -> bool {
        if self.machine(identity).is_some() {
            return false;
        }
        self.machines.push(Machine {
            identity,
            is_local: false,
            is_host: identity == self.host,
            status: MachineStatus::Pending,
            has_sent_session_state: false,
        });
        true
    }

    /// Forget a machine and every gamer it owned. Returns the removed gamers.
    pub fn remove_machine(&mut self, identity: PeerId) -> Vec<GamerId> {
        let Some(index) = self.machines.iter().position(|m| m.identity == identity && !m.is_local) else {
            return Vec::new();
        };
        self.machines.remove(index);
        self.allocated_ids.retain(|_, owner| *owner != identity);
        if let Some(expected) = self.expected_machines.as_mut() {
            expected.retain(|id| *id != identity);
        }

        let removed: Vec<GamerId> = self
            .gamers
            .iter()
            .filter(|g| g.machine == identity)
            .map(|g| g.id)
            .collect();
        self.gamers.retain(|g| g.machine != identity);
        for id in &removed {
            self.events.push_back(SessionEvent::GamerLeft(*id));
        }
        removed
    }

    pub fn set_expected_machines(&mut self, machines: Vec<PeerId>) {
        self.expected_machines = Some(machines);
    }

    /// Clients: the host's settings have arrived, the host told us who else
    /// is in the session, and we are connected to all of them
    pub fn is_mesh_complete(&self) -> bool {
        let host_ready = self.machine(self.host).is_some_and(|m| m.has_sent_session_state);
        let Some(expected) = &self.expected_machines else {
            return false;
        };
        host_ready && expected.iter().all(|id| self.machine(*id).is_some())
    }

    // ------------------------------------------------------------------------
    // Gamers
    // ------------------------------------------------------------------------

    pub fn gamers(&self) -> &[Gamer] {
        &self.gamers
    }

    pub fn gamer(&self, id: GamerId) -> Option<&Gamer> {
        self.gamers.iter().find(|g| g.id == id)
    }

    pub fn gamer_mut(&mut self, id: GamerId) -> Option<&mut Gamer> {
        self.gamers.iter_mut().find(|g| g.id == id)
    }

    pub fn is_local_gamer(&self, id: GamerId) -> bool {
        self.gamer(id).is_some_and(|g| g.machine == self.local)
    }

    pub fn local_gamers(&self) -> impl Iterator<Item = &Gamer> {
        self.gamers.iter().filter(move |g| g.machine == self.local)
    }

    pub fn local_gamers_mut(&mut self) -> impl Iterator<Item = &mut Gamer> {
        let local = self.local;
        self.gamers.iter_mut().filter(move |g| g.machine == local)
    }

    pub fn add_gamer(&mut self, gamer: Gamer) {
        self.allocated_ids.remove(&gamer.id);
        self.events.push_back(SessionEvent::GamerJoined(gamer.id));
        self.gamers.push(gamer);
    }

    pub fn remove_gamer(&mut self, id: GamerId) -> Option<Gamer> {
        let index = self.gamers.iter().position(|g| g.id == id)?;
        self.events.push_back(SessionEvent::GamerLeft(id));
        Some(self.gamers.remove(index))
    }

    /// Host only: reserve the lowest free id for a gamer on `machine`, or
    /// `None` when the session is full
    pub fn allocate_gamer_id(&mut self, machine: PeerId) -> Option<GamerId> {
        let taken = self.gamers.len() + self.allocated_ids.len();
        if taken >= usize::try_from(self.settings.max_gamers).unwrap_or(0) {
            return None;
        }
        let id = (0..=MAX_GAMER_ID).find(|id| self.gamer(*id).is_none() && !self.allocated_ids.contains_key(id))?;
        self.allocated_ids.insert(id, machine);
        Some(id)
    }

    pub fn allocation_owner(&self, id: GamerId) -> Option<PeerId> {
        self.allocated_ids.get(&id).copied()
    }

    pub fn queue_pending_gamer(&mut self, gamer: PendingGamer) {
        self.pending_local_gamers.push_back(gamer);
    }

    pub fn pending_gamers(&self) -> impl Iterator<Item = &PendingGamer> {
        self.pending_local_gamers.iter()
    }

    pub fn take_pending_gamer(&mut self) -> Option<PendingGamer> {
        self.pending_local_gamers.pop_front()
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }
}
