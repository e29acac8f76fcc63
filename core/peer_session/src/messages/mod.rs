//! Internal message catalog
//!
//! Every session-level exchange is an internal message: one kind byte
//! followed by kind-specific fields. A message type implements
//! [`MessageSender`] to encode itself from the local session state; a unit
//! receiver implements [`MessageReceiver`] to decode, validate and apply it.
//!
//! ```text
//!  idx  kind                    from            channel / reliability
//!  ---  ----------------------  --------------  ------------------------
//!   0   ConnectionAcknowledged  any machine     1 reliable-ordered
//!   1   ConnectToAllRequest     host            1 reliable-ordered
//!   2   FullyConnected          any machine     1 reliable-ordered
//!   3   GamerIdRequest          client → host   1 reliable-ordered
//!   4   GamerIdResponse         host            1 reliable-ordered
//!   5   GamerJoined             any machine     1 reliable-ordered
//!   6   GamerLeft               any machine     1 reliable-ordered
//!   7   GamerStateChanged       any machine     1 reliable-ordered
//!   8   SessionStateChanged     host            1 reliable-ordered
//!   9   GameStarted             host            1 reliable-ordered
//!  10   GameEnded               host            1 reliable-ordered
//!  11   UserMessage             any machine     0 caller-chosen
//!  12   RemoveMachine           host            1 reliable-ordered
//! ```
//!
//! Receivers never partially apply a message: all fields are decoded and all
//! preconditions checked before the session state is touched.

use crate::identity::PeerId;
use crate::session::state::{GamerId, SessionState};
use crate::transport::Reliability;
use crate::wire::{WireError, WireReader, WireWriter};

mod catalog;
mod connection;
mod flow;
mod gamer;
mod outbox;
mod session_state;
mod user;

pub use catalog::{DispatchError, Dispatcher, MessageCatalog};
pub use connection::{ConnectToAllRequest, ConnectionAcknowledged, FullyConnected, RemoveMachine};
pub(crate) use flow::{announce_local_gamer, check_fully_connected};
pub use gamer::{GamerIdRequest, GamerIdResponse, GamerJoined, GamerLeft, GamerStateChanged};
pub use outbox::{BackendCommand, MessageContext, Outbox};
pub(crate) use session_state::end_game;
pub use session_state::{GameEnded, GameStarted, SessionStateChanged};
pub use user::UserMessage;

/// Channel for game data
pub const USER_CHANNEL: u8 = 0;

/// Channel for every internal message except [`UserMessage`]
pub const INTERNAL_CHANNEL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ConnectionAcknowledged = 0,
    ConnectToAllRequest = 1,
    FullyConnected = 2,
    GamerIdRequest = 3,
    GamerIdResponse = 4,
    GamerJoined = 5,
    GamerLeft = 6,
    GamerStateChanged = 7,
    SessionStateChanged = 8,
    GameStarted = 9,
    GameEnded = 10,
    UserMessage = 11,
    RemoveMachine = 12,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::ConnectionAcknowledged,
        MessageKind::ConnectToAllRequest,
        MessageKind::FullyConnected,
        MessageKind::GamerIdRequest,
        MessageKind::GamerIdResponse,
        MessageKind::GamerJoined,
        MessageKind::GamerLeft,
        MessageKind::GamerStateChanged,
        MessageKind::SessionStateChanged,
        MessageKind::GameStarted,
        MessageKind::GameEnded,
        MessageKind::UserMessage,
        MessageKind::RemoveMachine,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Delivery options for game data, mapped onto transport reliability classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendDataOptions {
    InOrder,
    Reliable,
    #[default]
    ReliableInOrder,
    Chat,
}

impl SendDataOptions {
    pub fn reliability(self) -> Reliability {
        match self {
            SendDataOptions::InOrder => Reliability::UnreliableSequenced,
            SendDataOptions::Reliable => Reliability::ReliableUnordered,
            SendDataOptions::ReliableInOrder => Reliability::ReliableOrdered,
            SendDataOptions::Chat => Reliability::ReliableUnordered,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A message that decoded fine but must not be applied
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Anomaly {
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("machine {0} is not the host")]
    HostClaim(PeerId),
    #[error("unknown gamer {0}")]
    UnknownGamer(GamerId),
    #[error("unknown machine {0}")]
    UnknownMachine(PeerId),
    #[error("message only valid on the host")]
    NotHost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed: {0}")]
    Malformed(#[from] WireError),
    #[error("suspicious: {0}")]
    Anomaly(#[from] Anomaly),
}

// ============================================================================
// Contracts
// ============================================================================

/// An internal message ready to be encoded
pub trait MessageSender {
    fn kind(&self) -> MessageKind;

    fn channel(&self) -> u8 {
        INTERNAL_CHANNEL
    }

    fn reliability(&self) -> Reliability {
        Reliability::ReliableOrdered
    }

    /// Write the fields after the kind byte
    fn encode(&self, w: &mut WireWriter<'_>, state: &SessionState) -> Result<(), WireError>;
}

/// Decodes one kind of internal message and applies it
pub trait MessageReceiver: Send + Sync {
    /// `r` is positioned after the kind byte
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError>;
}

// ============================================================================
// Shared precondition checks
// ============================================================================

/// The sender must be a known remote machine
fn require_known(state: &SessionState, sender: PeerId) -> Result<(), Anomaly> {
    match state.machine(sender) {
        Some(machine) if !machine.is_local => Ok(()),
        Some(_) => Err(Anomaly::UnexpectedMessage("message from the local machine")),
        None => Err(Anomaly::UnknownMachine(sender)),
    }
}

/// The sender must be the machine we recognise as host
fn require_host(state: &SessionState, sender: PeerId) -> Result<(), Anomaly> {
    require_known(state, sender)?;
    if sender == state.host_identity() {
        Ok(())
    } else {
        Err(Anomaly::HostClaim(sender))
    }
}

fn require_fully_connected(state: &SessionState, sender: PeerId) -> Result<(), Anomaly> {
    require_known(state, sender)?;
    match state.machine(sender) {
        Some(machine) if machine.is_fully_connected() => Ok(()),
        _ => Err(Anomaly::UnexpectedMessage("sender is not fully connected")),
    }
}
