//! Kind → receiver table and the dispatcher that uses it

use crate::identity::PeerId;
use crate::wire::WireReader;

use super::connection::{ConnectToAllRequestReceiver, ConnectionAcknowledgedReceiver, FullyConnectedReceiver, RemoveMachineReceiver};
use super::gamer::{
    GamerIdRequestReceiver, GamerIdResponseReceiver, GamerJoinedReceiver, GamerLeftReceiver, GamerStateChangedReceiver,
};
use super::session_state::{GameEndedReceiver, GameStartedReceiver, SessionStateChangedReceiver};
use super::user::UserMessageReceiver;
use super::{MessageContext, MessageKind, MessageReceiver, ReceiveError};

/// One receiver per message kind, indexed by kind byte. Built once and
/// handed to the [`Dispatcher`].
pub struct MessageCatalog {
    receivers: Vec<Box<dyn MessageReceiver>>,
}

impl MessageCatalog {
    /// Every internal message at its fixed index
    pub fn standard() -> Self {
        let receivers: Vec<Box<dyn MessageReceiver>> = MessageKind::ALL
            .iter()
            .map(|kind| -> Box<dyn MessageReceiver> {
                match kind {
                    MessageKind::ConnectionAcknowledged => Box::new(ConnectionAcknowledgedReceiver),
                    MessageKind::ConnectToAllRequest => Box::new(ConnectToAllRequestReceiver),
                    MessageKind::FullyConnected => Box::new(FullyConnectedReceiver),
                    MessageKind::GamerIdRequest => Box::new(GamerIdRequestReceiver),
                    MessageKind::GamerIdResponse => Box::new(GamerIdResponseReceiver),
                    MessageKind::GamerJoined => Box::new(GamerJoinedReceiver),
                    MessageKind::GamerLeft => Box::new(GamerLeftReceiver),
                    MessageKind::GamerStateChanged => Box::new(GamerStateChangedReceiver),
                    MessageKind::SessionStateChanged => Box::new(SessionStateChangedReceiver),
                    MessageKind::GameStarted => Box::new(GameStartedReceiver),
                    MessageKind::GameEnded => Box::new(GameEndedReceiver),
                    MessageKind::UserMessage => Box::new(UserMessageReceiver),
                    MessageKind::RemoveMachine => Box::new(RemoveMachineReceiver),
                }
            })
            .collect();
        MessageCatalog { receivers }
    }

    /// Swap the receiver for one kind
    pub fn with_receiver(mut self, kind: MessageKind, receiver: Box<dyn MessageReceiver>) -> Self {
        self.receivers[kind.index()] = receiver;
        self
    }

    pub fn receiver(&self, kind: MessageKind) -> Option<&dyn MessageReceiver> {
        self.receivers.get(kind.index()).map(|r| r.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("empty message")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("{kind:?}: {source}")]
    Receive {
        kind: MessageKind,
        #[source]
        source: ReceiveError,
    },
}

pub struct Dispatcher {
    catalog: MessageCatalog,
}

impl Dispatcher {
    pub fn new(catalog: MessageCatalog) -> Self {
        Dispatcher { catalog }
    }

    /// Decode the kind byte and run the matching receiver
    pub fn dispatch(&self, data: &[u8], sender: PeerId, ctx: &mut MessageContext<'_>) -> Result<MessageKind, DispatchError> {
        let mut r = WireReader::new(data);
        let byte = r.read_u8().map_err(|_| DispatchError::Empty)?;
        let kind = MessageKind::from_u8(byte).ok_or(DispatchError::UnknownKind(byte))?;
        let receiver = self.catalog.receiver(kind).ok_or(DispatchError::UnknownKind(byte))?;

        log::trace!("{:?} from {}", kind, sender);
        receiver
            .receive(&mut r, ctx, sender)
            .map_err(|source| DispatchError::Receive { kind, source })?;
        Ok(kind)
    }

    /// Dispatch and log failures: anomalies at warn, malformed data at debug
    pub fn dispatch_logged(&self, data: &[u8], sender: PeerId, ctx: &mut MessageContext<'_>) {
        match self.dispatch(data, sender, ctx) {
            Ok(_) => {}
            Err(e @ DispatchError::Receive {
                source: ReceiveError::Anomaly(_),
                ..
            }) => log::warn!("Suspicious message from {} dropped: {}", sender, e),
            Err(e) => log::debug!("Malformed message from {} dropped: {}", sender, e),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new(MessageCatalog::standard())
    }
}
