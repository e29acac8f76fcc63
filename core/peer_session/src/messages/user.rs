//! Game data between gamers

use crate::identity::PeerId;
use crate::session::state::{GamerId, InboundPacket, SessionState, ALL_GAMERS};
use crate::transport::Reliability;
use crate::wire::{WireError, WireReader, WireWriter};

use super::{
    require_known, Anomaly, MessageContext, MessageKind, MessageReceiver, MessageSender, ReceiveError, SendDataOptions,
    USER_CHANNEL,
};

/// ```text
/// sender gamer (u8) | to all (bool) | recipient gamer (u8, 255 = all) | data (bytes)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub sender: GamerId,
    /// `None` addresses every gamer
    pub recipient: Option<GamerId>,
    pub options: SendDataOptions,
    pub data: Vec<u8>,
}

impl MessageSender for UserMessage {
    fn kind(&self) -> MessageKind {
        MessageKind::UserMessage
    }

    fn channel(&self) -> u8 {
        USER_CHANNEL
    }

    fn reliability(&self) -> Reliability {
        self.options.reliability()
    }

    fn encode(&self, w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        w.write_u8(self.sender);
        w.write_bool(self.recipient.is_none());
        w.write_u8(self.recipient.unwrap_or(ALL_GAMERS));
        w.write_bytes(&self.data);
        Ok(())
    }
}

pub(crate) struct UserMessageReceiver;

impl MessageReceiver for UserMessageReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let sender_gamer = r.read_u8()?;
        let to_all = r.read_bool()?;
        let recipient = r.read_u8()?;
        let data = r.read_bytes()?;

        require_known(ctx.state, sender)?;
        let sender_pending = ctx.state.machine(sender).is_some_and(|m| m.is_pending());
        if sender_pending || ctx.state.local_machine().is_pending() {
            return Err(Anomaly::UnexpectedMessage("user data while a machine is pending").into());
        }

        match ctx.state.gamer(sender_gamer) {
            // Its GamerJoined may still be in flight
            None => {
                log::trace!("User data from unknown gamer {} dropped", sender_gamer);
                return Ok(());
            }
            Some(gamer) if gamer.machine != sender => {
                return Err(Anomaly::UnexpectedMessage("sending gamer belongs to another machine").into());
            }
            Some(_) => {}
        }

        if to_all {
            for gamer in ctx.state.local_gamers_mut() {
                gamer.inbound.push_back(InboundPacket {
                    sender: sender_gamer,
                    data: data.clone(),
                });
            }
            return Ok(());
        }

        if ctx.state.gamer(recipient).is_none() {
            log::trace!("User data for unknown gamer {} dropped", recipient);
            return Ok(());
        }
        if !ctx.state.is_local_gamer(recipient) {
            return Err(Anomaly::UnexpectedMessage("recipient gamer is not local").into());
        }
        if let Some(gamer) = ctx.state.gamer_mut(recipient) {
            gamer.inbound.push_back(InboundPacket {
                sender: sender_gamer,
                data,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DispatchError, Dispatcher, Outbox};
    use crate::session::state::{Gamer, MachineStatus, SessionSettings};

    struct Fixture {
        state: SessionState,
        remote: PeerId,
    }

    /// Host with local gamers 0 and 1, remote gamer 5
    fn fixture() -> Fixture {
        let local = PeerId::generate().unwrap();
        let remote = PeerId::generate().unwrap();
        let mut state = SessionState::new_host(local, SessionSettings::default());
        state.add_remote_machine(remote);
        state.machine_mut(remote).unwrap().status = MachineStatus::FullyConnected;
        state.add_gamer(Gamer::new(0, local, "A".into(), "a".into()));
        state.add_gamer(Gamer::new(1, local, "B".into(), "b".into()));
        state.add_gamer(Gamer::new(5, remote, "R".into(), "r".into()));
        Fixture { state, remote }
    }

    fn bytes(message: &UserMessage, state: &SessionState) -> Vec<u8> {
        let mut buf = vec![MessageKind::UserMessage as u8];
        message.encode(&mut WireWriter::new(&mut buf), state).unwrap();
        buf
    }

    fn deliver(f: &mut Fixture, message: &UserMessage) -> Result<MessageKind, DispatchError> {
        let data = bytes(message, &f.state);
        let mut outbox = Outbox::new();
        Dispatcher::default().dispatch(&data, f.remote, &mut MessageContext::new(&mut f.state, &mut outbox))
    }

    #[test]
    fn test_to_all_reaches_every_local_gamer() {
        let mut f = fixture();
        let message = UserMessage {
            sender: 5,
            recipient: None,
            options: SendDataOptions::Reliable,
            data: b"hello".to_vec(),
        };
        assert_eq!(message.channel(), USER_CHANNEL);
        assert_eq!(message.reliability(), Reliability::ReliableUnordered);

        deliver(&mut f, &message).unwrap();
        for id in [0, 1] {
            let packet = f.state.gamer_mut(id).unwrap().receive_data().unwrap();
            assert_eq!(packet.sender, 5);
            assert_eq!(packet.data, b"hello".to_vec());
        }
        assert!(f.state.gamer(5).unwrap().inbound.is_empty());
    }

    #[test]
    fn test_directed_reaches_only_recipient() {
        let mut f = fixture();
        let message = UserMessage {
            sender: 5,
            recipient: Some(1),
            options: SendDataOptions::ReliableInOrder,
            data: vec![9],
        };
        deliver(&mut f, &message).unwrap();
        assert!(f.state.gamer(0).unwrap().inbound.is_empty());
        assert_eq!(f.state.gamer(1).unwrap().inbound.len(), 1);
    }

    #[test]
    fn test_directed_to_remote_gamer_is_anomaly() {
        let mut f = fixture();
        let message = UserMessage {
            sender: 5,
            recipient: Some(5),
            options: SendDataOptions::InOrder,
            data: vec![],
        };
        assert!(matches!(
            deliver(&mut f, &message),
            Err(DispatchError::Receive {
                source: ReceiveError::Anomaly(_),
                ..
            })
        ));
    }

    #[test]
    fn test_spoofed_sender_gamer_is_anomaly() {
        let mut f = fixture();
        let message = UserMessage {
            sender: 0,
            recipient: None,
            options: SendDataOptions::Chat,
            data: vec![1],
        };
        assert!(deliver(&mut f, &message).is_err());
        assert!(f.state.gamer(1).unwrap().inbound.is_empty());
    }

    #[test]
    fn test_unknown_sender_gamer_is_dropped_quietly() {
        let mut f = fixture();
        let message = UserMessage {
            sender: 42,
            recipient: None,
            options: SendDataOptions::ReliableInOrder,
            data: vec![1],
        };
        assert_eq!(deliver(&mut f, &message), Ok(MessageKind::UserMessage));
        assert!(f.state.gamer(0).unwrap().inbound.is_empty());
    }

    #[test]
    fn test_pending_sender_is_anomaly() {
        let mut f = fixture();
        f.state.machine_mut(f.remote).unwrap().status = MachineStatus::Pending;
        let message = UserMessage {
            sender: 5,
            recipient: None,
            options: SendDataOptions::ReliableInOrder,
            data: vec![1],
        };
        assert!(deliver(&mut f, &message).is_err());
    }
}
