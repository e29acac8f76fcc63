//! Connection lifecycle messages

use crate::backend::Recipient;
use crate::identity::PeerId;
use crate::session::state::{MachineStatus, SessionEvent, SessionState};
use crate::wire::{WireError, WireReader, WireWriter};

use super::flow::check_fully_connected;
use super::{
    require_host, require_known, Anomaly, BackendCommand, GamerJoined, MessageContext, MessageKind, MessageReceiver,
    MessageSender, ReceiveError, SessionStateChanged,
};

// ============================================================================
// ConnectionAcknowledged
// ============================================================================

/// First message on every new connection, in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionAcknowledged;

impl MessageSender for ConnectionAcknowledged {
    fn kind(&self) -> MessageKind {
        MessageKind::ConnectionAcknowledged
    }

    fn encode(&self, _w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        Ok(())
    }
}

pub(crate) struct ConnectionAcknowledgedReceiver;

impl MessageReceiver for ConnectionAcknowledgedReceiver {
    fn receive(&self, _r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        require_known(ctx.state, sender)?;

        let local_gamers: Vec<u8> = ctx.state.local_gamers().map(|g| g.id).collect();
        for id in local_gamers {
            ctx.send(&GamerJoined { id }, Recipient::Peer(sender));
        }

        if ctx.state.is_host() {
            let others: Vec<PeerId> = ctx
                .state
                .remote_machine_ids()
                .into_iter()
                .filter(|id| *id != sender)
                .collect();
            ctx.send(&SessionStateChanged, Recipient::Peer(sender));
            ctx.send(
                &ConnectToAllRequest {
                    machines: others.clone(),
                },
                Recipient::Peer(sender),
            );
            for other in others {
                ctx.command(BackendCommand::Introduce {
                    client: sender,
                    host: other,
                });
            }
        }

        if ctx.state.is_fully_connected() {
            ctx.send(&FullyConnected, Recipient::Peer(sender));
        }
        Ok(())
    }
}

// ============================================================================
// ConnectToAllRequest
// ============================================================================

/// Host → new client: every other machine already in the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectToAllRequest {
    pub machines: Vec<PeerId>,
}

impl MessageSender for ConnectToAllRequest {
    fn kind(&self) -> MessageKind {
        MessageKind::ConnectToAllRequest
    }

    fn encode(&self, w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        let count = u8::try_from(self.machines.len()).map_err(|_| WireError::InvalidValue {
            field: "machine count",
            value: u8::MAX,
        })?;
        w.write_u8(count);
        for machine in &self.machines {
            w.write_peer_id(machine)?;
        }
        Ok(())
    }
}

pub(crate) struct ConnectToAllRequestReceiver;

impl MessageReceiver for ConnectToAllRequestReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let count = r.read_u8()?;
        let mut machines = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            machines.push(r.read_peer_id()?);
        }

        require_host(ctx.state, sender)?;
        if ctx.state.is_host() {
            return Err(Anomaly::UnexpectedMessage("connect-to-all request sent to the host").into());
        }

        let local = ctx.state.local_identity();
        machines.retain(|id| *id != local && *id != sender);
        log::debug!("Host expects us to reach {} other machine(s)", machines.len());
        ctx.state.set_expected_machines(machines);
        check_fully_connected(ctx);
        Ok(())
    }
}

// ============================================================================
// FullyConnected
// ============================================================================

/// The sender is connected to every machine in the session
#[derive(Debug, Clone, Copy, Default)]
pub struct FullyConnected;

impl MessageSender for FullyConnected {
    fn kind(&self) -> MessageKind {
        MessageKind::FullyConnected
    }

    fn encode(&self, _w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        Ok(())
    }
}

pub(crate) struct FullyConnectedReceiver;

impl MessageReceiver for FullyConnectedReceiver {
    fn receive(&self, _r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        require_known(ctx.state, sender)?;
        if let Some(machine) = ctx.state.machine_mut(sender) {
            machine.status = MachineStatus::FullyConnected;
        }
        log::debug!("Machine {} is fully connected", sender);
        Ok(())
    }
}

// ============================================================================
// RemoveMachine
// ============================================================================

/// Host → everyone: drop this machine from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveMachine {
    pub machine: PeerId,
}

impl MessageSender for RemoveMachine {
    fn kind(&self) -> MessageKind {
        MessageKind::RemoveMachine
    }

    fn encode(&self, w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        w.write_peer_id(&self.machine)
    }
}

pub(crate) struct RemoveMachineReceiver;

impl MessageReceiver for RemoveMachineReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let machine = r.read_peer_id()?;

        require_host(ctx.state, sender)?;
        if machine == ctx.state.local_identity() {
            let reason = "removed from session by host".to_string();
            ctx.state.push_event(SessionEvent::SessionEnded { reason: reason.clone() });
            ctx.command(BackendCommand::Shutdown { reason });
            return Ok(());
        }
        if ctx.state.machine(machine).is_none() {
            return Err(Anomaly::UnknownMachine(machine).into());
        }

        log::info!("Host removed machine {}", machine);
        ctx.command(BackendCommand::Disconnect {
            peer: machine,
            reason: "removed from session by host".to_string(),
        });
        Ok(())
    }
}
