//! Gamer membership and gamer state messages
//!
//! Ids come from the host: a client asks with `GamerIdRequest`, the host
//! reserves an id and answers with `GamerIdResponse`, and the owner then
//! announces the gamer to everyone with `GamerJoined`.

use crate::backend::Recipient;
use crate::identity::PeerId;
use crate::session::state::{Gamer, GamerId, SessionEvent, SessionState};
use crate::wire::{WireError, WireReader, WireWriter};

use super::{
    require_fully_connected, require_host, require_known, Anomaly, MessageContext, MessageKind, MessageReceiver,
    MessageSender, ReceiveError,
};

fn local_gamer<'s>(state: &'s SessionState, id: GamerId) -> Result<&'s Gamer, WireError> {
    state
        .gamer(id)
        .ok_or(WireError::InvalidValue { field: "gamer id", value: id })
}

/// The gamer must exist and belong to `sender`
fn require_owned(state: &SessionState, id: GamerId, sender: PeerId) -> Result<(), Anomaly> {
    match state.gamer(id) {
        Some(gamer) if gamer.machine == sender => Ok(()),
        Some(_) => Err(Anomaly::UnexpectedMessage("gamer belongs to another machine")),
        None => Err(Anomaly::UnknownGamer(id)),
    }
}

// ============================================================================
// GamerIdRequest / GamerIdResponse
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct GamerIdRequest;

impl MessageSender for GamerIdRequest {
    fn kind(&self) -> MessageKind {
        MessageKind::GamerIdRequest
    }

    fn encode(&self, _w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        Ok(())
    }
}

pub(crate) struct GamerIdRequestReceiver;

impl MessageReceiver for GamerIdRequestReceiver {
    fn receive(&self, _r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        if !ctx.state.is_host() {
            return Err(Anomaly::NotHost.into());
        }
        require_fully_connected(ctx.state, sender)?;

        let id = ctx.state.allocate_gamer_id(sender);
        match id {
            Some(id) => log::debug!("Gamer id {} reserved for {}", id, sender),
            None => log::info!("Session full, gamer id request from {} refused", sender),
        }
        ctx.send(&GamerIdResponse { id }, Recipient::Peer(sender));
        Ok(())
    }
}

/// Host → client: the reserved id, or none when the session is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamerIdResponse {
    pub id: Option<GamerId>,
}

impl MessageSender for GamerIdResponse {
    fn kind(&self) -> MessageKind {
        MessageKind::GamerIdResponse
    }

    fn encode(&self, w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        w.write_bool(self.id.is_some());
        if let Some(id) = self.id {
            w.write_u8(id);
        }
        Ok(())
    }
}

pub(crate) struct GamerIdResponseReceiver;

impl MessageReceiver for GamerIdResponseReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let id = if r.read_bool()? { Some(r.read_u8()?) } else { None };

        require_host(ctx.state, sender)?;
        if ctx.state.is_host() || ctx.state.pending_gamers().next().is_none() {
            return Err(Anomaly::UnexpectedMessage("no local gamer waiting for an id").into());
        }
        if let Some(id) = id {
            if ctx.state.gamer(id).is_some() {
                return Err(Anomaly::UnexpectedMessage("gamer id already in use").into());
            }
        }

        let Some(pending) = ctx.state.take_pending_gamer() else {
            return Ok(());
        };
        match id {
            Some(id) => {
                let local = ctx.state.local_identity();
                ctx.state
                    .add_gamer(Gamer::new(id, local, pending.display_name, pending.gamertag));
                log::info!("Local gamer {} joined", id);
                ctx.send(&GamerJoined { id }, Recipient::Broadcast);
            }
            None => {
                log::info!("Host has no room for '{}'", pending.display_name);
                ctx.state.push_event(SessionEvent::GamerRejected {
                    display_name: pending.display_name,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// GamerJoined
// ============================================================================

/// Announce a local gamer; fields are read from the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamerJoined {
    pub id: GamerId,
}

impl MessageSender for GamerJoined {
    fn kind(&self) -> MessageKind {
        MessageKind::GamerJoined
    }

    fn encode(&self, w: &mut WireWriter<'_>, state: &SessionState) -> Result<(), WireError> {
        let gamer = local_gamer(state, self.id)?;
        w.write_u8(gamer.id);
        w.write_str(&gamer.display_name)?;
        w.write_str(&gamer.gamertag)?;
        w.write_bool(gamer.is_private_slot);
        w.write_bool(gamer.is_ready);
        Ok(())
    }
}

pub(crate) struct GamerJoinedReceiver;

impl MessageReceiver for GamerJoinedReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let id = r.read_u8()?;
        let display_name = r.read_str()?;
        let gamertag = r.read_str()?;
        let is_private_slot = r.read_bool()?;
        let is_ready = r.read_bool()?;

        require_known(ctx.state, sender)?;
        let existing_owner = ctx.state.gamer(id).map(|g| g.machine);
        match existing_owner {
            Some(owner) if owner != sender => {
                return Err(Anomaly::UnexpectedMessage("gamer id owned by another machine").into());
            }
            Some(_) => {
                log::trace!("Gamer {} announced again by {}", id, sender);
                return Ok(());
            }
            None => {}
        }
        if ctx.state.is_host() && ctx.state.allocation_owner(id) != Some(sender) {
            return Err(Anomaly::UnexpectedMessage("gamer id was not assigned to the sender").into());
        }

        let mut gamer = Gamer::new(id, sender, display_name, gamertag);
        gamer.is_private_slot = is_private_slot;
        gamer.is_ready = is_ready;
        log::info!("Gamer {} ('{}') joined from {}", id, gamer.display_name, sender);
        ctx.state.add_gamer(gamer);
        Ok(())
    }
}

// ============================================================================
// GamerLeft
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamerLeft {
    pub id: GamerId,
}

impl MessageSender for GamerLeft {
    fn kind(&self) -> MessageKind {
        MessageKind::GamerLeft
    }

    fn encode(&self, w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        w.write_u8(self.id);
        Ok(())
    }
}

pub(crate) struct GamerLeftReceiver;

impl MessageReceiver for GamerLeftReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let id = r.read_u8()?;

        require_fully_connected(ctx.state, sender)?;
        require_owned(ctx.state, id, sender)?;

        ctx.state.remove_gamer(id);
        log::info!("Gamer {} left", id);
        Ok(())
    }
}

// ============================================================================
// GamerStateChanged
// ============================================================================

/// Names and flags of a local gamer, each group optional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamerStateChanged {
    pub id: GamerId,
    pub send_names: bool,
    pub send_flags: bool,
}

impl MessageSender for GamerStateChanged {
    fn kind(&self) -> MessageKind {
        MessageKind::GamerStateChanged
    }

    fn encode(&self, w: &mut WireWriter<'_>, state: &SessionState) -> Result<(), WireError> {
        let gamer = local_gamer(state, self.id)?;
        w.write_u8(gamer.id);

        w.write_bool(self.send_names);
        if self.send_names {
            w.write_str(&gamer.display_name)?;
            w.write_str(&gamer.gamertag)?;
        }

        w.write_bool(self.send_flags);
        if self.send_flags {
            w.write_bool(gamer.is_private_slot);
            w.write_bool(gamer.is_ready);
        }
        Ok(())
    }
}

pub(crate) struct GamerStateChangedReceiver;

impl MessageReceiver for GamerStateChangedReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let id = r.read_u8()?;
        let names = if r.read_bool()? {
            Some((r.read_str()?, r.read_str()?))
        } else {
            None
        };
        let flags = if r.read_bool()? {
            Some((r.read_bool()?, r.read_bool()?))
        } else {
            None
        };

        require_fully_connected(ctx.state, sender)?;
        require_owned(ctx.state, id, sender)?;

        let Some(gamer) = ctx.state.gamer_mut(id) else {
            return Err(Anomaly::UnknownGamer(id).into());
        };
        if let Some((display_name, gamertag)) = names {
            gamer.display_name = display_name;
            gamer.gamertag = gamertag;
        }
        if let Some((is_private_slot, is_ready)) = flags {
            gamer.is_private_slot = is_private_slot;
            gamer.is_ready = is_ready;
        }
        ctx.state.push_event(SessionEvent::GamerStateChanged(id));
        Ok(())
    }
}
