//! Host-owned session settings and game phase

use crate::identity::PeerId;
use crate::session::state::{SessionEvent, SessionPhase, SessionProperties, SessionSettings, SessionState};
use crate::wire::{WireError, WireReader, WireWriter};

use super::{require_host, Anomaly, MessageContext, MessageKind, MessageReceiver, MessageSender, ReceiveError};

/// Host → clients: the full session settings
///
/// ```text
/// allow host migration (bool) | allow join in progress (bool)
/// max gamers (i32) | private slots (i32) | properties | phase (u8)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStateChanged;

impl MessageSender for SessionStateChanged {
    fn kind(&self) -> MessageKind {
        MessageKind::SessionStateChanged
    }

    fn encode(&self, w: &mut WireWriter<'_>, state: &SessionState) -> Result<(), WireError> {
        let settings = &state.settings;
        w.write_bool(settings.allow_host_migration);
        w.write_bool(settings.allow_join_in_progress);
        w.write_i32(settings.max_gamers);
        w.write_i32(settings.private_gamer_slots);
        settings.properties.pack(w);
        w.write_u8(settings.phase.to_u8());
        Ok(())
    }
}

pub(crate) struct SessionStateChangedReceiver;

impl MessageReceiver for SessionStateChangedReceiver {
    fn receive(&self, r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        let allow_host_migration = r.read_bool()?;
        let allow_join_in_progress = r.read_bool()?;
        let max_gamers = r.read_i32()?;
        let private_gamer_slots = r.read_i32()?;
        let properties = SessionProperties::unpack(r)?;
        let phase_byte = r.read_u8()?;
        let phase = SessionPhase::from_u8(phase_byte).ok_or(WireError::InvalidValue {
            field: "session phase",
            value: phase_byte,
        })?;

        require_host(ctx.state, sender)?;
        if ctx.state.is_host() {
            return Err(Anomaly::HostClaim(sender).into());
        }

        ctx.state.settings = SessionSettings {
            allow_host_migration,
            allow_join_in_progress,
            max_gamers,
            private_gamer_slots,
            properties,
            phase,
        };
        if let Some(host) = ctx.state.machine_mut(sender) {
            host.has_sent_session_state = true;
        }
        ctx.state.push_event(SessionEvent::SessionStateChanged);
        super::flow::check_fully_connected(ctx);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GameStarted;

impl MessageSender for GameStarted {
    fn kind(&self) -> MessageKind {
        MessageKind::GameStarted
    }

    fn encode(&self, _w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        Ok(())
    }
}

pub(crate) struct GameStartedReceiver;

impl MessageReceiver for GameStartedReceiver {
    fn receive(&self, _r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        require_host(ctx.state, sender)?;
        if ctx.state.settings.phase != SessionPhase::Lobby {
            return Err(Anomaly::UnexpectedMessage("game started outside the lobby").into());
        }
        ctx.state.settings.phase = SessionPhase::Playing;
        ctx.state.push_event(SessionEvent::GameStarted);
        log::info!("Game started");
        Ok(())
    }
}

/// Back to the lobby; every gamer's ready flag is cleared
#[derive(Debug, Clone, Copy, Default)]
pub struct GameEnded;

impl MessageSender for GameEnded {
    fn kind(&self) -> MessageKind {
        MessageKind::GameEnded
    }

    fn encode(&self, _w: &mut WireWriter<'_>, _state: &SessionState) -> Result<(), WireError> {
        Ok(())
    }
}

pub(crate) struct GameEndedReceiver;

impl MessageReceiver for GameEndedReceiver {
    fn receive(&self, _r: &mut WireReader<'_>, ctx: &mut MessageContext<'_>, sender: PeerId) -> Result<(), ReceiveError> {
        require_host(ctx.state, sender)?;
        if ctx.state.settings.phase != SessionPhase::Playing {
            return Err(Anomaly::UnexpectedMessage("game ended while not playing").into());
        }
        end_game(ctx.state);
        log::info!("Game ended");
        Ok(())
    }
}

pub(crate) fn end_game(state: &mut SessionState) {
    state.settings.phase = SessionPhase::Lobby;
    let ids: Vec<u8> = state.gamers().iter().map(|g| g.id).collect();
    for id in ids {
        if let Some(gamer) = state.gamer_mut(id) {
            gamer.is_ready = false;
        }
    }
    state.push_event(SessionEvent::GameEnded);
}
