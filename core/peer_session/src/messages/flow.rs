//! Protocol steps reached from more than one place

use crate::backend::Recipient;
use crate::session::state::{Gamer, PendingGamer, SessionEvent};

use super::{FullyConnected, GamerIdRequest, GamerJoined, MessageContext};

/// Client side: once the host's settings are in and every machine it named
/// is connected, tell everyone and ask for ids for waiting local gamers
pub(crate) fn check_fully_connected(ctx: &mut MessageContext<'_>) {
    if ctx.state.is_fully_connected() || !ctx.state.is_mesh_complete() {
        return;
    }

    ctx.state.mark_fully_connected();
    ctx.state.push_event(SessionEvent::FullyConnected);
    log::info!(
        "Fully connected to {} machine(s)",
        ctx.state.remote_machine_ids().len()
    );
    ctx.send(&FullyConnected, Recipient::Broadcast);

    let host = ctx.state.host_identity();
    let waiting = ctx.state.pending_gamers().count();
    for _ in 0..waiting {
        ctx.send(&GamerIdRequest, Recipient::Peer(host));
    }
}

/// Bring a new local gamer into the session. The host assigns the id itself;
/// a client queues the gamer and asks the host once fully connected.
pub(crate) fn announce_local_gamer(ctx: &mut MessageContext<'_>, gamer: PendingGamer) {
    if ctx.state.is_host() {
        let local = ctx.state.local_identity();
        match ctx.state.allocate_gamer_id(local) {
            Some(id) => {
                ctx.state
                    .add_gamer(Gamer::new(id, local, gamer.display_name, gamer.gamertag));
                log::info!("Local gamer {} joined", id);
                ctx.send(&GamerJoined { id }, Recipient::Broadcast);
            }
            None => {
                log::info!("Session full, '{}' not added", gamer.display_name);
                ctx.state.push_event(SessionEvent::GamerRejected {
                    display_name: gamer.display_name,
                });
            }
        }
        return;
    }

    let ask_now = ctx.state.is_fully_connected();
    ctx.state.queue_pending_gamer(gamer);
    if ask_now {
        let host = ctx.state.host_identity();
        ctx.send(&GamerIdRequest, Recipient::Peer(host));
    }
}
