//! Messages and backend commands queued during a tick
//!
//! Receivers run inside [`Backend::poll`](crate::backend::Backend::poll) and
//! cannot reach the backend, so whatever they want sent or done waits here
//! until the session flushes the outbox once per tick.

use std::collections::VecDeque;

use crate::backend::{Backend, OutgoingMessage, Recipient};
use crate::identity::PeerId;
use crate::pool::Pool;
use crate::session::state::SessionState;
use crate::wire::WireWriter;

use super::MessageSender;

/// Something only the backend can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCommand {
    Introduce { client: PeerId, host: PeerId },
    Disconnect { peer: PeerId, reason: String },
    Shutdown { reason: String },
}

#[derive(Default)]
pub struct Outbox {
    staging: Pool<OutgoingMessage>,
    messages: VecDeque<OutgoingMessage>,
    commands: VecDeque<BackendCommand>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `message` into a staging buffer. A broadcast is resolved to the
    /// remote machines known right now.
    pub fn enqueue(&mut self, message: &dyn MessageSender, recipient: Recipient, state: &SessionState) {
        let recipient = match recipient {
            Recipient::Broadcast => Recipient::Group(state.remote_machine_ids()),
            other => other,
        };
        if matches!(&recipient, Recipient::Group(ids) if ids.is_empty()) {
            log::trace!("{:?} has no recipients", message.kind());
            return;
        }

        let mut out = self.staging.acquire();
        out.recipient = recipient;
        out.reliability = message.reliability();
        out.channel = message.channel();

        let mut w = WireWriter::new(&mut out.data);
        w.write_u8(message.kind() as u8);
        match message.encode(&mut w, state) {
            Ok(()) => {
                log::trace!("Queued {:?} to {:?}", message.kind(), out.recipient);
                self.messages.push_back(out);
            }
            Err(e) => {
                log::warn!("Failed to encode {:?}: {}", message.kind(), e);
                self.staging.release(out);
            }
        }
    }

    pub fn push_command(&mut self, command: BackendCommand) {
        self.commands.push_back(command);
    }

    pub fn queued_messages(&self) -> impl Iterator<Item = &OutgoingMessage> {
        self.messages.iter()
    }

    pub fn queued_commands(&self) -> impl Iterator<Item = &BackendCommand> {
        self.commands.iter()
    }

    /// Pull a queued shutdown out of the command list
    pub fn take_shutdown_request(&mut self) -> Option<String> {
        let index = self
            .commands
            .iter()
            .position(|c| matches!(c, BackendCommand::Shutdown { .. }))?;
        match self.commands.remove(index) {
            Some(BackendCommand::Shutdown { reason }) => Some(reason),
            _ => None,
        }
    }

    /// Hand every queued message to the backend, then run queued commands
    pub fn flush(&mut self, backend: &mut Backend) {
        while let Some(message) = self.messages.pop_front() {
            if !backend.has_shutdown() {
                backend.send_to(message.recipient.clone(), &message.data, message.reliability, message.channel);
            }
            self.staging.release(message);
        }

        while let Some(command) = self.commands.pop_front() {
            if backend.has_shutdown() {
                continue;
            }
            match command {
                BackendCommand::Introduce { client, host } => {
                    if let Err(e) = backend.introduce(client, host) {
                        log::warn!("Introduction of {} to {} failed: {}", client, host, e);
                    }
                }
                BackendCommand::Disconnect { peer, reason } => backend.disconnect_peer(peer, &reason),
                BackendCommand::Shutdown { reason } => backend.shutdown(&reason),
            }
        }
    }
}

/// What a receiver may touch: the session state and the outbox
pub struct MessageContext<'a> {
    pub state: &'a mut SessionState,
    outbox: &'a mut Outbox,
}

impl<'a> MessageContext<'a> {
    pub fn new(state: &'a mut SessionState, outbox: &'a mut Outbox) -> Self {
        MessageContext { state, outbox }
    }

    pub fn send(&mut self, message: &dyn MessageSender, recipient: Recipient) {
        self.outbox.enqueue(message, recipient, self.state);
    }

    pub fn command(&mut self, command: BackendCommand) {
        self.outbox.push_command(command);
    }
}
