//! Pooled message buffers handed between the backend and the dispatcher

use crate::identity::PeerId;
use crate::pool::Recycle;
use crate::transport::Reliability;

/// Where an outgoing message goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Recipient {
    /// Every remote peer connected when the message is sent
    #[default]
    Broadcast,
    Peer(PeerId),
    /// A fixed set of peers, resolved when the message was queued
    Group(Vec<PeerId>),
}

/// Outgoing message: routing, delivery class and encoded bytes
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub recipient: Recipient,
    pub reliability: Reliability,
    pub channel: u8,
    pub data: Vec<u8>,
}

impl Default for OutgoingMessage {
    fn default() -> Self {
        OutgoingMessage {
            recipient: Recipient::Broadcast,
            reliability: Reliability::ReliableOrdered,
            channel: 0,
            data: Vec::new(),
        }
    }
}

impl Recycle for OutgoingMessage {
    fn reset(&mut self) {
        self.recipient = Recipient::Broadcast;
        self.reliability = Reliability::ReliableOrdered;
        self.channel = 0;
        self.data.clear();
    }
}

/// Incoming application data from a connected peer
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub data: Vec<u8>,
}

impl Recycle for IncomingMessage {
    fn reset(&mut self) {
        self.data.clear();
    }
}
