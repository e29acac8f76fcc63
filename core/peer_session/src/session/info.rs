//! Public session info advertised through discovery
//!
//! The backend treats it as an opaque blob; this module gives it a shape and
//! bincode-encodes it.

use serde::{Deserialize, Serialize};

use super::state::{SessionProperties, SessionState, PROPERTY_COUNT};
use crate::master::HostListing;

/// How a hosted session can be found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// Same process or machine only, never advertised
    Local,
    /// Answers LAN discovery requests
    #[default]
    SystemLink,
    /// Registered with the master server
    PlayerMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPublicInfo {
    pub kind: SessionKind,
    pub host_gamertag: String,
    pub max_gamers: i32,
    pub private_gamer_slots: i32,
    pub current_gamer_count: u32,
    pub open_public_slots: i32,
    pub properties: Vec<Option<i32>>,
}

impl SessionPublicInfo {
    pub fn from_state(kind: SessionKind, state: &SessionState) -> Self {
        let settings = &state.settings;
        let current = state.gamers().len() as i32;
        SessionPublicInfo {
            kind,
            host_gamertag: state
                .local_gamers()
                .next()
                .map(|g| g.gamertag.clone())
                .unwrap_or_default(),
            max_gamers: settings.max_gamers,
            private_gamer_slots: settings.private_gamer_slots,
            current_gamer_count: current as u32,
            open_public_slots: (settings.max_gamers - settings.private_gamer_slots - current).max(0),
            properties: (0..PROPERTY_COUNT).map(|i| settings.properties.get(i)).collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// What a searching client is looking for
///
/// A host matches when its kind is the searched kind and every property set
/// in the search holds the same value on the host. Unset search properties
/// match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSearch {
    pub kind: SessionKind,
    pub properties: SessionProperties,
}

impl SessionSearch {
    pub fn new(kind: SessionKind, properties: SessionProperties) -> Self {
        SessionSearch { kind, properties }
    }

    pub fn matches(&self, info: &SessionPublicInfo) -> bool {
        if info.kind != self.kind {
            return false;
        }
        (0..PROPERTY_COUNT).all(|i| match self.properties.get(i) {
            Some(wanted) => info.properties.get(i).copied().flatten() == Some(wanted),
            None => true,
        })
    }

    /// Listings whose public info does not decode never match
    pub fn matches_listing(&self, listing: &HostListing) -> bool {
        match SessionPublicInfo::decode(&listing.public_info) {
            Ok(info) => self.matches(&info),
            Err(e) => {
                log::debug!("Undecodable session info from {}: {}", listing.identity, e);
                false
            }
        }
    }
}
