//! Network settings shared by peers and the master server
//!
//! Every field has a default so a partial JSON document (or none at all) is
//! a valid configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::SimulatedConditions;

// ============================================================================
// Defaults
// ============================================================================

/// Default application identifier (filters foreign traffic)
pub const DEFAULT_GAME_APP_ID: &str = "peer-session";

/// Default port a hosting peer binds
pub const DEFAULT_PORT: u16 = 14242;

/// Default master server port
pub const DEFAULT_MASTER_SERVER_PORT: u16 = 14243;

/// Extra time a host record survives past its registration interval
pub const REGISTRATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("could not resolve master server address '{0}'")]
    Resolve(String),
}

/// Tunables for session creation, discovery and registry heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub game_app_id: String,
    pub port: u16,
    pub master_server_address: String,
    pub master_server_port: u16,
    pub master_server_registration_interval_secs: u64,
    pub registration_grace_secs: u64,
    pub discovery_time_ms: u64,
    pub fully_connected_polling_ms: u64,
    pub fully_connected_timeout_ms: u64,
    /// TLS material for accepting QUIC connections. Every peer in a session
    /// accepts connections, the joining clients included: later joiners are
    /// introduced to them and connect in. Without both paths a QUIC endpoint
    /// can only connect out, and creating or joining a session fails.
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Upper bound of random extra latency on connected sends (testing only)
    pub simulated_latency_ms: u64,
    /// Chance in `0.0..=1.0` of dropping an unreliable message (testing only)
    pub simulated_loss: f32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            game_app_id: DEFAULT_GAME_APP_ID.to_string(),
            port: DEFAULT_PORT,
            master_server_address: "127.0.0.1".to_string(),
            master_server_port: DEFAULT_MASTER_SERVER_PORT,
            master_server_registration_interval_secs: 60,
            registration_grace_secs: REGISTRATION_GRACE.as_secs(),
            discovery_time_ms: 4000,
            fully_connected_polling_ms: 50,
            fully_connected_timeout_ms: 4000,
            cert_path: None,
            key_path: None,
            simulated_latency_ms: 0,
            simulated_loss: 0.0,
        }
    }
}

impl NetworkSettings {
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn registration_interval(&self) -> Duration {
        Duration::from_secs(self.master_server_registration_interval_secs)
    }

    pub fn registration_grace(&self) -> Duration {
        Duration::from_secs(self.registration_grace_secs)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_time_ms)
    }

    pub fn fully_connected_polling(&self) -> Duration {
        Duration::from_millis(self.fully_connected_polling_ms)
    }

    pub fn fully_connected_timeout(&self) -> Duration {
        Duration::from_millis(self.fully_connected_timeout_ms)
    }

    pub fn simulated_conditions(&self) -> SimulatedConditions {
        SimulatedConditions {
            latency: Duration::from_millis(self.simulated_latency_ms),
            loss: self.simulated_loss.clamp(0.0, 1.0),
        }
    }

    /// Resolve the master server host name to a socket address
    pub fn master_server_endpoint(&self) -> Result<SocketAddr, SettingsError> {
        let target = (self.master_server_address.as_str(), self.master_server_port);
        target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| SettingsError::Resolve(self.master_server_address.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = NetworkSettings::from_json_str("{}").unwrap();
        assert_eq!(settings, NetworkSettings::default());
        assert_eq!(settings.registration_interval(), Duration::from_secs(60));
        assert_eq!(settings.discovery_window(), Duration::from_millis(4000));
    }

    #[test]
    fn test_partial_override() {
        let settings = NetworkSettings::from_json_str(
            r#"{ "game_app_id": "tanks", "port": 3074, "cert_path": "certs/cert.pem" }"#,
        )
        .unwrap();
        assert_eq!(settings.game_app_id, "tanks");
        assert_eq!(settings.port, 3074);
        assert_eq!(settings.cert_path, Some(PathBuf::from("certs/cert.pem")));
        assert_eq!(settings.master_server_port, DEFAULT_MASTER_SERVER_PORT);
    }

    #[test]
    fn test_master_endpoint_resolves_literal() {
        let settings = NetworkSettings {
            master_server_address: "127.0.0.1".to_string(),
            master_server_port: 5000,
            ..NetworkSettings::default()
        };
        assert_eq!(
            settings.master_server_endpoint().unwrap(),
            "127.0.0.1:5000".parse().unwrap()
        );
    }

    #[test]
    fn test_simulated_conditions_from_json() {
        let settings =
            NetworkSettings::from_json_str(r#"{ "simulated_latency_ms": 120, "simulated_loss": 1.5 }"#).unwrap();
        let conditions = settings.simulated_conditions();
        assert_eq!(conditions.latency, Duration::from_millis(120));
        assert_eq!(conditions.loss, 1.0);
        assert!(NetworkSettings::default().simulated_conditions().is_ideal());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            NetworkSettings::from_json_str("{ port: }"),
            Err(SettingsError::Parse(_))
        ));
    }
}
