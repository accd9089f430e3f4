//! Session configuration shared by host and client.

use crate::layer::DefaultNetLayer;
use anyhow::{Context, Result};
use bomberboy_core::STR_MAX_ENCODE_LEN;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// Host and client session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address the host binds (or the client connects to).
    pub bind_address: IpAddr,
    /// Port shared by the stream listener and the datagram socket.
    pub port: u16,
    /// Player slots on the host.
    pub max_players: u16,
    /// Name advertised in query responses.
    pub server_name: String,
    /// Shared password; empty disables authentication.
    pub password: String,
    /// Display name sent by clients.
    pub player_name: String,
    /// How long a client waits for the handshake response.
    pub handshake_timeout_ms: u64,
    /// Malformed reliable frames tolerated before a client is dropped.
    pub max_malformed_frames: u32,
    /// Largest datagram sent or accepted.
    pub max_datagram_size: usize,
    /// Per-client queued stream bytes above which a client whose stream
    /// stops draining is considered stalled.
    pub reliable_backlog_limit: usize,
    /// How long a client may stay over the backlog limit without draining
    /// before the host drops it.
    pub backlog_stall_timeout_ms: u64,
    /// Addresses refused outright.
    pub banned: Vec<IpAddr>,
    /// When non-empty, the only addresses admitted.
    pub whitelist: Vec<IpAddr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7777,
            max_players: 8,
            server_name: "Unnamed Server".to_string(),
            password: String::new(),
            player_name: "Player".to_string(),
            handshake_timeout_ms: 5000,
            max_malformed_frames: 8,
            max_datagram_size: 1200,
            reliable_backlog_limit: 256 * 1024,
            backlog_stall_timeout_ms: 5000,
            banned: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Settings for a loopback session on an ephemeral port.
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse session config")
    }

    /// Socket address built from `bind_address` and `port`.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Backlog stall timeout as a duration.
    pub fn backlog_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.backlog_stall_timeout_ms)
    }

    /// Net layer enforcing the password, bans and whitelist.
    pub fn net_layer(&self) -> DefaultNetLayer {
        let mut layer = DefaultNetLayer::new(self.password.clone());
        for address in &self.banned {
            layer.ban(*address);
        }
        for address in &self.whitelist {
            layer.allow(*address);
        }
        layer
    }

    /// Clamp out-of-range values, warning about each.
    pub fn sanitized(mut self) -> Self {
        if self.max_players == 0 {
            warn!("max_players of 0 leaves no slots; using 1");
            self.max_players = 1;
        }
        if self.max_datagram_size < 64 {
            warn!(size = self.max_datagram_size, "max_datagram_size too small; using 64");
            self.max_datagram_size = 64;
        }
        if self.password.len() >= STR_MAX_ENCODE_LEN {
            warn!(
                len = self.password.len(),
                "password longer than the wire allows; truncating"
            );
            self.password = clamp_to_wire(&self.password);
        }
        self
    }
}

/// The prefix of `text` the string codec actually transmits.
fn clamp_to_wire(text: &str) -> String {
    let mut end = text.len().min(STR_MAX_ENCODE_LEN - 1);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerFlags, NetLayer};

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 7777);
        assert_eq!(config.max_players, 8);
        assert_eq!(config.server_name, "Unnamed Server");
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            port = 9000
            password = "hunter2"
            banned = ["10.0.0.5"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_players, 8);
        assert_eq!(config.banned, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert!(config.net_layer().flags().contains(LayerFlags::PASSWORD));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(SessionConfig::from_toml_str("port = \"high\"").is_err());
    }

    #[test]
    fn sanitize_clamps_zero_slots() {
        let config = SessionConfig {
            max_players: 0,
            ..SessionConfig::default()
        }
        .sanitized();
        assert_eq!(config.max_players, 1);
    }

    #[test]
    fn sanitize_clamps_passwords_to_the_wire_cap() {
        let config = SessionConfig {
            password: "p".repeat(200),
            ..SessionConfig::default()
        }
        .sanitized();
        assert_eq!(config.password.len(), STR_MAX_ENCODE_LEN - 1);

        // A multi-byte character straddling the cap is dropped whole.
        let config = SessionConfig {
            password: format!("{}é", "p".repeat(STR_MAX_ENCODE_LEN - 2)),
            ..SessionConfig::default()
        }
        .sanitized();
        assert_eq!(config.password, "p".repeat(STR_MAX_ENCODE_LEN - 2));
    }

    #[test]
    fn oversized_host_password_still_admits_the_same_secret() {
        let secret = "s".repeat(300);
        let host = SessionConfig {
            password: secret.clone(),
            ..SessionConfig::default()
        }
        .sanitized();
        let mut buffer = bomberboy_core::ByteBuffer::new();
        host.net_layer().encode_handshake(&mut buffer, "alice", &secret);
        let payload = buffer.into_inner();
        let mut incoming = bomberboy_core::ByteBuffer::from_wire(&payload);
        let mut controller = bomberboy_core::PlayerController::default();
        let verdict = host.net_layer().decode_handshake(
            &mut incoming,
            &bomberboy_core::DecodeContext::detached(),
            &mut controller,
        );
        assert_eq!(verdict, crate::layer::HandshakeVerdict::Accepted);
    }
}
