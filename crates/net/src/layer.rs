//! Pluggable admission policy run during the handshake.

use crate::identity::NetIdentity;
use crate::protocol::ResponseCode;
use bomberboy_core::{ByteBuffer, Decode, DecodeContext, Encode, PlayerController};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, warn};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Capabilities advertised in query responses.
    pub struct LayerFlags: u8 {
        /// A password is required to connect.
        const PASSWORD = 0b0000_0001;
        /// Only whitelisted addresses may connect.
        const WHITELIST = 0b0000_0010;
    }
}

impl Default for LayerFlags {
    fn default() -> Self {
        LayerFlags::empty()
    }
}

/// Outcome of decoding a connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVerdict {
    /// Player admitted; the controller has been named.
    Accepted,
    /// Payload could not be parsed.
    BadRequest,
    /// Credentials rejected.
    BadAuthentication,
}

impl From<HandshakeVerdict> for ResponseCode {
    fn from(verdict: HandshakeVerdict) -> Self {
        match verdict {
            HandshakeVerdict::Accepted => ResponseCode::Accepted,
            HandshakeVerdict::BadRequest => ResponseCode::BadRequest,
            HandshakeVerdict::BadAuthentication => ResponseCode::BadAuthentication,
        }
    }
}

/// Admission policy shared by host and client.
pub trait NetLayer {
    /// Advertised flags.
    fn flags(&self) -> LayerFlags;

    /// Client side: append the connect payload.
    fn encode_handshake(&self, buffer: &mut ByteBuffer, player_name: &str, password: &str);

    /// Host side: read the connect payload and name the new controller.
    fn decode_handshake(
        &self,
        buffer: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
        controller: &mut PlayerController,
    ) -> HandshakeVerdict;

    /// Host side: address-based gate run before any request is served.
    fn check_admission(&self, _identity: &NetIdentity) -> Result<(), ResponseCode> {
        Ok(())
    }
}

/// Name-and-password layer with optional ban list and whitelist.
#[derive(Debug, Clone, Default)]
pub struct DefaultNetLayer {
    password: String,
    banned: HashSet<IpAddr>,
    whitelist: HashSet<IpAddr>,
    flags: LayerFlags,
}

impl DefaultNetLayer {
    /// Layer requiring `password` when it is non-empty.
    pub fn new(password: impl Into<String>) -> Self {
        let password = password.into();
        let mut flags = LayerFlags::empty();
        flags.set(LayerFlags::PASSWORD, !password.is_empty());
        Self {
            password,
            flags,
            ..Self::default()
        }
    }

    /// Refuse every request from `address`.
    pub fn ban(&mut self, address: IpAddr) {
        self.banned.insert(address);
    }

    /// Lift a ban.
    pub fn unban(&mut self, address: &IpAddr) {
        self.banned.remove(address);
    }

    /// Restrict admission to whitelisted addresses.
    pub fn allow(&mut self, address: IpAddr) {
        self.whitelist.insert(address);
        self.flags.insert(LayerFlags::WHITELIST);
    }
}

impl NetLayer for DefaultNetLayer {
    fn flags(&self) -> LayerFlags {
        self.flags
    }

    fn encode_handshake(&self, buffer: &mut ByteBuffer, player_name: &str, password: &str) {
        player_name.encode(buffer);
        password.encode(buffer);
    }

    fn decode_handshake(
        &self,
        buffer: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
        controller: &mut PlayerController,
    ) -> HandshakeVerdict {
        let (name, password) = match <(String, String)>::decode(buffer, cx) {
            Ok(fields) => fields,
            Err(err) => {
                debug!(%err, "Malformed connect payload");
                return HandshakeVerdict::BadRequest;
            }
        };
        if self.flags.contains(LayerFlags::PASSWORD) && password != self.password {
            warn!(player = %name, "Wrong password");
            return HandshakeVerdict::BadAuthentication;
        }
        controller.set_player_name(name);
        HandshakeVerdict::Accepted
    }

    fn check_admission(&self, identity: &NetIdentity) -> Result<(), ResponseCode> {
        if self.banned.contains(&identity.address) {
            return Err(ResponseCode::Banned);
        }
        if self.flags.contains(LayerFlags::WHITELIST) && !self.whitelist.contains(&identity.address) {
            return Err(ResponseCode::Banned);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn connect_payload(layer: &DefaultNetLayer, name: &str, password: &str) -> ByteBuffer {
        let mut buffer = ByteBuffer::new();
        layer.encode_handshake(&mut buffer, name, password);
        ByteBuffer::from_wire(buffer.data())
    }

    #[test]
    fn password_flag_follows_configuration() {
        assert!(DefaultNetLayer::new("secret").flags().contains(LayerFlags::PASSWORD));
        assert!(DefaultNetLayer::new("").flags().is_empty());
    }

    #[test]
    fn correct_password_names_the_controller() {
        let layer = DefaultNetLayer::new("secret");
        let mut pc = PlayerController::default();
        let mut payload = connect_payload(&layer, "alice", "secret");
        let verdict = layer.decode_handshake(&mut payload, &DecodeContext::detached(), &mut pc);
        assert_eq!(verdict, HandshakeVerdict::Accepted);
        assert_eq!(pc.player_name(), "alice");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let layer = DefaultNetLayer::new("secret");
        let mut pc = PlayerController::default();
        let mut payload = connect_payload(&layer, "mallory", "guess");
        let verdict = layer.decode_handshake(&mut payload, &DecodeContext::detached(), &mut pc);
        assert_eq!(verdict, HandshakeVerdict::BadAuthentication);
        assert_eq!(pc.player_name(), "");
    }

    #[test]
    fn empty_password_is_rejected_when_one_is_set() {
        let layer = DefaultNetLayer::new("secret");
        let mut pc = PlayerController::default();
        let mut payload = connect_payload(&layer, "mallory", "");
        let verdict = layer.decode_handshake(&mut payload, &DecodeContext::detached(), &mut pc);
        assert_eq!(verdict, HandshakeVerdict::BadAuthentication);
    }

    struct OpenLayer;

    impl NetLayer for OpenLayer {
        fn flags(&self) -> LayerFlags {
            LayerFlags::empty()
        }

        fn encode_handshake(&self, _buffer: &mut ByteBuffer, _player_name: &str, _password: &str) {}

        fn decode_handshake(
            &self,
            _buffer: &mut ByteBuffer,
            _cx: &DecodeContext<'_>,
            _controller: &mut PlayerController,
        ) -> HandshakeVerdict {
            HandshakeVerdict::Accepted
        }
    }

    #[test]
    fn layers_without_an_address_gate_admit_everyone() {
        let remote = NetIdentity::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 6000);
        assert_eq!(OpenLayer.check_admission(&remote), Ok(()));
    }

    #[test]
    fn truncated_payload_is_bad_request() {
        let layer = DefaultNetLayer::new("");
        let mut pc = PlayerController::default();
        let mut payload = ByteBuffer::from_wire(b"bob");
        let verdict = layer.decode_handshake(&mut payload, &DecodeContext::detached(), &mut pc);
        assert_eq!(verdict, HandshakeVerdict::BadRequest);
    }

    #[test]
    fn bans_and_whitelist_gate_admission() {
        let local = NetIdentity::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        let mut layer = DefaultNetLayer::new("");
        assert_eq!(layer.check_admission(&local), Ok(()));

        layer.ban(local.address);
        assert_eq!(layer.check_admission(&local), Err(ResponseCode::Banned));
        layer.unban(&local.address);

        layer.allow(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(layer.check_admission(&local), Err(ResponseCode::Banned));
        layer.allow(local.address);
        assert_eq!(layer.check_admission(&local), Ok(()));
    }
}
