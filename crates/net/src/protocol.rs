//! Wire protocol: handshake requests and responses, replication messages.
//!
//! A replication payload is a sequence of messages:
//!
//! ```text
//! message      := u16 source · u16 target · u8 kind · body
//! RPC          := u16 index · u8 callingMode · u16 paramBytes · params
//! SYNC         := u16 varIndex · u16 valueBytes · value
//! SPAWN        := u16 classId · u16 netId · u16 ownerId · initialPayload
//! DESTROY      := (empty)
//! initialPayload := u16 bytes · (u16 varIndex · u16 valueBytes · value)*
//! ```
//!
//! `source` is the sending endpoint's player id (0 for the host) and
//! `target` the object's network id; target 0 addresses the game itself.

use crate::layer::LayerFlags;
use bomberboy_core::{
    encode_to_vec, ByteBuffer, CallingMode, CodecError, Decode, DecodeContext, Encode, RpcRequest,
    Version, GAME_RPC_SWITCH_LEVEL,
};

/// Admission request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestType {
    /// Liveness check.
    Ping = 1,
    /// Join as a player.
    Connect = 2,
    /// Ask for server information.
    Query = 3,
}

impl Encode for RequestType {
    fn encode(&self, buffer: &mut ByteBuffer) {
        (*self as u16).encode(buffer);
    }
}

impl Decode for RequestType {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        match u16::decode(buffer, cx)? {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Connect),
            3 => Ok(Self::Query),
            value => Err(CodecError::InvalidEnum {
                kind: "RequestType",
                value: value as u64,
            }),
        }
    }
}

/// Handshake response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseCode {
    /// Connect accepted; body is the assigned player id.
    Accepted = 1,
    /// Ping or query answered.
    Responded = 2,
    /// Request could not be parsed.
    BadRequest = 3,
    /// Engine or game version differs.
    BadVersions = 4,
    /// Password rejected.
    BadAuthentication = 5,
    /// No free player slot.
    ServerFull = 6,
    /// Address is banned or not whitelisted.
    Banned = 7,
}

impl ResponseCode {
    /// Whether the code ends the handshake with a rejection.
    pub fn is_rejection(self) -> bool {
        !matches!(self, Self::Accepted | Self::Responded)
    }
}

impl Encode for ResponseCode {
    fn encode(&self, buffer: &mut ByteBuffer) {
        (*self as u16).encode(buffer);
    }
}

impl Decode for ResponseCode {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        match u16::decode(buffer, cx)? {
            1 => Ok(Self::Accepted),
            2 => Ok(Self::Responded),
            3 => Ok(Self::BadRequest),
            4 => Ok(Self::BadVersions),
            5 => Ok(Self::BadAuthentication),
            6 => Ok(Self::ServerFull),
            7 => Ok(Self::Banned),
            value => Err(CodecError::InvalidEnum {
                kind: "ResponseCode",
                value: value as u64,
            }),
        }
    }
}

/// Fixed prefix of every handshake request; the net layer payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Sender's engine version.
    pub engine_version: Version,
    /// Sender's game version.
    pub game_version: Version,
    /// What the sender wants.
    pub request: RequestType,
}

impl Encode for HandshakeHeader {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.engine_version.encode(buffer);
        self.game_version.encode(buffer);
        self.request.encode(buffer);
    }
}

impl Decode for HandshakeHeader {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            engine_version: Version::decode(buffer, cx)?,
            game_version: Version::decode(buffer, cx)?,
            request: RequestType::decode(buffer, cx)?,
        })
    }
}

/// Body of a `Responded` answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Connected players.
    pub players: u16,
    /// Player slots.
    pub max_players: u16,
    /// Advertised name.
    pub server_name: String,
    /// Net layer flags, e.g. whether a password is required.
    pub flags: LayerFlags,
}

impl Encode for ServerInfo {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.players.encode(buffer);
        self.max_players.encode(buffer);
        self.server_name.encode(buffer);
        self.flags.bits().encode(buffer);
    }
}

impl Decode for ServerInfo {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            players: u16::decode(buffer, cx)?,
            max_players: u16::decode(buffer, cx)?,
            server_name: String::decode(buffer, cx)?,
            flags: LayerFlags::from_bits_truncate(u8::decode(buffer, cx)?),
        })
    }
}

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Remote procedure call.
    Rpc = 1,
    /// Sync-var update.
    Sync = 2,
    /// Object creation.
    Spawn = 3,
    /// Object removal.
    Destroy = 4,
}

impl MessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Rpc),
            2 => Some(Self::Sync),
            3 => Some(Self::Spawn),
            4 => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// One sync-var value inside a sync or spawn message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    /// Variable ordinal.
    pub index: u16,
    /// Encoded value in wire order.
    pub value: Vec<u8>,
}

impl Encode for SyncEntry {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.index.encode(buffer);
        encode_bytes(&self.value, buffer);
    }
}

impl Decode for SyncEntry {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            index: u16::decode(buffer, cx)?,
            value: decode_bytes(buffer, cx)?,
        })
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Remote procedure call.
    Rpc(RpcRequest),
    /// Sync-var update.
    Sync(SyncEntry),
    /// Object creation with its initial sync-var snapshot.
    Spawn {
        /// Registered class id.
        class_id: u16,
        /// Network id of the new object.
        net_id: u16,
        /// Owning player id.
        owner_id: u16,
        /// Initial sync-var values.
        initial: Vec<SyncEntry>,
    },
    /// Object removal.
    Destroy,
}

impl MessageBody {
    /// Wire kind of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Rpc(_) => MessageKind::Rpc,
            Self::Sync(_) => MessageKind::Sync,
            Self::Spawn { .. } => MessageKind::Spawn,
            Self::Destroy => MessageKind::Destroy,
        }
    }
}

/// One addressed replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    /// Sending endpoint's player id (0 = host).
    pub source: u16,
    /// Target object's network id (0 = the game).
    pub target: u16,
    /// Body.
    pub body: MessageBody,
}

impl NetMessage {
    /// Spawn notice for `net_id`.
    pub fn spawn(class_id: u16, net_id: u16, owner_id: u16, initial: Vec<SyncEntry>) -> Self {
        Self {
            source: 0,
            target: net_id,
            body: MessageBody::Spawn {
                class_id,
                net_id,
                owner_id,
                initial,
            },
        }
    }

    /// Destroy notice for `net_id`.
    pub fn destroy(net_id: u16) -> Self {
        Self {
            source: 0,
            target: net_id,
            body: MessageBody::Destroy,
        }
    }

    /// Game-level `SwitchLevel` call sent by the host.
    pub fn switch_level(level_class_id: u16) -> Self {
        Self {
            source: 0,
            target: 0,
            body: MessageBody::Rpc(RpcRequest {
                index: GAME_RPC_SWITCH_LEVEL,
                mode: CallingMode::Broadcast,
                params: encode_to_vec(&level_class_id),
            }),
        }
    }
}

impl Encode for NetMessage {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.source.encode(buffer);
        self.target.encode(buffer);
        (self.body.kind() as u8).encode(buffer);
        match &self.body {
            MessageBody::Rpc(request) => request.encode(buffer),
            MessageBody::Sync(entry) => entry.encode(buffer),
            MessageBody::Spawn {
                class_id,
                net_id,
                owner_id,
                initial,
            } => {
                class_id.encode(buffer);
                net_id.encode(buffer);
                owner_id.encode(buffer);
                let mut snapshot = ByteBuffer::new();
                for entry in initial {
                    entry.encode(&mut snapshot);
                }
                encode_bytes(snapshot.data(), buffer);
            }
            MessageBody::Destroy => {}
        }
    }
}

impl Decode for NetMessage {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let source = u16::decode(buffer, cx)?;
        let target = u16::decode(buffer, cx)?;
        let raw_kind = u8::decode(buffer, cx)?;
        let kind = MessageKind::from_u8(raw_kind).ok_or(CodecError::InvalidEnum {
            kind: "MessageKind",
            value: raw_kind as u64,
        })?;
        let body = match kind {
            MessageKind::Rpc => MessageBody::Rpc(RpcRequest::decode(buffer, cx)?),
            MessageKind::Sync => MessageBody::Sync(SyncEntry::decode(buffer, cx)?),
            MessageKind::Spawn => {
                let class_id = u16::decode(buffer, cx)?;
                let net_id = u16::decode(buffer, cx)?;
                let owner_id = u16::decode(buffer, cx)?;
                let len = u16::decode(buffer, cx)? as usize;
                let mut snapshot = buffer.pop_buffer(len).ok_or(CodecError::UnexpectedEnd {
                    needed: len,
                    remaining: buffer.len(),
                })?;
                let mut initial = Vec::new();
                while !snapshot.is_empty() {
                    initial.push(SyncEntry::decode(&mut snapshot, cx)?);
                }
                MessageBody::Spawn {
                    class_id,
                    net_id,
                    owner_id,
                    initial,
                }
            }
            MessageKind::Destroy => MessageBody::Destroy,
        };
        Ok(Self {
            source,
            target,
            body,
        })
    }
}

fn encode_bytes(bytes: &[u8], buffer: &mut ByteBuffer) {
    debug_assert!(bytes.len() <= u16::MAX as usize, "oversized length-prefixed block");
    let len = bytes.len().min(u16::MAX as usize);
    (len as u16).encode(buffer);
    buffer.push_slice(&bytes[..len]);
}

fn decode_bytes(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Vec<u8>, CodecError> {
    let len = u16::decode(buffer, cx)? as usize;
    buffer.pop_bytes(len).ok_or(CodecError::UnexpectedEnd {
        needed: len,
        remaining: buffer.len(),
    })
}

/// Encode messages into one payload.
pub fn encode_messages(messages: &[NetMessage]) -> Vec<u8> {
    let mut buffer = ByteBuffer::new();
    for message in messages {
        message.encode(&mut buffer);
    }
    buffer.into_inner()
}

/// Decode a whole payload. Any malformed message rejects the payload.
pub fn decode_messages(payload: &[u8]) -> Result<Vec<NetMessage>, CodecError> {
    let mut buffer = ByteBuffer::from_wire(payload);
    let cx = DecodeContext::detached();
    let mut messages = Vec::new();
    while !buffer.is_empty() {
        messages.push(NetMessage::decode(&mut buffer, &cx)?);
    }
    Ok(messages)
}

/// Packs messages into payloads no larger than a byte budget.
#[derive(Debug)]
pub struct FrameBuilder {
    limit: usize,
    current: ByteBuffer,
    finished: Vec<Vec<u8>>,
}

impl FrameBuilder {
    /// Builder producing payloads of at most `limit` bytes (a single message
    /// larger than the limit gets a payload of its own).
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            current: ByteBuffer::new(),
            finished: Vec::new(),
        }
    }

    /// Append a message.
    pub fn push(&mut self, message: &NetMessage) {
        let mut encoded = ByteBuffer::new();
        message.encode(&mut encoded);
        if !self.current.is_empty() && self.current.len() + encoded.len() > self.limit {
            self.finished.push(std::mem::take(&mut self.current).into_inner());
        }
        self.current.push_slice(encoded.data());
    }

    /// Whether nothing was pushed.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.finished.is_empty()
    }

    /// Finished payloads in push order.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.current.is_empty() {
            self.finished.push(self.current.into_inner());
        }
        self.finished
    }
}

/// Encode a handshake response frame payload.
pub fn encode_response(code: ResponseCode, body: &[u8]) -> Vec<u8> {
    let mut buffer = ByteBuffer::new();
    code.encode(&mut buffer);
    buffer.push_slice(body);
    buffer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bomberboy_core::decode_from_slice;

    fn rpc_message() -> NetMessage {
        NetMessage {
            source: 2,
            target: 9,
            body: MessageBody::Rpc(RpcRequest {
                index: 1,
                mode: CallingMode::Host,
                params: vec![5, 6],
            }),
        }
    }

    #[test]
    fn rpc_message_layout() {
        let bytes = encode_to_vec(&rpc_message());
        assert_eq!(bytes, vec![2, 0, 9, 0, 1, 1, 0, 1, 2, 0, 5, 6]);
    }

    #[test]
    fn spawn_payload_is_length_prefixed() {
        let message = NetMessage::spawn(
            4,
            7,
            2,
            vec![SyncEntry {
                index: 0,
                value: vec![9],
            }],
        );
        let bytes = encode_to_vec(&message);
        // header(5) + class/net/owner(6) + snapshot length(2) + entry(2 + 2 + 1)
        assert_eq!(bytes.len(), 5 + 6 + 2 + 5);
        assert_eq!(&bytes[11..13], &[5, 0]);
        assert_eq!(decode_messages(&bytes), Ok(vec![message]));
    }

    #[test]
    fn switch_level_addresses_the_game() {
        let bytes = encode_to_vec(&NetMessage::switch_level(12));
        assert_eq!(bytes, vec![0, 0, 0, 0, 1, 0, 0, 3, 2, 0, 12, 0]);
    }

    #[test]
    fn payload_holds_many_messages() {
        let messages = vec![NetMessage::destroy(3), rpc_message(), NetMessage::destroy(4)];
        assert_eq!(decode_messages(&encode_messages(&messages)), Ok(messages));
    }

    #[test]
    fn trailing_garbage_rejects_the_payload() {
        let mut bytes = encode_messages(&[NetMessage::destroy(3)]);
        bytes.push(0xFF);
        assert!(decode_messages(&bytes).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            decode_messages(&[0, 0, 1, 0, 9]),
            Err(CodecError::InvalidEnum { kind: "MessageKind", value: 9 })
        ));
    }

    #[test]
    fn frame_builder_splits_on_budget() {
        let mut builder = FrameBuilder::new(12);
        for net_id in 1..=5 {
            builder.push(&NetMessage::destroy(net_id));
        }
        let payloads = builder.finish();
        assert_eq!(payloads.len(), 3);
        let total: usize = payloads.iter().map(|p| decode_messages(p).unwrap().len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn handshake_header_roundtrips() {
        let header = HandshakeHeader {
            engine_version: Version::new(0, 1, 0),
            game_version: Version::new(2, 0, 1),
            request: RequestType::Query,
        };
        assert_eq!(decode_from_slice::<HandshakeHeader>(&encode_to_vec(&header)), Ok(header));
        assert!(decode_from_slice::<HandshakeHeader>(&[0; 12]).is_err());
    }

    #[test]
    fn server_info_layout() {
        let info = ServerInfo {
            players: 1,
            max_players: 8,
            server_name: "Arena".into(),
            flags: LayerFlags::PASSWORD,
        };
        let bytes = encode_to_vec(&info);
        assert_eq!(bytes, vec![1, 0, 8, 0, b'A', b'r', b'e', b'n', b'a', 0, 1]);
        assert_eq!(decode_from_slice::<ServerInfo>(&bytes), Ok(info));
    }

    #[test]
    fn response_codes_roundtrip() {
        let payload = encode_response(ResponseCode::Accepted, &encode_to_vec(&3u16));
        let mut buffer = ByteBuffer::from_wire(&payload);
        let cx = DecodeContext::detached();
        assert_eq!(ResponseCode::decode(&mut buffer, &cx), Ok(ResponseCode::Accepted));
        assert_eq!(u16::decode(&mut buffer, &cx), Ok(3));
        assert!(ResponseCode::BadVersions.is_rejection());
    }
}
