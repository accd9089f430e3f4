#![warn(missing_docs)]
//! Networking shared by the host and client sessions.
//!
//! Transports are a non-blocking stream listener and a datagram socket bound
//! to the same port. Every frame is `u16 length · payload`; a datagram holds
//! exactly one frame.

mod conditioner;
mod config;
mod framing;
mod identity;
mod layer;
mod protocol;
mod socket;

pub use conditioner::LossConditioner;
pub use config::SessionConfig;
pub use framing::{
    decode_datagram, encode_frame, FrameDecoder, FrameError, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD,
};
pub use identity::NetIdentity;
pub use layer::{DefaultNetLayer, HandshakeVerdict, LayerFlags, NetLayer};
pub use protocol::{
    decode_messages, encode_messages, encode_response, FrameBuilder, HandshakeHeader,
    MessageBody, MessageKind, NetMessage, RequestType, ResponseCode, ServerInfo, SyncEntry,
};
pub use socket::{
    Packet, ReliableListener, ReliablePoll, SocketStats, StreamConnection, UnreliableSocket,
};
