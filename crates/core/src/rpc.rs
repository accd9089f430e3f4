//! Remote procedure call descriptors, requests and dispatch outcomes.

use crate::buffer::ByteBuffer;
use crate::codec::{CodecError, Decode, DecodeContext, Encode};
use thiserror::Error;

/// Largest encoded RPC argument block or sync-var value. Leaves room for
/// the message and request headers inside one `u16`-length frame.
pub const MAX_PARAMS_LEN: usize = u16::MAX as usize - 64;

/// Transport an RPC or sync-var travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketClass {
    /// Ordered, loss-free stream.
    Reliable,
    /// Datagrams that may be dropped or reordered.
    Unreliable,
}

/// Who may call an RPC and where it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallingMode {
    /// Executes on the host.
    Host = 1,
    /// Executes on the owning endpoint.
    Owner = 2,
    /// Executes on the host and every remote.
    Broadcast = 3,
}

impl CallingMode {
    /// Wire discriminant.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Host),
            2 => Some(Self::Owner),
            3 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

impl Encode for CallingMode {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.to_u8().encode(buffer);
    }
}

impl Decode for CallingMode {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let raw = u8::decode(buffer, cx)?;
        Self::from_u8(raw).ok_or(CodecError::InvalidEnum {
            kind: "CallingMode",
            value: raw as u64,
        })
    }
}

/// Registered shape of one RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcInfo {
    /// Dense declaration ordinal, parents first.
    pub index: u16,
    /// Calling mode.
    pub mode: CallingMode,
    /// Transport.
    pub socket: SocketClass,
}

/// An encoded call waiting to be sent or executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// RPC ordinal.
    pub index: u16,
    /// Calling mode the caller registered.
    pub mode: CallingMode,
    /// Encoded arguments in wire order.
    pub params: Vec<u8>,
}

impl Encode for RpcRequest {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.index.encode(buffer);
        self.mode.encode(buffer);
        debug_assert!(self.params.len() <= MAX_PARAMS_LEN, "oversized RPC params");
        let len = self.params.len().min(u16::MAX as usize);
        (len as u16).encode(buffer);
        buffer.push_slice(&self.params[..len]);
    }
}

impl Decode for RpcRequest {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let index = u16::decode(buffer, cx)?;
        let mode = CallingMode::decode(buffer, cx)?;
        let len = u16::decode(buffer, cx)? as usize;
        let params = buffer.pop_bytes(len).ok_or(CodecError::UnexpectedEnd {
            needed: len,
            remaining: buffer.len(),
        })?;
        Ok(Self {
            index,
            mode,
            params,
        })
    }
}

/// Destination of a queued RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    /// The host.
    Host,
    /// One client, by player id.
    Client(u16),
    /// Every connected remote.
    AllRemotes,
}

/// An RPC request sitting in an object's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRpc {
    /// The request.
    pub request: RpcRequest,
    /// Where it goes.
    pub target: RpcTarget,
}

/// Failures while executing an inbound RPC or sync-var.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No RPC or sync-var is registered at this index.
    #[error("no entry registered at index {0}")]
    UnknownIndex(u16),
    /// Arguments did not decode; nothing was invoked.
    #[error("failed to decode arguments: {0}")]
    Decode(#[from] CodecError),
    /// The caller's role may not invoke this RPC.
    #[error("insufficient rights to call '{0}'")]
    RightsViolation(String),
    /// The table was asked to act on an object of another type.
    #[error("replication table for {expected} applied to another type")]
    TypeMismatch {
        /// Type the table was built for.
        expected: &'static str,
    },
}

/// What `call_rpc` did with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Executed locally only.
    Executed,
    /// Queued for the network only.
    Queued(RpcTarget),
    /// Executed locally and queued for the network.
    ExecutedAndQueued(RpcTarget),
    /// Refused: the local role lacks the rights for this calling mode.
    Denied,
    /// Dropped: the object is not registered with the session.
    Discarded,
    /// No RPC of that name exists, or its arguments failed to decode.
    Failed,
    /// Refused: the encoded arguments exceed [`MAX_PARAMS_LEN`]. Nothing
    /// ran and nothing was queued.
    TooLarge,
}

impl CallOutcome {
    /// Whether the call ran on this endpoint.
    pub fn executed_locally(self) -> bool {
        matches!(self, Self::Executed | Self::ExecutedAndQueued(_))
    }

    /// Network destination, if anything was queued.
    pub fn queued(self) -> Option<RpcTarget> {
        match self {
            Self::Queued(target) | Self::ExecutedAndQueued(target) => Some(target),
            _ => None,
        }
    }
}
