//! Client errors.

use bomberboy_core::CodecError;
use bomberboy_net::ResponseCode;
use thiserror::Error;

/// Failures surfaced by connection attempts and queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The host answered with a rejection code.
    #[error("host refused the request: {0:?}")]
    Rejected(ResponseCode),

    /// No answer arrived in time.
    #[error("no response within the handshake timeout")]
    Timeout,

    /// The stream closed before an answer arrived.
    #[error("connection closed by the host")]
    Closed,

    /// The answer could not be parsed.
    #[error("malformed response: {0}")]
    BadResponse(#[from] CodecError),

    /// The session is already connected or connecting.
    #[error("session is already {0}")]
    Busy(&'static str),
}
