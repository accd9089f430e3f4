#![warn(missing_docs)]
//! Client side of a session: connection state machine, replica maintenance
//! and one-shot server queries.

mod error;
mod query;
mod session;

pub use error::ClientError;
pub use query::{QueryReply, ServerQuery};
pub use session::{ClientSession, ConnectionState, DisconnectReason};
