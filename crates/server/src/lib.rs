#![warn(missing_docs)]
//! Authoritative host session.
//!
//! The host owns every replicated object. Each [`HostSession::update`] drains
//! the stream listener and the datagram socket, admits new players, executes
//! the RPCs clients are allowed to call and sends every client the spawns,
//! destroys, RPCs and sync-var changes produced since the previous update.

mod client;
mod host;
mod outbox;

pub use client::NetClient;
pub use host::HostSession;
