//! Per-client bookkeeping on the host.

use bomberboy_net::NetIdentity;
use std::time::{Duration, Instant};

/// An admitted player.
#[derive(Debug, Clone)]
pub struct NetClient {
    /// Address shared by the client's stream and datagram sockets.
    identity: NetIdentity,

    /// Player id assigned at admission; owner id of the client's objects.
    player_id: u16,

    /// Reliable frames from this client that failed to decode.
    malformed_frames: u32,

    joined_at: Instant,

    /// Since when the client's stream has sat over the backlog limit
    /// without draining.
    stalled_since: Option<Instant>,
}

impl NetClient {
    pub(crate) fn new(identity: NetIdentity, player_id: u16) -> Self {
        Self {
            identity,
            player_id,
            malformed_frames: 0,
            joined_at: Instant::now(),
            stalled_since: None,
        }
    }

    /// Address of the client.
    pub fn identity(&self) -> NetIdentity {
        self.identity
    }

    /// Assigned player id.
    pub fn player_id(&self) -> u16 {
        self.player_id
    }

    /// Malformed reliable frames received so far.
    pub fn malformed_frames(&self) -> u32 {
        self.malformed_frames
    }

    /// Time since admission.
    pub fn connected_for(&self) -> Duration {
        self.joined_at.elapsed()
    }

    /// Whether the client's stream is currently over the backlog limit
    /// and not draining.
    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    /// Record a flush that left the stream over the limit without writing
    /// anything. Returns how long the stall has lasted.
    pub(crate) fn note_stalled(&mut self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.stalled_since.get_or_insert(now))
    }

    /// Record a flush that made progress or left the stream under the limit.
    pub(crate) fn clear_stall(&mut self) {
        self.stalled_since = None;
    }

    /// Count a malformed frame and return the new total.
    pub(crate) fn note_malformed(&mut self) -> u32 {
        self.malformed_frames = self.malformed_frames.saturating_add(1);
        self.malformed_frames
    }
}
