//! Outbound packet-loss conditioner for the unreliable socket.
//!
//! Used by tests and soak runs to exercise loss tolerance on loopback, where
//! real datagram loss never happens.

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Decides which outgoing datagrams are dropped.
#[derive(Debug, Clone, Default)]
pub enum LossConditioner {
    /// Deliver everything.
    #[default]
    Off,
    /// Drop each datagram with probability `percent`/100.
    Random {
        /// Loss percentage in `0.0..=100.0`.
        percent: f64,
        /// Seeded generator for reproducible runs.
        rng: StdRng,
    },
    /// Cycle through a fixed pattern; `true` drops.
    Pattern {
        /// Drop decisions, repeated.
        pattern: Vec<bool>,
        /// Position of the next decision.
        cursor: usize,
    },
}

impl LossConditioner {
    /// Random loss reproducible from `seed`.
    pub fn random(percent: f64, seed: u64) -> Self {
        Self::Random {
            percent: percent.clamp(0.0, 100.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Scripted loss following `pattern`.
    pub fn pattern(pattern: Vec<bool>) -> Self {
        if pattern.is_empty() {
            return Self::Off;
        }
        Self::Pattern { pattern, cursor: 0 }
    }

    /// Whether the next datagram should be dropped.
    pub fn should_drop(&mut self) -> bool {
        match self {
            Self::Off => false,
            Self::Random { percent, rng } => *percent > rng.gen_range(0.0..100.0),
            Self::Pattern { pattern, cursor } => {
                let drop = pattern[*cursor % pattern.len()];
                *cursor = (*cursor + 1) % pattern.len();
                drop
            }
        }
    }
}
