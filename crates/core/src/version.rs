//! Build version triples exchanged during the handshake.

use crate::buffer::ByteBuffer;
use crate::codec::{CodecError, Decode, DecodeContext, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic version triple; handshakes require an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major component.
    pub major: u16,
    /// Minor component.
    pub minor: u16,
    /// Patch component.
    pub patch: u16,
}

impl Version {
    /// Construct a version.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Encode for Version {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.major.encode(buffer);
        self.minor.encode(buffer);
        self.patch.encode(buffer);
    }
}

impl Decode for Version {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            major: u16::decode(buffer, cx)?,
            minor: u16::decode(buffer, cx)?,
            patch: u16::decode(buffer, cx)?,
        })
    }
}

/// Version of the engine core itself.
pub const ENGINE_VERSION: Version = Version::new(0, 1, 0);
