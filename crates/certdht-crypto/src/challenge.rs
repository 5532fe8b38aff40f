//! Random challenges bound into every signed RPC.

use std::fmt;

use rand::RngCore;

/// Number of random bytes in a challenge.
pub const CHALLENGE_BYTES: usize = 8;

/// A single-use challenge: 8 random bytes rendered as 16 lower-case hex chars.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Challenge(String);

impl Challenge {
    /// Draw a fresh challenge from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap a challenge received from a peer. No format check is applied:
    /// whatever the peer sent is what its signature covers.
    pub fn from_wire(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", self.0)
    }
}
