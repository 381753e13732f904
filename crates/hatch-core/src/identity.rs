//! Connection identity.
//!
//! An identity is a plain integer chosen by the client and presented in the
//! `Hello` frame. The server uses it to address a connection.
//!
//! `0` is reserved for "unset": envelopes built locally carry it until the
//! server stamps the sender's identity on arrival.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Integer handle of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl Identity {
    /// The unset identity.
    pub const UNSET: Identity = Identity(0);

    /// Wrap a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Generate a fresh, non-zero identity for a local client.
    ///
    /// Hashes a per-process random state together with the wall clock and a
    /// process-wide counter, so two sessions opened in the same instant
    /// still differ.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        loop {
            let mut hasher = RandomState::new().build_hasher();
            std::process::id().hash(&mut hasher);
            COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
                .hash(&mut hasher);
            let raw = hasher.finish();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// The raw integer.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved unset value.
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for Identity {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        let raw: u64 = digits
            .parse()
            .map_err(|_| IdentityParseError::NotAnInteger(s.to_string()))?;
        Ok(Self(raw))
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity must be an unsigned integer, got: {0}")]
    NotAnInteger(String),
}
