//! Client identifiers (spec.md §3 "Client": "`id`: opaque string, unique per
//! process lifetime").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque, process-lifetime-unique client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Mint a fresh id. Called once per accepted TCP connection.
    pub fn generate() -> Self {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("client-{n}"))
    }

    /// Build an id with a caller-chosen value, for use in tests that need a
    /// stable, predictable identifier.
    #[cfg(test)]
    pub fn new_for_test(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
