use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical timestamp marking "as of which change" a dataset has been observed.
///
/// Opaque to everything outside the tracking store: only comparison and
/// increment are meaningful. Strictly increasing on every committed local
/// mutation, never reused.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    pub const ZERO: Watermark = Watermark(0);

    /// The next watermark in sequence.
    pub fn next(self) -> Watermark {
        Watermark(self.0 + 1)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one replica (a client database or a server store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    /// Generate a fresh random replica id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
