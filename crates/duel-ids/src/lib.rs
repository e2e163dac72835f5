//! Opaque identifiers shared across the duel match engine.
//!
//! Every identifier here is a 128-bit value with no structural meaning to
//! callers; ordering, hashing, and equality are the only operations other
//! crates are allowed to depend on. New values come from an [`IdGenerator`],
//! never from ad-hoc construction, so that tests can pin deterministic
//! sequences (see [`IdGenerator::from_seed`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(pub u128);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }
    };
}

opaque_id!(EntityId, "Identifier for a single entity within one match.");
opaque_id!(MatchId, "Identifier for a match, stable for its entire lifecycle.");
opaque_id!(SessionId, "Identifier for a session bound to one (player, match).");

/// Strictly increasing identifier for an optimistic update within a match.
///
/// Unlike the 128-bit ids above this is a per-match `u64` counter: the
/// optimistic manager relies on simple arithmetic ordering, not opacity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateId(pub u64);

/// Opaque public key for a player's wallet.
///
/// The runtime never validates signatures itself (out of scope per the
/// transport/auth layer); it only needs a stable, comparable identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PublicKey(pub [u8; 32]);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Monotonic generator for 128-bit ids.
///
/// Ids are `(salt << 64) | counter`: stable within a process, unique across
/// processes that are seeded with distinct salts, and strictly ordered for
/// tie-breaking within a single `IdGenerator`. Tests construct one with
/// [`IdGenerator::from_seed`] so id sequences are reproducible.
#[derive(Debug)]
pub struct IdGenerator {
    salt: u128,
    counter: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator salted from a label (e.g. a process or host id).
    #[must_use]
    pub fn new(salt_label: &str) -> Self {
        let hash = blake3::hash(salt_label.as_bytes());
        let bytes = hash.as_bytes();
        let mut salt_bytes = [0u8; 16];
        salt_bytes.copy_from_slice(&bytes[..16]);
        Self {
            salt: u128::from_be_bytes(salt_bytes),
            counter: AtomicU64::new(0),
        }
    }

    /// Creates a generator with an explicit numeric seed, for deterministic tests.
    #[must_use]
    pub fn from_seed(seed: u128) -> Self {
        Self {
            salt: seed,
            counter: AtomicU64::new(0),
        }
    }

    fn next_raw(&self) -> u128 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        self.salt ^ u128::from(counter)
    }

    /// Allocates a new entity id.
    pub fn entity_id(&self) -> EntityId {
        EntityId(self.next_raw())
    }

    /// Allocates a new match id.
    pub fn match_id(&self) -> MatchId {
        MatchId(self.next_raw())
    }

    /// Allocates a new session id.
    pub fn session_id(&self) -> SessionId {
        SessionId(self.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_distinct_and_ordered_by_allocation() {
        let gen = IdGenerator::from_seed(7);
        let a = gen.entity_id();
        let b = gen.entity_id();
        assert_ne!(a, b);
    }

    #[test]
    fn same_seed_yields_same_sequence() {
        let gen_a = IdGenerator::from_seed(42);
        let gen_b = IdGenerator::from_seed(42);
        assert_eq!(gen_a.entity_id(), gen_b.entity_id());
        assert_eq!(gen_a.match_id(), gen_b.match_id());
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let id = EntityId(255);
        assert_eq!(format!("{id}").len(), 32);
    }
}
