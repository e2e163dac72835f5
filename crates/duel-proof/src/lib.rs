//! Canonical BLAKE3 hashing for the match engine's settlement proofs.
//!
//! Determinism contract
//! - Every hash here is computed over a fixed-size, architecture-independent
//!   byte encoding: values are written in a stable field order, and every
//!   variable-length chunk is prefixed with an 8-byte little-endian length.
//! - Callers build a [`CanonicalHasher`], feed fields in the order their type
//!   defines, and call [`CanonicalHasher::finalize`]. The same sequence of
//!   `write_*` calls on the same bytes always produces the same digest,
//!   regardless of platform or process.
//!
//! This mirrors the encoding discipline used by the teacher's snapshot
//! hashing: explicit ordering, explicit length prefixes, no reliance on
//! hashmap iteration order or native endianness.

use blake3::Hasher;

/// 256-bit digest produced by [`CanonicalHasher::finalize`].
pub type Digest = [u8; 32];

/// Incremental canonical hasher.
///
/// Wraps a BLAKE3 [`Hasher`] with helpers that make the encoding discipline
/// explicit at call sites instead of leaving byte layout to be reconstructed
/// by hand at every call site.
#[derive(Default)]
pub struct CanonicalHasher(Hasher);

impl CanonicalHasher {
    /// Creates a new, empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self(Hasher::new())
    }

    /// Writes a fixed-size byte array verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Writes a `u128` as 16 big-endian bytes.
    pub fn write_u128(&mut self, value: u128) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Writes a `u64` as 8 big-endian bytes.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Writes an `i32` as 4 big-endian bytes.
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Writes a `u16` as 2 big-endian bytes.
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Writes an 8-byte little-endian length prefix followed by `bytes`.
    ///
    /// Used for any field whose length is not fixed at compile time (player
    /// names, variable-length logs).
    pub fn write_prefixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    /// Consumes the hasher and returns the final digest.
    #[must_use]
    pub fn finalize(&self) -> Digest {
        self.0.finalize().into()
    }
}

/// Computes the canonical digest of a single field sequence in one call.
///
/// Convenience wrapper for call sites that just want `hash_of(|h| { ... })`
/// instead of managing a `CanonicalHasher` binding themselves.
pub fn hash_with<F>(build: F) -> Digest
where
    F: FnOnce(&mut CanonicalHasher),
{
    let mut hasher = CanonicalHasher::new();
    build(&mut hasher);
    hasher.finalize()
}

/// Folds a sequence of already-computed digests into one digest, in order.
///
/// Used to build the action-log root from per-action hashes and the final
/// state root from per-entity hashes; order matters and is the caller's
/// responsibility (the match runtime feeds entities/actions in a stable,
/// documented order).
#[must_use]
pub fn merge_digests<'a, I>(digests: I) -> Digest
where
    I: IntoIterator<Item = &'a Digest>,
{
    let mut hasher = CanonicalHasher::new();
    let mut count: u64 = 0;
    for digest in digests {
        hasher.write_bytes(digest);
        count += 1;
    }
    hasher.write_u64(count);
    hasher.finalize()
}
