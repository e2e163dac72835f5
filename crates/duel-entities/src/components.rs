//! Fixed component schema for match entities.

use duel_ids::PublicKey;

/// Movement bounded to an axis-aligned arena box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    /// World-space X coordinate.
    pub x: i32,
    /// World-space Y coordinate.
    pub y: i32,
    /// World-space Z coordinate.
    pub z: i32,
    /// Maximum distance this entity may cover in one tick.
    pub speed: u16,
}

/// Hit points. Invariant: `0 <= current <= max`, enforced by
/// [`crate::EntityStore::set`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Health {
    /// Current hit points.
    pub current: u16,
    /// Maximum hit points.
    pub max: u16,
    /// Passive regeneration per tick (applied by the match runtime, not the store).
    pub regen_rate: u16,
}

impl Health {
    /// Returns `true` when `current` and `max` satisfy the store's invariant.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.current <= self.max
    }
}

/// Combat statistics and cooldown state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Combat {
    /// Base attack power.
    pub attack: u16,
    /// Damage reduction applied to incoming attacks.
    pub defense: u16,
    /// Critical-hit chance, percent in `0..=100`.
    pub crit_chance: u8,
    /// Tick at or after which this entity may attack again.
    pub cooldown_until_tick: u64,
}

/// Player identity. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Player {
    /// Wallet identity backing this player.
    pub wallet: PublicKey,
    /// Display name, at most 32 bytes.
    pub name: String,
    /// Player level, informational only to the runtime.
    pub level: u16,
}

impl Player {
    /// Maximum byte length of [`Player::name`].
    pub const MAX_NAME_LEN: usize = 32;

    /// Returns `true` when `name` respects [`Player::MAX_NAME_LEN`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.name.len() <= Self::MAX_NAME_LEN
    }
}
