//! Typed component storage keyed by entity id.
//!
//! Grounded in the teacher's `rmg_core::GraphStore`: a flat map keyed by
//! opaque id, with per-record typed payload slots instead of one opaque
//! byte blob, since this schema is fixed (four component kinds) rather than
//! open-ended. All reads return an owned snapshot; writes stamp the tick at
//! which they occurred so the optimistic manager can reason about
//! versioning without re-deriving it from the action log.

mod components;

pub use components::{Combat, Health, Player, Position};

use duel_ids::EntityId;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Errors returned by [`EntityStore`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EntityStoreError {
    /// No entity exists with the given id.
    #[error("entity not found")]
    NotFound,
    /// The entity exists but does not carry the requested component.
    #[error("entity does not have the requested component")]
    TypeMismatch,
    /// The write would violate a component invariant (e.g. `Health` bounds).
    #[error("component write violates an invariant")]
    InvalidValue,
    /// The component is immutable after entity creation (e.g. `Player`).
    #[error("component is immutable after creation")]
    Immutable,
}

#[derive(Clone, Debug)]
struct Slot<C> {
    value: C,
    last_updated_tick: u64,
}

/// A component value together with the tick it was last written at.
#[derive(Clone, Debug)]
pub struct ComponentSnapshot<C> {
    /// The stored value at the time of the read.
    pub value: C,
    /// Tick at which this value was last written.
    pub last_updated_tick: u64,
}

#[derive(Default, Clone)]
struct EntityRecord {
    position: Option<Slot<Position>>,
    health: Option<Slot<Health>>,
    combat: Option<Slot<Combat>>,
    player: Option<Slot<Player>>,
}

/// Seals [`Component`] to the four fixed kinds the match engine understands.
mod sealed {
    pub trait Sealed {}
}

/// A component kind storable in [`EntityStore`].
///
/// Implemented only for [`Position`], [`Health`], [`Combat`], and [`Player`];
/// the trait is sealed so callers cannot extend the schema at the type
/// level, matching the spec's "fixed schema" requirement.
pub trait Component: sealed::Sealed + Clone + Sized {
    /// Whether this component may be overwritten after entity creation.
    const IMMUTABLE: bool;

    #[doc(hidden)]
    fn slot(record: &EntityRecord) -> &Option<Slot<Self>>;
    #[doc(hidden)]
    fn slot_mut(record: &mut EntityRecord) -> &mut Option<Slot<Self>>;
}

macro_rules! impl_component {
    ($ty:ty, $field:ident, $immutable:expr) => {
        impl sealed::Sealed for $ty {}
        impl Component for $ty {
            const IMMUTABLE: bool = $immutable;

            fn slot(record: &EntityRecord) -> &Option<Slot<Self>> {
                &record.$field
            }

            fn slot_mut(record: &mut EntityRecord) -> &mut Option<Slot<Self>> {
                &mut record.$field
            }
        }
    };
}

impl_component!(Position, position, false);
impl_component!(Health, health, false);
impl_component!(Combat, combat, false);
impl_component!(Player, player, true);

/// Initial component set supplied when creating an entity.
///
/// `player` is required; the others are optional so non-player entities
/// (future expansion: projectiles, hazards) remain representable, though the
/// current match runtime always supplies all four for player entities.
#[derive(Clone, Debug, Default)]
pub struct EntityComponents {
    /// Initial position, if any.
    pub position: Option<Position>,
    /// Initial health, if any.
    pub health: Option<Health>,
    /// Initial combat stats, if any.
    pub combat: Option<Combat>,
    /// Initial player identity, if any.
    pub player: Option<Player>,
}

/// Typed, per-match component storage.
///
/// No cross-entity transactions: a caller mutating two entities within one
/// action (e.g. `Attack`) is responsible for its own atomicity (in practice,
/// the optimistic manager buffers all writes for an update and applies them
/// together, then relies on rollback via pre-images on failure).
#[derive(Default)]
pub struct EntityStore {
    records: FxHashMap<EntityId, EntityRecord>,
}

impl EntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialises a new entity with the given id and initial components.
    ///
    /// Callers supply `id` (typically from a [`duel_ids::IdGenerator`]) so
    /// entity allocation and component seeding stay in the caller's control.
    pub fn create(&mut self, id: EntityId, components: EntityComponents, tick: u64) {
        let record = EntityRecord {
            position: components.position.map(|value| Slot {
                value,
                last_updated_tick: tick,
            }),
            health: components.health.map(|value| Slot {
                value,
                last_updated_tick: tick,
            }),
            combat: components.combat.map(|value| Slot {
                value,
                last_updated_tick: tick,
            }),
            player: components.player.map(|value| Slot {
                value,
                last_updated_tick: tick,
            }),
        };
        self.records.insert(id, record);
    }

    /// Reads a snapshot of component `C` on entity `id`.
    pub fn get<C: Component>(&self, id: EntityId) -> Result<ComponentSnapshot<C>, EntityStoreError> {
        let record = self.records.get(&id).ok_or(EntityStoreError::NotFound)?;
        let slot = C::slot(record).as_ref().ok_or(EntityStoreError::TypeMismatch)?;
        Ok(ComponentSnapshot {
            value: slot.value.clone(),
            last_updated_tick: slot.last_updated_tick,
        })
    }

    /// Writes component `C` on entity `id`, stamping `tick` as its new version.
    ///
    /// `Health` writes are rejected with [`EntityStoreError::InvalidValue`] if
    /// they would violate `current <= max`; `Player` writes are rejected with
    /// [`EntityStoreError::Immutable`] once the entity has been created.
    pub fn set<C: Component>(
        &mut self,
        id: EntityId,
        value: C,
        tick: u64,
    ) -> Result<(), EntityStoreError> {
        let record = self.records.get_mut(&id).ok_or(EntityStoreError::NotFound)?;
        let slot = C::slot_mut(record);
        if C::IMMUTABLE && slot.is_some() {
            return Err(EntityStoreError::Immutable);
        }
        *slot = Some(Slot {
            value,
            last_updated_tick: tick,
        });
        Ok(())
    }

    /// Removes an entity and all of its components.
    pub fn remove(&mut self, id: EntityId) -> Result<(), EntityStoreError> {
        self.records.remove(&id).map(|_| ()).ok_or(EntityStoreError::NotFound)
    }

    /// Returns `true` if an entity with this id exists.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }
}

// `Health::set` needs a dedicated invariant check; the generic `set` above
// can't express "validate before commit" per-type without specialization, so
// health writes go through this wrapper instead of the raw generic method.
impl EntityStore {
    /// Writes [`Health`], rejecting values that violate `current <= max`.
    pub fn set_health(&mut self, id: EntityId, value: Health, tick: u64) -> Result<(), EntityStoreError> {
        if !value.is_valid() {
            return Err(EntityStoreError::InvalidValue);
        }
        self.set(id, value, tick)
    }

    /// Writes [`Player`], rejecting names over [`Player::MAX_NAME_LEN`].
    pub fn set_player(&mut self, id: EntityId, value: Player, tick: u64) -> Result<(), EntityStoreError> {
        if !value.is_valid() {
            return Err(EntityStoreError::InvalidValue);
        }
        self.set(id, value, tick)
    }
}
