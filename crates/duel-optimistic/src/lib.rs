//! Optimistic update admission, conflict detection, confirmation, and rollback.
//!
//! State machine (spec §4.4):
//!
//! ```text
//!  Pending ──apply──▶ Applied ──confirm──▶ Confirmed
//!     │                   │
//!     │                   └──reject──▶ Rejected (rolled back)
//!     └──expire──▶ Expired (rolled back if Applied)
//! ```
//!
//! `admit` collapses the `Pending` step into the same call that transitions
//! to `Applied`: conflict and validation checks happen first, and only a
//! winning update is ever recorded, matching spec §7's rule that rejected
//! actions "never enter the log". Conflict detection is grounded in the
//! teacher's `rmg_core::footprint` independence check (see [`footprint`]).

mod footprint;

pub use footprint::{ComponentKind, Footprint};

use duel_entities::{Combat, EntityStore, EntityStoreError, Health, Position};
use duel_ids::{EntityId, SessionId, UpdateId};
use duel_proof::{hash_with, Digest};
use duel_validator::{validate, Action, ComponentWrite, RejectReason, ValidationContext, ValidationOutcome};
use rustc_hash::FxHashMap;
use tracing::instrument;

/// Lifecycle state of an [`OptimisticUpdate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimisticState {
    /// Applied to the store, awaiting confirmation from the settlement substrate.
    Applied,
    /// Confirmed; permanent for the remainder of the match.
    Confirmed,
    /// Rejected after being applied; rolled back.
    Rejected,
    /// Expired before confirmation arrived; rolled back.
    Expired,
}

/// A speculative state change tracked until it is confirmed, rejected, or expires.
#[derive(Clone, Debug)]
pub struct OptimisticUpdate {
    /// Identifier for this update, unique within its match.
    pub update_id: UpdateId,
    /// Entity the submitting session acts on behalf of.
    pub entity_id: EntityId,
    /// Session that submitted the underlying action.
    pub session_id: SessionId,
    /// The action this update applies.
    pub kind: Action,
    /// Canonical hash of the components' values before this update applied.
    pub pre_image_hash: Digest,
    /// Tick at which the update was submitted.
    pub submit_tick: u64,
    /// Tick at or after which an unconfirmed update is rolled back.
    pub expiry_tick: u64,
    /// Current lifecycle state.
    pub state: OptimisticState,
    prior_values: Vec<(ComponentWrite, u64)>,
    new_values: Vec<ComponentWrite>,
}

/// A compact, finalizable record of an admitted action (spec §3 `LoggedAction`).
#[derive(Clone, Debug)]
pub struct LoggedAction {
    /// The update this entry came from.
    pub update_id: UpdateId,
    /// Entity the action was performed on behalf of.
    pub entity_id: EntityId,
    /// Session that submitted the action.
    pub session_id: SessionId,
    /// The action itself.
    pub kind: Action,
    /// Tick at which it was applied.
    pub applied_tick: u64,
    /// Whether the substrate has confirmed this entry.
    pub confirmed: bool,
}

impl LoggedAction {
    /// Canonical digest of this entry, used to fold into the action-log root.
    #[must_use]
    pub fn digest(&self) -> Digest {
        hash_with(|h| {
            h.write_u64(self.update_id.0)
                .write_u128(self.entity_id.0)
                .write_u128(self.session_id.0)
                .write_u64(self.applied_tick);
        })
    }
}

/// Errors returned by [`OptimisticManager::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimisticError {
    /// The action's footprint overlaps a currently in-flight update.
    Conflict,
    /// The action validator rejected the action.
    Rejected(RejectReason),
    /// `Forfeit` was submitted to `admit`; it must be handled by the match
    /// runtime directly, since it is a terminal transition, not a speculative
    /// component write.
    NotOptimistic,
    /// The store reported an error while applying or rolling back effects.
    Store(EntityStoreError),
}

impl From<EntityStoreError> for OptimisticError {
    fn from(value: EntityStoreError) -> Self {
        Self::Store(value)
    }
}

/// Tracks every in-flight and finalized optimistic update for one match.
#[derive(Default)]
pub struct OptimisticManager {
    updates: FxHashMap<UpdateId, OptimisticUpdate>,
    in_flight: Vec<UpdateId>,
    log: FxHashMap<UpdateId, LoggedAction>,
    log_order: Vec<UpdateId>,
    next_id: u64,
}

impl OptimisticManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> UpdateId {
        self.next_id += 1;
        UpdateId(self.next_id)
    }

    /// Returns `true` if `footprint` overlaps any currently `Applied` update.
    fn conflicts(&self, footprint: &Footprint) -> bool {
        self.in_flight.iter().any(|id| {
            let Some(update) = self.updates.get(id) else {
                return false;
            };
            let existing = Footprint::from_action(update.entity_id, &update.kind);
            !existing.independent(footprint)
        })
    }

    /// Attempts to admit `action` submitted by `session_id` for `entity_id`.
    ///
    /// On success, writes the validated effects into `store` and returns the
    /// new update's id. Session authorization is the caller's responsibility
    /// (spec §4.2's `SessionRegistry::authorize`) — by the time an action
    /// reaches `admit`, it has already passed auth.
    #[instrument(skip(self, store, ctx), level = "debug")]
    #[allow(clippy::too_many_arguments)]
    pub fn admit(
        &mut self,
        store: &mut EntityStore,
        entity_id: EntityId,
        session_id: SessionId,
        action: Action,
        tick: u64,
        optimistic_ttl_ticks: u64,
        ctx: &ValidationContext,
    ) -> Result<UpdateId, OptimisticError> {
        if matches!(action, Action::Forfeit) {
            return Err(OptimisticError::NotOptimistic);
        }

        let footprint = Footprint::from_action(entity_id, &action);
        if !footprint.is_empty() && self.conflicts(&footprint) {
            return Err(OptimisticError::Conflict);
        }

        let effects = match validate(store, entity_id, &action, tick, ctx) {
            ValidationOutcome::Rejected(reason) => return Err(OptimisticError::Rejected(reason)),
            ValidationOutcome::Valid { effects, .. } => effects,
        };

        let prior_values = read_prior_values(store, &effects)?;
        let pre_image_writes: Vec<ComponentWrite> = prior_values.iter().map(|(write, _)| write.clone()).collect();
        let pre_image_hash = hash_component_writes(&pre_image_writes);

        for write in &effects {
            apply_write(store, write, tick)?;
        }

        let update_id = self.allocate_id();
        let update = OptimisticUpdate {
            update_id,
            entity_id,
            session_id,
            kind: action,
            pre_image_hash,
            submit_tick: tick,
            expiry_tick: tick + optimistic_ttl_ticks,
            state: OptimisticState::Applied,
            prior_values,
            new_values: effects,
        };
        self.updates.insert(update_id, update);
        self.in_flight.push(update_id);
        self.log.insert(
            update_id,
            LoggedAction {
                update_id,
                entity_id,
                session_id,
                kind: action,
                applied_tick: tick,
                confirmed: false,
            },
        );
        self.log_order.push(update_id);
        Ok(update_id)
    }

    /// Confirms a previously applied update.
    pub fn confirm(&mut self, update_id: UpdateId) -> Result<(), OptimisticError> {
        let update = self.updates.get_mut(&update_id).ok_or(OptimisticError::Conflict)?;
        update.state = OptimisticState::Confirmed;
        self.in_flight.retain(|id| *id != update_id);
        if let Some(entry) = self.log.get_mut(&update_id) {
            entry.confirmed = true;
        }
        Ok(())
    }

    /// Rejects a previously applied update, restoring its pre-image in `store`.
    pub fn reject(&mut self, store: &mut EntityStore, update_id: UpdateId) -> Result<(), OptimisticError> {
        let update = self.updates.get_mut(&update_id).ok_or(OptimisticError::Conflict)?;
        for (write, prior_tick) in &update.prior_values {
            apply_write(store, write, *prior_tick)?;
        }
        update.state = OptimisticState::Rejected;
        self.in_flight.retain(|id| *id != update_id);
        self.log.remove(&update_id);
        self.log_order.retain(|id| *id != update_id);
        Ok(())
    }

    /// Rolls back every `Applied` update whose `expiry_tick <= now`, marking it `Expired`.
    ///
    /// This is the primary backpressure valve when the settlement substrate
    /// stalls (spec §4.4): called once per tick by the match runtime.
    pub fn expire_sweep(&mut self, store: &mut EntityStore, now: u64) -> Result<Vec<UpdateId>, OptimisticError> {
        let expired: Vec<UpdateId> = self
            .in_flight
            .iter()
            .copied()
            .filter(|id| {
                self.updates
                    .get(id)
                    .is_some_and(|u| u.state == OptimisticState::Applied && u.expiry_tick <= now)
            })
            .collect();

        for id in &expired {
            if let Some(update) = self.updates.get_mut(id) {
                for (write, prior_tick) in &update.prior_values {
                    apply_write(store, write, *prior_tick)?;
                }
                update.state = OptimisticState::Expired;
            }
            self.log.remove(id);
            self.log_order.retain(|existing| existing != id);
        }
        self.in_flight.retain(|id| !expired.contains(id));
        Ok(expired)
    }

    /// Returns the update record, if any.
    #[must_use]
    pub fn get(&self, update_id: UpdateId) -> Option<&OptimisticUpdate> {
        self.updates.get(&update_id)
    }

    /// Returns the confirmed subset of the action log, in admission order.
    ///
    /// This is exactly the sequence the settlement pipeline folds into the
    /// action-log root: tentative (unconfirmed) entries are excluded.
    pub fn confirmed_log(&self) -> impl Iterator<Item = &LoggedAction> {
        self.log_order
            .iter()
            .filter_map(|id| self.log.get(id))
            .filter(|entry| entry.confirmed)
    }

    /// Returns every still-open (tentative) log entry, in admission order.
    pub fn pending_log(&self) -> impl Iterator<Item = &LoggedAction> {
        self.log_order
            .iter()
            .filter_map(|id| self.log.get(id))
            .filter(|entry| !entry.confirmed)
    }
}

/// Snapshots the component value and `last_updated_tick` a write would
/// overwrite, so rollback can restore both (not just the value) and leave
/// `validate_move`'s `Δticks_since_last_move` budget unaffected by a
/// rolled-back update.
fn read_prior_values(
    store: &EntityStore,
    effects: &[ComponentWrite],
) -> Result<Vec<(ComponentWrite, u64)>, OptimisticError> {
    effects
        .iter()
        .map(|write| match write {
            ComponentWrite::Position { entity, .. } => {
                let snapshot = store.get::<Position>(*entity)?;
                Ok((ComponentWrite::Position { entity: *entity, value: snapshot.value }, snapshot.last_updated_tick))
            }
            ComponentWrite::Health { entity, .. } => {
                let snapshot = store.get::<Health>(*entity)?;
                Ok((ComponentWrite::Health { entity: *entity, value: snapshot.value }, snapshot.last_updated_tick))
            }
            ComponentWrite::Combat { entity, .. } => {
                let snapshot = store.get::<Combat>(*entity)?;
                Ok((ComponentWrite::Combat { entity: *entity, value: snapshot.value }, snapshot.last_updated_tick))
            }
        })
        .collect()
}

fn apply_write(store: &mut EntityStore, write: &ComponentWrite, tick: u64) -> Result<(), OptimisticError> {
    match write {
        ComponentWrite::Position { entity, value } => store.set(*entity, *value, tick)?,
        ComponentWrite::Health { entity, value } => store.set_health(*entity, *value, tick)?,
        ComponentWrite::Combat { entity, value } => store.set(*entity, *value, tick)?,
    }
    Ok(())
}

fn hash_component_writes(writes: &[ComponentWrite]) -> Digest {
    hash_with(|h| {
        for write in writes {
            match write {
                ComponentWrite::Position { entity, value } => {
                    h.write_u128(entity.0).write_i32(value.x).write_i32(value.y).write_i32(value.z);
                }
                ComponentWrite::Health { entity, value } => {
                    h.write_u128(entity.0).write_u16(value.current).write_u16(value.max);
                }
                ComponentWrite::Combat { entity, value } => {
                    h.write_u128(entity.0).write_u16(value.attack).write_u16(value.defense).write_u64(value.cooldown_until_tick);
                }
            }
        }
    })
}
