//! Pure, deterministic action validation.
//!
//! [`validate`] takes an [`EntityStore`] snapshot, the acting entity, an
//! [`Action`], the current tick, and a [`ValidationContext`] describing
//! match-level configuration; it returns a [`ValidationOutcome`] and never
//! mutates anything itself. The optimistic manager applies the effects it
//! returns, which keeps validation reproducible for the settlement proof:
//! replaying the same `(action_log, initial_state, config)` always yields
//! the same effects.

use duel_entities::{Combat, EntityStore, Health, Position};
use duel_ids::{EntityId, MatchId};
use duel_proof::CanonicalHasher;
use serde::{Deserialize, Serialize};

/// Wire-stable action schema (spec §6). `Forfeit` bypasses the optimistic
/// manager entirely — the match runtime applies it as a direct state
/// transition rather than a speculative component write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Relative movement request.
    Move {
        /// Delta along X.
        dx: i16,
        /// Delta along Y.
        dy: i16,
        /// Delta along Z.
        dz: i16,
    },
    /// Attack request against another entity.
    Attack {
        /// Entity being attacked.
        target: EntityId,
        /// Attack strength variant.
        variant: AttackVariant,
    },
    /// Request to raise a defensive stance for some duration.
    Defend {
        /// Ticks the stance remains active, capped at 16 per spec §6.
        duration_ticks: u8,
    },
    /// Request to consume an inventory slot.
    Item {
        /// Slot index being consumed.
        slot: u8,
    },
    /// Request to concede the match immediately.
    Forfeit,
}

/// Attack strength variant (spec §6 wire schema: `NORMAL | HEAVY`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttackVariant {
    /// Baseline damage and cooldown.
    Normal,
    /// Double damage and double cooldown.
    Heavy,
}

/// Reasons [`validate`] can reject an action (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Resulting position would leave the arena box, or distance exceeds the
    /// entity's speed budget for the elapsed ticks.
    OutOfBounds,
    /// The actor's `Combat.cooldown_until_tick` has not yet elapsed.
    OnCooldown,
    /// The action targets an entity the actor may not act against (e.g. itself).
    NotActor,
    /// The attack target's `Health.current` is already zero.
    TargetDead,
    /// Malformed or out-of-range parameters (e.g. an unknown target, an
    /// over-long defend duration, an out-of-range inventory slot).
    InvalidParameters,
    /// The match is not in the `Playing` state.
    MatchNotActive,
}

/// A single component write an accepted action would perform.
#[derive(Clone, Debug, PartialEq)]
pub enum ComponentWrite {
    /// Overwrite `Position` on the given entity.
    Position {
        /// Entity to write.
        entity: EntityId,
        /// New value.
        value: Position,
    },
    /// Overwrite `Health` on the given entity.
    Health {
        /// Entity to write.
        entity: EntityId,
        /// New value.
        value: Health,
    },
    /// Overwrite `Combat` on the given entity.
    Combat {
        /// Entity to write.
        entity: EntityId,
        /// New value.
        value: Combat,
    },
}

impl ComponentWrite {
    /// The entity this write targets.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        match self {
            Self::Position { entity, .. } | Self::Health { entity, .. } | Self::Combat { entity, .. } => *entity,
        }
    }
}

/// Outcome of [`validate`].
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationOutcome {
    /// The action is admissible; apply `effects` to commit it.
    Valid {
        /// Component writes the caller should apply atomically.
        effects: Vec<ComponentWrite>,
        /// Whether this action's effects must be bound into the settlement proof.
        requires_proof: bool,
    },
    /// The action is inadmissible for the given reason.
    Rejected(RejectReason),
}

/// Axis-aligned arena bounds (spec §9: "arena geometry — spec picks an
/// axis-aligned box").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaBox {
    /// Minimum X, inclusive.
    pub min_x: i32,
    /// Minimum Y, inclusive.
    pub min_y: i32,
    /// Minimum Z, inclusive.
    pub min_z: i32,
    /// Maximum X, inclusive.
    pub max_x: i32,
    /// Maximum Y, inclusive.
    pub max_y: i32,
    /// Maximum Z, inclusive.
    pub max_z: i32,
}

impl ArenaBox {
    /// Returns `true` if `(x, y, z)` lies within the box, inclusive.
    #[must_use]
    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        (self.min_x..=self.max_x).contains(&x)
            && (self.min_y..=self.max_y).contains(&y)
            && (self.min_z..=self.max_z).contains(&z)
    }
}

/// Match-level configuration and ephemeral lookups [`validate`] needs but
/// cannot derive from the [`EntityStore`] alone (transient combat state
/// lives in the match runtime, not the fixed component schema).
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext {
    /// Arena bounds for `Move`.
    pub arena_box: ArenaBox,
    /// Whether the owning match is currently `Playing`.
    pub match_active: bool,
    /// Base cooldown applied after a `Normal` attack, in ticks.
    pub base_cooldown_ticks: u64,
    /// Upper bound on any cooldown, regardless of variant.
    pub max_cooldown_ticks: u64,
    /// Number of inventory slots available per entity.
    pub inventory_slots: u8,
    /// Match identifier, mixed into [`rng_stream`].
    pub match_id: MatchId,
    /// Nonce of the action being validated, mixed into [`rng_stream`].
    pub nonce: u64,
    /// Tick until which the attack target is defending, if any.
    pub target_defending_until_tick: Option<u64>,
    /// Suppresses the crit roll while `true` (spec §5 `DegradedMatch`: "reduces
    /// validator work (disables optional effects) until recovery"). Crits are
    /// the only effect in this validator that is optional rather than load-bearing.
    pub disable_crit: bool,
}

/// Deterministic pseudo-random stream used for crit rolls.
///
/// Reproducible for a given `(match_id, actor, tick, nonce)` so that
/// replaying the action log during settlement yields identical rolls.
#[must_use]
pub fn rng_stream(match_id: MatchId, actor: EntityId, tick: u64, nonce: u64) -> u64 {
    let digest = {
        let mut hasher = CanonicalHasher::new();
        hasher
            .write_u128(match_id.0)
            .write_u128(actor.0)
            .write_u64(tick)
            .write_u64(nonce);
        hasher.finalize()
    };
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Validates `action` submitted by `actor` at `tick` against `store`.
///
/// Pure and side-effect-free: no argument is mutated, and no I/O occurs.
pub fn validate(
    store: &EntityStore,
    actor: EntityId,
    action: &Action,
    tick: u64,
    ctx: &ValidationContext,
) -> ValidationOutcome {
    if !ctx.match_active {
        return ValidationOutcome::Rejected(RejectReason::MatchNotActive);
    }
    match action {
        Action::Move { dx, dy, dz } => validate_move(store, actor, *dx, *dy, *dz, tick, ctx),
        Action::Attack { target, variant } => validate_attack(store, actor, *target, *variant, tick, ctx),
        Action::Defend { duration_ticks } => validate_defend(*duration_ticks),
        Action::Item { slot } => validate_item(*slot, ctx),
        Action::Forfeit => ValidationOutcome::Valid {
            effects: Vec::new(),
            requires_proof: true,
        },
    }
}

fn validate_move(
    store: &EntityStore,
    actor: EntityId,
    dx: i16,
    dy: i16,
    dz: i16,
    tick: u64,
    ctx: &ValidationContext,
) -> ValidationOutcome {
    let Ok(position) = store.get::<Position>(actor) else {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    };
    let new_x = position.value.x.saturating_add(i32::from(dx));
    let new_y = position.value.y.saturating_add(i32::from(dy));
    let new_z = position.value.z.saturating_add(i32::from(dz));
    if !ctx.arena_box.contains(new_x, new_y, new_z) {
        return ValidationOutcome::Rejected(RejectReason::OutOfBounds);
    }

    let elapsed = tick.saturating_sub(position.last_updated_tick).max(1);
    let budget = u64::from(position.value.speed) * elapsed;
    let distance = i64::from(dx).unsigned_abs() + i64::from(dy).unsigned_abs() + i64::from(dz).unsigned_abs();
    if distance > budget {
        return ValidationOutcome::Rejected(RejectReason::OutOfBounds);
    }

    ValidationOutcome::Valid {
        effects: vec![ComponentWrite::Position {
            entity: actor,
            value: Position {
                x: new_x,
                y: new_y,
                z: new_z,
                speed: position.value.speed,
            },
        }],
        requires_proof: false,
    }
}

fn validate_attack(
    store: &EntityStore,
    actor: EntityId,
    target: EntityId,
    variant: AttackVariant,
    tick: u64,
    ctx: &ValidationContext,
) -> ValidationOutcome {
    if target == actor {
        return ValidationOutcome::Rejected(RejectReason::NotActor);
    }
    let Ok(actor_combat) = store.get::<Combat>(actor) else {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    };
    let Ok(target_health) = store.get::<Health>(target) else {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    };
    let Ok(target_defense) = store.get::<Combat>(target) else {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    };
    if actor_combat.value.cooldown_until_tick > tick {
        return ValidationOutcome::Rejected(RejectReason::OnCooldown);
    }
    if target_health.value.current == 0 {
        return ValidationOutcome::Rejected(RejectReason::TargetDead);
    }

    let (power_multiplier, cooldown_ticks) = match variant {
        AttackVariant::Normal => (1u32, ctx.base_cooldown_ticks),
        AttackVariant::Heavy => (2u32, ctx.base_cooldown_ticks * 2),
    };
    let cooldown_ticks = cooldown_ticks.min(ctx.max_cooldown_ticks);
    let power = u32::from(actor_combat.value.attack) * power_multiplier;
    let defense_reduction = u32::from(target_defense.value.defense) / 2;
    let mut damage = power.saturating_sub(defense_reduction).max(1);

    let is_defending = ctx
        .target_defending_until_tick
        .is_some_and(|until| tick < until);
    if is_defending {
        damage = (damage / 2).max(1);
    }

    if !ctx.disable_crit {
        let roll = rng_stream(ctx.match_id, actor, tick, ctx.nonce) % 100;
        if roll < u64::from(actor_combat.value.crit_chance) {
            damage = damage.saturating_mul(2);
        }
    }

    let new_health = u32::from(target_health.value.current).saturating_sub(damage);
    let new_health = u16::try_from(new_health).unwrap_or(0);

    ValidationOutcome::Valid {
        effects: vec![
            ComponentWrite::Health {
                entity: target,
                value: Health {
                    current: new_health,
                    max: target_health.value.max,
                    regen_rate: target_health.value.regen_rate,
                },
            },
            ComponentWrite::Combat {
                entity: actor,
                value: Combat {
                    cooldown_until_tick: tick + cooldown_ticks,
                    ..actor_combat.value
                },
            },
        ],
        requires_proof: true,
    }
}

fn validate_defend(duration_ticks: u8) -> ValidationOutcome {
    if duration_ticks == 0 || duration_ticks > 16 {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    }
    ValidationOutcome::Valid {
        effects: Vec::new(),
        requires_proof: false,
    }
}

fn validate_item(slot: u8, ctx: &ValidationContext) -> ValidationOutcome {
    if slot >= ctx.inventory_slots {
        return ValidationOutcome::Rejected(RejectReason::InvalidParameters);
    }
    ValidationOutcome::Valid {
        effects: Vec::new(),
        requires_proof: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duel_entities::EntityComponents;
    use proptest::prelude::*;

    fn ctx() -> ValidationContext {
        ValidationContext {
            arena_box: ArenaBox {
                min_x: -100,
                min_y: -100,
                min_z: -100,
                max_x: 100,
                max_y: 100,
                max_z: 100,
            },
            match_active: true,
            base_cooldown_ticks: 20,
            max_cooldown_ticks: 200,
            inventory_slots: 4,
            match_id: MatchId(1),
            nonce: 1,
            target_defending_until_tick: None,
            disable_crit: false,
        }
    }

    fn setup() -> (EntityStore, EntityId, EntityId) {
        let mut store = EntityStore::new();
        let actor = EntityId(1);
        let target = EntityId(2);
        store.create(
            actor,
            EntityComponents {
                position: Some(Position { x: 0, y: 0, z: 0, speed: 10 }),
                health: Some(Health { current: 100, max: 100, regen_rate: 0 }),
                combat: Some(Combat { attack: 10, defense: 5, crit_chance: 0, cooldown_until_tick: 0 }),
                player: None,
            },
            0,
        );
        store.create(
            target,
            EntityComponents {
                position: Some(Position { x: 1, y: 1, z: 0, speed: 10 }),
                health: Some(Health { current: 100, max: 100, regen_rate: 0 }),
                combat: Some(Combat { attack: 10, defense: 5, crit_chance: 0, cooldown_until_tick: 0 }),
                player: None,
            },
            0,
        );
        (store, actor, target)
    }

    #[test]
    fn symmetric_attack_exchange_matches_spec_example() {
        let (store, actor, target) = setup();
        let outcome = validate(
            &store,
            actor,
            &Action::Attack { target, variant: AttackVariant::Normal },
            1,
            &ctx(),
        );
        let ValidationOutcome::Valid { effects, .. } = outcome else {
            panic!("expected valid attack")
        };
        let health_write = effects
            .iter()
            .find_map(|w| match w {
                ComponentWrite::Health { value, .. } => Some(*value),
                ComponentWrite::Position { .. } | ComponentWrite::Combat { .. } => None,
            })
            .expect("health write present");
        assert_eq!(health_write.current, 92);
    }

    #[test]
    fn move_outside_arena_is_rejected() {
        let (store, actor, _target) = setup();
        let outcome = validate(&store, actor, &Action::Move { dx: 200, dy: 0, dz: 0 }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::OutOfBounds));
    }

    #[test]
    fn move_beyond_speed_budget_is_rejected() {
        let (store, actor, _target) = setup();
        let outcome = validate(&store, actor, &Action::Move { dx: 50, dy: 0, dz: 0 }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::OutOfBounds));
    }

    #[test]
    fn attack_on_cooldown_is_rejected() {
        let (mut store, actor, target) = setup();
        store
            .set(actor, Combat { attack: 10, defense: 5, crit_chance: 0, cooldown_until_tick: 50 }, 0)
            .expect("write cooldown");
        let outcome = validate(&store, actor, &Action::Attack { target, variant: AttackVariant::Normal }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::OnCooldown));
    }

    #[test]
    fn attack_on_dead_target_is_rejected() {
        let (mut store, actor, target) = setup();
        store
            .set_health(target, Health { current: 0, max: 100, regen_rate: 0 }, 0)
            .expect("write health");
        let outcome = validate(&store, actor, &Action::Attack { target, variant: AttackVariant::Normal }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::TargetDead));
    }

    #[test]
    fn self_attack_is_not_actor() {
        let (store, actor, _target) = setup();
        let outcome = validate(&store, actor, &Action::Attack { target: actor, variant: AttackVariant::Normal }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::NotActor));
    }

    #[test]
    fn defend_duration_over_sixteen_is_rejected() {
        let (store, actor, _target) = setup();
        let outcome = validate(&store, actor, &Action::Defend { duration_ticks: 17 }, 1, &ctx());
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::InvalidParameters));
    }

    #[test]
    fn rng_stream_is_reproducible() {
        let a = rng_stream(MatchId(1), EntityId(2), 3, 4);
        let b = rng_stream(MatchId(1), EntityId(2), 3, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn match_not_active_rejects_before_other_checks() {
        let (store, actor, target) = setup();
        let mut context = ctx();
        context.match_active = false;
        let outcome = validate(&store, actor, &Action::Attack { target, variant: AttackVariant::Normal }, 1, &context);
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::MatchNotActive));
    }

    #[test]
    fn disabled_crit_never_doubles_damage() {
        let (mut store, actor, target) = setup();
        store
            .set(actor, Combat { attack: 10, defense: 5, crit_chance: 100, cooldown_until_tick: 0 }, 0)
            .expect("write crit_chance");
        let mut context = ctx();
        context.disable_crit = true;
        let outcome = validate(&store, actor, &Action::Attack { target, variant: AttackVariant::Normal }, 1, &context);
        let ValidationOutcome::Valid { effects, .. } = outcome else {
            panic!("expected valid attack")
        };
        let health = effects
            .iter()
            .find_map(|w| match w {
                ComponentWrite::Health { value, .. } => Some(*value),
                ComponentWrite::Position { .. } | ComponentWrite::Combat { .. } => None,
            })
            .expect("health write present");
        // attack=10, defense=5 -> damage = max(1, 10 - 2) = 8, never doubled.
        assert_eq!(health.current, 92);
    }

    proptest::proptest! {
        /// Determinism (spec §8): identical `(match_id, actor, tick, nonce)`
        /// inputs always produce the same `rng_stream` output, across any
        /// input values, not just the fixed cases above.
        #[test]
        fn rng_stream_is_deterministic_for_any_inputs(
            match_id in any::<u128>(),
            actor in any::<u128>(),
            tick in any::<u64>(),
            nonce in any::<u64>(),
        ) {
            let a = rng_stream(MatchId(match_id), EntityId(actor), tick, nonce);
            let b = rng_stream(MatchId(match_id), EntityId(actor), tick, nonce);
            prop_assert_eq!(a, b);
        }

        /// Attack damage is never zero: spec §4.3 "damage = max(1, power - defense/2)".
        #[test]
        fn attack_damage_is_never_zero(
            attack in 0u16..=2000,
            defense in 0u16..=2000,
            target_health in 1u16..=2000,
        ) {
            let mut store = EntityStore::new();
            let actor = EntityId(1);
            let target = EntityId(2);
            store.create(
                actor,
                EntityComponents {
                    combat: Some(Combat { attack, defense: 0, crit_chance: 0, cooldown_until_tick: 0 }),
                    ..Default::default()
                },
                0,
            );
            store.create(
                target,
                EntityComponents {
                    health: Some(Health { current: target_health, max: target_health, regen_rate: 0 }),
                    combat: Some(Combat { attack: 0, defense, crit_chance: 0, cooldown_until_tick: 0 }),
                    ..Default::default()
                },
                0,
            );
            let mut context = ctx();
            context.target_defending_until_tick = None;
            let outcome = validate(&store, actor, &Action::Attack { target, variant: AttackVariant::Normal }, 1, &context);
            let ValidationOutcome::Valid { effects, .. } = outcome else {
                panic!("expected valid attack")
            };
            let new_health = effects
                .iter()
                .find_map(|w| match w {
                    ComponentWrite::Health { value, .. } => Some(value.current),
                    ComponentWrite::Position { .. } | ComponentWrite::Combat { .. } => None,
                })
                .expect("health write present");
            prop_assert!(new_health < target_health);
        }
    }
}
