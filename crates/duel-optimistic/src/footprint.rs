//! Footprints and independence checks for in-flight optimistic updates.
//!
//! Grounded in the teacher's `rmg_core::footprint` module: a footprint
//! summarises the component slots one pending update would write, and two
//! footprints are independent iff their write sets are disjoint. The graph
//! engine's node/edge/boundary-port sets collapse here to a single
//! `(entity, component kind)` set, since the match engine's schema is a
//! fixed four-component lattice rather than an open graph.

use std::collections::BTreeSet;

use duel_ids::EntityId;
use duel_validator::Action;

/// The four writable component kinds, plus a synthetic `Control` kind for
/// actions (`Defend`, `Item`) that mutate match-runtime-level transient
/// state rather than a typed component, so they still participate in
/// per-entity conflict detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentKind {
    /// `Position`.
    Position,
    /// `Health`.
    Health,
    /// `Combat`.
    Combat,
    /// Transient runtime state not backed by a typed component.
    Control,
}

/// Write-set footprint of a pending optimistic update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Footprint(BTreeSet<(EntityId, ComponentKind)>);

impl Footprint {
    /// Derives the footprint an action would write, before validation runs.
    ///
    /// This must be computable from the action alone (not its validated
    /// effects) because conflict detection happens before the validator is
    /// invoked, per the admission order in spec §4.4.
    #[must_use]
    pub fn from_action(actor: EntityId, action: &Action) -> Self {
        let mut set = BTreeSet::new();
        match action {
            Action::Move { .. } => {
                set.insert((actor, ComponentKind::Position));
            }
            Action::Attack { target, .. } => {
                set.insert((actor, ComponentKind::Combat));
                set.insert((*target, ComponentKind::Health));
            }
            Action::Defend { .. } | Action::Item { .. } => {
                set.insert((actor, ComponentKind::Control));
            }
            Action::Forfeit => {}
        }
        Self(set)
    }

    /// Returns `true` when `self` and `other` share no `(entity, kind)` pair.
    #[must_use]
    pub fn independent(&self, other: &Self) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// Returns `true` when this footprint writes nothing (e.g. `Forfeit`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
