//! Ephemeral session authorization.
//!
//! A session lets a client submit actions for the duration of a match
//! without a per-action wallet signature. Authorization holds only a
//! high-water nonce mark per session, giving at-most-once admission with
//! `O(1)` state — the same shape as a TCP receive window, adapted to the
//! match engine's tick-indexed time.

use duel_ids::{EntityId, MatchId, PublicKey, SessionId};
use rustc_hash::FxHashMap;
use tracing::instrument;

/// A session bound to one `(player, match)` pair for its lifetime.
#[derive(Clone, Debug)]
pub struct Session {
    /// Stable identifier for this session.
    pub id: SessionId,
    /// Match this session is scoped to.
    pub match_id: MatchId,
    /// Wallet identity of the owning player.
    pub player_wallet: PublicKey,
    /// Entity this session is authorized to act on behalf of.
    pub entity_id: EntityId,
    /// Tick at which the session was issued.
    pub issued_tick: u64,
    /// Tick at or after which the session can no longer authorize actions.
    pub expiry_tick: u64,
    nonce_high_water: u64,
}

impl Session {
    /// Highest nonce admitted so far (0 if none have been admitted).
    #[must_use]
    pub fn nonce_high_water(&self) -> u64 {
        self.nonce_high_water
    }
}

/// Outcome of [`SessionRegistry::authorize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// The nonce was strictly greater than the high-water mark and is now admitted.
    Ok,
    /// The session's `expiry_tick` has passed.
    Expired,
    /// The nonce was not strictly greater than the high-water mark.
    ReplayOrRegression,
    /// No session exists with the given id.
    Unknown,
}

/// Registry of live sessions for one match (or, for a process-wide registry,
/// across matches — callers decide the scope by how many registries they keep).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: FxHashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new session for `player_wallet` acting as `entity_id` in `match_id`.
    ///
    /// `duration_ticks` is added to `issued_tick` to compute `expiry_tick`.
    #[instrument(skip(self), level = "debug")]
    pub fn issue(
        &mut self,
        id: SessionId,
        match_id: MatchId,
        player_wallet: PublicKey,
        entity_id: EntityId,
        issued_tick: u64,
        duration_ticks: u64,
    ) -> SessionId {
        let session = Session {
            id,
            match_id,
            player_wallet,
            entity_id,
            issued_tick,
            expiry_tick: issued_tick + duration_ticks,
            nonce_high_water: 0,
        };
        self.sessions.insert(id, session);
        id
    }

    /// Authorizes `nonce` against `session_id` at `now_tick`.
    ///
    /// On [`AuthorizeOutcome::Ok`] the session's high-water mark advances to
    /// `nonce`; every other outcome leaves session state untouched.
    #[instrument(skip(self), level = "debug")]
    pub fn authorize(&mut self, session_id: SessionId, nonce: u64, now_tick: u64) -> AuthorizeOutcome {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return AuthorizeOutcome::Unknown;
        };
        if now_tick >= session.expiry_tick {
            return AuthorizeOutcome::Expired;
        }
        if nonce <= session.nonce_high_water {
            return AuthorizeOutcome::ReplayOrRegression;
        }
        session.nonce_high_water = nonce;
        AuthorizeOutcome::Ok
    }

    /// Returns the session record, if any.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    /// Removes a session (used when its match tears down).
    pub fn remove(&mut self, session_id: SessionId) -> Option<Session> {
        self.sessions.remove(&session_id)
    }
}
