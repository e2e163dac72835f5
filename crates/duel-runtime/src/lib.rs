//! Composition root: wires [`MatchRegistry`], [`SettlementPipeline`], id/clock/
//! telemetry plumbing, and the process-wide tick-driving loop behind one
//! entry point.
//!
//! Grounded in the teacher's `echo_kernel::Kernel` ("owns its substate,
//! exposes a narrow public surface, `run()` hands control to a scheduler")
//! and `echo_sched::Scheduler` (a fixed-interval loop that never suspends
//! inside one tick) — generalized here from one global tick loop driving one
//! `GraphStore` to one loop driving every live match's `MatchRuntime::tick`
//! each period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duel_clock::ClockSource;
use duel_config::MatchConfig;
use duel_ids::{IdGenerator, MatchId, SessionId};
use duel_match::{ActionReceipt, EndReason, Handle, MatchError, MatchRegistry, MatchRuntime, MatchState, PlayerSetup};
use duel_settlement::{SettlementBackend, SettlementJob, SettlementPipeline, SettlementPolicy};
use duel_telemetry::{ArcSink, Sink};
use duel_validator::Action;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// Wall-clock deadline for one [`Engine::submit_action`] call (spec §5
/// "`submit_action` has a 100ms deadline from receipt to admitted-or-rejected").
pub const SUBMIT_ACTION_DEADLINE: Duration = Duration::from_millis(100);

/// Errors returned by [`Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No match is registered with the given id (never registered, or already settled and dropped).
    #[error("no match with this id is registered")]
    UnknownMatch,
    /// `submit_action` did not complete within [`SUBMIT_ACTION_DEADLINE`].
    #[error("submission deadline exceeded")]
    DeadlineExceeded,
    /// The match itself rejected the submission.
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Process-wide handle on the match engine: one [`MatchRegistry`], one
/// [`SettlementPipeline`], and the id/clock/telemetry plumbing every match
/// is constructed with.
///
/// Callers spawn the tick-driving loop once via [`Engine::spawn_driver`] and
/// otherwise only ever call [`Engine::create_match`] and
/// [`Engine::submit_action`]; `duel-serviced` is the sole intended caller in
/// this workspace, but nothing here is tied to its transport.
pub struct Engine {
    registry: Mutex<MatchRegistry>,
    settlement: SettlementPipeline,
    ids: IdGenerator,
    clock: Arc<dyn ClockSource>,
    sink: Arc<dyn Sink>,
    tick: AtomicU64,
}

impl Engine {
    /// Builds an engine around `backend`, spawning `policy.max_concurrent_settlements`
    /// settlement worker tasks immediately.
    #[must_use]
    pub fn new<B>(
        id_salt: &str,
        backend: Arc<B>,
        policy: SettlementPolicy,
        clock: Arc<dyn ClockSource>,
        sink: Arc<dyn Sink>,
    ) -> Arc<Self>
    where
        B: SettlementBackend + Send + Sync + 'static,
    {
        let settlement = SettlementPipeline::spawn(backend, policy, Arc::clone(&sink));
        Arc::new(Self {
            registry: Mutex::new(MatchRegistry::new()),
            settlement,
            ids: IdGenerator::new(id_salt),
            clock,
            sink,
            tick: AtomicU64::new(0),
        })
    }

    /// Current global tick counter. Every live match's `current_tick` is
    /// driven from this same counter, so two matches created at different
    /// moments still agree on "what tick is it right now".
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Creates a new match in [`duel_match::MatchState::Playing`] and registers it.
    ///
    /// Mirrors `MatchRuntime::new` immediately calling `start`, since this
    /// engine has no separate matchmaking/readiness phase to wait through
    /// (spec §4.5: both entities and sessions are materialised at creation).
    #[instrument(skip(self, config, p1, p2))]
    pub async fn create_match(&self, config: MatchConfig, p1: PlayerSetup, p2: PlayerSetup) -> (MatchId, Handle) {
        let match_id = self.ids.match_id();
        let now_tick = self.current_tick();
        let sink: Box<dyn Sink> = Box::new(ArcSink(Arc::clone(&self.sink)));
        let mut runtime = MatchRuntime::new(match_id, config, p1, p2, &self.ids, now_tick, sink);
        runtime.start(now_tick);
        let handle = {
            let mut registry = self.registry.lock().await;
            registry.insert(runtime)
        };
        (match_id, handle)
    }

    /// Looks up a live match's handle.
    pub async fn handle(&self, match_id: MatchId) -> Result<Handle, EngineError> {
        self.registry.lock().await.get(match_id).ok_or(EngineError::UnknownMatch)
    }

    /// Submits an action against `match_id`, bounded by [`SUBMIT_ACTION_DEADLINE`].
    ///
    /// The deadline wraps only the wait for the match's mutex plus the
    /// (synchronous, non-suspending) call into `MatchRuntime::submit_action`
    /// — per spec §4.5 a tick itself never suspends, so the only way this
    /// can time out is contention from another caller holding the same
    /// match's lock.
    #[instrument(skip(self, action))]
    pub async fn submit_action(
        &self,
        match_id: MatchId,
        session_id: SessionId,
        nonce: u64,
        action: Action,
    ) -> Result<ActionReceipt, EngineError> {
        let handle = self.handle(match_id).await?;
        let attempt = tokio::time::timeout(SUBMIT_ACTION_DEADLINE, async move {
            let mut guard = handle.lock().await;
            let now_tick = guard.snapshot().tick;
            guard.submit_action(session_id, nonce, action, now_tick)
        })
        .await;
        match attempt {
            Ok(result) => result.map_err(EngineError::from),
            Err(_elapsed) => Err(EngineError::DeadlineExceeded),
        }
    }

    /// Current settlement status for a match, or `NotFound` if it was never enqueued.
    pub async fn settlement_status(&self, match_id: MatchId) -> duel_settlement::SettlementStatus {
        self.settlement.status(match_id).await
    }

    /// Spawns the process-wide tick-driving task, looping at `tick_period`
    /// until the returned handle is aborted.
    ///
    /// Grounded in `echo_sched::Scheduler::run`'s `tokio::time::interval`
    /// loop; generalized to drive every registered match's tick instead of
    /// one global scheduler tick.
    pub fn spawn_driver(self: Arc<Self>, tick_period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_period);
            loop {
                interval.tick().await;
                self.drive_one_tick().await;
            }
        })
    }

    /// Advances every live match by one tick, reports each match's tick
    /// duration, and hands off any newly `Ended` match to the settlement
    /// pipeline before dropping it from the registry.
    ///
    /// Handles are collected before any lock is awaited, since `FxHashMap`'s
    /// iterator can't be held across an `.await` point (see
    /// `MatchRegistry::handles`).
    #[instrument(skip(self))]
    pub async fn drive_one_tick(&self) {
        let now_tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let handles: Vec<_> = self.registry.lock().await.handles().collect();

        let mut ended = Vec::new();
        for (match_id, handle) in handles {
            let started = Instant::now();
            let outcome = {
                let mut guard = handle.lock().await;
                guard.tick(now_tick);
                let took_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                guard.report_tick_duration(took_micros);
                if matches!(guard.state(), MatchState::Ended { .. }) {
                    guard.outcome()
                } else {
                    None
                }
            };
            if let Some(outcome) = outcome {
                ended.push(match_id);
                // Disputed matches (spec §7 item 5: "do not attempt automatic
                // settlement") are dropped from the registry below but never
                // handed to the settlement pipeline.
                if outcome.reason != EndReason::Disputed {
                    self.settlement.enqueue(SettlementJob::new(outcome)).await;
                }
            }
        }

        if !ended.is_empty() {
            let mut registry = self.registry.lock().await;
            for match_id in ended {
                registry.drop_match(match_id);
            }
        }
    }

    /// Number of matches currently registered (awaiting a tick or settlement).
    pub async fn live_match_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duel_entities::{Combat, EntityComponents, Health, Position};
    use duel_ids::PublicKey;
    use duel_match::EndReason;
    use duel_settlement::{Confirmation, ScriptedBackend, SettlementStatus};
    use duel_telemetry::CountingSink;

    fn player(wallet_byte: u8) -> PlayerSetup {
        PlayerSetup {
            wallet: PublicKey([wallet_byte; 32]),
            name: format!("p{wallet_byte}"),
            components: EntityComponents {
                position: Some(Position { x: 0, y: 0, z: 0, speed: 10 }),
                health: Some(Health { current: 10, max: 10, regen_rate: 0 }),
                combat: Some(Combat { attack: 100, defense: 0, crit_chance: 0, cooldown_until_tick: 0 }),
                player: None,
            },
        }
    }

    fn policy() -> SettlementPolicy {
        SettlementPolicy {
            max_concurrent_settlements: 2,
            base_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 100,
            max_attempts: 3,
            job_ttl_ms: 60_000,
        }
    }

    fn engine(backend: Arc<ScriptedBackend>) -> Arc<Engine> {
        let clock: Arc<dyn ClockSource> = Arc::new(duel_clock::ManualClock::new());
        let sink: Arc<dyn Sink> = Arc::new(CountingSink::new());
        Engine::new("test-salt", backend, policy(), clock, sink)
    }

    #[tokio::test]
    async fn created_match_accepts_an_action_immediately() {
        let engine = engine(Arc::new(ScriptedBackend::new()));
        let (match_id, handle) = engine.create_match(MatchConfig::defaults(), player(1), player(2)).await;
        let (session_one, session_two) = {
            let guard = handle.lock().await;
            (guard.session_one(), guard.session_two())
        };
        let _ = session_two;

        let receipt = engine
            .submit_action(match_id, session_one, 1, Action::Move { dx: 1, dy: 0, dz: 0 })
            .await
            .expect("admitted");
        assert_eq!(receipt.applied_tick, engine.current_tick());
    }

    #[tokio::test]
    async fn submit_action_against_an_unknown_match_is_reported() {
        let engine = engine(Arc::new(ScriptedBackend::new()));
        let err = engine
            .submit_action(MatchId(999), SessionId(1), 1, Action::Move { dx: 0, dy: 0, dz: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownMatch));
    }

    #[tokio::test]
    async fn driving_a_tick_advances_every_live_match() {
        let engine = engine(Arc::new(ScriptedBackend::new()));
        let mut config = MatchConfig::defaults();
        config.duration_ticks = 1_000;
        let (match_id, _handle) = engine.create_match(config, player(1), player(2)).await;

        engine.drive_one_tick().await;

        let handle = engine.handle(match_id).await.expect("still live");
        let guard = handle.lock().await;
        assert_eq!(guard.snapshot().tick, 1);
    }

    #[tokio::test]
    async fn an_ended_match_is_settled_and_dropped_from_the_registry() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine(Arc::clone(&backend));
        let mut config = MatchConfig::defaults();
        config.duration_ticks = 1_000;
        let (match_id, handle) = engine.create_match(config, player(1), player(2)).await;
        backend.script(match_id, vec![Ok(Confirmation { tx_id: "tx".to_owned() })]).await;

        {
            let mut guard = handle.lock().await;
            guard.end_now(EndReason::Elimination, None);
        }

        engine.drive_one_tick().await;
        assert_eq!(engine.live_match_count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.settlement_status(match_id).await, SettlementStatus::Confirmed { tx_id: "tx".to_owned() });
    }

    #[tokio::test]
    async fn a_disputed_match_is_dropped_without_settlement() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine(Arc::clone(&backend));
        let mut config = MatchConfig::defaults();
        config.duration_ticks = 1_000;
        let (match_id, handle) = engine.create_match(config, player(1), player(2)).await;
        // No response scripted: if `drive_one_tick` enqueued this match, the
        // worker would see `Err(Invalid)` and mark it `Disputed` itself,
        // masking the bug this test guards against. Asserting `NotFound`
        // below only proves the job was never submitted.

        {
            let mut guard = handle.lock().await;
            guard.end_now(EndReason::Disputed, None);
        }

        engine.drive_one_tick().await;
        assert_eq!(engine.live_match_count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.settlement_status(match_id).await, SettlementStatus::NotFound);
    }
}
