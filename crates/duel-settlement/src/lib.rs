//! Settlement pipeline (spec §4.7): turns a completed match's [`MatchOutcome`]
//! into a payout request against an abstract [`SettlementBackend`], with
//! bounded concurrency, capped exponential backoff, and a `Disputed`
//! fallback on exhausted or non-retryable errors.
//!
//! Worker pool shape is grounded in the teacher's `echo_sched::Scheduler`
//! (a fixed-size pool of tasks pulling off a shared queue) generalized from
//! one tick loop to N job workers, the way `echo-session-service` spawns one
//! task per inbound connection off a shared `mpsc` channel.

mod payout;

pub use payout::{compute_split, PayoutSplit};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duel_config::MatchConfig;
use duel_ids::MatchId;
use duel_match::MatchOutcome;
use duel_proof::Digest;
use duel_telemetry::{Event, Sink};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::instrument;

/// Errors a [`SettlementBackend`] can return from [`SettlementBackend::submit`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    /// The backend's network path is temporarily saturated; safe to retry.
    #[error("settlement backend network busy")]
    NetworkBusy,
    /// The backend (or chain/rollup) is congested; safe to retry.
    #[error("settlement backend congested")]
    Congested,
    /// A transient failure with no more specific cause; safe to retry.
    #[error("transient settlement failure")]
    Transient,
    /// The backend rejected the payload outright. Never retried.
    #[error("settlement payload rejected")]
    Rejected,
    /// The payload was structurally invalid. Never retried.
    #[error("invalid settlement payload")]
    Invalid,
}

impl SettlementError {
    /// `true` for `NetworkBusy`, `Congested`, and `Transient` (spec §4.7 step 4).
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkBusy | Self::Congested | Self::Transient)
    }
}

/// A successful settlement confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    /// Backend-assigned transaction identifier.
    pub tx_id: String,
}

/// Current status of a match's settlement, per [`SettlementBackend::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementStatus {
    /// No job has ever been submitted for this match.
    NotFound,
    /// A job is in flight (submitted, awaiting confirmation, or backing off).
    Pending,
    /// The backend confirmed the payout.
    Confirmed {
        /// The confirmed transaction id.
        tx_id: String,
    },
    /// Settlement failed and will not be retried automatically.
    Failed,
}

/// The deterministic, backend-facing settlement request (spec §4.7 step 2:
/// "deterministic in `(match_id, winner, splits, action_log_root,
/// final_state_root)`").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementPayload {
    /// The match being settled.
    pub match_id: MatchId,
    /// The computed payout split.
    pub split: PayoutSplit,
    /// Digest over the ordered, confirmed action log.
    pub action_log_root: Digest,
    /// Digest over final component state.
    pub final_state_root: Digest,
}

/// Abstract settlement substrate (spec §6 "`SettlementBackend` interface").
///
/// Out of scope per spec §0: the concrete chain/rollup RPC. Implementors are
/// expected to be cheap to clone/share and safe to call from multiple
/// worker tasks concurrently.
pub trait SettlementBackend: Send + Sync {
    /// Submits a payout request. Returns a confirmation or a (possibly
    /// retryable) error.
    fn submit(
        &self,
        payload: &SettlementPayload,
    ) -> impl std::future::Future<Output = Result<Confirmation, SettlementError>> + Send;

    /// Looks up the last known status for a match, if any job was ever submitted.
    fn status(
        &self,
        match_id: MatchId,
    ) -> impl std::future::Future<Output = SettlementStatus> + Send;
}

/// A queued unit of settlement work (spec §4.7 `SettlementJob`).
#[derive(Clone, Debug)]
pub struct SettlementJob {
    /// The match outcome being settled.
    pub outcome: MatchOutcome,
    /// Number of submission attempts already made.
    pub attempts: u32,
}

impl SettlementJob {
    /// Wraps a freshly produced [`MatchOutcome`] as a new job with zero attempts.
    #[must_use]
    pub fn new(outcome: MatchOutcome) -> Self {
        Self { outcome, attempts: 0 }
    }
}

/// Retry and concurrency policy for a [`SettlementPipeline`] (spec §6 config).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SettlementPolicy {
    /// Number of concurrent worker tasks pulling off the job queue.
    pub max_concurrent_settlements: usize,
    /// Base backoff delay before the first retry, in milliseconds.
    pub base_backoff_ms: u64,
    /// Backoff multiplier applied per additional attempt.
    pub backoff_multiplier: f64,
    /// Backoff ceiling, in milliseconds, regardless of attempt count.
    pub max_backoff_ms: u64,
    /// Maximum submission attempts before a retryable error is treated as exhausted.
    pub max_attempts: u32,
    /// Wall-clock deadline for a single job, in milliseconds, before it is marked `Disputed`.
    pub job_ttl_ms: u64,
}

impl SettlementPolicy {
    /// Derives a policy from a match's [`MatchConfig`].
    #[must_use]
    pub fn from_config(config: &MatchConfig) -> Self {
        Self {
            max_concurrent_settlements: config.max_concurrent_settlements,
            base_backoff_ms: config.settlement_base_backoff_ms,
            backoff_multiplier: config.settlement_backoff_multiplier,
            max_backoff_ms: config.settlement_max_backoff_ms,
            max_attempts: config.settlement_max_attempts,
            job_ttl_ms: config.job_ttl_ms,
        }
    }

    /// Backoff delay before attempt number `attempt` (1-based), capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let scaled = (self.base_backoff_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Durable-queue-plus-workers that converts completed matches into settlement
/// attempts (spec §4.7).
///
/// "Durable" here means "survives for the process's lifetime": the queue is
/// an in-memory `mpsc` channel, matching spec §0's scope (no SQL persistence
/// of historical games is part of this crate's job).
pub struct SettlementPipeline {
    tx: mpsc::Sender<SettlementJob>,
    records: Arc<Mutex<FxHashMap<MatchId, SettlementStatus>>>,
    workers: JoinSet<()>,
}

impl SettlementPipeline {
    /// Spawns `policy.max_concurrent_settlements` worker tasks pulling from a
    /// shared, bounded job queue.
    #[must_use]
    pub fn spawn<B>(backend: Arc<B>, policy: SettlementPolicy, sink: Arc<dyn Sink>) -> Self
    where
        B: SettlementBackend + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(policy.max_concurrent_settlements.max(1) * 4);
        let rx = Arc::new(Mutex::new(rx));
        let records: Arc<Mutex<FxHashMap<MatchId, SettlementStatus>>> =
            Arc::new(Mutex::new(FxHashMap::default()));

        let mut workers = JoinSet::new();
        for _ in 0..policy.max_concurrent_settlements.max(1) {
            let rx = Arc::clone(&rx);
            let backend = Arc::clone(&backend);
            let records = Arc::clone(&records);
            let sink = Arc::clone(&sink);
            workers.spawn(async move {
                worker_loop(rx, backend, records, sink, policy).await;
            });
        }

        Self { tx, records, workers }
    }

    /// Enqueues a completed match for settlement.
    ///
    /// Idempotent per spec §3 "Ownership": if this match already has a
    /// terminal `Confirmed` status recorded, the job is dropped without
    /// re-submitting (duplicate `MatchRuntime::outcome()` calls are safe).
    pub async fn enqueue(&self, job: SettlementJob) {
        {
            let records = self.records.lock().await;
            if matches!(records.get(&job.outcome.match_id), Some(SettlementStatus::Confirmed { .. })) {
                return;
            }
        }
        let _ = self.tx.send(job).await;
    }

    /// Current settlement status for a match, or `NotFound` if no job was ever enqueued.
    pub async fn status(&self, match_id: MatchId) -> SettlementStatus {
        self.records.lock().await.get(&match_id).cloned().unwrap_or(SettlementStatus::NotFound)
    }

    /// Stops accepting new jobs and waits for in-flight workers to drain.
    ///
    /// Workers only exit their loop once the sender side is dropped, so this
    /// drops `self.tx` first.
    pub async fn shutdown(mut self) {
        drop(self.tx);
        while self.workers.join_next().await.is_some() {}
    }
}

async fn worker_loop<B>(
    rx: Arc<Mutex<mpsc::Receiver<SettlementJob>>>,
    backend: Arc<B>,
    records: Arc<Mutex<FxHashMap<MatchId, SettlementStatus>>>,
    sink: Arc<dyn Sink>,
    policy: SettlementPolicy,
) where
    B: SettlementBackend + Send + Sync,
{
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else {
            return;
        };
        records.lock().await.insert(job.outcome.match_id, SettlementStatus::Pending);
        process_job(job, backend.as_ref(), &records, sink.as_ref(), &policy).await;
    }
}

#[instrument(skip(job, backend, records, sink, policy), fields(match_id = %job.outcome.match_id))]
async fn process_job<B>(
    mut job: SettlementJob,
    backend: &B,
    records: &Mutex<FxHashMap<MatchId, SettlementStatus>>,
    sink: &dyn Sink,
    policy: &SettlementPolicy,
) where
    B: SettlementBackend + Sync,
{
    let match_id = job.outcome.match_id;
    let deadline = Instant::now() + Duration::from_millis(policy.job_ttl_ms);
    let split = compute_split(
        job.outcome.bet,
        job.outcome.house_edge,
        job.outcome.tx_fee,
        job.outcome.winner,
        job.outcome.player_one,
        job.outcome.player_two,
    );
    let payload = SettlementPayload {
        match_id,
        split,
        action_log_root: job.outcome.action_log_root,
        final_state_root: job.outcome.final_state_root,
    };

    loop {
        if Instant::now() >= deadline {
            dispute(match_id, records, sink).await;
            return;
        }

        match backend.submit(&payload).await {
            Ok(confirmation) => {
                records
                    .lock()
                    .await
                    .insert(match_id, SettlementStatus::Confirmed { tx_id: confirmation.tx_id });
                sink.record(Event::SettlementSettled { match_id: match_id.0 });
                return;
            }
            Err(err) if err.is_retryable() && job.attempts < policy.max_attempts => {
                job.attempts += 1;
                sink.record(Event::SettlementRetried { match_id: match_id.0, attempt: job.attempts });
                tokio::time::sleep(policy.backoff_for(job.attempts)).await;
            }
            Err(_) => {
                dispute(match_id, records, sink).await;
                return;
            }
        }
    }
}

async fn dispute(match_id: MatchId, records: &Mutex<FxHashMap<MatchId, SettlementStatus>>, sink: &dyn Sink) {
    records.lock().await.insert(match_id, SettlementStatus::Failed);
    sink.record(Event::SettlementDisputed { match_id: match_id.0 });
}

/// In-memory backend double for tests: a pre-scripted sequence of
/// responses, one per `submit` call, looping on the last entry once exhausted.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<HashMap<MatchId, Vec<Result<Confirmation, SettlementError>>>>,
}

impl ScriptedBackend {
    /// Creates a backend with no scripted responses; `submit` for an
    /// unscripted match returns `Err(SettlementError::Invalid)`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the ordered sequence of responses for a given match.
    pub async fn script(&self, match_id: MatchId, responses: Vec<Result<Confirmation, SettlementError>>) {
        self.responses.lock().await.insert(match_id, responses);
    }
}

impl SettlementBackend for ScriptedBackend {
    async fn submit(&self, payload: &SettlementPayload) -> Result<Confirmation, SettlementError> {
        let mut guard = self.responses.lock().await;
        let Some(script) = guard.get_mut(&payload.match_id) else {
            return Err(SettlementError::Invalid);
        };
        if script.is_empty() {
            return Err(SettlementError::Invalid);
        }
        if script.len() == 1 {
            script[0].clone()
        } else {
            script.remove(0)
        }
    }

    async fn status(&self, _match_id: MatchId) -> SettlementStatus {
        SettlementStatus::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duel_ids::{EntityId, PublicKey};
    use duel_match::EndReason;
    use duel_telemetry::CountingSink;

    fn sample_outcome(match_id: u128) -> MatchOutcome {
        let player_one = EntityId(1);
        let player_two = EntityId(2);
        MatchOutcome {
            match_id: MatchId(match_id),
            player_one,
            player_two,
            wallet_one: PublicKey([1u8; 32]),
            wallet_two: PublicKey([2u8; 32]),
            bet: 1_000,
            house_edge: 0.05,
            tx_fee: 0,
            winner: Some(player_one),
            reason: EndReason::Elimination,
            action_log_root: [0u8; 32],
            final_state_root: [0u8; 32],
        }
    }

    fn policy() -> SettlementPolicy {
        SettlementPolicy {
            max_concurrent_settlements: 2,
            base_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            max_attempts: 5,
            job_ttl_ms: 60_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_succeed_settles_exactly_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let outcome = sample_outcome(1);
        backend
            .script(
                outcome.match_id,
                vec![
                    Err(SettlementError::Transient),
                    Err(SettlementError::Transient),
                    Ok(Confirmation { tx_id: "tx-3".to_owned() }),
                ],
            )
            .await;

        let sink = Arc::new(CountingSink::new());
        let pipeline = SettlementPipeline::spawn(backend, policy(), sink.clone());
        pipeline.enqueue(SettlementJob::new(outcome)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(sink.settlement_retried_count(), 2);
        assert_eq!(sink.settlement_settled_count(), 1);
        assert_eq!(sink.settlement_disputed_count(), 0);
        match pipeline.status(MatchId(1)).await {
            SettlementStatus::Confirmed { tx_id } => assert_eq!(tx_id, "tx-3"),
            other => panic!("expected Confirmed, got {other:?}"),
        }
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_disputes_immediately() {
        let backend = Arc::new(ScriptedBackend::new());
        let outcome = sample_outcome(2);
        backend.script(outcome.match_id, vec![Err(SettlementError::Rejected)]).await;

        let sink = Arc::new(CountingSink::new());
        let pipeline = SettlementPipeline::spawn(backend, policy(), sink.clone());
        pipeline.enqueue(SettlementJob::new(outcome)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.settlement_disputed_count(), 1);
        assert_eq!(pipeline.status(MatchId(2)).await, SettlementStatus::Failed);
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dispute_instead_of_looping_forever() {
        let backend = Arc::new(ScriptedBackend::new());
        let outcome = sample_outcome(3);
        let mut always_transient = Vec::new();
        for _ in 0..10 {
            always_transient.push(Err(SettlementError::Transient));
        }
        backend.script(outcome.match_id, always_transient).await;

        let mut tight_policy = policy();
        tight_policy.max_attempts = 2;
        let sink = Arc::new(CountingSink::new());
        let pipeline = SettlementPipeline::spawn(backend, tight_policy, sink.clone());
        pipeline.enqueue(SettlementJob::new(outcome)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(sink.settlement_disputed_count(), 1);
        assert_eq!(sink.settlement_settled_count(), 0);
        pipeline.shutdown().await;
    }

    #[test]
    fn policy_from_config_carries_the_configured_bounds() {
        let config = MatchConfig::defaults();
        let policy = SettlementPolicy::from_config(&config);
        assert_eq!(policy.max_concurrent_settlements, config.max_concurrent_settlements);
        assert_eq!(policy.max_attempts, config.settlement_max_attempts);
        assert_eq!(policy.job_ttl_ms, config.job_ttl_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueue_after_confirmation_is_a_no_op() {
        let backend = Arc::new(ScriptedBackend::new());
        let outcome = sample_outcome(4);
        backend.script(outcome.match_id, vec![Ok(Confirmation { tx_id: "tx-only".to_owned() })]).await;

        let sink = Arc::new(CountingSink::new());
        let pipeline = SettlementPipeline::spawn(backend, policy(), sink.clone());
        pipeline.enqueue(SettlementJob::new(outcome.clone())).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        pipeline.enqueue(SettlementJob::new(outcome)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.settlement_settled_count(), 1);
        pipeline.shutdown().await;
    }
}
