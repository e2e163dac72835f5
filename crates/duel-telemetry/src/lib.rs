//! Counters and histograms emitted via an abstract sink.
//!
//! The teacher's `rmg_core::telemetry` module emits fixed JSON events
//! straight to stdout behind a feature flag. This crate keeps the "named
//! event, cheap to call, safe to no-op in prod" shape but routes through a
//! [`Sink`] trait instead of a hardcoded writer, so the match runtime's
//! `TickOverrun`/`SlowTick`/`DegradedMatch` signals (spec §5) can be wired to
//! a metrics backend without recompiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

/// A named telemetry event, with an optional numeric payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A tick's work exceeded its budget but was still completed within one period.
    TickOverrun {
        /// Match this event belongs to, as a raw id for sink correlation.
        match_id: u128,
        /// How long the tick took, in microseconds.
        took_micros: u64,
    },
    /// A tick took more than `2 * tick_period_ms`.
    SlowTick {
        /// Match this event belongs to.
        match_id: u128,
        /// How long the tick took, in microseconds.
        took_micros: u64,
    },
    /// Three consecutive `SlowTick`s; the match runtime enters degraded mode.
    DegradedMatch {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// An optimistic update was applied speculatively.
    OptimisticApplied {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// An optimistic update was confirmed.
    OptimisticConfirmed {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// An optimistic update was rejected and rolled back.
    OptimisticRejected {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// An optimistic update expired unconfirmed and was rolled back.
    OptimisticExpired {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// A settlement job was retried after a retryable backend error.
    SettlementRetried {
        /// Match this event belongs to.
        match_id: u128,
        /// Attempt number that just failed, starting at 1.
        attempt: u32,
    },
    /// A settlement job's payout request was confirmed by the backend.
    SettlementSettled {
        /// Match this event belongs to.
        match_id: u128,
    },
    /// A settlement job could not be completed and was marked `Disputed`.
    SettlementDisputed {
        /// Match this event belongs to.
        match_id: u128,
    },
}

/// Destination for telemetry events.
///
/// Implementors should be cheap and non-blocking; the match tick loop and
/// the settlement workers call `record` inline on their hot path.
pub trait Sink: Send + Sync {
    /// Records one telemetry event.
    fn record(&self, event: Event);
}

/// Sink that forwards every event to `tracing` at an appropriate level.
///
/// The default wiring for `duel-serviced`: structured spans already carry
/// match/session ids, so this sink only needs to add the event payload.
#[derive(Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn record(&self, event: Event) {
        match event {
            Event::TickOverrun { match_id, took_micros } => {
                tracing::debug!(match_id, took_micros, "tick_overrun");
            }
            Event::SlowTick { match_id, took_micros } => {
                warn!(match_id, took_micros, "slow_tick");
            }
            Event::DegradedMatch { match_id } => {
                warn!(match_id, "degraded_match");
            }
            Event::OptimisticApplied { match_id } => {
                tracing::trace!(match_id, "optimistic_applied");
            }
            Event::OptimisticConfirmed { match_id } => {
                tracing::trace!(match_id, "optimistic_confirmed");
            }
            Event::OptimisticRejected { match_id } => {
                tracing::debug!(match_id, "optimistic_rejected");
            }
            Event::OptimisticExpired { match_id } => {
                tracing::debug!(match_id, "optimistic_expired");
            }
            Event::SettlementRetried { match_id, attempt } => {
                warn!(match_id, attempt, "settlement_retried");
            }
            Event::SettlementSettled { match_id } => {
                tracing::info!(match_id, "settlement_settled");
            }
            Event::SettlementDisputed { match_id } => {
                tracing::error!(match_id, "settlement_disputed");
            }
        }
    }
}

/// Adapts a shared `Arc<dyn Sink>` so it can be handed out as an owned
/// `Box<dyn Sink>` to callers that expect to own their sink (e.g. one per
/// match), while every caller still reports to the same underlying sink
/// instance.
#[derive(Clone)]
pub struct ArcSink(pub Arc<dyn Sink>);

impl Sink for ArcSink {
    fn record(&self, event: Event) {
        self.0.record(event);
    }
}

/// In-memory sink that only counts events by kind, for tests and for
/// dashboards that poll rather than stream.
#[derive(Default)]
pub struct CountingSink {
    tick_overrun: AtomicU64,
    slow_tick: AtomicU64,
    degraded_match: AtomicU64,
    optimistic_rejected: AtomicU64,
    optimistic_expired: AtomicU64,
    settlement_retried: AtomicU64,
    settlement_settled: AtomicU64,
    settlement_disputed: AtomicU64,
}

impl CountingSink {
    /// Creates a sink with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the `TickOverrun` counter.
    #[must_use]
    pub fn tick_overrun_count(&self) -> u64 {
        self.tick_overrun.load(Ordering::Relaxed)
    }

    /// Current value of the `SlowTick` counter.
    #[must_use]
    pub fn slow_tick_count(&self) -> u64 {
        self.slow_tick.load(Ordering::Relaxed)
    }

    /// Current value of the `DegradedMatch` counter.
    #[must_use]
    pub fn degraded_match_count(&self) -> u64 {
        self.degraded_match.load(Ordering::Relaxed)
    }

    /// Current value of the `OptimisticRejected` counter.
    #[must_use]
    pub fn optimistic_rejected_count(&self) -> u64 {
        self.optimistic_rejected.load(Ordering::Relaxed)
    }

    /// Current value of the `OptimisticExpired` counter.
    #[must_use]
    pub fn optimistic_expired_count(&self) -> u64 {
        self.optimistic_expired.load(Ordering::Relaxed)
    }

    /// Current value of the `SettlementRetried` counter.
    #[must_use]
    pub fn settlement_retried_count(&self) -> u64 {
        self.settlement_retried.load(Ordering::Relaxed)
    }

    /// Current value of the `SettlementSettled` counter.
    #[must_use]
    pub fn settlement_settled_count(&self) -> u64 {
        self.settlement_settled.load(Ordering::Relaxed)
    }

    /// Current value of the `SettlementDisputed` counter.
    #[must_use]
    pub fn settlement_disputed_count(&self) -> u64 {
        self.settlement_disputed.load(Ordering::Relaxed)
    }
}

impl Sink for CountingSink {
    fn record(&self, event: Event) {
        let counter = match event {
            Event::TickOverrun { .. } => &self.tick_overrun,
            Event::SlowTick { .. } => &self.slow_tick,
            Event::DegradedMatch { .. } => &self.degraded_match,
            Event::OptimisticRejected { .. } => &self.optimistic_rejected,
            Event::OptimisticExpired { .. } => &self.optimistic_expired,
            Event::SettlementRetried { .. } => &self.settlement_retried,
            Event::SettlementSettled { .. } => &self.settlement_settled,
            Event::SettlementDisputed { .. } => &self.settlement_disputed,
            Event::OptimisticApplied { .. } | Event::OptimisticConfirmed { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
