//! Transaction lifecycle hooks and session counters.
//!
//! Hooks are best effort: a panicking observer is logged and otherwise
//! ignored, so telemetry can never change what the peer receives.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chaincode_protocol::Response;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::InvocationKind;

/// What observers learn about a transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub channel_id: String,
    pub tx_id: String,
    pub kind: InvocationKind,
    pub function: Option<String>,
    pub started_at: Instant,
}

impl TransactionInfo {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Terminal outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Completed(Response),
    Failed(Response),
}

impl TransactionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionOutcome::Completed(_))
    }

    pub fn response(&self) -> &Response {
        match self {
            TransactionOutcome::Completed(response) | TransactionOutcome::Failed(response) => {
                response
            }
        }
    }
}

pub trait TransactionObserver: Send + Sync {
    fn on_transaction_start(&self, _info: &TransactionInfo) {}

    fn on_transaction_end(&self, _info: &TransactionInfo, _outcome: &TransactionOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransactionObserver for NoopObserver {}

/// Emits one structured log line per transaction boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn on_transaction_start(&self, info: &TransactionInfo) {
        debug!(
            channel = %info.channel_id,
            tx_id = %info.tx_id,
            kind = info.kind.as_str(),
            function = info.function.as_deref().unwrap_or(""),
            "Transaction started"
        );
    }

    fn on_transaction_end(&self, info: &TransactionInfo, outcome: &TransactionOutcome) {
        let response = outcome.response();
        info!(
            channel = %info.channel_id,
            tx_id = %info.tx_id,
            kind = info.kind.as_str(),
            status = response.status,
            success = outcome.is_success(),
            elapsed_ms = info.elapsed().as_millis() as u64,
            "Transaction finished"
        );
    }
}

pub(crate) fn notify_start(observer: &dyn TransactionObserver, info: &TransactionInfo) {
    if catch_unwind(AssertUnwindSafe(|| observer.on_transaction_start(info))).is_err() {
        warn!(tx_id = %info.tx_id, "Transaction observer panicked in start hook");
    }
}

pub(crate) fn notify_end(
    observer: &dyn TransactionObserver,
    info: &TransactionInfo,
    outcome: &TransactionOutcome,
) {
    if catch_unwind(AssertUnwindSafe(|| observer.on_transaction_end(info, outcome))).is_err() {
        warn!(tx_id = %info.tx_id, "Transaction observer panicked in end hook");
    }
}

#[derive(Debug)]
pub struct SessionMetrics {
    started_at: DateTime<Utc>,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped_messages: AtomicU64,
    protocol_violations: AtomicU64,
    request_timeouts: AtomicU64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub session_started_at: DateTime<Utc>,
    pub transactions_started: u64,
    pub transactions_completed: u64,
    pub transactions_failed: u64,
    pub transactions_active: u64,
    pub dropped_messages: u64,
    pub protocol_violations: u64,
    pub request_timeouts: u64,
}

impl SessionMetrics {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: &TransactionOutcome) {
        let counter = if outcome.is_success() {
            &self.completed
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running violation count including this one.
    pub(crate) fn record_violation(&self) -> u64 {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        self.protocol_violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        MetricsSnapshot {
            session_started_at: self.started_at,
            transactions_started: started,
            transactions_completed: completed,
            transactions_failed: failed,
            transactions_active: started.saturating_sub(completed + failed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
        }
    }
}
