// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracer facade.
//!
//! The workload engine only talks to a [`Tracer`]: it starts transactions and spans, sends
//! synthetic errors, flushes, and reads counters. [`ApmTracer`] is the real implementation; it
//! queues events in memory and streams them to the APM server from a background task. Tests
//! substitute their own implementation.

pub mod apm;
pub mod model;
pub mod stacktrace;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use apm::{ApmTracer, TracerConfig, TracerError};
pub use model::EventKind;
pub use stacktrace::SyntheticError;
pub use transport::TransportStats;

/// Counters of events handed to the server and events discarded on the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub transactions_sent: u64,
    pub transactions_dropped: u64,
    pub spans_sent: u64,
    pub spans_dropped: u64,
    pub errors_sent: u64,
    pub errors_dropped: u64,
}

impl TracerStats {
    pub fn sent(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::Transaction => self.transactions_sent,
            EventKind::Span => self.spans_sent,
            EventKind::Error => self.errors_sent,
        }
    }

    pub fn dropped(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::Transaction => self.transactions_dropped,
            EventKind::Span => self.spans_dropped,
            EventKind::Error => self.errors_dropped,
        }
    }

    /// Events the client produced, whether or not they made it out.
    pub fn generated(&self, kind: EventKind) -> u64 {
        self.sent(kind) + self.dropped(kind)
    }
}

/// What the load generator needs from an APM client.
///
/// Implementations must be safe to call from several tasks at once.
#[async_trait]
pub trait Tracer: Send + Sync {
    fn start_transaction(&self, name: &str, transaction_type: &str) -> Transaction;

    /// Queues the transaction. Its spans must have been ended before.
    fn end_transaction(&self, transaction: Transaction);

    /// Starts a span as a child of `transaction`. Returns `None`, and counts the span as
    /// dropped, if the transaction already holds the maximum number of spans.
    fn start_span(&self, transaction: &mut Transaction, name: &str, subtype: &str) -> Option<Span>;

    fn end_span(&self, span: Span);

    fn send_error(&self, error: &SyntheticError);

    /// Waits until every event queued so far has been sent, or until `cancel` fires.
    async fn flush(&self, cancel: &CancellationToken);

    fn stats(&self) -> TracerStats;

    fn transport_stats(&self) -> TransportStats;

    /// Stops sending. Events queued afterwards are dropped.
    async fn close(&self);
}

pub(crate) fn new_id() -> String {
    hex::encode(fastrand::u64(..).to_be_bytes())
}

pub(crate) fn new_trace_id() -> String {
    hex::encode(fastrand::u128(..).to_be_bytes())
}

pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub(crate) fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// A transaction being recorded. Ended with [`Tracer::end_transaction`].
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: String,
    pub(crate) trace_id: String,
    pub(crate) name: String,
    pub(crate) transaction_type: String,
    pub(crate) timestamp: i64,
    pub(crate) started: Instant,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) spans_started: u64,
    pub(crate) spans_dropped: u64,
    max_spans: u64,
}

impl Transaction {
    pub fn new(name: &str, transaction_type: &str, max_spans: u64) -> Self {
        Transaction {
            id: new_id(),
            trace_id: new_trace_id(),
            name: name.to_string(),
            transaction_type: transaction_type.to_string(),
            timestamp: now_micros(),
            started: Instant::now(),
            tags: BTreeMap::new(),
            spans_started: 0,
            spans_dropped: 0,
            max_spans,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_tag(&mut self, key: &str, value: impl ToString) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn spans_started(&self) -> u64 {
        self.spans_started
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped
    }

    /// Registers a new child span, or records a drop when the span budget is used up.
    pub fn try_start_span(&mut self, name: &str, subtype: &str) -> Option<Span> {
        if self.spans_started >= self.max_spans {
            self.spans_dropped += 1;
            return None;
        }
        self.spans_started += 1;
        Some(Span {
            id: new_id(),
            transaction_id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            name: name.to_string(),
            subtype: subtype.to_string(),
            timestamp: now_micros(),
            started: Instant::now(),
        })
    }
}

/// A span being recorded. Ended with [`Tracer::end_span`].
#[derive(Debug)]
pub struct Span {
    pub(crate) id: String,
    pub(crate) transaction_id: String,
    pub(crate) trace_id: String,
    pub(crate) name: String,
    pub(crate) subtype: String,
    pub(crate) timestamp: i64,
    pub(crate) started: Instant,
}

impl Span {
    pub fn name(&self) -> &str {
        &self.name
    }
}

static DEFAULT_TRACER: Mutex<Option<Arc<ApmTracer>>> = Mutex::new(None);

/// Installs `tracer` as the process-wide default, returning the previous one.
///
/// The previous tracer is not closed; callers that replace a live tracer should close it.
pub fn set_default(tracer: Arc<ApmTracer>) -> Option<Arc<ApmTracer>> {
    match DEFAULT_TRACER.lock() {
        Ok(mut slot) => slot.replace(tracer),
        Err(poisoned) => poisoned.into_inner().replace(tracer),
    }
}

/// The process-wide default tracer, if one is installed.
pub fn default_tracer() -> Option<Arc<ApmTracer>> {
    match DEFAULT_TRACER.lock() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Removes the default tracer without closing it.
pub fn take_default() -> Option<Arc<ApmTracer>> {
    match DEFAULT_TRACER.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Removes the default tracer if it is `tracer`.
pub fn clear_default(tracer: &Arc<ApmTracer>) -> bool {
    let mut slot = match DEFAULT_TRACER.lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, tracer)) {
        *slot = None;
        true
    } else {
        false
    }
}

/// Closes and removes the default tracer, if any.
pub async fn close_default() {
    if let Some(tracer) = take_default() {
        debug!("Closing default tracer");
        tracer.close().await;
    }
}
