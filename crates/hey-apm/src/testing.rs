// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory tracer shared by unit tests.

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::tracer::{
    Span, SyntheticError, Tracer, TracerStats, Transaction, TransportStats,
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedTransaction {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub spans_started: u64,
}

/// Tracer that keeps everything in memory and counts every event as sent.
#[derive(Debug, Default)]
pub(crate) struct RecordingTracer {
    max_spans: u64,
    flush_delay: Option<Duration>,
    transactions: Mutex<Vec<RecordedTransaction>>,
    error_frames: Mutex<Vec<u64>>,
    spans_sent: AtomicU64,
    spans_dropped: AtomicU64,
    flushes: AtomicU64,
    closes: AtomicU64,
}

impl RecordingTracer {
    pub fn new(max_spans: u64) -> Self {
        RecordingTracer {
            max_spans,
            ..Default::default()
        }
    }

    /// Makes every flush take `delay` before completing.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = Some(delay);
        self
    }

    pub fn transactions(&self) -> Vec<RecordedTransaction> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn error_frames(&self) -> Vec<u64> {
        self.error_frames.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tracer for RecordingTracer {
    fn start_transaction(&self, name: &str, transaction_type: &str) -> Transaction {
        Transaction::new(name, transaction_type, self.max_spans)
    }

    fn end_transaction(&self, transaction: Transaction) {
        self.transactions.lock().unwrap().push(RecordedTransaction {
            name: transaction.name().to_string(),
            tags: transaction.tags.clone(),
            spans_started: transaction.spans_started(),
        });
    }

    fn start_span(&self, transaction: &mut Transaction, name: &str, subtype: &str) -> Option<Span> {
        let span = transaction.try_start_span(name, subtype);
        if span.is_none() {
            self.spans_dropped.fetch_add(1, Ordering::SeqCst);
        }
        span
    }

    fn end_span(&self, _span: Span) {
        self.spans_sent.fetch_add(1, Ordering::SeqCst);
    }

    fn send_error(&self, error: &SyntheticError) {
        self.error_frames
            .lock()
            .unwrap()
            .push(error.frames() as u64);
    }

    async fn flush(&self, cancel: &CancellationToken) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.flush_delay {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stats(&self) -> TracerStats {
        TracerStats {
            transactions_sent: self.transactions.lock().unwrap().len() as u64,
            transactions_dropped: 0,
            spans_sent: self.spans_sent.load(Ordering::SeqCst),
            spans_dropped: self.spans_dropped.load(Ordering::SeqCst),
            errors_sent: self.error_frames.lock().unwrap().len() as u64,
            errors_dropped: 0,
        }
    }

    fn transport_stats(&self) -> TransportStats {
        TransportStats::default()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
