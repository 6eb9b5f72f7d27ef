// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run reports.
//!
//! A [`Report`] combines the workload description, the run's counters and the difference
//! between the server snapshots taken around the run. Ratios and rates whose denominator is
//! zero are left out instead of being reported as zero or infinity.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Input;
use crate::probe::{ServerInfo, ServerStatus};
use crate::tracer::EventKind;
use crate::worker::RunResult;

/// Index reports are stored in.
pub const REPORT_INDEX: &str = "hey-bench";

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// `numerator / denominator`, or `None` when the denominator is zero.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}

/// The workload-shaping part of an [`Input`]. Two reports are comparable when their
/// fingerprints are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub apm_host: String,
    pub run_timeout: u64,
    pub flush_timeout: u64,
    pub transaction_generation_frequency: u64,
    pub transaction_generation_limit: u64,
    pub spans_generated_max_limit: u64,
    pub spans_generated_min_limit: u64,
    pub error_generation_frequency: u64,
    pub error_generation_limit: u64,
    pub error_generation_frames_max_limit: u64,
    pub error_generation_frames_min_limit: u64,
}

impl From<&Input> for Fingerprint {
    fn from(input: &Input) -> Self {
        Fingerprint {
            apm_host: input.apm_url.clone(),
            run_timeout: nanos(input.run_timeout),
            flush_timeout: nanos(input.flush_timeout),
            transaction_generation_frequency: nanos(input.transaction_frequency),
            transaction_generation_limit: input.transaction_limit,
            spans_generated_max_limit: input.span_max,
            spans_generated_min_limit: input.span_min,
            error_generation_frequency: nanos(input.error_frequency),
            error_generation_limit: input.error_limit,
            error_generation_frames_max_limit: input.error_frame_max,
            error_generation_frames_min_limit: input.error_frame_min,
        }
    }
}

impl Fingerprint {
    /// One `match` clause per field.
    pub fn match_clauses(&self) -> Vec<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields
                .into_iter()
                .map(|(field, value)| json!({ "match": { field: value } }))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub input: Fingerprint,

    pub report_id: String,
    pub report_date: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Seconds from start until the flush completed.
    pub elapsed: f64,
    pub requests: u64,
    pub failed_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_success_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_sec: Option<f64>,

    pub transactions_generated: u64,
    pub transactions_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions_indexed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions_sent_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions_loss_ratio: Option<f64>,

    pub spans_generated: u64,
    pub spans_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spans_indexed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spans_sent_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spans_loss_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spans_per_transaction: Option<f64>,

    pub errors_generated: u64,
    pub errors_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_indexed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_sent_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_loss_ratio: Option<f64>,

    pub events_generated: u64,
    pub events_sent: u64,
    pub events_accepted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_indexed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_generated_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_sent_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_accepted_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_indexed_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_per_request: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_loss_ratio: Option<f64>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unique_errors: BTreeMap<String, u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apm_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apm_build: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apm_build_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apm_settings: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_alloc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_alloc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mallocs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gc: Option<u64>,
}

/// Eight hex digits from four random bytes.
pub fn new_report_id() -> String {
    hex::encode(fastrand::u32(..).to_be_bytes())
}

fn indexed(initial: &ServerStatus, last: &ServerStatus, kind: EventKind) -> Option<u64> {
    let before = initial.indexed.get(kind)?;
    let after = last.indexed.get(kind)?;
    Some(after.saturating_sub(before))
}

fn loss_ratio(indexed: Option<u64>, generated: u64) -> Option<f64> {
    ratio(indexed? as f64, generated as f64).map(|r| 1.0 - r)
}

impl Report {
    pub fn build(
        input: &Input,
        result: &RunResult,
        info: Option<&ServerInfo>,
        initial: &ServerStatus,
        last: &ServerStatus,
    ) -> Report {
        let now = Utc::now();
        let elapsed = result.elapsed().as_secs_f64();
        let stats = &result.stats;
        let transport = &result.transport;

        let transactions_generated = stats.generated(EventKind::Transaction);
        let spans_generated = stats.generated(EventKind::Span);
        let errors_generated = stats.generated(EventKind::Error);
        let transactions_indexed = indexed(initial, last, EventKind::Transaction);
        let spans_indexed = indexed(initial, last, EventKind::Span);
        let errors_indexed = indexed(initial, last, EventKind::Error);

        let events_generated = transactions_generated + spans_generated + errors_generated;
        let events_sent = stats.transactions_sent + stats.spans_sent + stats.errors_sent;
        let events_indexed = match (transactions_indexed, spans_indexed, errors_indexed) {
            (Some(t), Some(s), Some(e)) => Some(t + s + e),
            _ => None,
        };

        let mem_delta = match (&initial.mem_stats, &last.mem_stats) {
            (Some(initial), Some(last)) => Some(last.sub(initial)),
            _ => None,
        };

        Report {
            input: Fingerprint::from(input),
            report_id: new_report_id(),
            report_date: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp: now,

            elapsed,
            requests: transport.requests,
            failed_requests: transport.failed_requests,
            request_success_ratio: ratio(
                transport.requests as f64,
                (transport.requests + transport.failed_requests) as f64,
            ),
            requests_per_sec: ratio(transport.requests as f64, elapsed),

            transactions_generated,
            transactions_sent: stats.transactions_sent,
            transactions_indexed,
            transactions_sent_ratio: ratio(
                stats.transactions_sent as f64,
                transactions_generated as f64,
            ),
            transactions_loss_ratio: loss_ratio(transactions_indexed, transactions_generated),

            spans_generated,
            spans_sent: stats.spans_sent,
            spans_indexed,
            spans_sent_ratio: ratio(stats.spans_sent as f64, spans_generated as f64),
            spans_loss_ratio: loss_ratio(spans_indexed, spans_generated),
            spans_per_transaction: ratio(spans_generated as f64, transactions_generated as f64),

            errors_generated,
            errors_sent: stats.errors_sent,
            errors_indexed,
            errors_sent_ratio: ratio(stats.errors_sent as f64, errors_generated as f64),
            errors_loss_ratio: loss_ratio(errors_indexed, errors_generated),

            events_generated,
            events_sent,
            events_accepted: transport.accepted,
            events_indexed,
            events_generated_per_sec: ratio(events_generated as f64, elapsed),
            events_sent_per_sec: ratio(events_sent as f64, elapsed),
            events_accepted_per_sec: ratio(transport.accepted as f64, elapsed),
            events_indexed_per_sec: events_indexed.and_then(|n| ratio(n as f64, elapsed)),
            events_per_request: ratio(events_sent as f64, transport.requests as f64),
            indexed_ratio: events_indexed.and_then(|n| ratio(n as f64, transport.accepted as f64)),
            event_loss_ratio: loss_ratio(events_indexed, events_generated),

            unique_errors: transport.unique_errors.clone(),

            apm_version: info.map(|i| i.version.clone()),
            apm_build: info.map(|i| i.build_sha.clone()),
            apm_build_date: info.map(|i| i.build_date.clone()),
            apm_settings: last.settings.clone(),

            total_alloc: mem_delta.map(|m| m.total_alloc),
            heap_alloc: mem_delta.map(|m| m.heap_alloc),
            mallocs: mem_delta.map(|m| m.mallocs),
            num_gc: mem_delta.map(|m| m.num_gc),
        }
    }

    /// Indexed events per second, the figure benchmarks are compared on.
    pub fn performance(&self) -> Option<f64> {
        self.events_indexed_per_sec
    }

    /// Events that made it into the server's indices, zero if unknown.
    pub fn indexed_events(&self) -> u64 {
        self.events_indexed.unwrap_or(0)
    }
}
