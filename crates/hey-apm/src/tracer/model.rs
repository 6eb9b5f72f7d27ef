// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Intake v2 event documents.
//!
//! A request body is newline-delimited JSON: one `metadata` line followed by one line per
//! event, each wrapped in an object keyed by its kind.

use std::collections::BTreeMap;

use serde::Serialize;

pub const AGENT_NAME: &str = "hey-apm";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct MetadataLine<'a> {
    pub metadata: Metadata<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata<'a> {
    pub service: Service<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Service<'a> {
    pub name: &'a str,
    pub agent: Agent,
    pub language: Language,
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Language {
    pub name: &'static str,
}

impl<'a> MetadataLine<'a> {
    pub fn new(service_name: &'a str) -> Self {
        MetadataLine {
            metadata: Metadata {
                service: Service {
                    name: service_name,
                    agent: Agent {
                        name: AGENT_NAME,
                        version: AGENT_VERSION,
                    },
                    language: Language { name: "rust" },
                },
            },
        }
    }
}

/// One event line of an intake request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Transaction(TransactionEvent),
    Span(SpanEvent),
    Error(ErrorEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Transaction(_) => EventKind::Transaction,
            Event::Span(_) => EventKind::Span,
            Event::Error(_) => EventKind::Error,
        }
    }
}

/// The three event kinds the load generator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Transaction,
    Span,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Transaction, EventKind::Span, EventKind::Error];

    /// Value of `processor.event` for documents of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::Span => "span",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    /// Microseconds since the unix epoch.
    pub timestamp: i64,
    /// Milliseconds.
    pub duration: f64,
    pub sampled: bool,
    pub span_count: SpanCount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpanCount {
    pub started: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Context {
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanEvent {
    pub id: String,
    pub transaction_id: String,
    pub trace_id: String,
    pub parent_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    pub subtype: String,
    pub timestamp: i64,
    pub duration: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<StackFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub id: String,
    pub timestamp: i64,
    pub culprit: String,
    pub exception: Exception,
}

#[derive(Debug, Clone, Serialize)]
pub struct Exception {
    pub message: String,
    #[serde(rename = "type")]
    pub exception_type: String,
    pub stacktrace: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub filename: String,
    pub function: String,
    pub module: String,
    pub lineno: u32,
}
