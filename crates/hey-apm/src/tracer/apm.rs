// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::model::{
    Context, ErrorEvent, Event, EventKind, Exception, MetadataLine, SpanCount, SpanEvent,
    TransactionEvent,
};
use super::stacktrace::{synthetic_frames, SyntheticError, SPAN_STACK_DEPTH};
use super::transport::{SendOutcome, Transport, TransportCounters, TransportError};
use super::{
    millis, new_id, now_micros, Span, Tracer, TracerStats, Transaction, TransportStats,
};
use crate::http_utils::build_client;

const DEFAULT_QUEUE_SIZE: usize = 8192;
const DEFAULT_MAX_REQUEST_SIZE: usize = 768 * 1024;
const DEFAULT_REQUEST_TIME: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub server_url: String,
    pub secret: String,
    pub service_name: String,
    /// Spans beyond this count within one transaction are dropped.
    pub max_spans: u64,
    /// Events waiting to be encoded. Events arriving on a full queue are dropped.
    pub queue_size: usize,
    /// A request is sent once its body grows past this many bytes.
    pub max_request_size: usize,
    /// A request is sent at the latest this long after its first event was encoded.
    pub request_time: Duration,
    pub request_timeout: Duration,
    /// Spans lasting longer than this carry a stack trace.
    pub span_frames_min_duration: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            server_url: crate::config::DEFAULT_APM_URL.to_string(),
            secret: String::new(),
            service_name: crate::config::DEFAULT_SERVICE_NAME.to_string(),
            max_spans: 500,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            request_time: DEFAULT_REQUEST_TIME,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            span_frames_min_duration: Duration::from_nanos(1),
        }
    }
}

impl TracerConfig {
    pub fn from_input(input: &crate::config::Input) -> Self {
        TracerConfig {
            server_url: input.apm_url.clone(),
            secret: input.apm_secret.clone(),
            service_name: input.service_name.clone(),
            max_spans: input.span_max,
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug)]
enum Command {
    Event(Event),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    transactions_sent: AtomicU64,
    transactions_dropped: AtomicU64,
    spans_sent: AtomicU64,
    spans_dropped: AtomicU64,
    errors_sent: AtomicU64,
    errors_dropped: AtomicU64,
}

impl Counters {
    fn sent(&self, kind: EventKind) -> &AtomicU64 {
        match kind {
            EventKind::Transaction => &self.transactions_sent,
            EventKind::Span => &self.spans_sent,
            EventKind::Error => &self.errors_sent,
        }
    }

    fn dropped(&self, kind: EventKind) -> &AtomicU64 {
        match kind {
            EventKind::Transaction => &self.transactions_dropped,
            EventKind::Span => &self.spans_dropped,
            EventKind::Error => &self.errors_dropped,
        }
    }

    fn snapshot(&self) -> TracerStats {
        TracerStats {
            transactions_sent: self.transactions_sent.load(Ordering::Relaxed),
            transactions_dropped: self.transactions_dropped.load(Ordering::Relaxed),
            spans_sent: self.spans_sent.load(Ordering::Relaxed),
            spans_dropped: self.spans_dropped.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
            errors_dropped: self.errors_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Tracer that streams events to an APM server.
///
/// Events are pushed onto a bounded queue without waiting; a background task encodes them into
/// newline-delimited JSON request bodies and sends those one at a time, which keeps events of
/// the same kind in order on the wire.
pub struct ApmTracer {
    config: TracerConfig,
    tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    transport_counters: Arc<TransportCounters>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ApmTracer {
    /// Creates the tracer and starts its background sender. Must be called within a Tokio
    /// runtime.
    pub fn new(config: TracerConfig) -> Result<Self, TracerError> {
        let client = build_client(config.request_timeout)?;
        let transport_counters = Arc::new(TransportCounters::default());
        let transport = Transport::new(
            client,
            &config.server_url,
            &config.secret,
            Arc::clone(&transport_counters),
        )?;

        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let sender = Sender {
            rx,
            transport,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            metadata: metadata_line(&config.service_name),
            max_request_size: config.max_request_size,
            request_time: config.request_time,
            body: Vec::new(),
            pending: BTreeMap::new(),
            deadline: None,
        };
        let worker = tokio::spawn(sender.run());

        debug!(
            "Tracer started: sending to {} as {}",
            config.server_url, config.service_name
        );

        Ok(ApmTracer {
            config,
            tx,
            counters,
            transport_counters,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    fn enqueue(&self, event: Event) {
        let kind = event.kind();
        if let Err(e) = self.tx.try_send(Command::Event(event)) {
            self.counters.dropped(kind).fetch_add(1, Ordering::Relaxed);
            if let mpsc::error::TrySendError::Closed(_) = e {
                debug!("Tracer closed, dropping {}", kind.as_str());
            }
        }
    }
}

fn metadata_line(service_name: &str) -> Vec<u8> {
    match serde_json::to_vec(&MetadataLine::new(service_name)) {
        Ok(mut line) => {
            line.push(b'\n');
            line
        }
        Err(e) => {
            error!("Failed to encode metadata: {e}");
            Vec::new()
        }
    }
}

#[async_trait]
impl Tracer for ApmTracer {
    fn start_transaction(&self, name: &str, transaction_type: &str) -> Transaction {
        Transaction::new(name, transaction_type, self.config.max_spans)
    }

    fn end_transaction(&self, transaction: Transaction) {
        let duration = transaction.started.elapsed();
        let context = if transaction.tags.is_empty() {
            None
        } else {
            Some(Context {
                tags: transaction.tags,
            })
        };
        self.enqueue(Event::Transaction(TransactionEvent {
            id: transaction.id,
            trace_id: transaction.trace_id,
            name: transaction.name,
            transaction_type: transaction.transaction_type,
            timestamp: transaction.timestamp,
            duration: millis(duration),
            sampled: true,
            span_count: SpanCount {
                started: transaction.spans_started,
                dropped: transaction.spans_dropped,
            },
            context,
        }));
    }

    fn start_span(&self, transaction: &mut Transaction, name: &str, subtype: &str) -> Option<Span> {
        let span = transaction.try_start_span(name, subtype);
        if span.is_none() {
            self.counters.spans_dropped.fetch_add(1, Ordering::Relaxed);
        }
        span
    }

    fn end_span(&self, span: Span) {
        let duration = span.started.elapsed();
        let stacktrace = if duration > self.config.span_frames_min_duration {
            synthetic_frames(SPAN_STACK_DEPTH)
        } else {
            Vec::new()
        };
        self.enqueue(Event::Span(SpanEvent {
            id: span.id,
            parent_id: span.transaction_id.clone(),
            transaction_id: span.transaction_id,
            trace_id: span.trace_id,
            name: span.name,
            span_type: "app".to_string(),
            subtype: span.subtype,
            timestamp: span.timestamp,
            duration: millis(duration),
            stacktrace,
        }));
    }

    fn send_error(&self, error: &SyntheticError) {
        self.enqueue(Event::Error(ErrorEvent {
            id: new_id(),
            timestamp: now_micros(),
            culprit: error.culprit(),
            exception: Exception {
                message: error.to_string(),
                exception_type: "SyntheticError".to_string(),
                stacktrace: error.stack_trace(),
            },
        }));
    }

    async fn flush(&self, cancel: &CancellationToken) {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = self.tx.send(Command::Flush(ack_tx)) => {
                if sent.is_err() {
                    debug!("Tracer closed, nothing to flush");
                    return;
                }
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = ack_rx => {}
        }
    }

    fn stats(&self) -> TracerStats {
        self.counters.snapshot()
    }

    fn transport_stats(&self) -> TransportStats {
        self.transport_counters.snapshot()
    }

    async fn close(&self) {
        self.cancel.cancel();
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Tracer sender task failed: {e}");
            }
            debug!("Tracer closed");
        }
    }
}

impl Drop for ApmTracer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background task owning the receiving end of the queue and the current request body.
struct Sender {
    rx: mpsc::Receiver<Command>,
    transport: Transport,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    metadata: Vec<u8>,
    max_request_size: usize,
    request_time: Duration,
    body: Vec<u8>,
    /// Events encoded into `body`, per kind.
    pending: BTreeMap<EventKind, u64>,
    deadline: Option<Instant>,
}

impl Sender {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.discard();
                    return;
                }
                _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                    self.send().await;
                }
                command = self.rx.recv() => match command {
                    Some(Command::Event(event)) => {
                        self.encode(event);
                        if self.body.len() >= self.max_request_size {
                            self.send().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.send().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.send().await;
                        return;
                    }
                },
            }
        }
    }

    fn encode(&mut self, event: Event) {
        let kind = event.kind();
        if self.body.is_empty() {
            self.body.extend_from_slice(&self.metadata);
            self.deadline = Some(Instant::now() + self.request_time);
        }
        match serde_json::to_writer(&mut self.body, &event) {
            Ok(()) => {
                self.body.push(b'\n');
                *self.pending.entry(kind).or_insert(0) += 1;
            }
            Err(e) => {
                warn!("Failed to encode {}: {e}", kind.as_str());
                self.counters.dropped(kind).fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn send(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            self.body.clear();
            return;
        }
        let body = std::mem::take(&mut self.body);
        let pending = std::mem::take(&mut self.pending);
        if self.transport.send(body, &self.cancel).await == SendOutcome::Cancelled {
            for (kind, count) in pending {
                self.counters.dropped(kind).fetch_add(count, Ordering::Relaxed);
            }
            return;
        }
        for (kind, count) in pending {
            self.counters.sent(kind).fetch_add(count, Ordering::Relaxed);
        }
    }

    fn discard(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        self.body.clear();
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Event(event) = command {
                *pending.entry(event.kind()).or_insert(0) += 1;
            }
        }
        for (kind, count) in pending {
            self.counters.dropped(kind).fetch_add(count, Ordering::Relaxed);
        }
    }
}
