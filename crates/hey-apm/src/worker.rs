// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Workload engine.
//!
//! A [`Worker`] drives the generators from two independent tickers until the run timeout
//! elapses, the stop signal is raised, or every enabled event kind has reached its limit. It
//! then flushes the tracer (bounded by the flush timeout) and returns a [`RunResult`].
//!
//! ```text
//! Idle --work()--> Running --timeout | stop | limits--> Draining --flushed | flush timeout--> Done
//!                     \
//!                      `--cancel--> (error, no result)
//! ```

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Input;
use crate::generator::{ErrorGenerator, TransactionGenerator};
use crate::ticker::MaybeTicker;
use crate::tracer::{Tracer, TracerStats, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Run cancelled")]
    Cancelled,
}

/// Outcome of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// When generation started.
    pub start: DateTime<Utc>,
    /// When generation stopped.
    pub end: DateTime<Utc>,
    /// When the tracer drained, or the flush timeout elapsed.
    pub flushed: DateTime<Utc>,
    pub stats: TracerStats,
    pub transport: TransportStats,
}

impl RunResult {
    /// Time from start until the flush completed.
    pub fn elapsed(&self) -> Duration {
        (self.flushed - self.start).to_std().unwrap_or_default()
    }
}

/// Why the running phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    RunTimeout,
    StopSignal,
    LimitsReached,
}

/// Per-kind schedule: how often and how many.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    frequency: Duration,
    limit: u64,
}

impl Schedule {
    fn new(frequency: Duration, limit: u64) -> Option<Self> {
        (!frequency.is_zero() && limit > 0).then_some(Schedule { frequency, limit })
    }

    fn ticker(schedule: Option<Self>) -> (MaybeTicker, u64) {
        match schedule {
            Some(s) => (MaybeTicker::every(s.frequency), s.limit),
            None => (MaybeTicker::new(), 0),
        }
    }
}

pub struct Worker {
    tracer: Arc<dyn Tracer>,
    run_timeout: Duration,
    flush_timeout: Duration,
    transaction_schedule: Option<Schedule>,
    error_schedule: Option<Schedule>,
    transactions: TransactionGenerator,
    errors: ErrorGenerator,
    seed: u64,
    stop: CancellationToken,
    state: WorkerState,
}

impl Worker {
    pub fn new(input: &Input, tracer: Arc<dyn Tracer>) -> Self {
        Worker {
            transactions: TransactionGenerator::new(
                Arc::clone(&tracer),
                input.span_min,
                input.span_max,
            ),
            errors: ErrorGenerator::new(
                Arc::clone(&tracer),
                input.error_frame_min,
                input.error_frame_max,
            ),
            tracer,
            run_timeout: input.run_timeout,
            flush_timeout: input.flush_timeout,
            transaction_schedule: Schedule::new(
                input.transaction_frequency,
                input.transaction_limit,
            ),
            error_schedule: Schedule::new(input.error_frequency, input.error_limit),
            seed: input.seed,
            stop: CancellationToken::new(),
            state: WorkerState::Idle,
        }
    }

    /// Uses `stop` as the graceful stop signal instead of a private one.
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Cancelling the returned token makes the worker stop generating and drain.
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, state: WorkerState) {
        debug!("Worker {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the workload to completion.
    ///
    /// Cancelling `cancel` aborts immediately with [`WorkerError::Cancelled`]: nothing is
    /// flushed and no result is produced.
    ///
    /// A kind counts as enabled only when both its frequency and its limit are non-zero. When
    /// no kind is enabled the run ends at once, whatever the run timeout.
    ///
    /// If the flush timeout elapses the tracer is closed before its counters are read, so
    /// events that never left the client are reported as dropped.
    pub async fn work(mut self, cancel: &CancellationToken) -> Result<RunResult, WorkerError> {
        info!(
            "Starting run: timeout {:?}, flush timeout {:?}, transactions {:?}, errors {:?}",
            self.run_timeout, self.flush_timeout, self.transaction_schedule, self.error_schedule
        );
        self.transition(WorkerState::Running);
        let start = Utc::now();

        let reason = self.generate(cancel).await?;
        let end = Utc::now();
        info!("Stopped generating events: {reason:?}");

        self.transition(WorkerState::Draining);
        self.drain(cancel).await;
        if cancel.is_cancelled() {
            warn!("Run cancelled while flushing");
            return Err(WorkerError::Cancelled);
        }
        let flushed = Utc::now();
        self.transition(WorkerState::Done);

        let result = RunResult {
            start,
            end,
            flushed,
            stats: self.tracer.stats(),
            transport: self.tracer.transport_stats(),
        };
        info!(
            "Run done in {:.3}s: {} transactions, {} spans, {} errors sent; {} requests, {} failed, {} events accepted",
            result.elapsed().as_secs_f64(),
            result.stats.transactions_sent,
            result.stats.spans_sent,
            result.stats.errors_sent,
            result.transport.requests,
            result.transport.failed_requests,
            result.transport.accepted,
        );
        Ok(result)
    }

    async fn generate(&mut self, cancel: &CancellationToken) -> Result<StopReason, WorkerError> {
        let mut rng = fastrand::Rng::with_seed(self.seed);
        let (mut transaction_ticker, mut transactions_left) =
            Schedule::ticker(self.transaction_schedule);
        let (mut error_ticker, mut errors_left) = Schedule::ticker(self.error_schedule);

        let deadline = (!self.run_timeout.is_zero()).then(|| Instant::now() + self.run_timeout);
        let mut run_timer: Option<Pin<Box<Sleep>>> = deadline.map(|d| Box::pin(sleep_until(d)));

        loop {
            if !transaction_ticker.is_active() && !error_ticker.is_active() {
                return Ok(StopReason::LimitsReached);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Run cancelled");
                    return Err(WorkerError::Cancelled);
                }
                _ = self.stop.cancelled() => {
                    return Ok(StopReason::StopSignal);
                }
                _ = error_ticker.tick() => {
                    self.errors.generate(&mut rng);
                    errors_left -= 1;
                    if errors_left == 0 {
                        debug!("Error limit reached");
                        error_ticker.stop();
                    }
                }
                _ = transaction_ticker.tick() => {
                    self.transactions.generate(&mut rng).await;
                    transactions_left -= 1;
                    if transactions_left == 0 {
                        debug!("Transaction limit reached");
                        transaction_ticker.stop();
                    }
                }
                _ = wait(&mut run_timer) => {
                    return Ok(StopReason::RunTimeout);
                }
            }

            // a busy engine must not starve the run timer
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(StopReason::RunTimeout);
            }
        }
    }

    async fn drain(&self, cancel: &CancellationToken) {
        let flush_cancel = cancel.child_token();
        if self.flush_timeout.is_zero() {
            self.tracer.flush(&flush_cancel).await;
            return;
        }
        let flush = self.tracer.flush(&flush_cancel);
        if tokio::time::timeout(self.flush_timeout, flush).await.is_err() {
            flush_cancel.cancel();
            error!("timed out waiting for flush");
            self.tracer.close().await;
        }
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.await,
        None => pending().await,
    }
}
