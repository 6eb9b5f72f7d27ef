// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Benchmark driver.
//!
//! Runs a warm-up followed by a fixed matrix of workloads. After each scored workload and a
//! cool-down pause, its report is compared with previous reports of the same workload found in
//! the report cluster. Every failure is logged as it happens and the driver carries on; the
//! last one is returned at the end.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Input, UNLIMITED};
use crate::report::{Fingerprint, Report, REPORT_INDEX};
use crate::runner::{RunError, Runner};
use crate::search::{SearchClient, SearchError};
use crate::tracer;
use crate::worker::WorkerError;

/// Frequency of workloads that do not set one.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_millis(100);
pub const HIGH_LOAD_FREQUENCY: Duration = Duration::from_millis(1);
pub const WARM_UP_FREQUENCY: Duration = Duration::from_millis(1);
pub const WARM_UP_LIMIT: u64 = 32767;
pub const WARM_UP_FRAMES: u64 = 10;
/// Reports with fewer indexed events are not evaluated.
pub const MIN_INDEXED_EVENTS: u64 = 100;
/// Previous reports considered per regression check.
const MAX_PREVIOUS_REPORTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    /// Duration of the warm-up run.
    pub warm_up: Duration,
    /// Pause after the warm-up and after every scored run.
    pub cool_down: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            warm_up: Duration::from_secs(60),
            cool_down: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("Report cluster is not reachable: {0}")]
    Connectivity(#[source] SearchError),

    #[error("not enough events indexed: {0}")]
    NotEnoughEvents(u64),

    #[error(
        "regression: report {report_id} indexed {performance:.2} events/s (margin {margin}), \
         report {previous_id} indexed {previous_performance:.2} events/s"
    )]
    Regression {
        report_id: String,
        performance: f64,
        previous_id: String,
        previous_performance: f64,
        margin: f64,
    },

    #[error("Failed to query previous reports: {0}")]
    Search(#[source] SearchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl BenchError {
    fn is_cancelled(&self) -> bool {
        matches!(self, BenchError::Run(RunError::Worker(WorkerError::Cancelled)))
    }
}

/// One named workload of the benchmark matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRun {
    pub name: &'static str,
    pub input: Input,
}

/// The scored workloads, derived from `base`.
pub fn matrix(base: &Input) -> Vec<SubRun> {
    vec![
        SubRun {
            name: "transactions only",
            input: base.with_transactions(DEFAULT_FREQUENCY, UNLIMITED, 0),
        },
        SubRun {
            name: "small transactions",
            input: base.with_transactions(DEFAULT_FREQUENCY, UNLIMITED, 10),
        },
        SubRun {
            name: "large transactions",
            input: base.with_transactions(DEFAULT_FREQUENCY, UNLIMITED, 40),
        },
        SubRun {
            name: "small errors only",
            input: base.with_errors(DEFAULT_FREQUENCY, UNLIMITED, 10),
        },
        SubRun {
            name: "very large errors only",
            input: base.with_errors(DEFAULT_FREQUENCY, UNLIMITED, 100),
        },
        SubRun {
            name: "high load",
            input: base.with_transactions(HIGH_LOAD_FREQUENCY, UNLIMITED, 10),
        },
    ]
}

/// Error-only workload run for `duration` whose report is not indexed.
pub fn warm_up_input(base: &Input, duration: Duration) -> Input {
    Input {
        run_timeout: duration,
        skip_index_report: true,
        ..base.with_errors(WARM_UP_FREQUENCY, WARM_UP_LIMIT, WARM_UP_FRAMES)
    }
}

/// Fields of a stored report the regression check looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct PreviousReport {
    pub report_id: String,
    #[serde(default)]
    pub events_indexed_per_sec: Option<f64>,
}

/// Reports of the same workload from the last `days` days, newest first.
pub fn regression_query(fingerprint: &Fingerprint, days: u32) -> Value {
    let mut must = vec![json!({
        "range": {
            "@timestamp": {
                "gte": format!("now-{days}d/d"),
                "lte": "now",
            }
        }
    })];
    must.extend(fingerprint.match_clauses());
    json!({
        "query": { "bool": { "must": must } },
        "sort": [{ "@timestamp": { "order": "desc" } }],
        "size": MAX_PREVIOUS_REPORTS,
    })
}

/// First previous report `report` underperforms against, given `margin`.
pub fn find_regression(
    report: &Report,
    previous: &[PreviousReport],
    margin: f64,
) -> Option<BenchError> {
    let performance = report.performance().unwrap_or(0.0);
    previous
        .iter()
        .filter(|p| p.report_id != report.report_id)
        .find_map(|p| {
            let previous_performance = p.events_indexed_per_sec?;
            (performance * margin < previous_performance).then(|| BenchError::Regression {
                report_id: report.report_id.clone(),
                performance,
                previous_id: p.report_id.clone(),
                previous_performance,
                margin,
            })
        })
}

/// Checks `report` against previous reports of the same workload.
pub async fn verify(
    reports: &SearchClient,
    input: &Input,
    report: &Report,
) -> Result<(), BenchError> {
    let indexed = report.indexed_events();
    if indexed < MIN_INDEXED_EVENTS {
        return Err(BenchError::NotEnoughEvents(indexed));
    }

    let query = regression_query(&report.input, input.regression_days_u32()?);
    let previous: Vec<PreviousReport> = reports
        .search(REPORT_INDEX, &query)
        .await
        .map_err(BenchError::Search)?;
    info!(
        "Comparing report {} with {} previous reports",
        report.report_id,
        previous.len()
    );

    match find_regression(report, &previous, input.regression_margin) {
        Some(regression) => Err(regression),
        None => Ok(()),
    }
}

pub struct Bench {
    runner: Runner,
    config: BenchConfig,
    stop: CancellationToken,
}

impl Bench {
    pub fn new(input: Input, config: BenchConfig) -> Result<Self, BenchError> {
        let stop = CancellationToken::new();
        let runner = Runner::new(input)?.with_stop_signal(stop.clone());
        Ok(Bench {
            runner,
            config,
            stop,
        })
    }

    /// Raising `stop` ends the current workload early and skips the remaining ones.
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.runner = self.runner.with_stop_signal(stop.clone());
        self.stop = stop;
        self
    }

    async fn cool_down(&self, cancel: &CancellationToken) -> Result<(), BenchError> {
        if self.config.cool_down.is_zero() {
            return Ok(());
        }
        info!("Cooling down for {:?}", self.config.cool_down);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BenchError::Run(RunError::Worker(WorkerError::Cancelled))),
            _ = tokio::time::sleep(self.config.cool_down) => Ok(()),
        }
    }

    async fn scored_run(
        &self,
        reports: &SearchClient,
        sub_run: &SubRun,
        cancel: &CancellationToken,
    ) -> Result<(), BenchError> {
        info!("Running benchmark '{}'", sub_run.name);
        let report = self.runner.run(&sub_run.input, cancel).await?;
        self.cool_down(cancel).await?;
        verify(reports, &sub_run.input, &report).await?;
        info!("Benchmark '{}' passed ({})", sub_run.name, report.report_id);
        Ok(())
    }

    /// Runs the warm-up and the whole matrix, returning the last failure.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), BenchError> {
        tracer::close_default().await;

        let base = self.runner.input();
        let reports = self
            .runner
            .reports()
            .ok_or(ConfigError::MissingReportCluster)?;
        reports.ping().await.map_err(BenchError::Connectivity)?;
        // reject a bad lookback before spending time on runs
        base.regression_days_u32()?;

        let mut last_error = None;

        info!("Warming up for {:?}", self.config.warm_up);
        let warm_up = warm_up_input(base, self.config.warm_up);
        if let Err(e) = self.runner.run(&warm_up, cancel).await {
            let e = BenchError::from(e);
            if e.is_cancelled() {
                return Err(e);
            }
            error!("Warm-up failed: {e}");
            last_error = Some(e);
        }
        self.cool_down(cancel).await?;

        for sub_run in matrix(base) {
            if self.stop.is_cancelled() {
                warn!("Benchmark stopped, skipping '{}'", sub_run.name);
                continue;
            }
            if let Err(e) = self.scored_run(reports, &sub_run, cancel).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                error!("Benchmark '{}' failed: {e}", sub_run.name);
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
