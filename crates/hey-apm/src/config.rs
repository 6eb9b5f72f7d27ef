// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run configuration.
//!
//! An [`Input`] describes one workload: where to send events, how many of each kind to
//! generate, how fast, and for how long. It is built once, validated, and never mutated while
//! a run is in progress. The benchmark driver derives per-run copies of it with
//! [`Input::with_transactions`], [`Input::with_errors`] and friends.

use std::time::Duration;

use reqwest::Url;

/// Default APM server address.
pub const DEFAULT_APM_URL: &str = "http://localhost:8200";
/// Default service name reported in the event metadata.
pub const DEFAULT_SERVICE_NAME: &str = "hey-service";
/// Default run timeout.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);
/// Default flush timeout.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default regression margin for benchmarks.
pub const DEFAULT_REGRESSION_MARGIN: f64 = 1.1;
/// Default regression lookback, in days.
pub const DEFAULT_REGRESSION_DAYS: &str = "7";

/// Limit used when a workload does not bound an event kind.
///
/// Kept within the signed 64 bit range so reports stay indexable as `long` values.
pub const UNLIMITED: u64 = i64::MAX as u64;

/// Errors raised while building or validating an [`Input`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid {what}: minimum {min} is greater than maximum {max}")]
    MinGreaterThanMax { what: &'static str, min: u64, max: u64 },

    #[error("Invalid credentials for {what}: expected 'user:password'")]
    InvalidAuth { what: &'static str },

    #[error("Invalid regression margin {0}: must be a number >= 1.0")]
    InvalidRegressionMargin(f64),

    #[error("Invalid regression days '{0}': must be a non-negative integer")]
    InvalidRegressionDays(String),

    #[error("Benchmark mode requires a report cluster URL")]
    MissingReportCluster,
}

/// Parses a duration such as `100ms`, `30s`, `1m`, `1h30m` or `0`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Splits a `user:password` pair. The password may itself contain colons.
pub fn parse_auth(auth: &str, what: &'static str) -> Result<(String, String), ConfigError> {
    match auth.split_once(':') {
        Some((user, password)) if !user.is_empty() => {
            Ok((user.to_string(), password.to_string()))
        }
        _ => Err(ConfigError::InvalidAuth { what }),
    }
}

/// Everything needed to describe and execute one workload.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    /// Whether this run is part of a benchmark.
    pub is_benchmark: bool,
    /// APM server base URL.
    pub apm_url: String,
    /// APM server secret token; empty when the server does not require one.
    pub apm_secret: String,
    /// Service name attached to every generated event.
    pub service_name: String,
    /// Search cluster backing the APM server, used to count indexed events.
    pub apm_es_url: Option<String>,
    /// `user:password` for the APM server's search cluster.
    pub apm_es_auth: Option<String>,
    /// Search cluster where reports are stored.
    pub es_url: Option<String>,
    /// `user:password` for the report cluster.
    pub es_auth: Option<String>,
    /// Do not index the report of this run (used for warm-up runs).
    pub skip_index_report: bool,

    /// Stop generating events after this long. Zero means no timeout.
    pub run_timeout: Duration,
    /// Give up waiting for the tracer to drain after this long. Zero means wait forever.
    pub flush_timeout: Duration,

    /// Period between generated transactions. Zero disables transactions.
    pub transaction_frequency: Duration,
    /// Maximum number of transactions to generate.
    pub transaction_limit: u64,
    /// Minimum number of spans per transaction.
    pub span_min: u64,
    /// Maximum number of spans per transaction.
    pub span_max: u64,

    /// Period between generated errors. Zero disables errors.
    pub error_frequency: Duration,
    /// Maximum number of errors to generate.
    pub error_limit: u64,
    /// Minimum number of stack frames per error.
    pub error_frame_min: u64,
    /// Maximum number of stack frames per error.
    pub error_frame_max: u64,

    /// A benchmark run regresses when its performance times this margin is below a previous
    /// run's performance.
    pub regression_margin: f64,
    /// How many days back to look for previous reports.
    pub regression_days: String,

    /// Seed for the generators' random number generator.
    pub seed: u64,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            is_benchmark: false,
            apm_url: DEFAULT_APM_URL.to_string(),
            apm_secret: String::new(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            apm_es_url: None,
            apm_es_auth: None,
            es_url: None,
            es_auth: None,
            skip_index_report: false,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            transaction_frequency: Duration::ZERO,
            transaction_limit: 0,
            span_min: 0,
            span_max: 0,
            error_frequency: Duration::ZERO,
            error_limit: 0,
            error_frame_min: 0,
            error_frame_max: 0,
            regression_margin: DEFAULT_REGRESSION_MARGIN,
            regression_days: DEFAULT_REGRESSION_DAYS.to_string(),
            seed: 0,
        }
    }
}

impl Input {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.apm_url)?;
        if let Some(url) = &self.apm_es_url {
            validate_url(url)?;
        }
        if let Some(url) = &self.es_url {
            validate_url(url)?;
        }
        if let Some(auth) = &self.apm_es_auth {
            parse_auth(auth, "apm-es-auth")?;
        }
        if let Some(auth) = &self.es_auth {
            parse_auth(auth, "es-auth")?;
        }

        if self.span_min > self.span_max {
            return Err(ConfigError::MinGreaterThanMax {
                what: "spans per transaction",
                min: self.span_min,
                max: self.span_max,
            });
        }
        if self.error_frame_min > self.error_frame_max {
            return Err(ConfigError::MinGreaterThanMax {
                what: "frames per error",
                min: self.error_frame_min,
                max: self.error_frame_max,
            });
        }

        if self.is_benchmark {
            if !self.regression_margin.is_finite() || self.regression_margin < 1.0 {
                return Err(ConfigError::InvalidRegressionMargin(self.regression_margin));
            }
            if self.es_url.is_none() {
                return Err(ConfigError::MissingReportCluster);
            }
        }
        self.regression_days_u32()?;

        Ok(())
    }

    /// Regression lookback as a number of days.
    pub fn regression_days_u32(&self) -> Result<u32, ConfigError> {
        self.regression_days
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidRegressionDays(self.regression_days.clone()))
    }

    /// Whether transactions are generated at all.
    pub fn transactions_enabled(&self) -> bool {
        !self.transaction_frequency.is_zero() && self.transaction_limit > 0
    }

    /// Whether errors are generated at all.
    pub fn errors_enabled(&self) -> bool {
        !self.error_frequency.is_zero() && self.error_limit > 0
    }

    /// Copy of this input generating only transactions, with a fixed number of spans each.
    pub fn with_transactions(&self, frequency: Duration, limit: u64, spans: u64) -> Self {
        Self {
            transaction_frequency: frequency,
            transaction_limit: limit,
            span_min: spans,
            span_max: spans,
            error_frequency: Duration::ZERO,
            error_limit: 0,
            error_frame_min: 0,
            error_frame_max: 0,
            ..self.clone()
        }
    }

    /// Copy of this input generating only errors, with a fixed number of frames each.
    pub fn with_errors(&self, frequency: Duration, limit: u64, frames: u64) -> Self {
        Self {
            transaction_frequency: Duration::ZERO,
            transaction_limit: 0,
            span_min: 0,
            span_max: 0,
            error_frequency: frequency,
            error_limit: limit,
            error_frame_min: frames,
            error_frame_max: frames,
            ..self.clone()
        }
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{scheme}'"),
        }),
    }
}
