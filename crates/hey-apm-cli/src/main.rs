// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::ffi::OsString;
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hey_apm::config::{
    parse_duration, ConfigError, DEFAULT_APM_URL, DEFAULT_SERVICE_NAME, UNLIMITED,
};
use hey_apm::{Bench, BenchConfig, Input, Runner};

fn duration(value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
}

/// Generates load against an APM server and reports on how it coped.
#[derive(Debug, Parser)]
#[command(name = "hey-apm", version)]
struct Args {
    /// Stop generating events after this long (0 for no timeout)
    #[arg(long = "run", default_value = "30s", value_parser = duration)]
    run_timeout: Duration,

    /// Give up waiting for queued events to be sent after this long (0 to wait forever)
    #[arg(long = "flush", default_value = "10s", value_parser = duration)]
    flush_timeout: Duration,

    /// Random seed [default: current unix time in seconds]
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long = "service-name", default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// APM server secret token
    #[arg(long = "apm-secret", default_value = "")]
    apm_secret: String,

    #[arg(long = "apm-url", default_value = DEFAULT_APM_URL)]
    apm_url: String,

    /// Search cluster where reports are stored
    #[arg(long = "es-url")]
    es_url: Option<String>,

    /// Credentials for the report cluster, as user:password
    #[arg(long = "es-auth")]
    es_auth: Option<String>,

    /// Search cluster the APM server writes to
    #[arg(long = "apm-es-url")]
    apm_es_url: Option<String>,

    /// Credentials for the APM server's search cluster, as user:password
    #[arg(long = "apm-es-auth")]
    apm_es_auth: Option<String>,

    /// Run the benchmark matrix and check for regressions
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    bench: bool,

    /// Regression margin
    #[arg(long = "rm", default_value_t = hey_apm::config::DEFAULT_REGRESSION_MARGIN)]
    regression_margin: f64,

    /// Regression lookback, in days
    #[arg(long = "rd", default_value = hey_apm::config::DEFAULT_REGRESSION_DAYS)]
    regression_days: String,

    /// Max errors to generate
    #[arg(long = "e", default_value_t = UNLIMITED)]
    error_limit: u64,

    /// Error frequency (0 disables errors)
    #[arg(long = "ef", default_value = "1ns", value_parser = duration)]
    error_frequency: Duration,

    /// Max frames per error
    #[arg(long = "ex", default_value_t = 10)]
    error_frame_max: u64,

    /// Min frames per error
    #[arg(long = "em", default_value_t = 0)]
    error_frame_min: u64,

    /// Max transactions to generate
    #[arg(long = "t", default_value_t = UNLIMITED)]
    transaction_limit: u64,

    /// Transaction frequency (0 disables transactions)
    #[arg(long = "tf", default_value = "1ns", value_parser = duration)]
    transaction_frequency: Duration,

    /// Max spans per transaction
    #[arg(long = "sx", default_value_t = 10)]
    span_max: u64,

    /// Min spans per transaction
    #[arg(long = "sm", default_value_t = 1)]
    span_min: u64,

    #[arg(long = "log-level", env = "HEY_APM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Warm-up duration in benchmark mode
    #[arg(long = "warmup", default_value = "60s", value_parser = duration)]
    warm_up: Duration,

    /// Pause after the warm-up and every benchmark run
    #[arg(long = "cooldown", default_value = "60s", value_parser = duration)]
    cool_down: Duration,
}

impl Args {
    fn input(&self) -> Input {
        let seed = self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });
        Input {
            is_benchmark: self.bench,
            apm_url: self.apm_url.clone(),
            apm_secret: self.apm_secret.clone(),
            service_name: self.service_name.clone(),
            apm_es_url: self.apm_es_url.clone(),
            apm_es_auth: self.apm_es_auth.clone(),
            es_url: self.es_url.clone(),
            es_auth: self.es_auth.clone(),
            skip_index_report: false,
            run_timeout: self.run_timeout,
            flush_timeout: self.flush_timeout,
            transaction_frequency: self.transaction_frequency,
            transaction_limit: self.transaction_limit,
            span_min: self.span_min,
            span_max: self.span_max,
            error_frequency: self.error_frequency,
            error_limit: self.error_limit,
            error_frame_min: self.error_frame_min,
            error_frame_max: self.error_frame_max,
            regression_margin: self.regression_margin,
            regression_days: self.regression_days.clone(),
            seed,
        }
    }

    fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            warm_up: self.warm_up,
            cool_down: self.cool_down,
        }
    }
}

/// Accepts single-dash long flags (`-run 10s`) by rewriting them as `--run 10s`.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            match arg.to_str() {
                Some(s)
                    if s.starts_with('-')
                        && !s.starts_with("--")
                        && s[1..].starts_with(|c: char| c.is_ascii_alphabetic()) =>
                {
                    OsString::from(format!("-{s}"))
                }
                _ => arg,
            }
        })
        .collect()
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!(
        "h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{}",
        log_level.to_lowercase()
    );
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

/// First interrupt stops gracefully, a second one aborts.
async fn watch_signals(stop: CancellationToken, cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("Interrupted, stopping after the current flush. Interrupt again to abort");
    stop.cancel();
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Aborting");
        cancel.cancel();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let input = args.input();
    input.validate()?;

    let stop = CancellationToken::new();
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(stop.clone(), cancel.clone()));

    if input.is_benchmark {
        info!("Starting benchmark against {}", input.apm_url);
        Bench::new(input, args.bench_config())?
            .with_stop_signal(stop)
            .run(&cancel)
            .await?;
        info!("Benchmark finished without regressions");
    } else {
        debug!("Using seed {}", input.seed);
        let report = Runner::new(input)?
            .with_stop_signal(stop)
            .run_once(&cancel)
            .await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse_from(normalize_args(std::env::args_os()));

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
