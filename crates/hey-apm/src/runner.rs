// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single run: probe the server, drive the workload, probe again, report.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Input;
use crate::http_utils::build_client;
use crate::probe::{self, ServerStatus};
use crate::report::{Report, REPORT_INDEX};
use crate::search::{SearchClient, SearchError};
use crate::tracer::{self, ApmTracer, Tracer, TracerConfig, TracerError};
use crate::worker::{Worker, WorkerError};

/// Timeout of probe and search cluster requests.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Tracer(#[from] TracerError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Executes runs of one [`Input`] against the APM server.
pub struct Runner {
    input: Input,
    client: reqwest::Client,
    apm_search: Option<SearchClient>,
    reports: Option<SearchClient>,
    stop: CancellationToken,
}

impl Runner {
    pub fn new(input: Input) -> Result<Self, RunError> {
        let client = build_client(PROBE_TIMEOUT)?;
        let apm_search = input
            .apm_es_url
            .as_deref()
            .map(|url| SearchClient::new(client.clone(), url, input.apm_es_auth.as_deref()))
            .transpose()?;
        let reports = input
            .es_url
            .as_deref()
            .map(|url| SearchClient::new(client.clone(), url, input.es_auth.as_deref()))
            .transpose()?;
        Ok(Runner {
            input,
            client,
            apm_search,
            reports,
            stop: CancellationToken::new(),
        })
    }

    /// Raising `stop` ends the workload early; the run still flushes and reports.
    pub fn with_stop_signal(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn input(&self) -> &Input {
        &self.input
    }

    /// Client for the cluster reports are stored in, if one is configured.
    pub fn reports(&self) -> Option<&SearchClient> {
        self.reports.as_ref()
    }

    async fn snapshot(&self) -> ServerStatus {
        probe::status(
            &self.client,
            &self.input.apm_secret,
            &self.input.apm_url,
            self.apm_search.as_ref(),
        )
        .await
    }

    /// Runs `input` once and returns its report.
    ///
    /// A fresh tracer is installed as the default for the duration of the run and closed
    /// before the final snapshot.
    pub async fn run(&self, input: &Input, cancel: &CancellationToken) -> Result<Report, RunError> {
        let info = match probe::info(&self.client, &input.apm_secret, &input.apm_url).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Unable to read APM server info: {e}");
                None
            }
        };
        let initial = self.snapshot().await;

        let tracer = Arc::new(ApmTracer::new(TracerConfig::from_input(input))?);
        if tracer::set_default(Arc::clone(&tracer)).is_some() {
            debug!("Replacing default tracer");
        }

        let worker = Worker::new(input, Arc::clone(&tracer) as Arc<dyn Tracer>)
            .with_stop_signal(self.stop.clone());
        let result = worker.work(cancel).await;

        tracer.close().await;
        tracer::clear_default(&tracer);
        let result = result?;

        let last = self.snapshot().await;
        let report = Report::build(input, &result, info.as_ref(), &initial, &last);
        info!(
            "Report {}: {} events generated, {} sent, {} accepted, {} indexed in {:.3}s",
            report.report_id,
            report.events_generated,
            report.events_sent,
            report.events_accepted,
            report
                .events_indexed
                .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            report.elapsed,
        );

        if input.skip_index_report {
            debug!("Not indexing report {}", report.report_id);
        } else if let Some(reports) = &self.reports {
            match reports
                .index_document(REPORT_INDEX, &report.report_id, &report)
                .await
            {
                Ok(()) => info!("Indexed report {} into {REPORT_INDEX}", report.report_id),
                Err(e) => error!("Failed to index report {}: {e}", report.report_id),
            }
        }

        Ok(report)
    }

    /// Runs the configured input once.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Report, RunError> {
        self.run(&self.input, cancel).await
    }
}
