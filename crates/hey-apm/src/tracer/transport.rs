// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const INTAKE_PATH: &str = "/intake/v2/events";
const NDJSON: &str = "application/x-ndjson";

/// Transport-level counters, as observed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Requests the server answered with a success status.
    pub requests: u64,
    /// Requests that failed, either on the network or with an error status.
    pub failed_requests: u64,
    /// Distinct error messages returned by the server, with how often each was seen.
    pub unique_errors: BTreeMap<String, u64>,
    /// Events the server reported as accepted.
    pub accepted: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TransportCounters {
    requests: AtomicU64,
    failed_requests: AtomicU64,
    accepted: AtomicU64,
    unique_errors: Mutex<HashMap<String, u64>>,
}

impl TransportCounters {
    pub fn snapshot(&self) -> TransportStats {
        let unique_errors = self
            .unique_errors
            .lock()
            .map(|errors| errors.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        TransportStats {
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            unique_errors,
            accepted: self.accepted.load(Ordering::Relaxed),
        }
    }

    fn record_error(&self, message: String) {
        if let Ok(mut errors) = self.unique_errors.lock() {
            *errors.entry(message).or_insert(0) += 1;
        }
    }
}

/// Body of an intake response when the request is sent with `?verbose`.
#[derive(Debug, Default, Deserialize)]
struct IntakeResponse {
    #[serde(default)]
    accepted: u64,
    #[serde(default)]
    errors: Vec<IntakeError>,
}

#[derive(Debug, Deserialize)]
struct IntakeError {
    message: String,
}

/// Outcome of a single request, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Sent,
    Failed,
    Cancelled,
}

/// Streams encoded request bodies to the intake endpoint.
///
/// Nothing is retried: each failure is counted and its message recorded.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    client: reqwest::Client,
    intake_url: Url,
    headers: HeaderMap,
    counters: Arc<TransportCounters>,
}

impl Transport {
    pub fn new(
        client: reqwest::Client,
        server_url: &str,
        secret: &str,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, TransportError> {
        let mut intake_url =
            Url::parse(server_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        intake_url.set_path(INTAKE_PATH);
        intake_url.set_query(Some("verbose"));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
        if !secret.is_empty() {
            let mut value = HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|_| TransportError::InvalidSecret)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Transport {
            client,
            intake_url,
            headers,
            counters,
        })
    }

    /// Sends one request body. Returns once the server answered, the request failed, or
    /// `cancel` fired; a cancelled request is discarded without touching the counters.
    pub async fn send(&self, body: Vec<u8>, cancel: &CancellationToken) -> SendOutcome {
        let bytes = body.len();
        let request = self
            .client
            .post(self.intake_url.clone())
            .headers(self.headers.clone())
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Discarding in-flight request of {bytes} bytes");
                return SendOutcome::Cancelled;
            }
            response = request => response,
        };

        match response {
            Ok(response) => {
                let status = response.status();
                let body = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SendOutcome::Cancelled,
                    body = response.text() => body.unwrap_or_default(),
                };
                let parsed = serde_json::from_str::<IntakeResponse>(&body).ok();
                if let Some(parsed) = &parsed {
                    self.counters
                        .accepted
                        .fetch_add(parsed.accepted, Ordering::Relaxed);
                }

                if status.is_success() {
                    self.counters.requests.fetch_add(1, Ordering::Relaxed);
                    debug!("Sent {bytes} bytes to intake, status {status}");
                    SendOutcome::Sent
                } else {
                    self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
                    error!("{status}: Failed to push to intake: {body}");
                    match parsed {
                        Some(parsed) if !parsed.errors.is_empty() => {
                            for e in parsed.errors {
                                self.counters.record_error(e.message);
                            }
                        }
                        _ if body.is_empty() => self.counters.record_error(status.to_string()),
                        _ => self.counters.record_error(body),
                    }
                    SendOutcome::Failed
                }
            }
            Err(e) => {
                self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
                error!("Network error sending to intake: {e}");
                self.counters.record_error(e.to_string());
                SendOutcome::Failed
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid APM server URL: {0}")]
    InvalidUrl(String),

    #[error("Secret token is not a valid header value")]
    InvalidSecret,
}
