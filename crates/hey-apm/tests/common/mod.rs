// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fake APM server and search clusters for integration tests.
//!
//! The APM server counts every event it receives at the intake endpoint as accepted and, unless
//! ingestion is broken, as indexed. Its search cluster answers count queries from those
//! counters. The report cluster stores nothing and answers regression queries with a fixed set
//! of previous reports.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hey_apm::Input;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct Indexed {
    pub transactions: AtomicU64,
    pub spans: AtomicU64,
    pub errors: AtomicU64,
}

impl Indexed {
    fn counter(&self, kind: &str) -> Option<&AtomicU64> {
        match kind {
            "transaction" => Some(&self.transactions),
            "span" => Some(&self.spans),
            "error" => Some(&self.errors),
            _ => None,
        }
    }

    pub fn total(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
            + self.spans.load(Ordering::SeqCst)
            + self.errors.load(Ordering::SeqCst)
    }
}

pub struct FakeApm {
    pub apm: ServerGuard,
    pub apm_es: ServerGuard,
    pub reports: ServerGuard,
    pub indexed: Arc<Indexed>,
    pub intake_requests: Arc<AtomicU64>,
    mocks: Vec<Mock>,
}

impl FakeApm {
    /// A server that indexes everything it receives.
    pub async fn start() -> Self {
        Self::start_with(true, Duration::ZERO).await
    }

    /// A server whose intake holds every request for `delay` before answering.
    pub async fn start_slow(delay: Duration) -> Self {
        Self::start_with(true, delay).await
    }

    /// A server that accepts events but never indexes them.
    pub async fn start_broken() -> Self {
        Self::start_with(false, Duration::ZERO).await
    }

    async fn start_with(index_events: bool, intake_delay: Duration) -> Self {
        let mut apm = Server::new_async().await;
        let mut apm_es = Server::new_async().await;
        let mut reports = Server::new_async().await;
        let indexed = Arc::new(Indexed::default());
        let intake_requests = Arc::new(AtomicU64::new(0));
        let mut mocks = Vec::new();

        mocks.push(
            apm.mock("GET", "/")
                .match_header("Accept", "application/json")
                .with_status(200)
                .with_body(
                    r#"{"build_date": "2024-05-01T00:00:00Z", "build_sha": "f00dbabe", "version": "8.14.0"}"#,
                )
                .create_async()
                .await,
        );
        mocks.push(
            apm.mock("GET", "/debug/vars")
                .with_status(200)
                .with_body(
                    r#"{"cmdline": ["apm-server", "-E", "queue.mem.events=4096"],
                        "memstats": {"TotalAlloc": 1000, "HeapAlloc": 100, "Mallocs": 10, "NumGC": 1}}"#,
                )
                .create_async()
                .await,
        );

        let counters = Arc::clone(&indexed);
        let requests = Arc::clone(&intake_requests);
        mocks.push(
            apm.mock("POST", "/intake/v2/events")
                .match_query(Matcher::Any)
                .match_header("User-Agent", "hey-apm")
                .with_status(202)
                .with_body_from_request(move |request| {
                    requests.fetch_add(1, Ordering::SeqCst);
                    if !intake_delay.is_zero() {
                        std::thread::sleep(intake_delay);
                    }
                    let body = request.body().cloned().unwrap_or_default();
                    let mut accepted = 0;
                    for line in body.split(|b| *b == b'\n') {
                        let Ok(Value::Object(event)) = serde_json::from_slice::<Value>(line)
                        else {
                            continue;
                        };
                        let Some(kind) = event.keys().next() else {
                            continue;
                        };
                        if let Some(counter) = counters.counter(kind) {
                            accepted += 1;
                            if index_events {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                    json!({ "accepted": accepted }).to_string().into_bytes()
                })
                .create_async()
                .await,
        );

        for kind in ["transaction", "span", "error"] {
            let counters = Arc::clone(&indexed);
            mocks.push(
                apm_es
                    .mock("POST", "/apm*/_count")
                    .match_body(Matcher::PartialJson(
                        json!({"query": {"term": {"processor.event": kind}}}),
                    ))
                    .with_status(200)
                    .with_body_from_request(move |_| {
                        let count = counters
                            .counter(kind)
                            .map(|c| c.load(Ordering::SeqCst))
                            .unwrap_or(0);
                        json!({ "count": count }).to_string().into_bytes()
                    })
                    .create_async()
                    .await,
            );
        }

        mocks.push(
            reports
                .mock("GET", "/")
                .with_status(200)
                .with_body(r#"{"version": {"number": "8.14.0"}}"#)
                .create_async()
                .await,
        );

        FakeApm {
            apm,
            apm_es,
            reports,
            indexed,
            intake_requests,
            mocks,
        }
    }

    /// Accepts reports indexed into `hey-bench`.
    pub async fn accept_reports(&mut self, expected: usize) -> Mock {
        self.reports
            .mock("PUT", Matcher::Regex(r"^/hey-bench/_doc/[0-9a-f]{8}".to_string()))
            .match_query(Matcher::UrlEncoded("refresh".into(), "true".into()))
            .with_status(201)
            .with_body(r#"{"result": "created"}"#)
            .expect(expected)
            .create_async()
            .await
    }

    /// Answers regression queries with `previous` as stored reports.
    pub async fn previous_reports(&mut self, previous: Vec<Value>) -> Mock {
        let hits: Vec<Value> = previous
            .into_iter()
            .map(|source| json!({ "_source": source }))
            .collect();
        self.reports
            .mock("POST", "/hey-bench/_search")
            .match_body(Matcher::PartialJson(json!({
                "sort": [{"@timestamp": {"order": "desc"}}],
                "size": 1000,
            })))
            .with_status(200)
            .with_body(json!({ "hits": { "hits": hits } }).to_string())
            .create_async()
            .await
    }

    pub fn input(&self) -> Input {
        Input {
            apm_url: self.apm.url(),
            apm_es_url: Some(self.apm_es.url()),
            es_url: Some(self.reports.url()),
            run_timeout: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(10),
            seed: 1,
            ..Default::default()
        }
    }
}
