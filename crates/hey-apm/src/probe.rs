// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server probe.
//!
//! Reads build metadata from the APM server and takes snapshots of its state: how many
//! documents of each kind its search cluster holds, memory statistics and command line
//! settings from its expvar endpoint.

use std::collections::BTreeMap;

use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::http_utils::with_secret;
use crate::search::{SearchClient, SearchError};
use crate::tracer::EventKind;

/// Indices the APM server writes to.
pub const APM_INDEX_PATTERN: &str = "apm*";
const EXPVAR_PATH: &str = "debug/vars";
// literal scheme the server info endpoint is queried with
const INFO_AUTH_SCHEME: &str = "Beater";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid APM server URL '{0}'")]
    InvalidUrl(String),

    #[error("APM server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("APM server returned {0}")]
    UnexpectedStatus(String),

    #[error("Failed to decode APM server response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Build metadata of the APM server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_sha: String,
    #[serde(default)]
    pub build_date: String,
}

/// Memory allocator and garbage collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemStats {
    #[serde(rename = "TotalAlloc", default)]
    pub total_alloc: u64,
    #[serde(rename = "HeapAlloc", default)]
    pub heap_alloc: u64,
    #[serde(rename = "Mallocs", default)]
    pub mallocs: u64,
    #[serde(rename = "NumGC", default)]
    pub num_gc: u64,
}

impl MemStats {
    /// Element-wise `self - initial`, floored at zero.
    pub fn sub(&self, initial: &MemStats) -> MemStats {
        MemStats {
            total_alloc: self.total_alloc.saturating_sub(initial.total_alloc),
            heap_alloc: self.heap_alloc.saturating_sub(initial.heap_alloc),
            mallocs: self.mallocs.saturating_sub(initial.mallocs),
            num_gc: self.num_gc.saturating_sub(initial.num_gc),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Expvar {
    memstats: Option<MemStats>,
    #[serde(default)]
    cmdline: Vec<String>,
}

/// Documents per event kind in the server's indices. A kind is `None` when it could not be
/// counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexedCounts {
    pub transactions: Option<u64>,
    pub spans: Option<u64>,
    pub errors: Option<u64>,
}

impl IndexedCounts {
    pub fn get(&self, kind: EventKind) -> Option<u64> {
        match kind {
            EventKind::Transaction => self.transactions,
            EventKind::Span => self.spans,
            EventKind::Error => self.errors,
        }
    }

    fn set(&mut self, kind: EventKind, count: u64) {
        let slot = match kind {
            EventKind::Transaction => &mut self.transactions,
            EventKind::Span => &mut self.spans,
            EventKind::Error => &mut self.errors,
        };
        *slot = Some(count);
    }
}

/// Snapshot of the server's state at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStatus {
    pub indexed: IndexedCounts,
    pub mem_stats: Option<MemStats>,
    pub settings: Option<BTreeMap<String, String>>,
}

fn endpoint(url: &str, path: &str) -> Result<Url, ProbeError> {
    let mut base = Url::parse(url).map_err(|_| ProbeError::InvalidUrl(url.to_string()))?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|_| ProbeError::InvalidUrl(url.to_string()))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    secret: &str,
    url: Url,
) -> Result<T, ProbeError> {
    let request = client.get(url).header(ACCEPT, "application/json");
    let response = with_secret(request, INFO_AUTH_SCHEME, secret).send().await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(ProbeError::UnexpectedStatus(status.to_string()));
    }
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

/// Reads the server's version and build metadata from its root endpoint.
pub async fn info(
    client: &reqwest::Client,
    secret: &str,
    url: &str,
) -> Result<ServerInfo, ProbeError> {
    let info: ServerInfo = get_json(client, secret, endpoint(url, "")?).await?;
    debug!(
        "APM server version {} ({}, built {})",
        info.version, info.build_sha, info.build_date
    );
    Ok(info)
}

/// Counts the documents of `kind` in the server's indices.
pub async fn indexed(search: &SearchClient, kind: EventKind) -> Result<u64, ProbeError> {
    let query = json!({ "term": { "processor.event": kind.as_str() } });
    Ok(search.count(APM_INDEX_PATTERN, query).await?)
}

/// Takes a snapshot of the server. Parts that cannot be read are logged and left empty.
pub async fn status(
    client: &reqwest::Client,
    secret: &str,
    url: &str,
    search: Option<&SearchClient>,
) -> ServerStatus {
    let mut status = ServerStatus::default();

    match search {
        Some(search) => {
            for kind in EventKind::ALL {
                match indexed(search, kind).await {
                    Ok(count) => status.indexed.set(kind, count),
                    Err(e) => warn!("Failed to count indexed {} documents: {e}", kind.as_str()),
                }
            }
        }
        None => debug!("No search cluster configured for the APM server, skipping indexed counts"),
    }

    let expvar = match endpoint(url, EXPVAR_PATH) {
        Ok(expvar_url) => get_json::<Expvar>(client, secret, expvar_url).await,
        Err(e) => Err(e),
    };
    match expvar {
        Ok(expvar) => {
            if expvar.memstats.is_none() {
                warn!("APM server expvar has no memstats");
            }
            status.mem_stats = expvar.memstats;
            status.settings = Some(parse_settings(&expvar.cmdline));
        }
        Err(e) => warn!("Failed to read APM server expvar: {e}"),
    }

    status
}

/// Collects the `-E key=value` overrides of a command line.
pub fn parse_settings(cmdline: &[String]) -> BTreeMap<String, String> {
    let mut settings = BTreeMap::new();
    let mut args = cmdline.iter();
    while let Some(arg) = args.next() {
        let setting = if arg == "-E" {
            args.next().map(String::as_str)
        } else {
            arg.strip_prefix("-E")
        };
        if let Some((key, value)) = setting.and_then(|s| s.split_once('=')) {
            settings.insert(key.to_string(), value.to_string());
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use tracing_test::traced_test;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_parse_settings() {
        let settings = parse_settings(&args(&[
            "apm-server",
            "-e",
            "-E",
            "apm-server.host=0.0.0.0:8200",
            "-Eoutput.elasticsearch.bulk_max_size=5000",
            "-E",
            "queue.mem.events=4096",
            "-E",
            "not-a-setting",
            "-c",
            "apm-server.yml",
        ]));
        assert_eq!(settings.len(), 3);
        assert_eq!(settings["apm-server.host"], "0.0.0.0:8200");
        assert_eq!(settings["output.elasticsearch.bulk_max_size"], "5000");
        assert_eq!(settings["queue.mem.events"], "4096");
    }

    #[test]
    fn test_parse_settings_trailing_flag() {
        assert!(parse_settings(&args(&["apm-server", "-E"])).is_empty());
    }

    #[test]
    fn test_memstats_sub() {
        let initial = MemStats {
            total_alloc: 100,
            heap_alloc: 50,
            mallocs: 10,
            num_gc: 1,
        };
        let last = MemStats {
            total_alloc: 300,
            heap_alloc: 40,
            mallocs: 25,
            num_gc: 4,
        };
        assert_eq!(
            last.sub(&initial),
            MemStats {
                total_alloc: 200,
                heap_alloc: 0,
                mallocs: 15,
                num_gc: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_info() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("Accept", "application/json")
            .match_header("Authorization", "Beater secret")
            .with_status(200)
            .with_body(r#"{"build_date": "2024-01-01T00:00:00Z", "build_sha": "abc123", "version": "8.12.0"}"#)
            .create_async()
            .await;

        let info = info(&reqwest::Client::new(), "secret", &server.url())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(
            info,
            ServerInfo {
                version: "8.12.0".to_string(),
                build_sha: "abc123".to_string(),
                build_date: "2024-01-01T00:00:00Z".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_info_without_secret_sends_no_auth() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("Authorization", Matcher::Missing)
            .with_status(200)
            .with_body(r#"{"version": "7.17.0"}"#)
            .create_async()
            .await;

        let info = info(&reqwest::Client::new(), "", &server.url())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(info.version, "7.17.0");
        assert_eq!(info.build_sha, "");
    }

    #[tokio::test]
    async fn test_info_unexpected_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(401)
            .create_async()
            .await;

        let err = info(&reqwest::Client::new(), "wrong", &server.url())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "APM server returned 401 Unauthorized");
    }

    #[tokio::test]
    async fn test_status() {
        let mut apm = Server::new_async().await;
        let _expvar = apm
            .mock("GET", "/debug/vars")
            .with_status(200)
            .with_body(
                r#"{
                    "cmdline": ["apm-server", "-E", "queue.mem.events=4096"],
                    "memstats": {"TotalAlloc": 1000, "HeapAlloc": 500, "Mallocs": 20, "NumGC": 2, "Sys": 9}
                }"#,
            )
            .create_async()
            .await;
        let mut es = Server::new_async().await;
        let mut counts = Vec::new();
        for (kind, count) in [("transaction", 10), ("span", 30), ("error", 5)] {
            let mock = es
                .mock("POST", "/apm*/_count")
                .match_body(Matcher::PartialJson(
                    json!({"query": {"term": {"processor.event": kind}}}),
                ))
                .with_status(200)
                .with_body(format!(r#"{{"count": {count}}}"#))
                .create_async()
                .await;
            counts.push(mock);
        }
        let search = SearchClient::new(reqwest::Client::new(), &es.url(), None).unwrap();

        let status = status(&reqwest::Client::new(), "", &apm.url(), Some(&search)).await;

        assert_eq!(
            status.indexed,
            IndexedCounts {
                transactions: Some(10),
                spans: Some(30),
                errors: Some(5),
            }
        );
        assert_eq!(status.mem_stats.unwrap().total_alloc, 1000);
        assert_eq!(status.mem_stats.unwrap().num_gc, 2);
        assert_eq!(status.settings.unwrap()["queue.mem.events"], "4096");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_status_tolerates_failures() {
        let mut apm = Server::new_async().await;
        let _expvar = apm
            .mock("GET", "/debug/vars")
            .with_status(404)
            .create_async()
            .await;
        let mut es = Server::new_async().await;
        let _count = es
            .mock("POST", "/apm*/_count")
            .with_status(500)
            .create_async()
            .await;
        let search = SearchClient::new(reqwest::Client::new(), &es.url(), None).unwrap();

        let status = status(&reqwest::Client::new(), "", &apm.url(), Some(&search)).await;

        assert_eq!(status, ServerStatus::default());
        assert!(logs_contain("Failed to count indexed span documents"));
        assert!(logs_contain("Failed to read APM server expvar"));
    }

    #[tokio::test]
    async fn test_status_without_search_cluster() {
        let mut apm = Server::new_async().await;
        let _expvar = apm
            .mock("GET", "/debug/vars")
            .with_status(200)
            .with_body(r#"{"cmdline": []}"#)
            .create_async()
            .await;

        let status = status(&reqwest::Client::new(), "", &apm.url(), None).await;

        assert_eq!(status.indexed, IndexedCounts::default());
        assert!(status.mem_stats.is_none());
        assert_eq!(status.settings, Some(BTreeMap::new()));
    }
}
