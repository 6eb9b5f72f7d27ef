// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::RequestBuilder;

/// Sent as `User-Agent` on every request.
pub const USER_AGENT: &str = "hey-apm";

/// Builds the HTTP client shared by the tracer, the server probe and the search clients.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Adds `Authorization: <scheme> <secret>` unless the secret is empty.
pub fn with_secret(request: RequestBuilder, scheme: &str, secret: &str) -> RequestBuilder {
    if secret.is_empty() {
        return request;
    }
    match HeaderValue::from_str(&format!("{scheme} {secret}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.header(AUTHORIZATION, value)
        }
        Err(_) => request,
    }
}
