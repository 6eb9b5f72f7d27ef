// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Load generator for APM servers.
//!
//! Generates transactions, spans and errors at configurable rates, streams them to an APM
//! server, and reports how many were sent, accepted and indexed. In benchmark mode a fixed set
//! of workloads is run and each report is checked against previous ones for regressions.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bench;
pub mod config;
pub mod generator;
pub mod http_utils;
pub mod probe;
pub mod report;
pub mod runner;
pub mod search;
pub mod ticker;
pub mod tracer;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bench::{Bench, BenchConfig, BenchError};
pub use config::{ConfigError, Input};
pub use report::Report;
pub use runner::{RunError, Runner};
pub use worker::{RunResult, Worker, WorkerError};
