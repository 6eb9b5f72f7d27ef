// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rate tickers that can be switched off.
//!
//! A [`MaybeTicker`] that was never started, or has been stopped, never yields, so it can sit
//! in a `select!` next to active sources without special-casing.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct MaybeTicker {
    interval: Option<Interval>,
}

impl MaybeTicker {
    /// An inert ticker.
    pub fn new() -> Self {
        MaybeTicker { interval: None }
    }

    /// A ticker pulsing every `period`, or an inert one if `period` is zero.
    pub fn every(period: Duration) -> Self {
        let mut ticker = MaybeTicker::new();
        ticker.start(period);
        ticker
    }

    /// Starts pulsing every `period`, first pulse one period from now. A zero period leaves the
    /// ticker inert.
    pub fn start(&mut self, period: Duration) {
        if period.is_zero() {
            self.interval = None;
            return;
        }
        let mut interval = interval_at(Instant::now() + period, period);
        // pulses missed while the engine was busy are skipped, not bunched up
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    /// Permanently silences the ticker.
    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_active(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next pulse. Never completes on an inert ticker.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}
