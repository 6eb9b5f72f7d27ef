// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event generators.
//!
//! Both generators share one [`Tracer`]. Sizes (spans per transaction, frames per error) are
//! drawn from a caller-provided seeded RNG so runs are reproducible.

use std::sync::Arc;

use tracing::error;

use crate::tracer::{SyntheticError, Tracer, Transaction};

pub const TRANSACTION_NAME: &str = "generated";
pub const TRANSACTION_TYPE: &str = "request";
pub const SPAN_NAME: &str = "generated span";
pub const SPAN_SUBTYPE: &str = "app";
/// Tag holding the number of spans requested for a transaction.
pub const SPANS_TAG: &str = "spans";

fn sample(rng: &mut fastrand::Rng, min: u64, max: u64) -> u64 {
    if min >= max {
        min
    } else {
        rng.u64(min..=max)
    }
}

pub struct TransactionGenerator {
    tracer: Arc<dyn Tracer>,
    span_min: u64,
    span_max: u64,
}

impl TransactionGenerator {
    pub fn new(tracer: Arc<dyn Tracer>, span_min: u64, span_max: u64) -> Self {
        TransactionGenerator {
            tracer,
            span_min,
            span_max,
        }
    }

    /// Emits one transaction and returns how many spans were requested for it.
    ///
    /// Spans are emitted from a separate task that is awaited before returning, so a
    /// transaction is always complete when control goes back to the caller.
    pub async fn generate(&self, rng: &mut fastrand::Rng) -> u64 {
        let spans = sample(rng, self.span_min, self.span_max);
        let mut transaction = self
            .tracer
            .start_transaction(TRANSACTION_NAME, TRANSACTION_TYPE);
        transaction.set_tag(SPANS_TAG, spans);

        let tracer = Arc::clone(&self.tracer);
        let emitter = tokio::spawn(async move {
            emit_spans(tracer.as_ref(), &mut transaction, spans);
            transaction
        });

        match emitter.await {
            Ok(transaction) => self.tracer.end_transaction(transaction),
            Err(e) => error!("Span emitter task failed: {e}"),
        }
        spans
    }
}

fn emit_spans(tracer: &dyn Tracer, transaction: &mut Transaction, count: u64) {
    for _ in 0..count {
        if let Some(span) = tracer.start_span(transaction, SPAN_NAME, SPAN_SUBTYPE) {
            tracer.end_span(span);
        }
    }
}

pub struct ErrorGenerator {
    tracer: Arc<dyn Tracer>,
    frame_min: u64,
    frame_max: u64,
}

impl ErrorGenerator {
    pub fn new(tracer: Arc<dyn Tracer>, frame_min: u64, frame_max: u64) -> Self {
        ErrorGenerator {
            tracer,
            frame_min,
            frame_max,
        }
    }

    /// Sends one synthetic error and returns its frame count.
    pub fn generate(&self, rng: &mut fastrand::Rng) -> u64 {
        let frames = sample(rng, self.frame_min, self.frame_max);
        self.tracer
            .send_error(&SyntheticError::new(frames as usize));
        frames
    }
}
