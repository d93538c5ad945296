// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in AMQP headers: the publisher injects the caller's
//! context, the dispatcher extracts it from each delivery and opens a consumer
//! span named after the routing key.

use crate::transport::DeliveredMessage;
use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Carrier exposing AMQP headers to OpenTelemetry propagators.
///
/// Keys are written lowercase; only `LongString` values are read back.
pub(crate) struct HeaderCarrier<'h> {
    headers: &'h mut BTreeMap<ShortString, AMQPValue>,
}

impl<'h> HeaderCarrier<'h> {
    pub(crate) fn new(headers: &'h mut BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderCarrier { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_lowercase());
        self.headers
            .insert(key, AMQPValue::LongString(LongString::from(value)));
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let Some(AMQPValue::LongString(value)) = self.headers.get(key) else {
            return None;
        };

        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(header = key, error = err.to_string(), "trace header is not utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Extracts the publisher's trace context from a delivery and starts a consumer span.
pub(crate) fn new_span(
    delivery: &DeliveredMessage,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|headers| headers.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
