// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery:
//! 1. Decodes the payload as UTF-8 text
//! 2. Runs every asynchronous handler for the routing key concurrently and
//!    waits for all of them
//! 3. Runs the synchronous handlers one by one, stopping at the first failure
//! 4. Acknowledges the delivery, whatever the outcome
//! 5. On failure, republishes the message once through a delay queue when
//!    the exchange allows it, otherwise drops it
//!
//! A retried message is a new message carrying the `requeued` header; the
//! broker's own redelivery is never used.

use crate::{
    errors::{AmqpError, HandlerError},
    exchange::ExchangeCatalog,
    handler::ConsumerMessage,
    otel,
    publisher::{PublishMessage, Publisher, PERSISTENT_DELIVERY_MODE},
    registry::HandlerRegistry,
    transport::{AmqpTransport, DeliveredMessage},
};
use futures_util::future::join_all;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Header marking a message that was already retried once
pub const AMQP_HEADERS_REQUEUED: &str = "requeued";
/// Delay, in seconds, before a failed message is redelivered
pub const RESEND_DELAY_SECS: u32 = 60;

/// What happened to a delivery once it left the consume callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every handler succeeded.
    Processed,
    /// No handler is registered for the routing key; the message was discarded.
    Unrouted,
    /// A handler failed and the message was republished through a delay queue.
    RequeuedForRetry,
    /// A handler failed and the message was discarded.
    Dropped,
}

/// Collaborators shared by every consume task.
pub(crate) struct DeliveryContext {
    pub(crate) transport: Arc<dyn AmqpTransport>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) catalog: Arc<ExchangeCatalog>,
    pub(crate) publisher: Arc<dyn Publisher>,
}

/// Dispatches one delivery to its handlers, acknowledges it and applies the
/// retry policy.
///
/// Handler failures never surface as `Err`; only acknowledgement and
/// republish failures do.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &DeliveredMessage,
    defs: &DeliveryContext,
) -> Result<DeliveryOutcome, AmqpError> {
    let (ctx, mut span) = otel::new_span(delivery, tracer, &delivery.routing_key);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    if !defs.registry.has_handlers(&delivery.routing_key) {
        let msg = "removing message from queue - reason: no handler for routing key";
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });
        debug!(delivery_tag = delivery.delivery_tag, "{}", msg);

        ack(delivery, defs, &mut span).await?;
        return Ok(DeliveryOutcome::Unrouted);
    }

    let result = run_handlers(&ctx, delivery, &defs.registry).await;

    ack(delivery, defs, &mut span).await?;

    let Err(err) = result else {
        debug!("message successfully processed");
        span.set_status(Status::Ok);
        return Ok(DeliveryOutcome::Processed);
    };

    warn!(
        delivery_tag = delivery.delivery_tag,
        error = err.to_string(),
        "error whiling handling msg"
    );
    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    if !should_retry(&defs.catalog, delivery) {
        warn!(
            delivery_tag = delivery.delivery_tag,
            "dropping failed msg, no retry left"
        );
        return Ok(DeliveryOutcome::Dropped);
    }

    warn!(
        delivery_tag = delivery.delivery_tag,
        "requeuing msg in {}s",
        RESEND_DELAY_SECS
    );
    match defs.publisher.publish(&ctx, &retry_message(delivery)).await {
        Ok(_) => Ok(DeliveryOutcome::RequeuedForRetry),
        Err(e) => {
            error!(
                delivery_tag = delivery.delivery_tag,
                error = e.to_string(),
                "error whiling requeuing"
            );
            span.record_error(&e);
            Err(AmqpError::RequeuingMessageError)
        }
    }
}

async fn run_handlers(
    ctx: &Context,
    delivery: &DeliveredMessage,
    registry: &HandlerRegistry,
) -> Result<(), HandlerError> {
    let msg = ConsumerMessage {
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        body: String::from_utf8(delivery.data.clone())?,
        headers: delivery.properties.headers().clone().unwrap_or_default(),
    };

    let results = join_all(
        registry
            .async_handlers(&delivery.routing_key)
            .iter()
            .map(|registered| registered.handler().exec(ctx, &msg)),
    )
    .await;

    if let Some(err) = results.into_iter().find_map(Result::err) {
        return Err(err);
    }

    for registered in registry.sync_handlers(&delivery.routing_key) {
        registered.handler().handle(&msg)?;
    }

    Ok(())
}

async fn ack(
    delivery: &DeliveredMessage,
    defs: &DeliveryContext,
    span: &mut impl Span,
) -> Result<(), AmqpError> {
    if let Err(e) = defs.transport.acknowledge(delivery.delivery_tag, false).await {
        error!("error whiling ack msg");
        span.record_error(&e);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
        return Err(e);
    }

    Ok(())
}

/// Any value counts as a marker, whatever type the sender encoded it with.
fn already_requeued(delivery: &DeliveredMessage) -> bool {
    delivery.header(AMQP_HEADERS_REQUEUED).is_some()
}

/// A failed delivery is retried once, and only when its exchange opts in
/// and has a dead-letter exchange to hold the delayed copy.
fn should_retry(catalog: &ExchangeCatalog, delivery: &DeliveredMessage) -> bool {
    let Some(exch) = catalog.get(&delivery.exchange) else {
        return false;
    };

    exch.retries_failures() && !already_requeued(delivery)
}

fn retry_message(delivery: &DeliveredMessage) -> PublishMessage {
    let props = &delivery.properties;

    let mut headers = props
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_REQUEUED),
        AMQPValue::Boolean(true),
    );

    PublishMessage {
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        data: delivery.data.clone(),
        content_type: props.content_type().as_ref().map(|c| c.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
        delay_secs: Some(RESEND_DELAY_SECS),
    }
}
