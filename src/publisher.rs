// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Validates send targets against the exchange catalogue, encodes payloads
//! and publishes them, either directly or through a delay holding queue.
//! The same publisher serves external callers and the dispatcher's retry
//! path. Every transport publish happens under one mutex so concurrent
//! producers never interleave writes on the shared channel.
//!
//! OpenTelemetry context is propagated in the message headers.

use crate::{
    delay::DelayScheduler,
    errors::AmqpError,
    exchange::ExchangeCatalog,
    otel,
    transport::AmqpTransport,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for plain text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// AMQP delivery mode asking the broker to store the message durably
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be published.
#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub delay_secs: Option<u32>,
}

impl PublishMessage {
    /// Raw bytes, no content type.
    pub fn bytes(exchange: &str, routing_key: &str, data: impl Into<Vec<u8>>) -> PublishMessage {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.into(),
            ..PublishMessage::default()
        }
    }

    /// UTF-8 text.
    pub fn text(exchange: &str, routing_key: &str, body: &str) -> PublishMessage {
        Self::bytes(exchange, routing_key, body.as_bytes()).content_type(TEXT_CONTENT_TYPE)
    }

    /// An already encoded JSON document.
    pub fn json_str(exchange: &str, routing_key: &str, json: &str) -> PublishMessage {
        Self::bytes(exchange, routing_key, json.as_bytes()).content_type(JSON_CONTENT_TYPE)
    }

    /// Serializes `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<PublishMessage, AmqpError> {
        let data = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError
        })?;

        Ok(Self::bytes(exchange, routing_key, data).content_type(JSON_CONTENT_TYPE))
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Marks the message for durable storage.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Delivers the message `delay_secs` seconds later. A zero delay publishes directly.
    pub fn delayed(mut self, delay_secs: u32) -> Self {
        self.delay_secs = Some(delay_secs).filter(|delay| *delay > 0);
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    fn properties(&self, headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }

        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

/// Publishes messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// Publisher validating targets against an `ExchangeCatalog`.
pub struct RabbitMQPublisher {
    transport: Arc<dyn AmqpTransport>,
    catalog: Arc<ExchangeCatalog>,
    scheduler: DelayScheduler,
    publish_lock: Mutex<()>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `transport` - Transport every publish goes through
    /// * `catalog` - Declared exchanges, used to validate send targets
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        catalog: Arc<ExchangeCatalog>,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            scheduler: DelayScheduler::new(transport.clone(), catalog.clone()),
            transport,
            catalog,
            publish_lock: Mutex::new(()),
        })
    }

    /// Publishes raw bytes without a content type.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated in the message headers
    /// * `exchange` - Declared exchange, or the dead-letter exchange of one
    /// * `routing_key` - Routing key of the message
    /// * `data` - Payload
    /// * `delay_secs` - Seconds to hold the message back; `None` or `Some(0)`
    ///   publishes directly
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the publish, or the validation or
    /// transport error
    pub async fn send_bytes(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        delay_secs: Option<u32>,
    ) -> Result<(), AmqpError> {
        let msg = with_delay(PublishMessage::bytes(exchange, routing_key, data), delay_secs);
        self.publish(ctx, &msg).await
    }

    /// Same as `send_bytes`, with the `text/plain` content type.
    pub async fn send_string(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &str,
        delay_secs: Option<u32>,
    ) -> Result<(), AmqpError> {
        let msg = with_delay(PublishMessage::text(exchange, routing_key, body), delay_secs);
        self.publish(ctx, &msg).await
    }

    /// Serializes `value` and publishes it as `application/json`.
    ///
    /// # Returns
    /// `SerializePayloadError` when `value` cannot be encoded, otherwise as
    /// `send_bytes`
    pub async fn send_json<T: Serialize + Sync + ?Sized>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        value: &T,
        delay_secs: Option<u32>,
    ) -> Result<(), AmqpError> {
        let msg = with_delay(PublishMessage::json(exchange, routing_key, value)?, delay_secs);
        self.publish(ctx, &msg).await
    }

    /// Same as `send_json`, with delivery mode 2.
    pub async fn send_persistent_json<T: Serialize + Sync + ?Sized>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        value: &T,
        delay_secs: Option<u32>,
    ) -> Result<(), AmqpError> {
        let msg = with_delay(
            PublishMessage::json(exchange, routing_key, value)?.persistent(),
            delay_secs,
        );
        self.publish(ctx, &msg).await
    }

    /// Publishes on a background task so the caller is not held up by the
    /// publish lock or the broker round trip.
    pub fn spawn_publish(
        self: &Arc<Self>,
        ctx: Context,
        msg: PublishMessage,
    ) -> JoinHandle<Result<(), AmqpError>> {
        let publisher = self.clone();
        tokio::spawn(async move { publisher.publish(&ctx, &msg).await })
    }

    fn validate(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        if exchange.is_empty() {
            return Err(AmqpError::InvalidPublishTarget(
                "exchange name must not be empty".to_owned(),
            ));
        }

        if routing_key.is_empty() {
            return Err(AmqpError::InvalidPublishTarget(
                "routing key must not be empty".to_owned(),
            ));
        }

        if !self.catalog.is_known(exchange) {
            error!(exchange, "publishing to an undeclared exchange");
            return Err(AmqpError::UnknownExchange(exchange.to_owned()));
        }

        Ok(())
    }
}

fn with_delay(msg: PublishMessage, delay_secs: Option<u32>) -> PublishMessage {
    match delay_secs {
        Some(delay) => msg.delayed(delay),
        None => msg,
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes `msg`, routing it through a holding queue when it is delayed.
    ///
    /// Target validation and delayed-queue resolution happen before the
    /// publish lock is taken.
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        self.validate(&msg.exchange, &msg.routing_key)?;

        let (exchange, routing_key) = match msg.delay_secs {
            Some(delay) => {
                let (dlx, queue) = self
                    .scheduler
                    .schedule_delayed(&msg.exchange, &msg.routing_key, delay)
                    .await?;
                self.validate(&dlx, &queue)?;
                debug!(
                    exchange = %msg.exchange,
                    routing_key = %msg.routing_key,
                    delay,
                    "message parked in {}",
                    queue
                );
                (dlx, queue)
            }
            None => (msg.exchange.clone(), msg.routing_key.clone()),
        };

        let mut headers = msg.headers.clone();
        otel::inject_context(ctx, &mut headers);
        let props = msg.properties(headers);

        let _guard = self.publish_lock.lock().await;
        self.transport
            .publish(&exchange, &routing_key, props, &msg.data)
            .await
    }
}
