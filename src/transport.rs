// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Capabilities
//!
//! The narrow set of AMQP operations the dispatch layer relies on. The
//! production implementation is `channel::LapinTransport`; the wire protocol,
//! connection lifecycle and network recovery all live below this trait.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    message::Delivery,
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    BasicProperties,
};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer. Ends when the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<DeliveredMessage, AmqpError>>;

/// Operations the dispatch layer performs against the broker.
///
/// Declarations must be idempotent at the broker: repeating one with identical
/// parameters succeeds. `consume` always uses manual acknowledgement.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn acknowledge(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    /// Stops the broker from pushing further deliveries to `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;
}

/// A single delivery handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct DeliveredMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
}

impl DeliveredMessage {
    /// Looks up a header, if the delivery carries headers at all.
    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(key))
    }
}

impl From<Delivery> for DeliveredMessage {
    fn from(delivery: Delivery) -> Self {
        DeliveredMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}
