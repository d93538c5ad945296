// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! A delayed message is parked in a holding queue named
//! `{routing_key}.delayed.{seconds}` that is bound to the exchange's
//! dead-letter exchange. The holding queue has a message TTL equal to the
//! delay and dead-letters expired messages back to the original exchange and
//! routing key. It expires itself a grace period after the TTL once unused.
//!
//! Queue names and arguments are pure functions of their inputs, so
//! concurrent schedulers converge on the same declaration.

use crate::{
    errors::AmqpError,
    exchange::ExchangeCatalog,
    topology::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_EXPIRES, AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::AmqpTransport,
};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::sync::Arc;
use tracing::debug;

/// Grace period, in milliseconds, a holding queue outlives its message TTL.
pub const DELAYED_QUEUE_EXPIRY_GRACE_MS: i64 = 60_000;

/// Name and arguments of the holding queue for one (exchange, routing key, delay).
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedQueueDescriptor {
    pub name: String,
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
    pub message_ttl_ms: i64,
    pub expires_ms: i64,
}

impl DelayedQueueDescriptor {
    pub fn new(exchange: &str, routing_key: &str, delay_secs: u32) -> DelayedQueueDescriptor {
        let message_ttl_ms = i64::from(delay_secs) * 1000;

        DelayedQueueDescriptor {
            name: delayed_queue_name(routing_key, delay_secs),
            dead_letter_exchange: exchange.to_owned(),
            dead_letter_routing_key: routing_key.to_owned(),
            message_ttl_ms,
            expires_ms: message_ttl_ms + DELAYED_QUEUE_EXPIRY_GRACE_MS,
        }
    }

    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.dead_letter_exchange.as_str())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.dead_letter_routing_key.as_str())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(self.message_ttl_ms),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongLongInt(self.expires_ms),
        );

        args
    }
}

pub fn delayed_queue_name(routing_key: &str, delay_secs: u32) -> String {
    format!("{routing_key}.delayed.{delay_secs}")
}

/// Declares holding queues on demand.
pub struct DelayScheduler {
    transport: Arc<dyn AmqpTransport>,
    catalog: Arc<ExchangeCatalog>,
}

impl DelayScheduler {
    pub fn new(transport: Arc<dyn AmqpTransport>, catalog: Arc<ExchangeCatalog>) -> DelayScheduler {
        DelayScheduler { transport, catalog }
    }

    /// Declares (or re-declares) the holding queue for a delayed send and binds
    /// it to the exchange's dead-letter exchange.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the message is finally delivered to
    /// * `routing_key` - Routing key the message is finally delivered with
    /// * `delay_secs` - Seconds the message stays in the holding queue
    ///
    /// # Returns
    /// The dead-letter exchange and the holding queue name; the caller
    /// publishes the message to that pair. `UnknownExchange` or
    /// `MissingDeadLetterExchange` are returned before any transport call.
    pub async fn schedule_delayed(
        &self,
        exchange: &str,
        routing_key: &str,
        delay_secs: u32,
    ) -> Result<(String, String), AmqpError> {
        let dlx = self.catalog.dead_letter_exchange_of(exchange)?;
        let descriptor = DelayedQueueDescriptor::new(exchange, routing_key, delay_secs);

        debug!(
            queue = %descriptor.name,
            ttl = descriptor.message_ttl_ms,
            "declaring delayed queue"
        );

        self.transport
            .declare_queue(
                &descriptor.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                descriptor.arguments(),
            )
            .await?;

        self.transport
            .bind_queue(&descriptor.name, dlx, &descriptor.name)
            .await?;

        Ok((dlx.to_owned(), descriptor.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeDefinition, queue::QueueDefinition, transport::MockAmqpTransport,
    };
    use mockall::predicate::eq;

    fn catalog() -> Arc<ExchangeCatalog> {
        Arc::new(
            ExchangeCatalog::new(vec![
                ExchangeDefinition::new("X").dead_letter_exchange("X.dlx"),
                ExchangeDefinition::new("orders")
                    .durable()
                    .dead_letter_exchange("orders.dlx")
                    .queue(QueueDefinition::new("orders.created").routing_key("order.created")),
                ExchangeDefinition::new("audit"),
            ])
            .unwrap(),
        )
    }

    fn ttl_and_expiry(args: &FieldTable) -> (Option<&AMQPValue>, Option<&AMQPValue>) {
        (
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            args.inner().get(AMQP_HEADERS_EXPIRES),
        )
    }

    #[test]
    fn descriptor_is_deterministic() {
        let descriptor = DelayedQueueDescriptor::new("X", "route.key", 30);

        assert_eq!(descriptor, DelayedQueueDescriptor::new("X", "route.key", 30));
        assert_eq!(descriptor.name, "route.key.delayed.30");
        assert_eq!(descriptor.message_ttl_ms, 30_000);
        assert_eq!(descriptor.expires_ms, 90_000);

        let args = descriptor.arguments();
        assert_eq!(
            ttl_and_expiry(&args),
            (
                Some(&AMQPValue::LongLongInt(30_000)),
                Some(&AMQPValue::LongLongInt(90_000))
            )
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("X")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("route.key")))
        );
    }

    #[tokio::test]
    async fn declares_and_binds_holding_queue_to_dead_letter_exchange() {
        let mut transport = MockAmqpTransport::new();

        transport
            .expect_declare_queue()
            .withf(|name, opts, args| {
                name == "order.created.delayed.5"
                    && opts.durable
                    && !opts.exclusive
                    && !opts.auto_delete
                    && ttl_and_expiry(args)
                        == (
                            Some(&AMQPValue::LongLongInt(5_000)),
                            Some(&AMQPValue::LongLongInt(65_000)),
                        )
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_bind_queue()
            .with(
                eq("order.created.delayed.5"),
                eq("orders.dlx"),
                eq("order.created.delayed.5"),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        let scheduler = DelayScheduler::new(Arc::new(transport), catalog());

        assert_eq!(
            scheduler.schedule_delayed("orders", "order.created", 5).await,
            Ok(("orders.dlx".to_owned(), "order.created.delayed.5".to_owned()))
        );
    }

    #[tokio::test]
    async fn rejects_exchange_without_dead_letter_exchange_before_any_transport_call() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_declare_queue().never();
        transport.expect_bind_queue().never();

        let scheduler = DelayScheduler::new(Arc::new(transport), catalog());

        assert_eq!(
            scheduler.schedule_delayed("audit", "audit.event", 10).await,
            Err(AmqpError::MissingDeadLetterExchange("audit".to_owned()))
        );
        assert_eq!(
            scheduler.schedule_delayed("shipping", "ship", 10).await,
            Err(AmqpError::UnknownExchange("shipping".to_owned()))
        );
    }
}
