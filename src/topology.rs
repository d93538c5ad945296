// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the exchanges of an `ExchangeCatalog`, their queues and
//! bindings, and the dead-letter exchanges backing delayed delivery.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over an `AmqpTransport`
//! - Header constants: Argument names understood by RabbitMQ

use crate::{
    errors::AmqpError,
    exchange::{ExchangeCatalog, ExchangeDefinition, ExchangeKind},
    transport::AmqpTransport,
};
use async_trait::async_trait;
use lapin::{options::ExchangeDeclareOptions, types::FieldTable};
use std::sync::Arc;
use tracing::{debug, info};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify an unused queue's expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Declares every exchange, queue, binding and dead-letter exchange.
    ///
    /// Any transport failure aborts the installation and is returned as is.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installer for the exchanges of a catalogue.
pub struct AmqpTopology {
    transport: Arc<dyn AmqpTransport>,
    catalog: Arc<ExchangeCatalog>,
}

impl AmqpTopology {
    pub fn new(transport: Arc<dyn AmqpTransport>, catalog: Arc<ExchangeCatalog>) -> AmqpTopology {
        AmqpTopology { transport, catalog }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. For each exchange: declares it, then declares and binds its queues
    /// 2. Declares each distinct dead-letter exchange once
    async fn install(&self) -> Result<(), AmqpError> {
        for exch in self.catalog.exchanges() {
            self.install_exchange(exch).await?;
        }

        self.install_dead_letter_exchanges().await?;

        info!(
            exchanges = self.catalog.exchanges().len(),
            dead_letter_exchanges = self.catalog.dead_letter_exchanges().len(),
            "topology installed"
        );

        Ok(())
    }
}

impl AmqpTopology {
    async fn install_exchange(&self, exch: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        self.transport
            .declare_exchange(
                &exch.name,
                exch.kind,
                exch.declare_options(),
                exch.arguments(),
            )
            .await?;

        debug!("exchange: {} was created", exch.name);

        for queue in exch.queues() {
            debug!("creating queue: {}", queue.name);

            self.transport
                .declare_queue(&queue.name, queue.declare_options(), queue.arguments())
                .await?;

            for key in queue.binding_keys() {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue.name, exch.name, key
                );

                self.transport.bind_queue(&queue.name, &exch.name, key).await?;
            }
        }

        Ok(())
    }

    async fn install_dead_letter_exchanges(&self) -> Result<(), AmqpError> {
        for dlx in self.catalog.dead_letter_exchanges() {
            debug!("creating dead letter exchange: {}", dlx);

            self.transport
                .declare_exchange(
                    dlx,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::QueueDefinition, transport::MockAmqpTransport};
    use mockall::{predicate::eq, Sequence};

    fn catalog() -> Arc<ExchangeCatalog> {
        Arc::new(
            ExchangeCatalog::new(vec![
                ExchangeDefinition::new("orders")
                    .topic()
                    .durable()
                    .dead_letter_exchange("orders.dlx")
                    .queue(
                        QueueDefinition::new("orders.created")
                            .durable()
                            .routing_key("order.created")
                            .routing_key("order.imported"),
                    ),
                ExchangeDefinition::new("payments")
                    .dead_letter_exchange("orders.dlx")
                    .queue(QueueDefinition::new("payments.settled")),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn declares_exchanges_queues_and_bindings_in_order() {
        let mut transport = MockAmqpTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_declare_exchange()
            .withf(|name, kind, opts, _| {
                name == "orders" && *kind == ExchangeKind::Topic && opts.durable
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_declare_queue()
            .withf(|name, opts, _| name == "orders.created" && opts.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_bind_queue()
            .with(eq("orders.created"), eq("orders"), eq("order.created"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_bind_queue()
            .with(eq("orders.created"), eq("orders"), eq("order.imported"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_declare_exchange()
            .withf(|name, _, _, _| name == "payments")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_declare_queue()
            .withf(|name, _, _| name == "payments.settled")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_bind_queue()
            .with(eq("payments.settled"), eq("payments"), eq("payments.settled"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_declare_exchange()
            .withf(|name, kind, opts, _| {
                name == "orders.dlx"
                    && *kind == ExchangeKind::Direct
                    && opts.durable
                    && !opts.auto_delete
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let topology = AmqpTopology::new(Arc::new(transport), catalog());

        assert_eq!(topology.install().await, Ok(()));
    }

    #[tokio::test]
    async fn declaration_failure_aborts_startup() {
        let mut transport = MockAmqpTransport::new();

        transport
            .expect_declare_exchange()
            .times(1)
            .returning(|name, _, _, _| Err(AmqpError::DeclareExchangeError(name.to_owned())));
        transport.expect_declare_queue().never();
        transport.expect_bind_queue().never();

        let topology = AmqpTopology::new(Arc::new(transport), catalog());

        assert_eq!(
            topology.install().await,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }
}
