// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and
//! provides `LapinTransport`, the `AmqpTransport` implementation backed by a
//! single shared `lapin::Channel`.
//!
//! Connection-level failures reported by lapin after startup are forwarded on
//! an unbounded channel so the hosting process can decide to reconnect or
//! shut down.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{AmqpTransport, DeliveredMessage, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error};

/// An open connection, its channel and the receiver for fatal connection errors.
pub struct AmqpConnection {
    pub connection: Arc<Connection>,
    pub channel: Arc<Channel>,
    pub fatal_errors: UnboundedReceiver<AmqpError>,
}

impl AmqpConnection {
    /// Closes the channel and then the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(200, "closing").await {
            error!(error = err.to_string(), "failure to close the channel");
            return Err(AmqpError::ChannelError);
        }

        if let Err(err) = self.connection.close(200, "closing").await {
            error!(error = err.to_string(), "failure to close the connection");
            return Err(AmqpError::ConnectionError);
        }

        Ok(())
    }
}

/// Creates a new AMQP connection and channel.
///
/// The connection is named after `cfg.app_name`. Errors raised by lapin on the
/// connection after this function returns are logged and pushed to
/// `AmqpConnection::fatal_errors`.
pub async fn new_amqp_channel(cfg: &RabbitMQConfigs) -> Result<AmqpConnection, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    let (fatal_tx, fatal_errors) = mpsc::unbounded_channel();
    conn.on_error(move |err| {
        error!(error = err.to_string(), "amqp connection failure");
        let _ = fatal_tx.send(AmqpError::ConnectionFatal(err.to_string()));
    });

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(AmqpConnection {
                connection: Arc::new(conn),
                channel: Arc::new(c),
                fatal_errors,
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// `AmqpTransport` over a single lapin channel.
#[derive(Clone)]
pub struct LapinTransport {
    channel: Arc<Channel>,
}

impl LapinTransport {
    pub fn new(channel: Arc<Channel>) -> Arc<LapinTransport> {
        Arc::new(LapinTransport { channel })
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(name, kind.into(), options, args)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(name, options, args).await {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(DeliveredMessage::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn acknowledge(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    consumer_tag, "error to cancel the consumer"
                );
                Err(AmqpError::ConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }
}
