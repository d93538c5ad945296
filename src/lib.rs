// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Routing, dispatch and delayed retry of RabbitMQ messages.
//!
//! Typical wiring: load `configs::RabbitMQConfigs`, open a connection with
//! `channel::new_amqp_channel`, install the `topology::AmqpTopology`, build a
//! `registry::HandlerRegistry`, then start a `dispatcher::RabbitMQDispatcher`
//! and publish through a `publisher::RabbitMQPublisher`.

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod delay;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod telemetry;
pub mod topology;
pub mod transport;

pub use consumer::{DeliveryOutcome, AMQP_HEADERS_REQUEUED, RESEND_DELAY_SECS};
