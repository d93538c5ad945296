// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Handlers come in two flavours: `ConsumerHandler` runs asynchronously and
//! all async handlers of a delivery run concurrently; `MessageHandler` runs
//! synchronously, one after another, in registration order.
//!
//! Handlers are identified by their concrete Rust type. The registry uses
//! that identity to match handlers with their routing registrations and to
//! keep a handler type from appearing twice for the same routing key.

use crate::errors::HandlerError;
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::any::{type_name, TypeId};

/// A decoded delivery as seen by handlers.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: String,
    pub headers: FieldTable,
}

impl ConsumerMessage {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }
}

/// Asynchronous message handler.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Synchronous message handler.
///
/// Runs on the consume task; keep it short or move heavy work into a
/// `ConsumerHandler`.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Identity of a handler's concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    pub fn of<H: ?Sized + 'static>() -> HandlerType {
        HandlerType {
            id: TypeId::of::<H>(),
            name: type_name::<H>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
