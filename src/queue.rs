// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A queue belongs to exactly one exchange and is bound to it either with an
//! explicit list of routing keys or, when none are given, with its own name.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::collections::BTreeMap;

/// Definition of a queue owned by an exchange.
///
/// Built with the same chained-builder style as `ExchangeDefinition`.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) delete: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) routing_keys: Vec<String>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with no explicit routing keys.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Adds a routing key to bind the queue with. Duplicates are ignored.
    pub fn routing_key(mut self, key: &str) -> Self {
        if !self.routing_keys.iter().any(|k| k == key) {
            self.routing_keys.push(key.to_owned());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys used to bind this queue: the explicit routing keys, or the queue's
    /// own name when none were configured.
    pub fn binding_keys(&self) -> Vec<&str> {
        if self.routing_keys.is_empty() {
            return vec![self.name.as_str()];
        }

        self.routing_keys.iter().map(String::as_str).collect()
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
