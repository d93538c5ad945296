// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps routing keys to the handlers interested in them. Routing
//! registrations associate a handler *type* with routing keys; the registry
//! inverts them into one ordered bucket per routing key, holding at most one
//! handler of each type. Synchronous and asynchronous handlers live in two
//! parallel tables.
//!
//! The registry is built once at startup and only read afterwards.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerType, MessageHandler},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, error};

/// Associates a handler type with the routing keys it consumes.
#[derive(Debug, Clone)]
pub struct RoutingRegistration {
    pub(crate) handler_type: HandlerType,
    pub(crate) routing_keys: Vec<String>,
}

impl RoutingRegistration {
    pub fn new(handler_type: HandlerType, routing_keys: &[&str]) -> RoutingRegistration {
        RoutingRegistration {
            handler_type,
            routing_keys: routing_keys.iter().map(|k| (*k).to_owned()).collect(),
        }
    }

    /// Registration for the handler type `H`.
    pub fn of<H: 'static>(routing_keys: &[&str]) -> RoutingRegistration {
        Self::new(HandlerType::of::<H>(), routing_keys)
    }
}

/// A handler instance tagged with its concrete type.
pub struct Registered<H: ?Sized> {
    pub(crate) handler_type: HandlerType,
    pub(crate) handler: Arc<H>,
}

impl<H: ?Sized> Clone for Registered<H> {
    fn clone(&self) -> Self {
        Registered {
            handler_type: self.handler_type,
            handler: self.handler.clone(),
        }
    }
}

impl<H: ?Sized> Registered<H> {
    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

pub type SyncHandler = Registered<dyn MessageHandler>;
pub type AsyncHandler = Registered<dyn ConsumerHandler>;

impl Registered<dyn MessageHandler> {
    pub fn sync<T: MessageHandler + 'static>(handler: T) -> SyncHandler {
        Registered {
            handler_type: HandlerType::of::<T>(),
            handler: Arc::new(handler),
        }
    }
}

impl Registered<dyn ConsumerHandler> {
    pub fn asynchronous<T: ConsumerHandler + 'static>(handler: T) -> AsyncHandler {
        Registered {
            handler_type: HandlerType::of::<T>(),
            handler: Arc::new(handler),
        }
    }
}

type Table<H> = HashMap<String, Vec<Registered<H>>>;

/// Routing key to handlers lookup, built once and read concurrently.
pub struct HandlerRegistry {
    sync: Table<dyn MessageHandler>,
    asynchronous: Table<dyn ConsumerHandler>,
}

impl HandlerRegistry {
    /// Builds the two routing tables.
    ///
    /// Routing keys registered several times for the same type are merged.
    /// A handler type appears at most once per routing key; later instances of
    /// the same type are ignored.
    ///
    /// # Parameters
    /// * `registrations` - Routing keys per handler type
    /// * `sync_handlers` - Synchronous handlers, in execution order
    /// * `async_handlers` - Asynchronous handlers
    ///
    /// # Returns
    /// The frozen registry, or `UnregisteredHandler` naming the first handler
    /// type without a registration
    pub fn build(
        registrations: &[RoutingRegistration],
        sync_handlers: Vec<SyncHandler>,
        async_handlers: Vec<AsyncHandler>,
    ) -> Result<HandlerRegistry, AmqpError> {
        let mut keys_by_type: HashMap<HandlerType, Vec<String>> = HashMap::new();
        for registration in registrations {
            let keys = keys_by_type.entry(registration.handler_type).or_default();
            for key in &registration.routing_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let registry = HandlerRegistry {
            sync: bucket(&keys_by_type, sync_handlers)?,
            asynchronous: bucket(&keys_by_type, async_handlers)?,
        };

        debug!(
            routing_keys = registry.routing_keys().len(),
            "handler registry built"
        );

        Ok(registry)
    }

    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Synchronous handlers for `routing_key`, in registration order.
    pub fn sync_handlers(&self, routing_key: &str) -> &[SyncHandler] {
        self.sync.get(routing_key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Asynchronous handlers for `routing_key`, in registration order.
    pub fn async_handlers(&self, routing_key: &str) -> &[AsyncHandler] {
        self.asynchronous
            .get(routing_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, routing_key: &str) -> bool {
        !self.sync_handlers(routing_key).is_empty() || !self.async_handlers(routing_key).is_empty()
    }

    /// Every routing key with at least one handler.
    pub fn routing_keys(&self) -> BTreeSet<&str> {
        self.sync
            .keys()
            .chain(self.asynchronous.keys())
            .map(String::as_str)
            .collect()
    }
}

fn bucket<H: ?Sized>(
    keys_by_type: &HashMap<HandlerType, Vec<String>>,
    handlers: Vec<Registered<H>>,
) -> Result<Table<H>, AmqpError> {
    let mut table: Table<H> = HashMap::new();

    for registered in handlers {
        let Some(keys) = keys_by_type.get(&registered.handler_type) else {
            error!(
                handler = registered.handler_type.name(),
                "handler without routing key registration"
            );
            return Err(AmqpError::UnregisteredHandler(
                registered.handler_type.name().to_owned(),
            ));
        };

        for key in keys {
            let entries = table.entry(key.clone()).or_default();
            if entries
                .iter()
                .any(|entry| entry.handler_type == registered.handler_type)
            {
                continue;
            }
            entries.push(registered.clone());
        }
    }

    Ok(table)
}

/// Collects registrations and handlers before freezing them into a `HandlerRegistry`.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<RoutingRegistration>,
    sync: Vec<SyncHandler>,
    asynchronous: Vec<AsyncHandler>,
}

impl HandlerRegistryBuilder {
    /// Registers the routing keys consumed by handler type `H`.
    pub fn route<H: 'static>(mut self, routing_keys: &[&str]) -> Self {
        self.registrations
            .push(RoutingRegistration::of::<H>(routing_keys));
        self
    }

    pub fn registration(mut self, registration: RoutingRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn handler<T: MessageHandler + 'static>(mut self, handler: T) -> Self {
        self.sync.push(SyncHandler::sync(handler));
        self
    }

    pub fn async_handler<T: ConsumerHandler + 'static>(mut self, handler: T) -> Self {
        self.asynchronous.push(AsyncHandler::asynchronous(handler));
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, AmqpError> {
        HandlerRegistry::build(&self.registrations, self.sync, self.asynchronous)
    }
}
