// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the exchange definition builder and the
//! `ExchangeCatalog`, the frozen set of exchanges declared at startup.
//! The catalogue answers the questions the publish and retry paths ask at
//! runtime: is this a known send target, and which dead-letter exchange
//! backs delayed delivery for it.

use crate::{errors::AmqpError, queue::QueueDefinition};
use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
};

/// Exchange type as written in configuration (`direct`, `fanout`, `topic`,
/// `headers`). Handler lookup is always an exact routing-key match, whatever
/// the broker-side routing of the exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unsupported exchange kind `{other}`"
            ))),
        }
    }
}

/// Definition of an exchange, the queues it owns and its failure policy.
///
/// `dead_letter_exchange` enables delayed delivery through this exchange;
/// `requeue_failed_messages` additionally lets the dispatcher retry a failed
/// delivery once through a delay queue.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) requeue_failed_messages: bool,
    pub(crate) queues: Vec<QueueDefinition>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a non-durable Direct exchange
    /// with no queues and no dead-letter exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Replaces the exchange declaration arguments.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single declaration argument.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Names the dead-letter exchange used to hold delayed messages for this exchange.
    pub fn dead_letter_exchange(mut self, name: &str) -> Self {
        self.dead_letter_exchange = Some(name.to_owned());
        self
    }

    /// Retries failed deliveries once through a delay queue.
    ///
    /// Only effective together with `dead_letter_exchange`.
    pub fn requeue_failed_messages(mut self) -> Self {
        self.requeue_failed_messages = true;
        self
    }

    /// Adds a queue owned by this exchange.
    pub fn queue(mut self, queue: QueueDefinition) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn dead_letter_exchange_name(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Whether a failed delivery from this exchange may be retried.
    pub fn retries_failures(&self) -> bool {
        self.requeue_failed_messages && self.dead_letter_exchange.is_some()
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.delete,
            internal: false,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// The exchanges declared at startup, frozen for the lifetime of the process.
///
/// Shared read-only between the topology installer, the publisher and the
/// dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ExchangeCatalog {
    exchanges: Vec<ExchangeDefinition>,
    index: HashMap<String, usize>,
    dead_letter_exchanges: Vec<String>,
}

impl ExchangeCatalog {
    /// Builds the catalogue, rejecting empty or duplicated exchange names.
    pub fn new(exchanges: Vec<ExchangeDefinition>) -> Result<ExchangeCatalog, AmqpError> {
        let mut index = HashMap::with_capacity(exchanges.len());
        let mut dead_letter_exchanges: Vec<String> = vec![];

        for (position, exch) in exchanges.iter().enumerate() {
            if exch.name.is_empty() {
                return Err(AmqpError::ConfigError(
                    "exchange name must not be empty".to_owned(),
                ));
            }

            if index.insert(exch.name.clone(), position).is_some() {
                return Err(AmqpError::ConfigError(format!(
                    "exchange `{}` declared twice",
                    exch.name
                )));
            }

            if let Some(dlx) = &exch.dead_letter_exchange {
                if !dead_letter_exchanges.contains(dlx) {
                    dead_letter_exchanges.push(dlx.clone());
                }
            }
        }

        Ok(ExchangeCatalog {
            exchanges,
            index,
            dead_letter_exchanges,
        })
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    /// Distinct dead-letter exchange names, in first-reference order.
    pub fn dead_letter_exchanges(&self) -> &[String] {
        &self.dead_letter_exchanges
    }

    pub fn get(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.index.get(name).map(|position| &self.exchanges[*position])
    }

    pub fn is_dead_letter_exchange(&self, name: &str) -> bool {
        self.dead_letter_exchanges.iter().any(|dlx| dlx == name)
    }

    /// A valid send target is a declared exchange or one of their dead-letter exchanges.
    pub fn is_known(&self, name: &str) -> bool {
        self.index.contains_key(name) || self.is_dead_letter_exchange(name)
    }

    /// Resolves the dead-letter exchange backing delayed sends to `exchange`.
    pub fn dead_letter_exchange_of(&self, exchange: &str) -> Result<&str, AmqpError> {
        let Some(def) = self.get(exchange) else {
            if self.is_dead_letter_exchange(exchange) {
                return Err(AmqpError::MissingDeadLetterExchange(exchange.to_owned()));
            }
            return Err(AmqpError::UnknownExchange(exchange.to_owned()));
        };

        def.dead_letter_exchange_name()
            .ok_or_else(|| AmqpError::MissingDeadLetterExchange(exchange.to_owned()))
    }

    /// Every queue owned by a declared exchange, in declaration order.
    pub fn queues(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.exchanges.iter().flat_map(|exch| exch.queues.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ExchangeCatalog {
        ExchangeCatalog::new(vec![
            ExchangeDefinition::new("orders")
                .durable()
                .dead_letter_exchange("orders.dlx")
                .queue(QueueDefinition::new("orders.created").routing_key("order.created")),
            ExchangeDefinition::new("payments").dead_letter_exchange("orders.dlx"),
            ExchangeDefinition::new("audit").fanout(),
        ])
        .unwrap()
    }

    #[test]
    fn dead_letter_exchanges_are_deduplicated() {
        assert_eq!(catalog().dead_letter_exchanges(), &["orders.dlx".to_owned()]);
    }

    #[test]
    fn dead_letter_exchanges_are_known_targets() {
        let catalog = catalog();

        assert!(catalog.is_known("orders"));
        assert!(catalog.is_known("orders.dlx"));
        assert!(!catalog.is_known("shipping"));
    }

    #[test]
    fn resolves_dead_letter_exchange_for_delayed_sends() {
        let catalog = catalog();

        assert_eq!(catalog.dead_letter_exchange_of("orders"), Ok("orders.dlx"));
        assert_eq!(
            catalog.dead_letter_exchange_of("audit"),
            Err(AmqpError::MissingDeadLetterExchange("audit".to_owned()))
        );
        assert_eq!(
            catalog.dead_letter_exchange_of("shipping"),
            Err(AmqpError::UnknownExchange("shipping".to_owned()))
        );
    }

    #[test]
    fn rejects_duplicated_exchanges() {
        let result = ExchangeCatalog::new(vec![
            ExchangeDefinition::new("orders"),
            ExchangeDefinition::new("orders"),
        ]);

        assert!(matches!(result, Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn requeue_requires_dead_letter_exchange() {
        assert!(!ExchangeDefinition::new("a").requeue_failed_messages().retries_failures());
        assert!(ExchangeDefinition::new("a")
            .dead_letter_exchange("a.dlx")
            .requeue_failed_messages()
            .retries_failures());
    }

    #[test]
    fn parses_exchange_kinds() {
        assert_eq!("Topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert!("x-delayed-message".parse::<ExchangeKind>().is_err());
    }
}
