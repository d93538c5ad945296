// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Dispatch Layer
//!
//! `AmqpError` covers configuration mistakes (unknown exchanges, missing
//! dead-letter exchanges, unregistered handlers) and transport failures
//! (connection, channel, declaration, publishing and acknowledgement).
//! `HandlerError` is what message handlers return; it never escapes the
//! consume loop.

use thiserror::Error;

/// Represents errors that can occur while setting up or operating the dispatch layer.
///
/// Configuration variants are raised before any transport call is made. Transport
/// variants wrap the failing operation's context; the underlying `lapin` error is
/// logged where it is converted.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error loading or converting the configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Connection-level failure reported by the transport after startup
    #[error("fatal connection error: {0}")]
    ConnectionFatal(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// The exchange is neither declared nor a dead-letter exchange of a declared one
    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    /// A delayed send targeted an exchange without a dead-letter exchange
    #[error("exchange `{0}` has no dead-letter exchange configured")]
    MissingDeadLetterExchange(String),

    /// A handler was supplied for a type that has no routing registration
    #[error("handler `{0}` has no routing key registration")]
    UnregisteredHandler(String),

    /// Empty exchange name or routing key on a publish
    #[error("invalid publish target: {0}")]
    InvalidPublishTarget(String),

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error republishing a failed message through its delay queue
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Error returned by message handlers.
///
/// Any variant counts as a handler failure for acknowledgement and retry purposes.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload was not valid UTF-8 text
    #[error("payload is not valid utf-8")]
    Decode(#[from] std::string::FromUtf8Error),

    /// The payload could not be deserialized as JSON
    #[error("failure to deserialize payload: {0}")]
    Deserialize(#[from] serde_json::Error),

    /// Handler-specific failure
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}
