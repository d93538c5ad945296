// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber for the process.
///
/// `RUST_LOG` wins when set and valid, otherwise `default_level` (e.g.
/// `"info"` or `"rabbitmq_dispatch=debug"`) is used. Returns `false` when a
/// global subscriber was already installed, which leaves it untouched.
pub fn init_tracing(default_level: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
