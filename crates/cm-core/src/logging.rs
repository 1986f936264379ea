/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Logging init. Mirrors the minimal `tracing` + `EnvFilter` setup used by
//! this workspace's other binaries: a configured default directive, with
//! `RUST_LOG` overriding it.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once from `main`, passing the
/// configured default directive (e.g. `"info"`); `RUST_LOG` still wins when
/// set, per `EnvFilter::from_env_lossy`.
pub fn init(default_directive: &str) {
    let default = default_directive
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder().with_default_directive(default).from_env_lossy();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}
