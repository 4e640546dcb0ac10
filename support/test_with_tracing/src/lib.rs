// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate for defining tests that have tracing output.
//!
//! Use `#[test_with_tracing::test]` (usually imported as `use
//! test_with_tracing::test;`) in place of `#[test]`. Ring processing code logs
//! guest-visible failures through `tracing`, and this makes those events show
//! up in the captured output of a failing test.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is not set: everything at debug, and the
/// per-descriptor events of the ring engine at trace.
fn default_targets() -> Targets {
    Targets::new()
        .with_default(LevelFilter::DEBUG)
        .with_target("virtio_ring", LevelFilter::TRACE)
}

#[doc(hidden)]
/// Initializes `tracing` for tests.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var.parse().unwrap_or_else(|err| {
                eprintln!("ignoring invalid RUST_LOG value {var:?}: {err}");
                default_targets()
            }),
            Err(_) => default_targets(),
        };
        // Another test harness may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false) // avoid polluting logs with escape sequences
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}
