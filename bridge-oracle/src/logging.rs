// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TEST_LOGGING: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber, honoring `RUST_LOG` (default `info`).
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;
    Ok(())
}

/// Idempotent variant for tests, writing through the test harness.
pub fn init_for_testing() {
    TEST_LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .try_init();
    });
}
