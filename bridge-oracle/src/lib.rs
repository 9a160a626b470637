// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod cosmos;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod ethereum;
pub mod logging;
pub mod metrics;
pub mod node;
pub(crate) mod records;
pub mod runner;
pub mod sequence;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
