// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod monitor;
pub mod signer;
