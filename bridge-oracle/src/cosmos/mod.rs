// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod monitor;
pub mod multisig;
pub mod relayer;
pub mod signer;
pub mod tx;
pub mod validator;
