// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Account sequence allocation for the vault.
//!
//! Reading the assigned sequences takes the chain's sequence lock in shared
//! mode. Attaching a freshly allocated sequence to a record takes it in
//! exclusive mode and re-reads them first, so two instances can never persist
//! the same sequence for different records.
//!
//! A reset or invalidated record gives its sequence back. The next sequence is
//! the lowest one at or above the on-chain account sequence that no record
//! holds, so such a gap is filled before the counter grows past the maximum.

use tracing::{debug, info};

use crate::error::{OracleError, OracleResult};
use crate::store::{LockGuard, SharedStore};
use crate::types::{sequence_resource, RecordId, RecordKind, Sequence, SigningUpdate};

#[derive(Clone, Debug)]
pub struct SequenceAllocator {
    store: SharedStore,
}

/// Lowest sequence `>= floor` missing from the ascending `held` list.
fn lowest_free(held: &[u64], floor: u64) -> u64 {
    let mut next = floor;
    for sequence in held.iter().copied().filter(|s| *s >= floor) {
        if sequence > next {
            break;
        }
        next = sequence + 1;
    }
    next
}

impl SequenceAllocator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn find_max_sequence(&self, chain_id: &str) -> OracleResult<Option<u64>> {
        let guard = LockGuard::shared(self.store.as_ref(), &sequence_resource(chain_id)).await?;
        let result = self.store.max_sequence(chain_id).await;
        guard.release().await;
        result
    }

    /// The next unused sequence, never below the on-chain account sequence.
    pub async fn next_sequence(&self, chain_id: &str, onchain_sequence: u64) -> OracleResult<u64> {
        let guard = LockGuard::shared(self.store.as_ref(), &sequence_resource(chain_id)).await?;
        let held = self
            .store
            .assigned_sequences(chain_id, onchain_sequence)
            .await;
        guard.release().await;
        let held = held?;
        let next = lowest_free(&held, onchain_sequence);
        debug!(
            "[SequenceAllocator {}] held {:?}, on-chain {}, next {}",
            chain_id, held, onchain_sequence, next
        );
        Ok(next)
    }

    /// Writes `update` with `sequence` attached, failing with
    /// [`OracleError::SequenceConflict`] if another record took the sequence
    /// since it was allocated.
    pub async fn persist_with_sequence(
        &self,
        chain_id: &str,
        kind: RecordKind,
        id: RecordId,
        sequence: u64,
        mut update: SigningUpdate,
    ) -> OracleResult<()> {
        let guard = LockGuard::exclusive(self.store.as_ref(), &sequence_resource(chain_id)).await?;
        let result = async {
            let held = self.store.assigned_sequences(chain_id, sequence).await?;
            if held.first() == Some(&sequence) {
                return Err(OracleError::SequenceConflict {
                    chain_id: chain_id.to_string(),
                    sequence,
                });
            }
            update.sequence = Some(Sequence::Assigned(sequence));
            self.store.update_record(kind, id, update).await?;
            info!(
                "[SequenceAllocator {}] Assigned sequence {} to {} {}",
                chain_id, sequence, kind, id
            );
            Ok(())
        }
        .await;
        guard.release().await;
        result
    }
}
