// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! State transitions on messages and refunds shared by signers and relayers.

use tracing::{info, warn};

use crate::error::{OracleError, OracleResult};
use crate::metrics::OracleMetrics;
use crate::store::{LockGuard, OracleStore};
use crate::types::{MessageStatus, RecordId, RecordKind, Sequence, Signable, SigningUpdate};

/// Outcome label recorded in `records_processed`.
pub(crate) type Outcome = &'static str;

/// Marks a record `Invalid` under its lock. Only `Pending` and `Signed`
/// records can become invalid; anything else is left alone.
pub(crate) async fn mark_invalid(
    store: &dyn OracleStore,
    record: &impl Signable,
    reason: &OracleError,
) -> OracleResult<bool> {
    let guard = LockGuard::exclusive(store, &record.lock_resource()).await?;
    let result = async {
        let Some(current) = store.get_record(record.kind(), record.id()).await? else {
            return Ok(false);
        };
        if !matches!(current.status(), MessageStatus::Pending | MessageStatus::Signed) {
            return Ok(false);
        }
        // an invalid record is never broadcast, so its sequence is free again
        let update = SigningUpdate {
            status: Some(MessageStatus::Invalid),
            sequence: Some(Sequence::Unassigned),
            ..Default::default()
        };
        store.update_record(record.kind(), record.id(), update).await?;
        warn!(
            "{} {} marked invalid: {}",
            record.kind(),
            record.id(),
            reason
        );
        Ok(true)
    }
    .await;
    guard.release().await;
    result
}

/// Sends a record back to `Pending`, discarding signatures, body, sequence and
/// outbound transaction. The caller holds the record lock.
pub(crate) async fn reset_record(
    store: &dyn OracleStore,
    metrics: &OracleMetrics,
    kind: RecordKind,
    id: RecordId,
    chain_id: &str,
    reason: &str,
) -> OracleResult<()> {
    store.update_record(kind, id, SigningUpdate::reset()).await?;
    metrics
        .record_resets
        .with_label_values(&[chain_id, reason])
        .inc();
    info!("{} {} reset to pending ({})", kind, id, reason);
    Ok(())
}

/// Runs `f` while holding the record's exclusive lock.
pub(crate) async fn with_record_lock<T, F, Fut>(
    store: &dyn OracleStore,
    kind: RecordKind,
    id: RecordId,
    f: F,
) -> OracleResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = OracleResult<T>>,
{
    let resource = format!("{}/{}", kind.collection(), id);
    let guard = LockGuard::exclusive(store, &resource).await?;
    let result = f().await;
    guard.release().await;
    result
}
