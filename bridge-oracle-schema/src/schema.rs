// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

diesel::table! {
    transactions (id) {
        id -> Int8,
        hash -> Text,
        chain_id -> Text,
        chain_domain -> Int8,
        chain_type -> Text,
        from_address -> Text,
        to_address -> Text,
        block_height -> Int8,
        confirmations -> Int8,
        status -> Text,
        refund_id -> Nullable<Int8>,
        message_ids -> Array<Int8>,
        created_at_ms -> Int8,
        updated_at_ms -> Int8,
    }
}

diesel::table! {
    messages (id) {
        id -> Int8,
        origin_transaction_id -> Int8,
        origin_transaction_hash -> Text,
        message_id -> Text,
        chain_id -> Text,
        chain_domain -> Int8,
        chain_type -> Text,
        content -> Jsonb,
        transaction_body -> Text,
        signatures -> Jsonb,
        sequence -> Nullable<Int8>,
        status -> Text,
        transaction_id -> Nullable<Int8>,
        transaction_hash -> Nullable<Text>,
        created_at_ms -> Int8,
        updated_at_ms -> Int8,
    }
}

diesel::table! {
    refunds (id) {
        id -> Int8,
        origin_transaction_id -> Int8,
        origin_transaction_hash -> Text,
        recipient_address -> Text,
        amount -> Text,
        chain_id -> Text,
        chain_domain -> Int8,
        transaction_body -> Text,
        signatures -> Jsonb,
        sequence -> Nullable<Int8>,
        status -> Text,
        transaction_id -> Nullable<Int8>,
        transaction_hash -> Nullable<Text>,
        created_at_ms -> Int8,
        updated_at_ms -> Int8,
    }
}

diesel::table! {
    locks (lock_id) {
        lock_id -> Text,
        resource_id -> Text,
        exclusive -> Bool,
        expires_at_ms -> Int8,
    }
}

diesel::table! {
    progress_store (task_name) {
        task_name -> Text,
        block_number -> Int8,
        target_block -> Int8,
        timestamp -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    transactions,
    messages,
    refunds,
    locks,
    progress_store,
);
