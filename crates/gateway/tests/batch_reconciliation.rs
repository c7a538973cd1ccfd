//! Batch writes and reads through a [`Gateway`], with the in-memory backend
//! scripted to leave part of each call unprocessed.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use docstore_gateway::{
    BackendError, CallContext, DeleteGroup, ErrorCode, ErrorKind, GetGroup, MemoryOperation, PutGroup,
    RawItems, RetryOptions, SearchKey, TableRef, assert_error_kind,
    testutil::{AUDIT_TABLE, Order, make_orders, memory_client, order_key, populated_gateway, test_gateway},
};

fn orders_group(customer: &str, count: usize) -> PutGroup {
    PutGroup::from_values(TableRef::gateway_default(), &make_orders(customer, count))
        .expect("marshal orders")
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unprocessed_writes_are_redriven() {
    let client = Arc::new(memory_client());
    client.leave_unprocessed(4);
    let gateway = test_gateway(Arc::clone(&client), 4);

    let outcome = gateway
        .batch_write_items(&CallContext::new(), vec![orders_group("c", 10)], vec![])
        .await
        .expect("batch write");

    assert!(outcome.is_success());
    assert_eq!(outcome.requested(), 10);
    assert_eq!(outcome.success_count(), 10);
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(client.item_count("orders"), 10);
    assert_eq!(client.calls(MemoryOperation::BatchWriteItem), 2);
    assert_eq!(gateway.metrics().snapshot().batch_redrive_count, 1);
}

#[tokio::test]
async fn persistent_leftover_is_a_reconciliation_error() {
    let client = Arc::new(memory_client());
    for _ in 0..5 {
        client.leave_unprocessed(2);
    }
    let gateway = test_gateway(Arc::clone(&client), 4);

    let outcome = gateway
        .batch_write_items(&CallContext::new(), vec![orders_group("c", 6)], vec![])
        .await
        .expect("first attempt succeeded");

    assert_eq!(outcome.attempts(), 5);
    assert_eq!(outcome.leftover_count(), 2);
    assert_eq!(outcome.success_count(), 4);
    let leftover = outcome.leftover().get("orders").expect("leftover recorded per table");
    assert_eq!(leftover.puts.len(), 2);
    assert_eq!(client.item_count("orders"), 4);
    assert_eq!(gateway.metrics().snapshot().batch_leftover_count, 2);

    let result = outcome.into_result();
    assert_error_kind!(result, ErrorKind::Reconciliation);
}

#[tokio::test]
async fn first_attempt_failure_is_returned_as_error() {
    let client = Arc::new(memory_client());
    client.inject_error(
        MemoryOperation::BatchWriteItem,
        BackendError::service(ErrorCode::InternalServerError, "boom"),
    );
    let gateway = test_gateway(Arc::clone(&client), 4);

    let result = gateway.batch_write_items(&CallContext::new(), vec![orders_group("c", 3)], vec![]).await;

    assert_error_kind!(result, ErrorKind::Backend(ErrorCode::InternalServerError));
    assert_eq!(client.item_count("orders"), 0);
}

#[tokio::test]
async fn with_retry_recovers_from_first_attempt_failure() {
    let client = Arc::new(memory_client());
    client.inject_error(
        MemoryOperation::BatchWriteItem,
        BackendError::service(ErrorCode::ProvisionedThroughputExceeded, "slow down"),
    );
    let gateway = test_gateway(Arc::clone(&client), 4);

    let outcome = gateway
        .batch_write_items_with_retry(
            &CallContext::new(),
            RetryOptions::new(2),
            vec![orders_group("c", 3)],
            vec![],
        )
        .await
        .expect("retry should recover")
        .expect("nothing to suppress");

    assert!(outcome.is_success());
    assert_eq!(client.item_count("orders"), 3);
    assert_eq!(gateway.metrics().snapshot().retry_count, 1);
}

#[tokio::test]
async fn oversized_write_is_rejected_before_sending() {
    let client = Arc::new(memory_client());
    let gateway = test_gateway(Arc::clone(&client), 4);

    let result = gateway.batch_write_items(&CallContext::new(), vec![orders_group("c", 26)], vec![]).await;

    assert_error_kind!(result, ErrorKind::Precondition);
    assert_eq!(client.calls(MemoryOperation::BatchWriteItem), 0);
}

#[tokio::test]
async fn batch_delete_removes_only_named_keys() {
    let (gateway, client) = populated_gateway("c", 5).await;

    let keys = (0..3).map(|idx| order_key("c", idx)).collect();
    let outcome = gateway
        .batch_delete_items(&CallContext::new(), TableRef::gateway_default(), keys)
        .await
        .expect("batch delete");

    assert!(outcome.is_success());
    assert_eq!(client.item_count("orders"), 2);
    let remaining: Option<Order> =
        gateway.get_item(&CallContext::new(), &order_key("c", 4), &[]).await.expect("get");
    assert!(remaining.is_some());
}

#[tokio::test]
async fn partition_only_override_drops_inherited_sort_key() {
    let client = Arc::new(memory_client());
    client.create_table("users", "id", None);
    let gateway = test_gateway(Arc::clone(&client), 4);
    let users = TableRef::named("users").with_key_names("id", None);

    let outcome = gateway
        .batch_delete_items(&CallContext::new(), users.clone(), vec![SearchKey::new("u1")])
        .await
        .expect("partition-only key is accepted");
    assert!(outcome.is_success());

    let result = gateway
        .batch_delete_items(&CallContext::new(), users, vec![SearchKey::with_sort("u1", "x")])
        .await;
    assert_error_kind!(result, ErrorKind::Precondition);
    assert_eq!(client.calls(MemoryOperation::BatchWriteItem), 1);
}

#[tokio::test]
async fn puts_and_deletes_share_one_request() {
    let (gateway, client) = populated_gateway("c", 2).await;

    let deletes = vec![DeleteGroup {
        table: TableRef::gateway_default(),
        keys: vec![order_key("c", 0)],
    }];
    let audit = PutGroup::from_values(TableRef::named(AUDIT_TABLE), &make_orders("audit", 2))
        .expect("marshal audit rows");
    let outcome = gateway
        .batch_write_items(&CallContext::new(), vec![audit], deletes)
        .await
        .expect("batch write");

    assert_eq!(outcome.requested(), 3);
    assert!(outcome.is_success());
    assert_eq!(client.item_count("orders"), 1);
    assert_eq!(client.item_count(AUDIT_TABLE), 2);
    assert_eq!(client.calls(MemoryOperation::BatchWriteItem), 1);
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_get_reads_across_tables() {
    let (gateway, _client) = populated_gateway("c", 3).await;
    let audit = PutGroup::from_values(TableRef::named(AUDIT_TABLE), &make_orders("audit", 2))
        .expect("marshal audit rows");
    gateway.batch_write_items(&CallContext::new(), vec![audit], vec![]).await.expect("seed audit");

    let mut orders: Vec<Order> = Vec::new();
    let mut audit_rows = RawItems::default();
    let outcome = {
        let mut groups = [
            GetGroup::new(
                TableRef::gateway_default(),
                vec![order_key("c", 0), order_key("c", 2), order_key("c", 7)],
                &mut orders,
            ),
            GetGroup::new(TableRef::named(AUDIT_TABLE), vec![order_key("audit", 1)], &mut audit_rows),
        ];
        gateway.batch_get_items(&CallContext::new(), &mut groups).await.expect("batch get")
    };

    assert_eq!(outcome.requested(), 4);
    assert_eq!(outcome.found(), 3);
    assert!(outcome.is_success());
    let mut ids: Vec<_> = orders.iter().map(|o| o.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, ["order#000000", "order#000002"]);
    assert_eq!(audit_rows.0.len(), 1);
}

#[tokio::test]
async fn unprocessed_keys_are_redriven() {
    let (gateway, client) = populated_gateway("c", 6).await;
    client.leave_unprocessed(3);

    let mut orders: Vec<Order> = Vec::new();
    let outcome = {
        let keys = (0..6).map(|idx| order_key("c", idx)).collect();
        let mut groups = [GetGroup::new(TableRef::gateway_default(), keys, &mut orders)];
        gateway.batch_get_items(&CallContext::new(), &mut groups).await.expect("batch get")
    };

    assert_eq!(outcome.attempts(), 2);
    assert_eq!(outcome.found(), 6);
    assert_eq!(orders.len(), 6);
    assert_eq!(client.calls(MemoryOperation::BatchGetItem), 2);
}

#[tokio::test]
async fn repeated_table_in_batch_get_is_rejected() {
    let (gateway, client) = populated_gateway("c", 2).await;

    let mut first: Vec<Order> = Vec::new();
    let mut second: Vec<Order> = Vec::new();
    let mut groups = [
        GetGroup::new(TableRef::gateway_default(), vec![order_key("c", 0)], &mut first),
        GetGroup::new(TableRef::named("orders"), vec![order_key("c", 1)], &mut second),
    ];
    let result = gateway.batch_get_items(&CallContext::new(), &mut groups).await;

    assert_error_kind!(result, ErrorKind::Precondition);
    assert_eq!(client.calls(MemoryOperation::BatchGetItem), 0);
}

#[tokio::test]
async fn batch_get_with_retry_delivers_once() {
    let (gateway, client) = populated_gateway("c", 3).await;
    client.inject_error(
        MemoryOperation::BatchGetItem,
        BackendError::service(ErrorCode::RequestLimitExceeded, "slow down"),
    );

    let mut orders: Vec<Order> = Vec::new();
    let outcome = {
        let keys = (0..3).map(|idx| order_key("c", idx)).collect();
        let mut groups = [GetGroup::new(TableRef::gateway_default(), keys, &mut orders)];
        gateway
            .batch_get_items_with_retry(&CallContext::new(), RetryOptions::new(2), &mut groups)
            .await
            .expect("retry should recover")
            .expect("nothing to suppress")
    };

    assert_eq!(outcome.found(), 3);
    assert_eq!(orders.len(), 3, "items from the failed attempt are not delivered twice");
}
