//! Shared test utilities for gateway tests.
//!
//! Feature-gated behind `testutil` so none of it reaches production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! docstore-gateway = { path = "../gateway", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use docstore_gateway::testutil::{make_order, memory_client, test_gateway};
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    admission::AdmissionController,
    backend::BackendPair,
    config::{BatchRetryConfig, GatewayConfig, RetryConfig},
    gateway::Gateway,
    memory::MemoryClient,
    metrics::Metrics,
    types::SearchKey,
};

/// The table test gateways are bound to.
pub const TEST_TABLE: &str = "orders";

/// A second table with the fallback `PK`/`SK` key names.
pub const AUDIT_TABLE: &str = "audit";

/// Sample record stored in [`TEST_TABLE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "PK")]
    pub customer: String,
    #[serde(rename = "SK")]
    pub id: String,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Create a deterministic order for `customer`.
///
/// Ids are zero-padded (`"order#000042"`) so sort-key order matches `idx`.
#[must_use]
pub fn make_order(customer: &str, idx: usize) -> Order {
    Order {
        customer: customer.to_owned(),
        id: format!("order#{idx:06}"),
        total: (idx as u64 + 1) * 10,
        status: None,
    }
}

/// Create `count` orders for `customer`.
#[must_use]
pub fn make_orders(customer: &str, count: usize) -> Vec<Order> {
    (0..count).map(|idx| make_order(customer, idx)).collect()
}

/// The key of [`make_order`]`(customer, idx)`.
#[must_use]
pub fn order_key(customer: &str, idx: usize) -> SearchKey {
    SearchKey::with_sort(customer, format!("order#{idx:06}"))
}

/// A [`MemoryClient`] with [`TEST_TABLE`] and [`AUDIT_TABLE`] created.
#[must_use]
pub fn memory_client() -> MemoryClient {
    MemoryClient::new()
        .with_table(TEST_TABLE, "PK", Some("SK"))
        .with_table(AUDIT_TABLE, "PK", Some("SK"))
}

/// Configuration for [`TEST_TABLE`] with short retry and re-drive delays.
#[must_use]
pub fn test_config(capacity: usize) -> GatewayConfig {
    GatewayConfig::builder()
        .region("local")
        .table_name(TEST_TABLE)
        .sk_name("SK")
        .admission_capacity(capacity)
        .retry(
            RetryConfig::builder()
                .backoff_delay(Duration::from_millis(50))
                .immediate_delay(Duration::from_millis(10))
                .build()
                .expect("valid retry config"),
        )
        .batch(
            BatchRetryConfig::builder()
                .initial_backoff(Duration::from_millis(5))
                .max_backoff(Duration::from_millis(40))
                .build()
                .expect("valid batch config"),
        )
        .build()
        .expect("valid gateway config")
}

/// A gateway over `client` with an admission gate of `capacity` slots.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn test_gateway(client: Arc<MemoryClient>, capacity: usize) -> Gateway {
    let config = test_config(capacity);
    let admission = Arc::new(
        AdmissionController::with_capacity(config.admission_capacity(), Metrics::new())
            .expect("valid admission capacity"),
    );
    Gateway::new(config, BackendPair::new(client), admission)
}

/// A gateway whose table already holds `count` orders for `customer`.
///
/// # Panics
///
/// Panics if any put fails (should not happen with [`MemoryClient`]).
pub async fn populated_gateway(customer: &str, count: usize) -> (Gateway, Arc<MemoryClient>) {
    let client = Arc::new(memory_client());
    let gateway = test_gateway(Arc::clone(&client), 8);
    let ctx = crate::context::CallContext::new();
    for order in make_orders(customer, count) {
        gateway.put_item(&ctx, &order).await.expect("populate put failed");
    }
    (gateway, client)
}

/// Assert that a [`GatewayResult`](crate::GatewayResult) failed with the
/// given [`ErrorKind`](crate::ErrorKind) pattern.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use docstore_gateway::{ClassifiedError, ErrorKind, GatewayResult, assert_error_kind};
///
/// let result: GatewayResult<()> = Err(ClassifiedError::shutdown());
/// assert_error_kind!(result, ErrorKind::Shutdown);
/// ```
#[macro_export]
macro_rules! assert_error_kind {
    ($result:expr, $kind:pat) => {
        match &$result {
            Err(err) => assert!(
                matches!(err.kind(), $kind),
                "expected {}, got: {:?}",
                stringify!($kind),
                err,
            ),
            Ok(_) => panic!("expected {}, got Ok", stringify!($kind)),
        }
    };
}
