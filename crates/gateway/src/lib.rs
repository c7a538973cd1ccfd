//! Resilience layer between application code and document-store clients.
//!
//! This crate wraps one or two interchangeable backend clients (a primary
//! network client and an optional low-latency accelerator) with admission
//! control, error classification, classification-driven retry, multi-page
//! accumulation, and reconciliation of batch and transactional calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Gateway                             │
//! │  put / get / update / delete / query / scan / batch / txn   │
//! │                 (+ *_with_retry variants)                   │
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │ retry         │ pagination       │ batch / transaction      │
//! │ (budget,      │ (page loop,      │ (unprocessed re-drive,   │
//! │  suppression) │  cursor clones)  │  positional slicing)     │
//! ├───────────────┴──────────────────┴──────────────────────────┤
//! │        AdmissionController / AdmissionGate (N slots)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │     classify: BackendError ──► ClassifiedError (flags)      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  BackendPair::select()       │                              │
//! │  primary  │  accelerator     │   MemoryClient (testing)     │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use docstore_gateway::{
//!     AdmissionController, BackendPair, CallContext, Gateway, GatewayConfig, MemoryClient,
//!     Metrics, RetryOptions, SearchKey,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Order {
//!     #[serde(rename = "PK")]
//!     customer: String,
//!     #[serde(rename = "SK")]
//!     id: String,
//!     total: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::builder()
//!         .region("local")
//!         .table_name("orders")
//!         .sk_name("SK")
//!         .build()?;
//!     let admission = Arc::new(AdmissionController::with_capacity(
//!         config.admission_capacity(),
//!         Metrics::new(),
//!     )?);
//!     let client = Arc::new(MemoryClient::new().with_table("orders", "PK", Some("SK")));
//!     let gateway = Gateway::new(config, BackendPair::new(client), admission);
//!
//!     let ctx = CallContext::new();
//!     let order = Order { customer: "c1".into(), id: "o1".into(), total: 30 };
//!     gateway.put_item_with_retry(&ctx, RetryOptions::new(3), &order).await?;
//!
//!     let read: Option<Order> =
//!         gateway.get_item(&ctx, &SearchKey::with_sort("c1", "o1"), &[]).await?;
//!     assert_eq!(read, Some(order));
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Every operation returns [`GatewayResult<T>`]. A backend failure is
//! classified once into a [`ClassifiedError`] whose flags drive retry,
//! backoff and suppression; each layer it crosses adds a message prefix.
//!
//! | Kind | Retried | Suppressible |
//! |------|---------|--------------|
//! | [`ObjectNil`](ErrorKind::ObjectNil), [`Precondition`](ErrorKind::Precondition) | no | no |
//! | [`Backend`](ErrorKind::Backend) conflicts | no | no |
//! | [`Backend`](ErrorKind::Backend) throughput / internal | yes | yes |
//! | [`Reconciliation`](ErrorKind::Reconciliation) | no | no |
//! | [`Panicked`](ErrorKind::Panicked), [`Shutdown`](ErrorKind::Shutdown) | no | no |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with gateway factories and sample records for
//!   integration tests.
//! - **`failpoints`**: Compiles the `retry-before-sleep` and `batch-before-redrive` fail points.

#![deny(unsafe_code)]

pub mod admission;
pub mod backend;
pub mod batch;
pub mod classify;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod pagination;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;
pub mod types;

// Re-export primary types at crate root for convenience
pub use admission::{AdmissionController, AdmissionGate};
pub use backend::{BackendClient, BackendPair};
pub use batch::{
    BatchGetOutcome, BatchWriteOutcome, DeleteGroup, GetGroup, PutGroup, RawItems, ResultSink,
    UnprocessedWrites,
};
pub use classify::{classify, classify_result};
pub use config::{BatchRetryConfig, GatewayConfig, HttpTransportConfig, RetryConfig, SuppressionPolicy};
pub use context::CallContext;
pub use error::{BackendError, ClassifiedError, ConfigError, ErrorCode, ErrorKind, GatewayResult};
pub use gateway::{Gateway, ItemUpdate, ReadOutput};
pub use memory::{MemoryClient, MemoryOperation};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pagination::PageCursors;
pub use retry::{OperationClass, RetryBudget, RetryOptions};
pub use transaction::{
    TransactDeleteGroup, TransactGetGroup, TransactGetOutcome, TransactPutGroup, TransactUpdate,
    TransactionWrite,
};
pub use types::{
    AttributeValue, ConsumedCapacity, DeleteItemInput, GetItemInput, Item, Key, KeyNames,
    PutItemInput, QueryInput, ScanInput, SearchKey, TableRef, UpdateItemInput,
};
