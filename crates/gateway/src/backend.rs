//! Backend client abstraction and selection.
//!
//! [`BackendClient`] is the boundary to the external storage clients: the
//! primary network client and the optional low-latency accelerator. Both
//! speak the same request/response types from [`types`](crate::types), so
//! the gateway can route any call to either.
//!
//! # Implementing a client
//!
//! Wrap the vendor SDK, translate its requests and responses to the types in
//! [`types`](crate::types), and map its errors to [`BackendError`] with the
//! matching [`ErrorCode`](crate::ErrorCode). Clients must not retry on their
//! own; retry policy belongs to the gateway.
//!
//! See [`MemoryClient`](crate::MemoryClient) for a reference implementation.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::BackendError,
    types::{
        BatchGetInput, BatchGetOutput, BatchWriteInput, BatchWriteOutput, DeleteItemInput,
        GetItemInput, Item, Page, PutItemInput, QueryInput, ScanInput, TransactGetInput,
        TransactGetOutput, TransactWriteInput, UpdateItemInput,
    },
};

/// A storage client reachable by the gateway.
///
/// Every method is one backend round trip. Dropping the returned future
/// cancels the call.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Short name used in logs (`"primary"`, `"accelerator"`, ...).
    fn name(&self) -> &str;

    /// Reads one item; `Ok(None)` when absent.
    async fn get_item(&self, input: GetItemInput) -> Result<Option<Item>, BackendError>;

    /// Writes one item.
    async fn put_item(&self, input: PutItemInput) -> Result<(), BackendError>;

    /// Updates one item, creating it if absent.
    async fn update_item(&self, input: UpdateItemInput) -> Result<(), BackendError>;

    /// Deletes one item. Deleting an absent item succeeds.
    async fn delete_item(&self, input: DeleteItemInput) -> Result<(), BackendError>;

    /// Reads one page of a key-condition query.
    async fn query(&self, input: QueryInput) -> Result<Page, BackendError>;

    /// Reads one page of a scan.
    async fn scan(&self, input: ScanInput) -> Result<Page, BackendError>;

    /// Reads up to 100 keys across tables; may leave some unprocessed.
    async fn batch_get_item(&self, input: BatchGetInput) -> Result<BatchGetOutput, BackendError>;

    /// Writes up to 25 puts/deletes across tables; may leave some unprocessed.
    async fn batch_write_item(
        &self,
        input: BatchWriteInput,
    ) -> Result<BatchWriteOutput, BackendError>;

    /// Reads up to 25 keys atomically.
    async fn transact_get_items(
        &self,
        input: TransactGetInput,
    ) -> Result<TransactGetOutput, BackendError>;

    /// Applies up to 25 writes atomically.
    async fn transact_write_items(&self, input: TransactWriteInput) -> Result<(), BackendError>;
}

/// The primary client, an optional accelerator, and the skip flag.
///
/// Gateways hold this behind a copy-on-read snapshot: reconnecting or
/// toggling the accelerator builds a new pair and never mutates one a call
/// is using.
#[derive(Clone)]
pub struct BackendPair {
    primary: Arc<dyn BackendClient>,
    accelerator: Option<Arc<dyn BackendClient>>,
    skip_accelerator: bool,
}

impl fmt::Debug for BackendPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPair")
            .field("primary", &self.primary.name())
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_owned()))
            .field("skip_accelerator", &self.skip_accelerator)
            .finish()
    }
}

impl BackendPair {
    /// A pair with only the primary client.
    #[must_use]
    pub fn new(primary: Arc<dyn BackendClient>) -> Self {
        Self { primary, accelerator: None, skip_accelerator: false }
    }

    /// Returns a copy with `accelerator` attached.
    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Arc<dyn BackendClient>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Returns a copy without an accelerator.
    #[must_use]
    pub fn without_accelerator(mut self) -> Self {
        self.accelerator = None;
        self
    }

    /// Returns a copy with the skip flag set to `skip`.
    #[must_use]
    pub fn with_skip_accelerator(mut self, skip: bool) -> Self {
        self.skip_accelerator = skip;
        self
    }

    /// The client that services the next call: the accelerator when one is
    /// attached and not skipped, otherwise the primary.
    #[must_use]
    pub fn select(&self) -> &Arc<dyn BackendClient> {
        match &self.accelerator {
            Some(accelerator) if !self.skip_accelerator => accelerator,
            _ => &self.primary,
        }
    }

    /// The primary client.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn BackendClient> {
        &self.primary
    }

    /// The accelerator client, if attached.
    #[must_use]
    pub fn accelerator(&self) -> Option<&Arc<dyn BackendClient>> {
        self.accelerator.as_ref()
    }

    /// Whether the accelerator is bypassed.
    #[must_use]
    pub fn skip_accelerator(&self) -> bool {
        self.skip_accelerator
    }
}
