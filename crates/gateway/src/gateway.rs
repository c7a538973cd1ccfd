//! The public operation surface.
//!
//! [`Gateway`] binds a table (and its key names) to a snapshot of backend
//! clients and an injected [`AdmissionController`]. Every operation:
//!
//! 1. builds its request, failing fast with a precondition error,
//! 2. takes the current [`BackendPair`] snapshot and selects a client,
//! 3. runs the backend call inside an admission slot,
//! 4. classifies any backend error with an operation prefix.
//!
//! Each operation has a `*_with_retry` counterpart that wraps steps 2-4 in
//! [`retry`](crate::retry::retry). Timeout windows follow the operation class:
//!
//! | Class | Operations |
//! |-------|------------|
//! | [`Point`](OperationClass::Point) | `put_item`, `put_item_if_absent`, `get_item`, `delete_item` |
//! | [`Extended`](OperationClass::Extended) | updates, queries, scans, batches, transactions |
//!
//! Paginated reads take one admission slot and one timeout window per page,
//! so a long scan neither pins a slot between pages nor runs out of time
//! because of its length. Only the caller's context bounds the whole read;
//! when it is cancelled or its deadline passes, the pages already read are
//! kept.
//! Batch and transaction calls hold one slot for the whole call, re-drives
//! included.
//!
//! # Retry results
//!
//! Reads with retry return `Ok(None)` when the final error was suppressed
//! (see [`SuppressionPolicy`](crate::SuppressionPolicy)); for
//! [`get_item_with_retry`](Gateway::get_item_with_retry) that is
//! indistinguishable from an absent item. Writes with retry return `Ok(())`
//! in both cases.
//!
//! Batch calls report failures after the first attempt inside their outcome,
//! so only a failed first attempt is retried by `*_with_retry`.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    admission::AdmissionController,
    backend::{BackendClient, BackendPair},
    batch::{self, BatchGetOutcome, BatchWriteOutcome, DeleteGroup, FetchedItems, GetGroup, PutGroup},
    classify::classify_result,
    codec,
    config::GatewayConfig,
    context::CallContext,
    error::{ClassifiedError, GatewayResult},
    metrics::Metrics,
    pagination::{self, Accumulated, PageCursors},
    retry::{OperationClass, RetryBudget, RetryOptions, retry},
    transaction::{self, GetPlan, TransactGetGroup, TransactGetOutcome, TransactionWrite},
    types::{
        AttributeValue, BatchGetInput, BatchWriteInput, ConsumedCapacity, DeleteItemInput,
        ExpressionNames, ExpressionValues, GetItemInput, Item, Key, KeyNames, Page, PutItemInput,
        QueryInput, ScanInput, SearchKey, TableRef, TransactGetOutput, TransactWriteInput,
        UpdateItemInput,
    },
};

/// An update of one item on the gateway's table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    /// Item to update.
    pub key: SearchKey,
    /// `SET` / `REMOVE` clauses to apply.
    pub update_expression: String,
    /// Condition the item must satisfy; `None` updates unconditionally.
    pub condition_expression: Option<String>,
    /// `#name` placeholders used by either expression.
    pub expression_attribute_names: ExpressionNames,
    /// `:value` placeholders used by either expression.
    pub expression_attribute_values: ExpressionValues,
}

impl ItemUpdate {
    /// An unconditional update of `key`.
    pub fn new(key: SearchKey, update_expression: impl Into<String>) -> Self {
        Self { key, update_expression: update_expression.into(), ..Self::default() }
    }

    /// Returns this update guarded by `condition`.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition_expression = Some(condition.into());
        self
    }

    /// Binds the `#name` placeholder to `attribute`.
    #[must_use]
    pub fn name(mut self, placeholder: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.expression_attribute_names.insert(placeholder.into(), attribute.into());
        self
    }

    /// Binds the `:value` placeholder to `value`.
    #[must_use]
    pub fn value(mut self, placeholder: impl Into<String>, value: AttributeValue) -> Self {
        self.expression_attribute_values.insert(placeholder.into(), value);
        self
    }
}

/// Decoded result of a query or scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutput<T> {
    /// Items of every page read, in page order.
    pub items: Vec<T>,
    /// Items returned, summed across pages.
    pub count: u64,
    /// Items evaluated before filtering, summed across pages.
    pub scanned_count: u64,
    /// Cursor to resume from; `None` once the backend has no more pages.
    pub next_cursor: Option<Key>,
    /// Capacity merged across pages, when the backend reported any.
    pub consumed_capacity: Option<ConsumedCapacity>,
    /// Pages read.
    pub pages: u32,
    /// Set when the caller's context was cancelled or reached its deadline
    /// before the read finished. The fields above hold what was read until
    /// then.
    pub interrupted: Option<ClassifiedError>,
}

impl<T: DeserializeOwned> ReadOutput<T> {
    fn decode(acc: Accumulated, operation: &str) -> GatewayResult<Self> {
        let next_cursor = acc.next_cursor().cloned();
        let items = codec::from_items(acc.items).map_err(|e| e.with_prefix(operation))?;
        Ok(Self {
            items,
            count: acc.count,
            scanned_count: acc.scanned_count,
            next_cursor,
            consumed_capacity: acc.consumed_capacity,
            pages: acc.pages,
            interrupted: acc.interrupted,
        })
    }
}

/// A query or scan, positioned at a cursor.
#[derive(Debug, Clone)]
enum PagedRead {
    Query(QueryInput),
    Scan(ScanInput),
}

impl PagedRead {
    fn name(&self) -> &'static str {
        match self {
            Self::Query(_) => "Query",
            Self::Scan(_) => "Scan",
        }
    }

    fn start(&self) -> Option<Key> {
        match self {
            Self::Query(input) => input.exclusive_start_key.clone(),
            Self::Scan(input) => input.exclusive_start_key.clone(),
        }
    }

    fn at(&self, cursor: Option<Key>) -> Self {
        let mut read = self.clone();
        match &mut read {
            Self::Query(input) => input.exclusive_start_key = cursor,
            Self::Scan(input) => input.exclusive_start_key = cursor,
        }
        read
    }

    async fn fetch(self, client: &dyn BackendClient) -> GatewayResult<Page> {
        match self {
            Self::Query(input) => classify_result(client.query(input).await, Some("Query")),
            Self::Scan(input) => classify_result(client.scan(input).await, Some("Scan")),
        }
    }
}

fn window(ctx: &CallContext, class: OperationClass) -> CallContext {
    ctx.with_timeout(class.window_bounds().0)
}

fn placeholders(prefix: &str, attributes: &[&str]) -> (String, ExpressionNames) {
    let names: ExpressionNames = attributes
        .iter()
        .enumerate()
        .map(|(i, attribute)| (format!("#{prefix}{i}"), (*attribute).to_owned()))
        .collect();
    let expression = names.keys().cloned().collect::<Vec<_>>().join(", ");
    (expression, names)
}

/// Document-store gateway over one table.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use docstore_gateway::{
///     AdmissionController, BackendPair, CallContext, Gateway, GatewayConfig, MemoryClient,
///     Metrics, SearchKey,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     #[serde(rename = "PK")]
///     id: String,
///     name: String,
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = GatewayConfig::builder().region("local").table_name("users").build()?;
/// let admission = Arc::new(AdmissionController::with_capacity(
///     config.admission_capacity(),
///     Metrics::new(),
/// )?);
/// let client = Arc::new(MemoryClient::new().with_table("users", "PK", None));
/// let gateway = Gateway::new(config, BackendPair::new(client), admission);
///
/// let ctx = CallContext::new();
/// gateway.put_item(&ctx, &User { id: "u1".into(), name: "Ada".into() }).await?;
/// let user: Option<User> = gateway.get_item(&ctx, &SearchKey::new("u1"), &[]).await?;
/// assert!(user.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    defaults: KeyNames,
    backends: RwLock<Option<Arc<BackendPair>>>,
    admission: Arc<AdmissionController>,
    metrics: Metrics,
}

impl Gateway {
    /// Creates a gateway for `config`'s table over `backends`.
    ///
    /// The configured skip-accelerator flag is applied on top of the pair's
    /// own. Counters are shared with `admission`.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        backends: BackendPair,
        admission: Arc<AdmissionController>,
    ) -> Self {
        let defaults = KeyNames {
            table_name: config.table_name().to_owned(),
            pk_name: config.pk_name().to_owned(),
            sk_name: config.sk_name().map(str::to_owned),
        };
        let skip = backends.skip_accelerator() || config.skip_accelerator();
        let backends = backends.with_skip_accelerator(skip);
        let metrics = admission.metrics().clone();
        Self {
            config,
            defaults,
            backends: RwLock::new(Some(Arc::new(backends))),
            admission,
            metrics,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the table and key names requests default to.
    #[must_use]
    pub fn key_names(&self) -> &KeyNames {
        &self.defaults
    }

    /// Returns the shared counters.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Returns the admission controller.
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    // ---- backend management ----

    /// The current backend snapshot.
    ///
    /// # Errors
    ///
    /// Returns an object-nil error after [`disconnect`](Self::disconnect).
    pub fn backends(&self) -> GatewayResult<Arc<BackendPair>> {
        self.backends.read().clone().ok_or_else(|| ClassifiedError::object_nil("Gateway"))
    }

    /// Whether backends are attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.backends.read().is_some()
    }

    /// Replaces the primary client, keeping the accelerator and skip flag.
    ///
    /// Also reattaches a disconnected gateway. Calls already running keep
    /// the snapshot they started with.
    pub fn reconnect(&self, primary: Arc<dyn BackendClient>) {
        let mut slot = self.backends.write();
        let next = match slot.as_deref() {
            Some(current) => {
                let pair = BackendPair::new(primary).with_skip_accelerator(current.skip_accelerator());
                match current.accelerator() {
                    Some(accelerator) => pair.with_accelerator(Arc::clone(accelerator)),
                    None => pair,
                }
            },
            None => BackendPair::new(primary).with_skip_accelerator(self.config.skip_accelerator()),
        };
        tracing::info!(backends = ?next, "gateway backends reconnected");
        *slot = Some(Arc::new(next));
    }

    /// Attaches `accelerator`; it services calls unless skipped.
    ///
    /// # Errors
    ///
    /// Returns an object-nil error after [`disconnect`](Self::disconnect).
    pub fn enable_accelerator(&self, accelerator: Arc<dyn BackendClient>) -> GatewayResult<()> {
        self.swap_backends(|pair| pair.with_accelerator(accelerator))
    }

    /// Detaches the accelerator; calls go to the primary.
    ///
    /// # Errors
    ///
    /// Returns an object-nil error after [`disconnect`](Self::disconnect).
    pub fn disable_accelerator(&self) -> GatewayResult<()> {
        self.swap_backends(BackendPair::without_accelerator)
    }

    /// Sets whether an attached accelerator is bypassed.
    ///
    /// # Errors
    ///
    /// Returns an object-nil error after [`disconnect`](Self::disconnect).
    pub fn set_skip_accelerator(&self, skip: bool) -> GatewayResult<()> {
        self.swap_backends(|pair| pair.with_skip_accelerator(skip))
    }

    /// Detaches all backends. Later calls fail with an object-nil error
    /// until [`reconnect`](Self::reconnect). Returns whether backends were
    /// attached.
    pub fn disconnect(&self) -> bool {
        let was_connected = self.backends.write().take().is_some();
        if was_connected {
            tracing::info!(table = %self.defaults.table_name, "gateway backends disconnected");
        }
        was_connected
    }

    fn swap_backends(&self, change: impl FnOnce(BackendPair) -> BackendPair) -> GatewayResult<()> {
        let mut slot = self.backends.write();
        let current =
            slot.as_deref().cloned().ok_or_else(|| ClassifiedError::object_nil("Gateway"))?;
        let next = change(current);
        tracing::debug!(backends = ?next, "gateway backends updated");
        *slot = Some(Arc::new(next));
        Ok(())
    }

    fn client(&self) -> GatewayResult<Arc<dyn BackendClient>> {
        let pair = self.backends()?;
        Ok(Arc::clone(pair.select()))
    }

    // ---- plumbing ----

    async fn admitted<T, F, Fut>(&self, ctx: &CallContext, call: F) -> GatewayResult<T>
    where
        F: FnOnce(Arc<dyn BackendClient>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let client = self.client()?;
        self.admission.execute(ctx, call(client)).await
    }

    fn budget(&self, class: OperationClass, options: RetryOptions) -> RetryBudget {
        RetryBudget::for_options(class, options, self.config.retry())
    }

    async fn retrying<T, F, Fut>(
        &self,
        ctx: &CallContext,
        class: OperationClass,
        options: RetryOptions,
        operation: &str,
        attempt: F,
    ) -> GatewayResult<Option<T>>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let budget = self.budget(class, options);
        retry(ctx, &budget, self.config.retry(), Some(&self.metrics), operation, attempt).await
    }

    fn key(&self, key: &SearchKey, operation: &str) -> GatewayResult<Key> {
        self.defaults.key_for(key).map_err(|e| e.with_prefix(operation))
    }

    // ---- put ----

    fn put_input<T: Serialize + ?Sized>(&self, value: &T) -> GatewayResult<PutItemInput> {
        let item = codec::to_item(value).map_err(|e| e.with_prefix("PutItem"))?;
        self.check_item_key(&item, "PutItem")?;
        Ok(PutItemInput { table_name: self.defaults.table_name.clone(), item, ..Default::default() })
    }

    fn check_item_key(&self, item: &Item, operation: &str) -> GatewayResult<()> {
        if item.contains_key(&self.defaults.pk_name) {
            return Ok(());
        }
        Err(ClassifiedError::precondition(format!(
            "{operation} item has no partition key attribute {}",
            self.defaults.pk_name
        )))
    }

    async fn put_once(&self, ctx: CallContext, input: PutItemInput) -> GatewayResult<()> {
        self.admitted(&ctx, |client| async move {
            classify_result(client.put_item(input).await, Some("PutItem"))
        })
        .await
    }

    /// Writes `value` as an item, replacing any item with the same key.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `value` is not a struct or map, a
    /// precondition error if it lacks the partition key attribute, or the
    /// classified backend error.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name))]
    pub async fn put_item<T: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        value: &T,
    ) -> GatewayResult<()> {
        let input = self.put_input(value)?;
        self.put_once(window(ctx, OperationClass::Point), input).await
    }

    /// [`put_item`](Self::put_item) retried per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn put_item_with_retry<T: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        value: &T,
    ) -> GatewayResult<()> {
        let input = self.put_input(value)?;
        self.retrying(ctx, OperationClass::Point, options, "PutItem", |attempt| {
            self.put_once(attempt, input.clone())
        })
        .await?;
        Ok(())
    }

    /// Writes `value` only if no item with its partition key exists.
    ///
    /// # Errors
    ///
    /// An existing item surfaces as a `ConditionalCheckFailed` backend error;
    /// see [`put_item`](Self::put_item) for the rest.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name))]
    pub async fn put_item_if_absent<T: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        value: &T,
    ) -> GatewayResult<()> {
        let mut input = self.put_input(value)?;
        input.condition_expression = Some("attribute_not_exists(#pk)".to_owned());
        input.expression_attribute_names.insert("#pk".to_owned(), self.defaults.pk_name.clone());
        self.put_once(window(ctx, OperationClass::Point), input).await
    }

    // ---- get ----

    fn get_input(&self, key: &SearchKey, projection: &[&str]) -> GatewayResult<GetItemInput> {
        let key = self.key(key, "(GetItem)")?;
        let (projection_expression, expression_attribute_names) = if projection.is_empty() {
            (None, ExpressionNames::new())
        } else {
            let (expression, names) = placeholders("p", projection);
            (Some(expression), names)
        };
        Ok(GetItemInput {
            table_name: self.defaults.table_name.clone(),
            key,
            projection_expression,
            expression_attribute_names,
            consistent_read: false,
        })
    }

    async fn get_once(&self, ctx: CallContext, input: GetItemInput) -> GatewayResult<Option<Item>> {
        self.admitted(&ctx, |client| async move {
            classify_result(client.get_item(input).await, Some("GetItem"))
        })
        .await
    }

    fn decode_item<T: DeserializeOwned>(item: Option<Item>) -> GatewayResult<Option<T>> {
        item.map(|item| codec::from_item(item).map_err(|e| e.with_prefix("GetItem"))).transpose()
    }

    /// Reads the item at `key`, keeping only the `projection` attributes when
    /// any are named. `Ok(None)` when no item exists.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for a malformed key, the classified
    /// backend error, or a serialization error if the item does not fit `T`.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name))]
    pub async fn get_item<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        key: &SearchKey,
        projection: &[&str],
    ) -> GatewayResult<Option<T>> {
        let input = self.get_input(key, projection)?;
        let item = self.get_once(window(ctx, OperationClass::Point), input).await?;
        Self::decode_item(item)
    }

    /// [`get_item`](Self::get_item) retried per `options`. A
    /// suppressed final error reads as an absent item.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn get_item_with_retry<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        key: &SearchKey,
        projection: &[&str],
    ) -> GatewayResult<Option<T>> {
        let input = self.get_input(key, projection)?;
        let item = self
            .retrying(ctx, OperationClass::Point, options, "GetItem", |attempt| {
                self.get_once(attempt, input.clone())
            })
            .await?
            .flatten();
        Self::decode_item(item)
    }

    // ---- update ----

    fn update_input(&self, update: ItemUpdate) -> GatewayResult<UpdateItemInput> {
        if update.update_expression.trim().is_empty() {
            return Err(ClassifiedError::precondition("(UpdateItem) update expression is required"));
        }
        Ok(UpdateItemInput {
            table_name: self.defaults.table_name.clone(),
            key: self.key(&update.key, "(UpdateItem)")?,
            update_expression: update.update_expression,
            condition_expression: update.condition_expression,
            expression_attribute_names: update.expression_attribute_names,
            expression_attribute_values: update.expression_attribute_values,
        })
    }

    async fn update_once(&self, ctx: CallContext, input: UpdateItemInput) -> GatewayResult<()> {
        self.admitted(&ctx, |client| async move {
            classify_result(client.update_item(input).await, Some("UpdateItem"))
        })
        .await
    }

    /// Applies `update`, creating the item if absent.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an empty expression or malformed
    /// key, or the classified backend error. A failed condition surfaces as
    /// a `ConditionalCheckFailed` backend error.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name))]
    pub async fn update_item(&self, ctx: &CallContext, update: ItemUpdate) -> GatewayResult<()> {
        let input = self.update_input(update)?;
        self.update_once(window(ctx, OperationClass::Extended), input).await
    }

    /// [`update_item`](Self::update_item) retried per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn update_item_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        update: ItemUpdate,
    ) -> GatewayResult<()> {
        let input = self.update_input(update)?;
        self.retrying(ctx, OperationClass::Extended, options, "UpdateItem", |attempt| {
            self.update_once(attempt, input.clone())
        })
        .await?;
        Ok(())
    }

    fn remove_input(&self, key: &SearchKey, attributes: &[&str]) -> GatewayResult<UpdateItemInput> {
        if attributes.is_empty() {
            return Err(ClassifiedError::precondition(
                "(RemoveItemAttribute) at least one attribute is required",
            ));
        }
        let (expression, names) = placeholders("r", attributes);
        let mut update = ItemUpdate::new(key.clone(), format!("REMOVE {expression}"));
        update.expression_attribute_names = names;
        self.update_input(update)
    }

    /// Removes `attributes` from the item at `key`.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when `attributes` is empty; see
    /// [`update_item`](Self::update_item).
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, attributes = attributes.len()))]
    pub async fn remove_item_attribute(
        &self,
        ctx: &CallContext,
        key: &SearchKey,
        attributes: &[&str],
    ) -> GatewayResult<()> {
        let input = self.remove_input(key, attributes)?;
        self.update_once(window(ctx, OperationClass::Extended), input).await
    }

    /// [`remove_item_attribute`](Self::remove_item_attribute) retried per
    /// `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn remove_item_attribute_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        key: &SearchKey,
        attributes: &[&str],
    ) -> GatewayResult<()> {
        let input = self.remove_input(key, attributes)?;
        self.retrying(ctx, OperationClass::Extended, options, "RemoveItemAttribute", |attempt| {
            self.update_once(attempt, input.clone())
        })
        .await?;
        Ok(())
    }

    // ---- delete ----

    fn delete_input(&self, key: &SearchKey) -> GatewayResult<DeleteItemInput> {
        Ok(DeleteItemInput {
            table_name: self.defaults.table_name.clone(),
            key: self.key(key, "(DeleteItem)")?,
            ..Default::default()
        })
    }

    async fn delete_once(&self, ctx: CallContext, input: DeleteItemInput) -> GatewayResult<()> {
        self.admitted(&ctx, |client| async move {
            classify_result(client.delete_item(input).await, Some("DeleteItem"))
        })
        .await
    }

    /// Deletes the item at `key`. Deleting an absent item succeeds.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for a malformed key or the classified
    /// backend error.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name))]
    pub async fn delete_item(&self, ctx: &CallContext, key: &SearchKey) -> GatewayResult<()> {
        let input = self.delete_input(key)?;
        self.delete_once(window(ctx, OperationClass::Point), input).await
    }

    /// [`delete_item`](Self::delete_item) retried per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn delete_item_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        key: &SearchKey,
    ) -> GatewayResult<()> {
        let input = self.delete_input(key)?;
        self.retrying(ctx, OperationClass::Point, options, "DeleteItem", |attempt| {
            self.delete_once(attempt, input.clone())
        })
        .await?;
        Ok(())
    }

    // ---- query / scan ----

    fn query_read(&self, mut input: QueryInput) -> GatewayResult<PagedRead> {
        if input.table_name.is_empty() {
            input.table_name.clone_from(&self.defaults.table_name);
        }
        if input.key_condition_expression.trim().is_empty() {
            return Err(ClassifiedError::precondition("(Query) key condition expression is required"));
        }
        Ok(PagedRead::Query(input))
    }

    fn scan_read(&self, mut input: ScanInput) -> PagedRead {
        if input.table_name.is_empty() {
            input.table_name.clone_from(&self.defaults.table_name);
        }
        PagedRead::Scan(input)
    }

    async fn fetch_page(
        &self,
        ctx: &CallContext,
        page_window: Duration,
        client: &Arc<dyn BackendClient>,
        read: PagedRead,
    ) -> GatewayResult<Page> {
        let client = Arc::clone(client);
        let page_ctx = ctx.with_timeout(page_window);
        self.admission.execute(&page_ctx, async move { read.fetch(client.as_ref()).await }).await
    }

    async fn read_once(
        &self,
        ctx: &CallContext,
        page_window: Duration,
        read: PagedRead,
        max_pages: Option<u32>,
    ) -> GatewayResult<Accumulated> {
        let client = self.client()?;
        pagination::accumulate(ctx, read.start(), max_pages, |cursor| {
            self.fetch_page(ctx, page_window, &client, read.at(cursor))
        })
        .await
    }

    async fn cursors_once(
        &self,
        ctx: &CallContext,
        read: PagedRead,
        max_pages: Option<u32>,
    ) -> GatewayResult<PageCursors> {
        let client = self.client()?;
        let page_window = OperationClass::Extended.window_bounds().0;
        pagination::page_cursors(ctx, max_pages, |cursor| {
            self.fetch_page(ctx, page_window, &client, read.at(cursor))
        })
        .await
    }

    async fn read_items<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        read: PagedRead,
        max_pages: Option<u32>,
    ) -> GatewayResult<ReadOutput<T>> {
        let operation = read.name();
        let page_window = OperationClass::Extended.window_bounds().0;
        let acc = self.read_once(ctx, page_window, read, max_pages).await?;
        ReadOutput::decode(acc, operation)
    }

    async fn read_items_with_retry<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        read: PagedRead,
        max_pages: Option<u32>,
    ) -> GatewayResult<Option<ReadOutput<T>>> {
        let operation = read.name();
        let page_window = self.budget(OperationClass::Extended, options).timeout_window();
        // The window bounds each page; only the caller's deadline bounds an attempt.
        let acc = self
            .retrying(ctx, OperationClass::Extended, options, operation, |_attempt| {
                self.read_once(ctx, page_window, read.clone(), max_pages)
            })
            .await?;
        acc.map(|acc| ReadOutput::decode(acc, operation)).transpose()
    }

    /// Runs a key-condition query, reading up to `max_pages` pages (`None`
    /// or `Some(0)` reads all of them) from the input's start cursor. An
    /// empty `table_name` targets the gateway's table.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for a missing key condition, the first
    /// classified backend error, or a serialization error if an item does not
    /// fit `T`. Cancellation or the end of `ctx`'s deadline is reported
    /// through [`ReadOutput::interrupted`]. A page that outlives its own
    /// window while `ctx` is still live fails the read with a timeout.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_pages = ?max_pages))]
    pub async fn query_items<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        input: QueryInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<ReadOutput<T>> {
        let read = self.query_read(input)?;
        self.read_items(ctx, read, max_pages).await
    }

    /// [`query_items`](Self::query_items) retried per `options`.
    /// Each attempt restarts from the input's start cursor, and the options'
    /// timeout window bounds each page rather than the whole attempt.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries, max_pages = ?max_pages))]
    pub async fn query_items_with_retry<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        input: QueryInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<Option<ReadOutput<T>>> {
        let read = self.query_read(input)?;
        self.read_items_with_retry(ctx, options, read, max_pages).await
    }

    /// Reads one page of a query starting at `cursor`. Pass the returned
    /// [`ReadOutput::next_cursor`] back in to continue.
    ///
    /// # Errors
    ///
    /// See [`query_items`](Self::query_items).
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, resumed = cursor.is_some()))]
    pub async fn query_items_paged<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        mut input: QueryInput,
        cursor: Option<Key>,
    ) -> GatewayResult<ReadOutput<T>> {
        input.exclusive_start_key = cursor;
        let read = self.query_read(input)?;
        self.read_items(ctx, read, Some(1)).await
    }

    /// Walks a query's pages from the start, returning the start cursor of
    /// each page (up to `max_pages`) without keeping items.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for a missing key condition or the first
    /// classified backend error.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_pages = ?max_pages))]
    pub async fn query_page_cursors(
        &self,
        ctx: &CallContext,
        input: QueryInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<PageCursors> {
        let read = self.query_read(input)?;
        self.cursors_once(ctx, read, max_pages).await
    }

    /// Scans the table (or index), reading up to `max_pages` pages.
    ///
    /// # Errors
    ///
    /// See [`query_items`](Self::query_items).
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_pages = ?max_pages))]
    pub async fn scan_items<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        input: ScanInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<ReadOutput<T>> {
        let read = self.scan_read(input);
        self.read_items(ctx, read, max_pages).await
    }

    /// [`scan_items`](Self::scan_items) retried per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries, max_pages = ?max_pages))]
    pub async fn scan_items_with_retry<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        input: ScanInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<Option<ReadOutput<T>>> {
        let read = self.scan_read(input);
        self.read_items_with_retry(ctx, options, read, max_pages).await
    }

    /// Reads one page of a scan starting at `cursor`.
    ///
    /// # Errors
    ///
    /// See [`query_items`](Self::query_items).
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, resumed = cursor.is_some()))]
    pub async fn scan_items_paged<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        mut input: ScanInput,
        cursor: Option<Key>,
    ) -> GatewayResult<ReadOutput<T>> {
        input.exclusive_start_key = cursor;
        let read = self.scan_read(input);
        self.read_items(ctx, read, Some(1)).await
    }

    /// Walks a scan's pages, returning the start cursor of each page.
    ///
    /// # Errors
    ///
    /// Returns the first classified backend error.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_pages = ?max_pages))]
    pub async fn scan_page_cursors(
        &self,
        ctx: &CallContext,
        input: ScanInput,
        max_pages: Option<u32>,
    ) -> GatewayResult<PageCursors> {
        let read = self.scan_read(input);
        self.cursors_once(ctx, read, max_pages).await
    }

    // ---- batch ----

    async fn batch_write_once(
        &self,
        ctx: CallContext,
        request: BatchWriteInput,
    ) -> GatewayResult<BatchWriteOutcome> {
        let drive_ctx = ctx.clone();
        self.admitted(&ctx, |client| async move {
            batch::drive_write(&drive_ctx, client.as_ref(), self.config.batch(), Some(&self.metrics), request)
                .await
        })
        .await
    }

    async fn batch_get_once(&self, ctx: CallContext, request: BatchGetInput) -> GatewayResult<FetchedItems> {
        let drive_ctx = ctx.clone();
        self.admitted(&ctx, |client| async move {
            batch::fetch_get(&drive_ctx, client.as_ref(), self.config.batch(), Some(&self.metrics), request)
                .await
        })
        .await
    }

    /// Writes `puts` and deletes `deletes` in one batch of at most 25
    /// entries, re-driving unprocessed entries with bounded backoff.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an empty or oversized batch, or the
    /// classified error of a failed first attempt. Leftover work and later
    /// failures are reported through [`BatchWriteOutcome::error`]; use
    /// [`BatchWriteOutcome::into_result`] for all-or-nothing handling.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, puts = puts.len(), deletes = deletes.len()))]
    pub async fn batch_write_items(
        &self,
        ctx: &CallContext,
        puts: Vec<PutGroup>,
        deletes: Vec<DeleteGroup>,
    ) -> GatewayResult<BatchWriteOutcome> {
        let request = batch::build_write_request(&self.defaults, puts, deletes)?;
        self.batch_write_once(window(ctx, OperationClass::Extended), request).await
    }

    /// [`batch_write_items`](Self::batch_write_items), retrying a failed
    /// first attempt per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn batch_write_items_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        puts: Vec<PutGroup>,
        deletes: Vec<DeleteGroup>,
    ) -> GatewayResult<Option<BatchWriteOutcome>> {
        let request = batch::build_write_request(&self.defaults, puts, deletes)?;
        self.retrying(ctx, OperationClass::Extended, options, "BatchWriteItem", |attempt| {
            self.batch_write_once(attempt, request.clone())
        })
        .await
    }

    /// Deletes `keys` from `table` in one batch.
    ///
    /// # Errors
    ///
    /// See [`batch_write_items`](Self::batch_write_items).
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, keys = keys.len()))]
    pub async fn batch_delete_items(
        &self,
        ctx: &CallContext,
        table: TableRef,
        keys: Vec<SearchKey>,
    ) -> GatewayResult<BatchWriteOutcome> {
        let request = batch::build_write_request(&self.defaults, vec![], vec![DeleteGroup { table, keys }])?;
        self.batch_write_once(window(ctx, OperationClass::Extended), request).await
    }

    /// [`batch_delete_items`](Self::batch_delete_items), retrying a failed
    /// first attempt per `options`.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn batch_delete_items_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        table: TableRef,
        keys: Vec<SearchKey>,
    ) -> GatewayResult<Option<BatchWriteOutcome>> {
        let request = batch::build_write_request(&self.defaults, vec![], vec![DeleteGroup { table, keys }])?;
        self.retrying(ctx, OperationClass::Extended, options, "BatchWriteItem", |attempt| {
            self.batch_write_once(attempt, request.clone())
        })
        .await
    }

    /// Reads the keys of every group in one batch of at most 100 keys and
    /// appends each returned item to its group's sink. Groups must target
    /// distinct tables.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for a repeated table or an empty or
    /// oversized batch, the classified error of a failed first attempt, or a
    /// serialization error if an item does not fit its sink. Unread keys are
    /// reported through [`BatchGetOutcome::error`].
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, groups = groups.len()))]
    pub async fn batch_get_items(
        &self,
        ctx: &CallContext,
        groups: &mut [GetGroup<'_>],
    ) -> GatewayResult<BatchGetOutcome> {
        let request = batch::build_get_request(&self.defaults, groups)?;
        let fetched = self.batch_get_once(window(ctx, OperationClass::Extended), request).await?;
        batch::deliver(&self.defaults, groups, fetched)
    }

    /// [`batch_get_items`](Self::batch_get_items), retrying a failed first
    /// attempt per `options`. Sinks are untouched when the final
    /// error was suppressed.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries, groups = groups.len()))]
    pub async fn batch_get_items_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        groups: &mut [GetGroup<'_>],
    ) -> GatewayResult<Option<BatchGetOutcome>> {
        let request = batch::build_get_request(&self.defaults, groups)?;
        let fetched = self
            .retrying(ctx, OperationClass::Extended, options, "BatchGetItem", |attempt| {
                self.batch_get_once(attempt, request.clone())
            })
            .await?;
        fetched.map(|fetched| batch::deliver(&self.defaults, groups, fetched)).transpose()
    }

    // ---- transactions ----

    async fn transact_write_once(&self, ctx: CallContext, input: TransactWriteInput) -> GatewayResult<()> {
        self.admitted(&ctx, |client| async move {
            transaction::execute_write(client.as_ref(), input).await
        })
        .await
    }

    async fn transact_get_once(&self, ctx: CallContext, plan: GetPlan) -> GatewayResult<TransactGetOutput> {
        self.admitted(&ctx, |client| async move {
            transaction::fetch_get(client.as_ref(), &plan).await
        })
        .await
    }

    /// Applies `write` atomically: deletes, then puts, then updates, at most
    /// 25 operations in total.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an empty or oversized transaction or
    /// a malformed key, or the classified backend error. A cancellation caused
    /// by a failed condition has
    /// [`conditional_check_failed`](ClassifiedError::conditional_check_failed)
    /// set.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, operations = write.operation_count()))]
    pub async fn transaction_write_items(
        &self,
        ctx: &CallContext,
        write: TransactionWrite,
    ) -> GatewayResult<()> {
        let input = transaction::build_write(&self.defaults, write)?;
        self.transact_write_once(window(ctx, OperationClass::Extended), input).await
    }

    /// [`transaction_write_items`](Self::transaction_write_items) retried per
    /// `options`. Set a client request token on `write` to make
    /// retries idempotent.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries))]
    pub async fn transaction_write_items_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        write: TransactionWrite,
    ) -> GatewayResult<()> {
        let input = transaction::build_write(&self.defaults, write)?;
        self.retrying(ctx, OperationClass::Extended, options, "TransactWriteItems", |attempt| {
            self.transact_write_once(attempt, input.clone())
        })
        .await?;
        Ok(())
    }

    /// Reads the keys of every group atomically and appends each found item
    /// to its group's sink. Groups may repeat tables and keys.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an empty or oversized read, the
    /// classified backend error, a reconciliation error if the response does
    /// not line up with the request, or a serialization error if an item does
    /// not fit its sink.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, groups = groups.len()))]
    pub async fn transaction_get_items(
        &self,
        ctx: &CallContext,
        groups: &mut [TransactGetGroup<'_>],
    ) -> GatewayResult<TransactGetOutcome> {
        let plan = transaction::build_get(&self.defaults, groups)?;
        let output = self.transact_get_once(window(ctx, OperationClass::Extended), plan.clone()).await?;
        transaction::deliver_get(&plan, groups, output)
    }

    /// [`transaction_get_items`](Self::transaction_get_items) retried per
    /// `options`. Sinks are untouched when the final error was
    /// suppressed.
    ///
    /// # Errors
    ///
    /// Returns the final classified error unless it was suppressed.
    #[tracing::instrument(skip_all, fields(table = %self.defaults.table_name, max_retries = options.max_retries, groups = groups.len()))]
    pub async fn transaction_get_items_with_retry(
        &self,
        ctx: &CallContext,
        options: RetryOptions,
        groups: &mut [TransactGetGroup<'_>],
    ) -> GatewayResult<Option<TransactGetOutcome>> {
        let plan = transaction::build_get(&self.defaults, groups)?;
        let output = self
            .retrying(ctx, OperationClass::Extended, options, "TransactGetItems", |attempt| {
                self.transact_get_once(attempt, plan.clone())
            })
            .await?;
        output.map(|output| transaction::deliver_get(&plan, groups, output)).transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{
        error::{BackendError, ErrorCode, ErrorKind},
        memory::{MemoryClient, MemoryOperation},
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(rename = "PK")]
        owner: String,
        #[serde(rename = "SK")]
        slug: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    }

    fn note(owner: &str, slug: &str) -> Note {
        Note { owner: owner.into(), slug: slug.into(), body: format!("{owner}/{slug}"), tag: None }
    }

    fn gateway_with(client: Arc<MemoryClient>) -> Gateway {
        let config = GatewayConfig::builder()
            .region("local")
            .table_name("notes")
            .sk_name("SK")
            .build()
            .unwrap();
        let admission = Arc::new(AdmissionController::with_capacity(4, Metrics::new()).unwrap());
        Gateway::new(config, BackendPair::new(client), admission)
    }

    fn memory() -> Arc<MemoryClient> {
        Arc::new(MemoryClient::new().with_table("notes", "PK", Some("SK")))
    }

    #[tokio::test]
    async fn test_put_then_get_with_projection() {
        let gateway = gateway_with(memory());
        let ctx = CallContext::new();
        gateway.put_item(&ctx, &note("ada", "n1")).await.unwrap();

        let full: Option<Note> =
            gateway.get_item(&ctx, &SearchKey::with_sort("ada", "n1"), &[]).await.unwrap();
        assert_eq!(full, Some(note("ada", "n1")));

        #[derive(Debug, Deserialize, PartialEq)]
        struct BodyOnly {
            body: String,
        }
        let projected: Option<BodyOnly> =
            gateway.get_item(&ctx, &SearchKey::with_sort("ada", "n1"), &["body"]).await.unwrap();
        assert_eq!(projected, Some(BodyOnly { body: "ada/n1".into() }));

        let absent: Option<Note> =
            gateway.get_item(&ctx, &SearchKey::with_sort("ada", "zz"), &[]).await.unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn test_put_without_partition_key_is_precondition() {
        let gateway = gateway_with(memory());
        let value = serde_json::json!({ "SK": "x", "body": "orphan" });
        let err = gateway.put_item(&CallContext::new(), &value).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_put_if_absent_surfaces_conflict() {
        let gateway = gateway_with(memory());
        let ctx = CallContext::new();
        gateway.put_item_if_absent(&ctx, &note("ada", "n1")).await.unwrap();
        let err = gateway.put_item_if_absent(&ctx, &note("ada", "n1")).await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::ConditionalCheckFailed));
        assert!(!err.allow_retry());
    }

    #[tokio::test]
    async fn test_update_and_remove_attribute() {
        let gateway = gateway_with(memory());
        let ctx = CallContext::new();
        let key = SearchKey::with_sort("ada", "n1");
        gateway.put_item(&ctx, &note("ada", "n1")).await.unwrap();

        let update = ItemUpdate::new(key.clone(), "SET tag = :t")
            .with_condition("attribute_exists(#pk)")
            .name("#pk", "PK")
            .value(":t", AttributeValue::S("draft".into()));
        gateway.update_item(&ctx, update).await.unwrap();
        let tagged: Note = gateway.get_item(&ctx, &key, &[]).await.unwrap().unwrap();
        assert_eq!(tagged.tag.as_deref(), Some("draft"));

        gateway.remove_item_attribute(&ctx, &key, &["tag"]).await.unwrap();
        let untagged: Note = gateway.get_item(&ctx, &key, &[]).await.unwrap().unwrap();
        assert!(untagged.tag.is_none());

        let err = gateway.remove_item_attribute(&ctx, &key, &[]).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_delete_item() {
        let gateway = gateway_with(memory());
        let ctx = CallContext::new();
        let key = SearchKey::with_sort("ada", "n1");
        gateway.put_item(&ctx, &note("ada", "n1")).await.unwrap();
        gateway.delete_item(&ctx, &key).await.unwrap();
        assert!(gateway.get_item::<Note>(&ctx, &key, &[]).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_throttling() {
        let client = memory();
        client.inject_error(
            MemoryOperation::PutItem,
            BackendError::service(ErrorCode::ProvisionedThroughputExceeded, "slow down"),
        );
        let gateway = gateway_with(Arc::clone(&client));

        gateway
            .put_item_with_retry(&CallContext::new(), RetryOptions::new(3), &note("ada", "n1"))
            .await
            .unwrap();

        assert_eq!(client.item_count("notes"), 1);
        let snapshot = gateway.metrics().snapshot();
        assert_eq!(snapshot.attempt_count, 2);
        assert_eq!(snapshot.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_suppresses_exhausted_throttling() {
        let client = memory();
        for _ in 0..3 {
            client.inject_error(
                MemoryOperation::GetItem,
                BackendError::service(ErrorCode::RequestLimitExceeded, "busy"),
            );
        }
        let gateway = gateway_with(Arc::clone(&client));

        let item: Option<Note> = gateway
            .get_item_with_retry(
                &CallContext::new(),
                RetryOptions::new(2),
                &SearchKey::with_sort("ada", "n1"),
                &[],
            )
            .await
            .unwrap();

        assert!(item.is_none());
        assert_eq!(client.calls(MemoryOperation::GetItem), 3);
        assert_eq!(gateway.metrics().snapshot().suppressed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_retry_window_outlasts_slow_backend() {
        let client = memory();
        client.set_latency(Duration::from_millis(5500));
        let gateway = gateway_with(Arc::clone(&client));
        let ctx = CallContext::new();

        let err = gateway
            .put_item_with_retry(&ctx, RetryOptions::new(1), &note("ada", "n1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Timeout);

        let widened = RetryOptions::new(1).with_timeout_window(Duration::from_secs(6));
        gateway.put_item_with_retry(&ctx, widened, &note("ada", "n2")).await.unwrap();

        assert_eq!(client.item_count("notes"), 1);
        assert_eq!(client.calls(MemoryOperation::PutItem), 2);
    }

    #[tokio::test]
    async fn test_query_paging_round_trip() {
        let client = Arc::new(MemoryClient::new().with_table("notes", "PK", Some("SK")).with_page_size(2));
        let gateway = gateway_with(client);
        let ctx = CallContext::new();
        for i in 0..5 {
            gateway.put_item(&ctx, &note("ada", &format!("n{i}"))).await.unwrap();
        }
        let input = QueryInput {
            key_condition_expression: "PK = :pk".into(),
            expression_attribute_values: ExpressionValues::from([(
                ":pk".to_owned(),
                AttributeValue::S("ada".into()),
            )]),
            ..Default::default()
        };

        let all: ReadOutput<Note> = gateway.query_items(&ctx, input.clone(), None).await.unwrap();
        assert_eq!(all.items.len(), 5);
        assert_eq!(all.pages, 3);
        assert!(all.next_cursor.is_none());

        let first: ReadOutput<Note> =
            gateway.query_items_paged(&ctx, input.clone(), None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second: ReadOutput<Note> =
            gateway.query_items_paged(&ctx, input.clone(), first.next_cursor).await.unwrap();
        assert_eq!(second.items[0].slug, "n2");

        let cursors = gateway.query_page_cursors(&ctx, input, None).await.unwrap();
        assert_eq!(cursors.cursors.len(), 3);
        assert!(cursors.cursors[0].is_none());
    }

    #[tokio::test]
    async fn test_query_requires_key_condition() {
        let gateway = gateway_with(memory());
        let err = gateway
            .query_items::<Note>(&CallContext::new(), QueryInput::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_disconnected_gateway_is_object_nil() {
        let gateway = gateway_with(memory());
        assert!(gateway.disconnect());
        assert!(!gateway.disconnect());

        let err = gateway.delete_item(&CallContext::new(), &SearchKey::new("ada")).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ObjectNil);
        assert_eq!(err.message(), "Gateway object nil");
        assert_eq!(gateway.disable_accelerator().unwrap_err().kind(), &ErrorKind::ObjectNil);

        gateway.reconnect(memory());
        assert!(gateway.is_connected());
        gateway.delete_item(&CallContext::new(), &SearchKey::new("ada")).await.unwrap();
    }

    #[tokio::test]
    async fn test_accelerator_routing() {
        let primary = memory();
        let accelerator = Arc::new(MemoryClient::named("accelerator").with_table("notes", "PK", Some("SK")));
        let gateway = gateway_with(Arc::clone(&primary));
        let ctx = CallContext::new();

        gateway.enable_accelerator(accelerator.clone()).unwrap();
        gateway.put_item(&ctx, &note("ada", "n1")).await.unwrap();
        assert_eq!(accelerator.item_count("notes"), 1);
        assert_eq!(primary.item_count("notes"), 0);

        gateway.set_skip_accelerator(true).unwrap();
        gateway.put_item(&ctx, &note("ada", "n2")).await.unwrap();
        assert_eq!(primary.item_count("notes"), 1);

        gateway.set_skip_accelerator(false).unwrap();
        gateway.disable_accelerator().unwrap();
        gateway.put_item(&ctx, &note("ada", "n3")).await.unwrap();
        assert_eq!(primary.item_count("notes"), 2);
        assert_eq!(accelerator.item_count("notes"), 1);
    }
}
