//! Batch reads and writes with unprocessed-subset re-drive.
//!
//! The backend accepts at most 25 writes or 100 key reads per batch call and
//! may leave part of any batch unprocessed. The drivers here validate the
//! request groups, issue the call, and re-drive only the unprocessed subset
//! with capped exponential backoff until it is empty or the attempt budget
//! is spent:
//!
//! ```text
//! attempt 1 ──► unprocessed? ── no ──► done
//!                   │ yes
//!                   ▼
//!   sleep min(initial * 2^n, max) (cancellable)
//!                   │
//!                   ▼
//! attempt n+1 (unprocessed subset only) ──► ...
//! ```
//!
//! Work completed by earlier attempts is never discarded. Whatever is still
//! unprocessed when the budget runs out is returned as a structured leftover
//! together with a `Reconciliation` error, so the caller can persist or
//! replay it.
//!
//! # Result destinations
//!
//! Batch reads deliver items into caller-owned [`ResultSink`]s, one per group.
//! `Vec<T>` is a sink for any deserializable `T`; [`RawItems`] collects
//! undecoded items.

use std::collections::{BTreeMap, BTreeSet};

use fail::fail_point;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    backend::BackendClient,
    classify::classify_result,
    codec,
    config::BatchRetryConfig,
    context::CallContext,
    error::{ClassifiedError, GatewayResult},
    metrics::Metrics,
    types::{
        BatchGetInput, BatchWriteInput, ConsumedCapacity, Item, Key, KeyNames, KeysAndAttributes,
        SearchKey, TableRef, WriteRequest,
    },
};

/// Maximum writes per batch call.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Maximum keys per batch read.
pub const MAX_BATCH_GET_KEYS: usize = 100;

/// A destination for decoded result items.
pub trait ResultSink: Send {
    /// Decodes `item` and appends it.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `item` does not decode.
    fn push_item(&mut self, item: Item) -> GatewayResult<()>;

    /// Drops every item past the first `len`.
    fn truncate(&mut self, len: usize);

    /// Items held so far.
    fn len(&self) -> usize;

    /// Whether no items are held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: DeserializeOwned + Send> ResultSink for Vec<T> {
    fn push_item(&mut self, item: Item) -> GatewayResult<()> {
        self.push(codec::from_item(item)?);
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        Vec::truncate(self, len);
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// A sink keeping items undecoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItems(pub Vec<Item>);

impl ResultSink for RawItems {
    fn push_item(&mut self, item: Item) -> GatewayResult<()> {
        self.0.push(item);
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Items to put into one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutGroup {
    /// Target table and key-name overrides.
    pub table: TableRef,
    /// Marshaled items to write.
    pub items: Vec<Item>,
}

impl PutGroup {
    /// Marshals `values` into a group for `table`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if any value fails to marshal.
    pub fn from_values<T: Serialize>(table: TableRef, values: &[T]) -> GatewayResult<Self> {
        let items = codec::to_items(values).map_err(|e| e.with_prefix("(Marshal Put Items)"))?;
        Ok(Self { table, items })
    }
}

/// Keys to delete from one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteGroup {
    /// Target table and key-name overrides.
    pub table: TableRef,
    /// Keys to delete.
    pub keys: Vec<SearchKey>,
}

/// Keys to read from one table, and where to put the results.
pub struct GetGroup<'a> {
    /// Source table and key-name overrides. Each table may appear in one group only.
    pub table: TableRef,
    /// Keys to read.
    pub keys: Vec<SearchKey>,
    /// Attributes to return; `None` returns whole items.
    pub projection_expression: Option<String>,
    /// Requests a strongly consistent read.
    pub consistent_read: bool,
    /// Receives the decoded items of this group.
    pub sink: &'a mut dyn ResultSink,
}

impl<'a> GetGroup<'a> {
    /// A group reading `keys` from `table` into `sink`.
    pub fn new(table: TableRef, keys: Vec<SearchKey>, sink: &'a mut dyn ResultSink) -> Self {
        Self { table, keys, projection_expression: None, consistent_read: false, sink }
    }
}

/// Writes left unprocessed in one table after the attempt budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnprocessedWrites {
    /// Items never written.
    pub puts: Vec<Item>,
    /// Keys never deleted.
    pub deletes: Vec<Key>,
}

impl UnprocessedWrites {
    /// Total requests left.
    #[must_use]
    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }

    /// Whether nothing is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Outcome of a batch write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutcome {
    requested: usize,
    attempts: u32,
    leftover: BTreeMap<String, UnprocessedWrites>,
    consumed_capacity: Vec<ConsumedCapacity>,
    error: Option<ClassifiedError>,
}

impl BatchWriteOutcome {
    /// Writes requested.
    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Writes applied: requested minus those left unprocessed, never below
    /// zero.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.requested.saturating_sub(self.leftover_count())
    }

    /// Backend calls made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Unprocessed writes by table.
    #[must_use = "leftover writes were not applied and must be persisted or replayed"]
    pub fn leftover(&self) -> &BTreeMap<String, UnprocessedWrites> {
        &self.leftover
    }

    /// Number of unprocessed writes.
    #[must_use]
    pub fn leftover_count(&self) -> usize {
        self.leftover.values().map(UnprocessedWrites::len).sum()
    }

    /// Capacity reported by every attempt.
    #[must_use]
    pub fn consumed_capacity(&self) -> &[ConsumedCapacity] {
        &self.consumed_capacity
    }

    /// Why the leftover is non-empty, if it is.
    #[must_use]
    pub fn error(&self) -> Option<&ClassifiedError> {
        self.error.as_ref()
    }

    /// Whether every requested write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into an all-or-nothing result, dropping the leftover.
    ///
    /// # Errors
    ///
    /// Returns [`error`](Self::error) when set.
    pub fn into_result(self) -> GatewayResult<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Outcome of a batch read. Items were delivered into the groups' sinks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutcome {
    requested: usize,
    found: usize,
    attempts: u32,
    leftover: BTreeMap<String, Vec<Key>>,
    consumed_capacity: Vec<ConsumedCapacity>,
    error: Option<ClassifiedError>,
}

impl BatchGetOutcome {
    /// Keys requested.
    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Keys read (found or not): requested minus those left unprocessed,
    /// never below zero.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.requested.saturating_sub(self.leftover_count())
    }

    /// Items returned across all groups. Absent keys are not an error.
    #[must_use]
    pub fn found(&self) -> usize {
        self.found
    }

    /// Backend calls made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Unread keys by table.
    #[must_use]
    pub fn leftover(&self) -> &BTreeMap<String, Vec<Key>> {
        &self.leftover
    }

    /// Number of unread keys.
    #[must_use]
    pub fn leftover_count(&self) -> usize {
        self.leftover.values().map(Vec::len).sum()
    }

    /// Capacity reported by every attempt.
    #[must_use]
    pub fn consumed_capacity(&self) -> &[ConsumedCapacity] {
        &self.consumed_capacity
    }

    /// Why the leftover is non-empty, if it is.
    #[must_use]
    pub fn error(&self) -> Option<&ClassifiedError> {
        self.error.as_ref()
    }

    /// Whether every requested key was read.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into an all-or-nothing result.
    ///
    /// # Errors
    ///
    /// Returns [`error`](Self::error) when set.
    pub fn into_result(self) -> GatewayResult<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

fn check_total(total: usize, max: usize, what: &str) -> GatewayResult<()> {
    if total == 0 || total > max {
        return Err(ClassifiedError::precondition(format!(
            "({what}) request must contain between 1 and {max} entries, got {total}"
        )));
    }
    Ok(())
}

/// Flattens put and delete groups into one batch request.
///
/// # Errors
///
/// Returns a precondition error if the total is outside `1..=25` or a key is
/// malformed for its table.
pub fn build_write_request(
    defaults: &KeyNames,
    puts: Vec<PutGroup>,
    deletes: Vec<DeleteGroup>,
) -> GatewayResult<BatchWriteInput> {
    let total = puts.iter().map(|g| g.items.len()).sum::<usize>()
        + deletes.iter().map(|g| g.keys.len()).sum::<usize>();
    check_total(total, MAX_BATCH_WRITE_ITEMS, "BatchWriteItem")?;

    let mut request = BatchWriteInput::default();
    for group in puts {
        let names = group.table.resolve(defaults);
        request
            .request_items
            .entry(names.table_name)
            .or_default()
            .extend(group.items.into_iter().map(|item| WriteRequest::Put { item }));
    }
    for group in deletes {
        let names = group.table.resolve(defaults);
        let keys = group
            .keys
            .iter()
            .map(|key| names.key_for(key).map(|key| WriteRequest::Delete { key }))
            .collect::<GatewayResult<Vec<_>>>()
            .map_err(|e| e.with_prefix("(BatchWriteItem)"))?;
        request.request_items.entry(names.table_name).or_default().extend(keys);
    }
    Ok(request)
}

/// Builds the map-keyed batch read for `groups`, rejecting repeated tables.
///
/// # Errors
///
/// Returns a precondition error on a repeated table, a total outside
/// `1..=100`, or a malformed key.
pub fn build_get_request(defaults: &KeyNames, groups: &[GetGroup<'_>]) -> GatewayResult<BatchGetInput> {
    let total = groups.iter().map(|g| g.keys.len()).sum();
    check_total(total, MAX_BATCH_GET_KEYS, "BatchGetItem")?;

    let mut request = BatchGetInput::default();
    let mut seen = BTreeSet::new();
    for group in groups {
        let names = group.table.resolve(defaults);
        if !seen.insert(names.table_name.clone()) {
            return Err(ClassifiedError::precondition(format!(
                "(BatchGetItem) table {} appears in more than one group",
                names.table_name
            )));
        }
        let keys = group
            .keys
            .iter()
            .map(|key| names.key_for(key))
            .collect::<GatewayResult<Vec<_>>>()
            .map_err(|e| e.with_prefix("(BatchGetItem)"))?;
        request.request_items.insert(names.table_name, KeysAndAttributes {
            keys,
            projection_expression: group.projection_expression.clone(),
            expression_attribute_names: Default::default(),
            consistent_read: group.consistent_read,
        });
    }
    Ok(request)
}

fn write_count(request: &BatchWriteInput) -> usize {
    request.request_items.values().map(Vec::len).sum()
}

fn get_count(request: &BatchGetInput) -> usize {
    request.request_items.values().map(|r| r.keys.len()).sum()
}

fn before_redrive() -> GatewayResult<()> {
    fail_point!("batch-before-redrive", |_| {
        Err(ClassifiedError::cancelled("injected failure before batch re-drive"))
    });
    Ok(())
}

/// Backoff between attempts; ends the loop early when the caller's context
/// ends or the injected fail point fires.
async fn pause(
    ctx: &CallContext,
    config: &BatchRetryConfig,
    metrics: Option<&Metrics>,
    attempt: u32,
    what: &str,
) -> GatewayResult<()> {
    if let Some(m) = metrics {
        m.record_batch_redrive();
    }
    before_redrive()?;
    ctx.sleep(config.backoff_for(attempt - 1), what).await
}

/// Issues `request` and re-drives its unprocessed subset.
///
/// # Errors
///
/// Returns the classified error when the first attempt fails; nothing was
/// applied in that case. Failures on later attempts are reported through
/// [`BatchWriteOutcome::error`] with the leftover intact.
pub async fn drive_write(
    ctx: &CallContext,
    client: &dyn BackendClient,
    config: &BatchRetryConfig,
    metrics: Option<&Metrics>,
    request: BatchWriteInput,
) -> GatewayResult<BatchWriteOutcome> {
    let requested = write_count(&request);
    let mut outcome = BatchWriteOutcome { requested, ..Default::default() };
    let mut pending = request;

    loop {
        outcome.attempts += 1;
        match classify_result(client.batch_write_item(pending.clone()).await, Some("BatchWriteItem")) {
            Ok(response) => {
                outcome.consumed_capacity.extend(response.consumed_capacity);
                pending = BatchWriteInput { request_items: response.unprocessed_items };
            },
            Err(err) if outcome.attempts == 1 => return Err(err),
            Err(err) => {
                outcome.error = Some(err);
                break;
            },
        }

        let remaining = write_count(&pending);
        if remaining == 0 {
            break;
        }
        if outcome.attempts >= config.max_attempts() {
            break;
        }
        debug!(attempt = outcome.attempts, remaining, "re-driving unprocessed batch writes");
        if let Err(err) = pause(ctx, config, metrics, outcome.attempts, "BatchWriteItem").await {
            outcome.error = Some(err.with_prefix("(BatchWriteItem)"));
            break;
        }
    }

    for (table, requests) in pending.request_items {
        let entry: &mut UnprocessedWrites = outcome.leftover.entry(table).or_default();
        for request in requests {
            match request {
                WriteRequest::Put { item } => entry.puts.push(item),
                WriteRequest::Delete { key } => entry.deletes.push(key),
            }
        }
    }
    outcome.leftover.retain(|_, writes| !writes.is_empty());

    let leftover = outcome.leftover_count();
    if leftover > 0 {
        if let Some(m) = metrics {
            m.record_batch_leftover(leftover);
        }
        warn!(requested, leftover, attempts = outcome.attempts, "batch writes left unprocessed");
        if leftover > requested {
            outcome.error = Some(ClassifiedError::reconciliation(format!(
                "(BatchWriteItem) backend reported {leftover} unprocessed writes for {requested} requested"
            )));
        } else if outcome.error.is_none() {
            outcome.error = Some(ClassifiedError::reconciliation(format!(
                "(BatchWriteItem) {leftover} of {requested} writes unprocessed after {} attempts",
                outcome.attempts
            )));
        }
    }
    Ok(outcome)
}

/// Items read by [`fetch_get`], not yet delivered to any sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedItems {
    outcome: BatchGetOutcome,
    responses: BTreeMap<String, Vec<Item>>,
}

impl FetchedItems {
    /// Items returned so far, per table.
    #[must_use]
    pub fn responses(&self) -> &BTreeMap<String, Vec<Item>> {
        &self.responses
    }

    /// The outcome before delivery; [`BatchGetOutcome::found`] is still zero.
    #[must_use]
    pub fn outcome(&self) -> &BatchGetOutcome {
        &self.outcome
    }
}

/// Issues `request` and re-drives unprocessed keys, keeping the returned
/// items for [`deliver`].
///
/// # Errors
///
/// Returns the classified error when the first attempt fails. Failures on
/// later attempts are reported through [`BatchGetOutcome::error`].
pub async fn fetch_get(
    ctx: &CallContext,
    client: &dyn BackendClient,
    config: &BatchRetryConfig,
    metrics: Option<&Metrics>,
    request: BatchGetInput,
) -> GatewayResult<FetchedItems> {
    let requested = get_count(&request);
    let mut fetched =
        FetchedItems { outcome: BatchGetOutcome { requested, ..Default::default() }, ..Default::default() };
    let outcome = &mut fetched.outcome;
    let mut pending = request;

    loop {
        outcome.attempts += 1;
        match classify_result(client.batch_get_item(pending.clone()).await, Some("BatchGetItem")) {
            Ok(response) => {
                outcome.consumed_capacity.extend(response.consumed_capacity);
                for (table, items) in response.responses {
                    fetched.responses.entry(table).or_default().extend(items);
                }
                pending = BatchGetInput { request_items: response.unprocessed_keys };
            },
            Err(err) if outcome.attempts == 1 => return Err(err),
            Err(err) => {
                outcome.error = Some(err);
                break;
            },
        }

        let remaining = get_count(&pending);
        if remaining == 0 || outcome.attempts >= config.max_attempts() {
            break;
        }
        debug!(attempt = outcome.attempts, remaining, "re-driving unprocessed batch keys");
        if let Err(err) = pause(ctx, config, metrics, outcome.attempts, "BatchGetItem").await {
            outcome.error = Some(err.with_prefix("(BatchGetItem)"));
            break;
        }
    }

    outcome.leftover = pending
        .request_items
        .into_iter()
        .filter(|(_, request)| !request.keys.is_empty())
        .map(|(table, request)| (table, request.keys))
        .collect();

    let leftover = outcome.leftover_count();
    if leftover > 0 {
        if let Some(m) = metrics {
            m.record_batch_leftover(leftover);
        }
        warn!(requested, leftover, attempts = outcome.attempts, "batch keys left unread");
        if leftover > requested {
            outcome.error = Some(ClassifiedError::reconciliation(format!(
                "(BatchGetItem) backend reported {leftover} unprocessed keys for {requested} requested"
            )));
        } else if outcome.error.is_none() {
            outcome.error = Some(ClassifiedError::reconciliation(format!(
                "(BatchGetItem) {leftover} of {requested} keys unread after {} attempts",
                outcome.attempts
            )));
        }
    }
    Ok(fetched)
}

/// Pushes every fetched item into the sink of the group that requested its
/// table. Delivery is all or nothing: if any item fails to decode, every
/// sink is left as it was.
///
/// # Errors
///
/// Returns a serialization error if an item does not decode into its sink.
pub fn deliver(
    defaults: &KeyNames,
    groups: &mut [GetGroup<'_>],
    fetched: FetchedItems,
) -> GatewayResult<BatchGetOutcome> {
    let FetchedItems { mut outcome, mut responses } = fetched;
    let marks: Vec<usize> = groups.iter().map(|g| g.sink.len()).collect();
    let mut failure = None;
    'groups: for group in groups.iter_mut() {
        let table = group.table.resolve(defaults).table_name;
        for item in responses.remove(&table).unwrap_or_default() {
            if let Err(err) = group.sink.push_item(item) {
                failure = Some(err);
                break 'groups;
            }
            outcome.found += 1;
        }
    }
    if let Some(err) = failure {
        for (group, &mark) in groups.iter_mut().zip(&marks) {
            group.sink.truncate(mark);
        }
        return Err(err.with_prefix("(Unmarshal Result Items)"));
    }
    Ok(outcome)
}
