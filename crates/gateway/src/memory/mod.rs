//! In-memory backend client.
//!
//! [`MemoryClient`] implements [`BackendClient`] over tables held in
//! process memory. It is the reference backend for tests and local
//! development: it speaks the same request shapes as a real store, answers
//! with the same coded errors, and pages, batches and transacts with the
//! same contracts.
//!
//! # Features
//!
//! - **Thread-safe**: tables live behind a [`parking_lot::RwLock`]
//! - **Ordered**: items are kept in a [`BTreeMap`] by `(partition, sort)`, so
//!   queries return a partition in sort-key order
//! - **Expressions**: the subset described in [`expression`]
//! - **Fault injection**: scripted errors per operation, forced unprocessed
//!   subsets for batch calls, and per-call latency
//!
//! # Example
//!
//! ```
//! use docstore_gateway::{BackendClient, MemoryClient, PutItemInput, AttributeValue, Item};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = MemoryClient::new().with_table("orders", "PK", Some("SK"));
//!     let item = Item::from([
//!         ("PK".to_owned(), AttributeValue::from("customer#1")),
//!         ("SK".to_owned(), AttributeValue::from("order#1")),
//!     ]);
//!     client
//!         .put_item(PutItemInput { table_name: "orders".into(), item, ..Default::default() })
//!         .await
//!         .unwrap();
//!     assert_eq!(client.item_count("orders"), 1);
//! }
//! ```
//!
//! # Limitations
//!
//! - Secondary indexes are not modelled; a query or scan naming an index is
//!   rejected
//! - Key attributes must be strings or numbers

mod expression;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use self::expression::{
    Placeholders, UpdateAction, condition_holds, parse_condition, parse_update, project,
};
use crate::{
    backend::BackendClient,
    error::{BackendError, ErrorCode},
    types::{
        AttributeValue, BatchGetInput, BatchGetOutput, BatchWriteInput, BatchWriteOutput,
        Capacity, ConsumedCapacity, DeleteItemInput, ExpressionNames, ExpressionValues,
        GetItemInput, Item, Key, KeysAndAttributes, Page, PutItemInput, QueryInput, ScanInput,
        TransactGetInput, TransactGetOutput, TransactWriteInput, TransactWriteItem,
        UpdateItemInput, WriteRequest,
    },
};

/// Per-call item ceiling of batch writes and transactions.
const MAX_WRITE_ITEMS: usize = 25;

/// Per-call key ceiling of batch reads.
const MAX_BATCH_GET_KEYS: usize = 100;

/// Capacity units charged per item read or written.
const UNITS_PER_ITEM: f64 = 0.5;

/// Backend operations, for fault scripting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOperation {
    GetItem,
    PutItem,
    UpdateItem,
    DeleteItem,
    Query,
    Scan,
    BatchGetItem,
    BatchWriteItem,
    TransactGetItems,
    TransactWriteItems,
}

type StorageKey = (String, String);

#[derive(Debug, Clone)]
struct Table {
    pk_name: String,
    sk_name: Option<String>,
    items: BTreeMap<StorageKey, Item>,
}

fn key_part(value: Option<&AttributeValue>, name: &str) -> Result<String, BackendError> {
    match value {
        Some(AttributeValue::S(s) | AttributeValue::N(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(BackendError::service(
            ErrorCode::Validation,
            format!("key attribute {name} must be a non-empty string or number"),
        )),
        None => Err(BackendError::service(
            ErrorCode::Validation,
            format!("One of the required keys was not given a value: {name}"),
        )),
    }
}

impl Table {
    fn storage_key(&self, attrs: &BTreeMap<String, AttributeValue>) -> Result<StorageKey, BackendError> {
        let pk = key_part(attrs.get(&self.pk_name), &self.pk_name)?;
        let sk = match &self.sk_name {
            Some(name) => key_part(attrs.get(name), name)?,
            None => String::new(),
        };
        Ok((pk, sk))
    }

    fn key_of(&self, item: &Item) -> Key {
        item.iter()
            .filter(|(name, _)| {
                **name == self.pk_name || self.sk_name.as_deref() == Some(name.as_str())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn is_key_attribute(&self, name: &str) -> bool {
        name == self.pk_name || self.sk_name.as_deref() == Some(name)
    }
}

#[derive(Debug, Default)]
struct Faults {
    errors: HashMap<MemoryOperation, VecDeque<Option<BackendError>>>,
    unprocessed: VecDeque<usize>,
    latency: Option<Duration>,
    calls: HashMap<MemoryOperation, usize>,
}

/// In-memory [`BackendClient`].
///
/// Cloning shares tables and fault scripts.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    name: Arc<str>,
    tables: Arc<RwLock<BTreeMap<String, Table>>>,
    faults: Arc<Mutex<Faults>>,
    page_size: Option<u32>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    /// Creates an empty client named `"memory"`.
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Creates an empty client reporting `name` from [`BackendClient::name`].
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            tables: Arc::new(RwLock::new(BTreeMap::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
            page_size: None,
        }
    }

    /// Returns this client with `table` created.
    #[must_use]
    pub fn with_table(self, table: &str, pk_name: &str, sk_name: Option<&str>) -> Self {
        self.create_table(table, pk_name, sk_name);
        self
    }

    /// Returns this client paging queries and scans at `size` items when the
    /// request sets no limit.
    #[must_use]
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Creates (or empties) `table` with the given key schema.
    pub fn create_table(&self, table: &str, pk_name: &str, sk_name: Option<&str>) {
        self.tables.write().insert(table.to_owned(), Table {
            pk_name: pk_name.to_owned(),
            sk_name: sk_name.map(str::to_owned),
            items: BTreeMap::new(),
        });
    }

    /// Items currently stored in `table`; zero for an unknown table.
    #[must_use]
    pub fn item_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.items.len())
    }

    /// A copy of every item in `table`, in key order.
    #[must_use]
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.tables.read().get(table).map(|t| t.items.values().cloned().collect()).unwrap_or_default()
    }

    /// Makes the next call to `operation` fail with `error`. Repeated calls
    /// queue errors in order.
    pub fn inject_error(&self, operation: MemoryOperation, error: BackendError) {
        self.faults.lock().errors.entry(operation).or_default().push_back(Some(error));
    }

    /// Lets the next scripted call to `operation` through, so errors queued
    /// after it land on later calls.
    pub fn allow_next(&self, operation: MemoryOperation) {
        self.faults.lock().errors.entry(operation).or_default().push_back(None);
    }

    /// Makes the next batch call leave its last `count` requests
    /// unprocessed. Repeated calls script consecutive batch calls.
    pub fn leave_unprocessed(&self, count: usize) {
        self.faults.lock().unprocessed.push_back(count);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = Some(latency);
    }

    /// Calls made to `operation` so far, including failed ones.
    #[must_use]
    pub fn calls(&self, operation: MemoryOperation) -> usize {
        self.faults.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    async fn enter(&self, operation: MemoryOperation) -> Result<(), BackendError> {
        let (latency, scripted) = {
            let mut faults = self.faults.lock();
            *faults.calls.entry(operation).or_default() += 1;
            let scripted = faults.errors.get_mut(&operation).and_then(VecDeque::pop_front).flatten();
            (faults.latency, scripted)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        scripted.map_or(Ok(()), Err)
    }

    fn unprocessed_count(&self) -> usize {
        self.faults.lock().unprocessed.pop_front().unwrap_or(0)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_page(
        &self,
        table_name: &str,
        key_condition: Option<&str>,
        filter: Option<&str>,
        placeholders: Placeholders<'_>,
        limit: Option<u32>,
        start: Option<&Key>,
        forward: bool,
    ) -> Result<Page, BackendError> {
        let tables = self.tables.read();
        let table = table(&tables, table_name)?;

        let key_clauses = match key_condition {
            Some(expr) => {
                let clauses = parse_condition(expr, placeholders)?;
                if !clauses.iter().any(|c| {
                    c.attribute() == table.pk_name
                        && matches!(c, expression::Clause::Compare(_, expression::Comparator::Eq, _))
                }) {
                    return Err(BackendError::service(
                        ErrorCode::Validation,
                        format!("Query condition missed key schema element: {}", table.pk_name),
                    ));
                }
                if let Some(clause) = clauses.iter().find(|c| !table.is_key_attribute(c.attribute())) {
                    return Err(BackendError::service(
                        ErrorCode::Validation,
                        format!("key condition on non-key attribute {}", clause.attribute()),
                    ));
                }
                clauses
            },
            None => Vec::new(),
        };
        let filter_clauses = match filter {
            Some(expr) => parse_condition(expr, placeholders)?,
            None => Vec::new(),
        };
        let start = start.filter(|k| !k.is_empty()).map(|k| table.storage_key(k)).transpose()?;

        let candidates: Box<dyn Iterator<Item = (&StorageKey, &Item)> + '_> =
            if forward { Box::new(table.items.iter()) } else { Box::new(table.items.iter().rev()) };
        let mut remaining = candidates
            .filter(|(key, _)| match &start {
                Some(start) if forward => *key > start,
                Some(start) => *key < start,
                None => true,
            })
            .filter(|(_, item)| key_clauses.iter().all(|c| c.matches(Some(*item))))
            .peekable();

        let limit = limit.or(self.page_size).map_or(usize::MAX, |l| l.max(1) as usize);
        let mut page = Page::default();
        let mut last = None;
        while page.scanned_count < limit as u64 {
            let Some((_, item)) = remaining.next() else { break };
            page.scanned_count += 1;
            last = Some(item);
            if filter_clauses.iter().all(|c| c.matches(Some(item))) {
                page.items.push(item.clone());
            }
        }
        page.count = page.items.len() as u64;
        if remaining.peek().is_some() {
            page.last_evaluated_key = last.map(|item| table.key_of(item));
        }
        page.consumed_capacity = Some(charge(table_name, page.scanned_count as usize, true));
        Ok(page)
    }
}

fn table<'t>(tables: &'t BTreeMap<String, Table>, name: &str) -> Result<&'t Table, BackendError> {
    tables.get(name).ok_or_else(|| not_found(name))
}

fn table_mut<'t>(
    tables: &'t mut BTreeMap<String, Table>,
    name: &str,
) -> Result<&'t mut Table, BackendError> {
    tables.get_mut(name).ok_or_else(|| not_found(name))
}

fn not_found(table: &str) -> BackendError {
    BackendError::service(
        ErrorCode::ResourceNotFound,
        format!("Requested resource not found: Table: {table} not found"),
    )
}

fn conditional_check_failed() -> BackendError {
    BackendError::service(ErrorCode::ConditionalCheckFailed, "The conditional request failed")
}

fn charge(table_name: &str, items: usize, read: bool) -> ConsumedCapacity {
    let units = items as f64 * UNITS_PER_ITEM;
    let (read_units, write_units) = if read { (units, 0.0) } else { (0.0, units) };
    ConsumedCapacity {
        table_name: Some(table_name.to_owned()),
        capacity_units: units,
        read_capacity_units: read_units,
        write_capacity_units: write_units,
        table: Some(Capacity {
            capacity_units: units,
            read_capacity_units: read_units,
            write_capacity_units: write_units,
        }),
        ..Default::default()
    }
}

fn apply_update(
    table: &Table,
    existing: Option<&Item>,
    key: &Key,
    actions: &[UpdateAction],
) -> Result<Item, BackendError> {
    let mut item = existing.cloned().unwrap_or_else(|| key.clone());
    for action in actions {
        let name = match action {
            UpdateAction::Set(name, _) | UpdateAction::Remove(name) => name,
        };
        if table.is_key_attribute(name) {
            return Err(BackendError::service(
                ErrorCode::Validation,
                format!("Cannot update attribute {name}. This attribute is part of the key"),
            ));
        }
        match action {
            UpdateAction::Set(name, value) => {
                item.insert(name.clone(), value.clone());
            },
            UpdateAction::Remove(name) => {
                item.remove(name);
            },
        }
    }
    Ok(item)
}

fn check_count(count: usize, max: usize, what: &str) -> Result<(), BackendError> {
    if count == 0 || count > max {
        return Err(BackendError::service(
            ErrorCode::Validation,
            format!("{what} must contain between 1 and {max} entries, got {count}"),
        ));
    }
    Ok(())
}

#[async_trait]
impl BackendClient for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, input: GetItemInput) -> Result<Option<Item>, BackendError> {
        self.enter(MemoryOperation::GetItem).await?;
        let tables = self.tables.read();
        let table = table(&tables, &input.table_name)?;
        let key = table.storage_key(&input.key)?;
        table
            .items
            .get(&key)
            .cloned()
            .map(|item| {
                project(item, input.projection_expression.as_deref(), &input.expression_attribute_names)
            })
            .transpose()
    }

    async fn put_item(&self, input: PutItemInput) -> Result<(), BackendError> {
        self.enter(MemoryOperation::PutItem).await?;
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, &input.table_name)?;
        let key = table.storage_key(&input.item)?;
        let placeholders = Placeholders {
            names: &input.expression_attribute_names,
            values: &input.expression_attribute_values,
        };
        if !condition_holds(input.condition_expression.as_deref(), placeholders, table.items.get(&key))? {
            return Err(conditional_check_failed());
        }
        table.items.insert(key, input.item);
        Ok(())
    }

    async fn update_item(&self, input: UpdateItemInput) -> Result<(), BackendError> {
        self.enter(MemoryOperation::UpdateItem).await?;
        let placeholders = Placeholders {
            names: &input.expression_attribute_names,
            values: &input.expression_attribute_values,
        };
        let actions = parse_update(&input.update_expression, placeholders)?;

        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, &input.table_name)?;
        let key = table.storage_key(&input.key)?;
        let existing = table.items.get(&key);
        if !condition_holds(input.condition_expression.as_deref(), placeholders, existing)? {
            return Err(conditional_check_failed());
        }
        let updated = apply_update(table, existing, &input.key, &actions)?;
        table.items.insert(key, updated);
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<(), BackendError> {
        self.enter(MemoryOperation::DeleteItem).await?;
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, &input.table_name)?;
        let key = table.storage_key(&input.key)?;
        let placeholders = Placeholders {
            names: &input.expression_attribute_names,
            values: &input.expression_attribute_values,
        };
        if !condition_holds(input.condition_expression.as_deref(), placeholders, table.items.get(&key))? {
            return Err(conditional_check_failed());
        }
        table.items.remove(&key);
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<Page, BackendError> {
        self.enter(MemoryOperation::Query).await?;
        reject_index(input.index_name.as_deref())?;
        let placeholders = Placeholders {
            names: &input.expression_attribute_names,
            values: &input.expression_attribute_values,
        };
        let page = self.read_page(
            &input.table_name,
            Some(&input.key_condition_expression),
            input.filter_expression.as_deref(),
            placeholders,
            input.limit,
            input.exclusive_start_key.as_ref(),
            input.scan_index_forward,
        )?;
        project_page(page, input.projection_expression.as_deref(), &input.expression_attribute_names)
    }

    async fn scan(&self, input: ScanInput) -> Result<Page, BackendError> {
        self.enter(MemoryOperation::Scan).await?;
        reject_index(input.index_name.as_deref())?;
        let placeholders = Placeholders {
            names: &input.expression_attribute_names,
            values: &input.expression_attribute_values,
        };
        let page = self.read_page(
            &input.table_name,
            None,
            input.filter_expression.as_deref(),
            placeholders,
            input.limit,
            input.exclusive_start_key.as_ref(),
            true,
        )?;
        project_page(page, input.projection_expression.as_deref(), &input.expression_attribute_names)
    }

    async fn batch_get_item(&self, input: BatchGetInput) -> Result<BatchGetOutput, BackendError> {
        self.enter(MemoryOperation::BatchGetItem).await?;
        let total: usize = input.request_items.values().map(|r| r.keys.len()).sum();
        check_count(total, MAX_BATCH_GET_KEYS, "BatchGetItem request")?;
        let mut processed_limit = total - self.unprocessed_count().min(total);

        let tables = self.tables.read();
        let mut output = BatchGetOutput::default();
        for (table_name, request) in input.request_items {
            let table = table(&tables, &table_name)?;
            let mut found = Vec::new();
            let mut unprocessed = Vec::new();
            for key in request.keys {
                if processed_limit == 0 {
                    unprocessed.push(key);
                    continue;
                }
                processed_limit -= 1;
                if let Some(item) = table.items.get(&table.storage_key(&key)?) {
                    found.push(project(
                        item.clone(),
                        request.projection_expression.as_deref(),
                        &request.expression_attribute_names,
                    )?);
                }
            }
            output.consumed_capacity.push(charge(&table_name, found.len(), true));
            output.responses.insert(table_name.clone(), found);
            if !unprocessed.is_empty() {
                output.unprocessed_keys.insert(table_name, KeysAndAttributes {
                    keys: unprocessed,
                    projection_expression: request.projection_expression,
                    expression_attribute_names: request.expression_attribute_names,
                    consistent_read: request.consistent_read,
                });
            }
        }
        Ok(output)
    }

    async fn batch_write_item(
        &self,
        input: BatchWriteInput,
    ) -> Result<BatchWriteOutput, BackendError> {
        self.enter(MemoryOperation::BatchWriteItem).await?;
        let total: usize = input.request_items.values().map(Vec::len).sum();
        check_count(total, MAX_WRITE_ITEMS, "BatchWriteItem request")?;
        let mut processed_limit = total - self.unprocessed_count().min(total);

        let mut tables = self.tables.write();
        for name in input.request_items.keys() {
            table(&tables, name)?;
        }
        let mut output = BatchWriteOutput::default();
        for (table_name, requests) in input.request_items {
            let table = table_mut(&mut tables, &table_name)?;
            let mut written = 0;
            let mut unprocessed = Vec::new();
            for request in requests {
                if processed_limit == 0 {
                    unprocessed.push(request);
                    continue;
                }
                processed_limit -= 1;
                written += 1;
                match request {
                    WriteRequest::Put { item } => {
                        let key = table.storage_key(&item)?;
                        table.items.insert(key, item);
                    },
                    WriteRequest::Delete { key } => {
                        let key = table.storage_key(&key)?;
                        table.items.remove(&key);
                    },
                }
            }
            output.consumed_capacity.push(charge(&table_name, written, false));
            if !unprocessed.is_empty() {
                output.unprocessed_items.insert(table_name, unprocessed);
            }
        }
        Ok(output)
    }

    async fn transact_get_items(
        &self,
        input: TransactGetInput,
    ) -> Result<TransactGetOutput, BackendError> {
        self.enter(MemoryOperation::TransactGetItems).await?;
        check_count(input.items.len(), MAX_WRITE_ITEMS, "TransactGetItems request")?;

        let tables = self.tables.read();
        let mut output = TransactGetOutput::default();
        let mut per_table: BTreeMap<&str, usize> = BTreeMap::new();
        for get in &input.items {
            let table = table(&tables, &get.table_name)?;
            let item = table
                .items
                .get(&table.storage_key(&get.key)?)
                .cloned()
                .map(|item| {
                    project(item, get.projection_expression.as_deref(), &get.expression_attribute_names)
                })
                .transpose()?;
            *per_table.entry(&get.table_name).or_default() += 1;
            output.responses.push(item);
        }
        output.consumed_capacity =
            per_table.into_iter().map(|(name, n)| charge(name, n * 2, true)).collect();
        Ok(output)
    }

    async fn transact_write_items(&self, input: TransactWriteInput) -> Result<(), BackendError> {
        self.enter(MemoryOperation::TransactWriteItems).await?;
        check_count(input.items.len(), MAX_WRITE_ITEMS, "TransactWriteItems request")?;

        let mut tables = self.tables.write();
        let mut touched = BTreeSet::new();
        let mut planned = Vec::with_capacity(input.items.len());
        let mut reasons = Vec::with_capacity(input.items.len());

        for op in &input.items {
            let table = table(&tables, op.table_name())?;
            let (key_attrs, condition, names, values): (
                &BTreeMap<String, AttributeValue>,
                Option<&str>,
                &ExpressionNames,
                &ExpressionValues,
            ) = match op {
                TransactWriteItem::Put {
                    item,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                    ..
                } => (item, condition_expression.as_deref(), expression_attribute_names, expression_attribute_values),
                TransactWriteItem::Delete {
                    key,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                    ..
                }
                | TransactWriteItem::Update {
                    key,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                    ..
                } => (key, condition_expression.as_deref(), expression_attribute_names, expression_attribute_values),
            };
            let storage_key = table.storage_key(key_attrs)?;
            if !touched.insert((op.table_name().to_owned(), storage_key.clone())) {
                return Err(BackendError::service(
                    ErrorCode::Validation,
                    "Transaction request cannot include multiple operations on one item",
                ));
            }

            let placeholders = Placeholders { names, values };
            let existing = table.items.get(&storage_key);
            let holds = condition_holds(condition, placeholders, existing)?;
            reasons.push(if holds { "None" } else { "ConditionalCheckFailed" });

            let next = match op {
                TransactWriteItem::Put { item, .. } => Some(item.clone()),
                TransactWriteItem::Delete { .. } => None,
                TransactWriteItem::Update { key, update_expression, .. } => {
                    let actions = parse_update(update_expression, placeholders)?;
                    Some(apply_update(table, existing, key, &actions)?)
                },
            };
            planned.push((op.table_name().to_owned(), storage_key, next));
        }

        if reasons.iter().any(|r| *r != "None") {
            return Err(BackendError::service(
                ErrorCode::TransactionCanceled,
                format!(
                    "Transaction cancelled, please refer cancellation reasons for specific reasons [{}]",
                    reasons.join(", ")
                ),
            ));
        }

        for (table_name, key, next) in planned {
            let table = table_mut(&mut tables, &table_name)?;
            match next {
                Some(item) => {
                    table.items.insert(key, item);
                },
                None => {
                    table.items.remove(&key);
                },
            }
        }
        Ok(())
    }
}

fn reject_index(index: Option<&str>) -> Result<(), BackendError> {
    match index {
        Some(index) => Err(BackendError::service(
            ErrorCode::Validation,
            format!("MemoryClient does not model secondary indexes (requested {index})"),
        )),
        None => Ok(()),
    }
}

fn project_page(
    mut page: Page,
    projection: Option<&str>,
    names: &ExpressionNames,
) -> Result<Page, BackendError> {
    if projection.is_some() {
        page.items = page
            .items
            .into_iter()
            .map(|item| project(item, projection, names))
            .collect::<Result<_, _>>()?;
    }
    Ok(page)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::TransactGetItem;

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_owned())
    }

    fn item(pk: &str, sk: &str) -> Item {
        Item::from([("PK".to_owned(), s(pk)), ("SK".to_owned(), s(sk))])
    }

    fn key(pk: &str, sk: &str) -> Key {
        item(pk, sk)
    }

    fn client() -> MemoryClient {
        MemoryClient::new().with_table("orders", "PK", Some("SK"))
    }

    async fn seed(client: &MemoryClient, pk: &str, count: usize) {
        for i in 0..count {
            client
                .put_item(PutItemInput {
                    table_name: "orders".into(),
                    item: item(pk, &format!("order#{i:02}")),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
    }

    fn query(pk: &str) -> QueryInput {
        QueryInput {
            table_name: "orders".into(),
            key_condition_expression: "#pk = :pk".into(),
            expression_attribute_names: ExpressionNames::from([("#pk".into(), "PK".into())]),
            expression_attribute_values: ExpressionValues::from([(":pk".into(), s(pk))]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_missing_item_is_none() {
        let client = client();
        let got = client
            .get_item(GetItemInput { table_name: "orders".into(), key: key("a", "b"), ..Default::default() })
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let err = client()
            .get_item(GetItemInput { table_name: "nope".into(), key: key("a", "b"), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::ResourceNotFound));
    }

    #[tokio::test]
    async fn test_put_if_absent_condition() {
        let client = client();
        let put = PutItemInput {
            table_name: "orders".into(),
            item: item("a", "b"),
            condition_expression: Some("attribute_not_exists(PK)".into()),
            ..Default::default()
        };
        client.put_item(put.clone()).await.unwrap();
        let err = client.put_item(put).await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::ConditionalCheckFailed));
    }

    #[tokio::test]
    async fn test_update_set_and_remove() {
        let client = client();
        client
            .update_item(UpdateItemInput {
                table_name: "orders".into(),
                key: key("a", "b"),
                update_expression: "SET status = :s, note = :n".into(),
                expression_attribute_values: ExpressionValues::from([
                    (":s".into(), s("paid")),
                    (":n".into(), s("gift")),
                ]),
                ..Default::default()
            })
            .await
            .unwrap();
        client
            .update_item(UpdateItemInput {
                table_name: "orders".into(),
                key: key("a", "b"),
                update_expression: "REMOVE note".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let items = client.items("orders");
        let stored = &items[0];
        assert_eq!(stored["status"], s("paid"));
        assert!(!stored.contains_key("note"));
    }

    #[tokio::test]
    async fn test_update_rejects_key_attribute() {
        let err = client()
            .update_item(UpdateItemInput {
                table_name: "orders".into(),
                key: key("a", "b"),
                update_expression: "SET SK = :s".into(),
                expression_attribute_values: ExpressionValues::from([(":s".into(), s("x"))]),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Validation));
    }

    #[tokio::test]
    async fn test_query_pages_in_sort_order() {
        let client = client().with_page_size(2);
        seed(&client, "a", 5).await;
        seed(&client, "b", 3).await;

        let first = client.query(query("a")).await.unwrap();
        assert_eq!(first.count, 2);
        assert_eq!(first.items[0]["SK"], s("order#00"));
        let cursor = first.last_evaluated_key.clone().unwrap();
        assert_eq!(cursor, key("a", "order#01"));

        let second = client
            .query(QueryInput { exclusive_start_key: Some(cursor), ..query("a") })
            .await
            .unwrap();
        assert_eq!(second.items[0]["SK"], s("order#02"));

        let last = client
            .query(QueryInput { exclusive_start_key: Some(key("a", "order#03")), ..query("a") })
            .await
            .unwrap();
        assert_eq!(last.count, 1);
        assert!(last.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_query_backwards_with_prefix() {
        let client = client();
        seed(&client, "a", 3).await;
        let mut input = query("a");
        input.key_condition_expression = "#pk = :pk AND begins_with(SK, :p)".into();
        input.expression_attribute_values.insert(":p".into(), s("order#0"));
        input.scan_index_forward = false;

        let page = client.query(input).await.unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(page.items[0]["SK"], s("order#02"));
    }

    #[tokio::test]
    async fn test_query_requires_partition_equality() {
        let mut input = query("a");
        input.key_condition_expression = "begins_with(SK, :pk)".into();
        let err = client().query(input).await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Validation));
    }

    #[tokio::test]
    async fn test_scan_filter_counts() {
        let client = client();
        seed(&client, "a", 4).await;
        let page = client
            .scan(ScanInput {
                table_name: "orders".into(),
                filter_expression: Some("SK >= :min".into()),
                expression_attribute_values: ExpressionValues::from([(":min".into(), s("order#02"))]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.scanned_count, 4);
        assert_eq!(page.consumed_capacity.unwrap().capacity_units, 2.0);
    }

    #[tokio::test]
    async fn test_scripted_error_is_consumed_once() {
        let client = client();
        client.inject_error(
            MemoryOperation::GetItem,
            BackendError::service(ErrorCode::InternalServerError, "boom"),
        );
        let input = GetItemInput { table_name: "orders".into(), key: key("a", "b"), ..Default::default() };
        assert!(client.get_item(input.clone()).await.is_err());
        assert!(client.get_item(input).await.is_ok());
        assert_eq!(client.calls(MemoryOperation::GetItem), 2);
    }

    #[tokio::test]
    async fn test_batch_write_leaves_scripted_tail_unprocessed() {
        let client = client();
        client.leave_unprocessed(2);
        let requests = (0..5)
            .map(|i| WriteRequest::Put { item: item("a", &format!("order#{i}")) })
            .collect();
        let output = client
            .batch_write_item(BatchWriteInput {
                request_items: BTreeMap::from([("orders".to_owned(), requests)]),
            })
            .await
            .unwrap();

        assert_eq!(client.item_count("orders"), 3);
        assert_eq!(output.unprocessed_items["orders"].len(), 2);
    }

    #[tokio::test]
    async fn test_batch_get_reports_unprocessed_keys() {
        let client = client();
        seed(&client, "a", 3).await;
        client.leave_unprocessed(1);
        let keys = (0..3).map(|i| key("a", &format!("order#{i:02}"))).collect();
        let output = client
            .batch_get_item(BatchGetInput {
                request_items: BTreeMap::from([(
                    "orders".to_owned(),
                    KeysAndAttributes { keys, ..Default::default() },
                )]),
            })
            .await
            .unwrap();

        assert_eq!(output.responses["orders"].len(), 2);
        assert_eq!(output.unprocessed_keys["orders"].keys, vec![key("a", "order#02")]);
    }

    #[tokio::test]
    async fn test_batch_write_ceiling() {
        let requests =
            (0..26).map(|i| WriteRequest::Delete { key: key("a", &i.to_string()) }).collect();
        let err = client()
            .batch_write_item(BatchWriteInput {
                request_items: BTreeMap::from([("orders".to_owned(), requests)]),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Validation));
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let client = client();
        seed(&client, "a", 1).await;

        let err = client
            .transact_write_items(TransactWriteInput {
                items: vec![
                    TransactWriteItem::Put {
                        table_name: "orders".into(),
                        item: item("b", "x"),
                        condition_expression: None,
                        expression_attribute_names: ExpressionNames::new(),
                        expression_attribute_values: ExpressionValues::new(),
                    },
                    TransactWriteItem::Put {
                        table_name: "orders".into(),
                        item: item("a", "order#00"),
                        condition_expression: Some("attribute_not_exists(PK)".into()),
                        expression_attribute_names: ExpressionNames::new(),
                        expression_attribute_values: ExpressionValues::new(),
                    },
                ],
                client_request_token: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(&ErrorCode::TransactionCanceled));
        assert!(err.to_string().contains("[None, ConditionalCheckFailed]"));
        assert_eq!(client.item_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_transact_get_allows_repeated_keys() {
        let client = client();
        seed(&client, "a", 1).await;
        let get = TransactGetItem {
            table_name: "orders".into(),
            key: key("a", "order#00"),
            ..Default::default()
        };
        let output = client
            .transact_get_items(TransactGetInput { items: vec![get.clone(), get] })
            .await
            .unwrap();
        assert_eq!(output.responses.len(), 2);
        assert!(output.responses.iter().all(Option::is_some));
    }
}
