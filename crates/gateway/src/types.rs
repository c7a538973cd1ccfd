//! Wire-level data model shared by the gateway and backend clients.
//!
//! These types mirror the request and response shapes of a key-value /
//! document store: attribute maps ([`Item`]), key maps ([`Key`]), paginated
//! read pages, batch and transactional payloads, and consumed-capacity
//! metrics. Backend clients speak these types; the gateway never inspects
//! the wire protocol beneath them.
//!
//! All types are plain owned values with structural equality. Anything the
//! gateway retains across a retry (cursors, unprocessed subsets) is an
//! independent copy, never a view into a backend buffer.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifiedError, GatewayResult};

/// A single attribute value in the store's item format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// UTF-8 string.
    S(String),
    /// Number, carried as its decimal string representation.
    N(String),
    /// Binary blob.
    B(Bytes),
    /// Boolean.
    Bool(bool),
    /// Explicit null.
    Null,
    /// Ordered list of values.
    L(Vec<AttributeValue>),
    /// Nested map of values.
    M(BTreeMap<String, AttributeValue>),
    /// String set.
    Ss(Vec<String>),
    /// Number set.
    Ns(Vec<String>),
}

impl AttributeValue {
    /// Returns the string payload when this is an `S` value.
    #[must_use]
    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the decimal payload when this is an `N` value.
    #[must_use]
    pub fn as_n(&self) -> Option<&str> {
        match self {
            Self::N(n) => Some(n),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::S(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::S(value)
    }
}

/// An item: attribute name to value.
pub type Item = BTreeMap<String, AttributeValue>;

/// A primary-key map (partition key, optionally sort key). Also the shape of
/// a page cursor ("exclusive start key" / "last evaluated key").
pub type Key = BTreeMap<String, AttributeValue>;

/// Expression attribute name placeholders (`#name` to attribute name).
pub type ExpressionNames = BTreeMap<String, String>;

/// Expression attribute value placeholders (`:value` to value).
pub type ExpressionValues = BTreeMap<String, AttributeValue>;

/// Caller-facing key values. The store's key attributes are strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchKey {
    /// Partition key value.
    pub pk: String,
    /// Sort key value, if the table has one.
    pub sk: Option<String>,
}

impl SearchKey {
    /// Key with a partition value only.
    pub fn new(pk: impl Into<String>) -> Self {
        Self { pk: pk.into(), sk: None }
    }

    /// Key with partition and sort values.
    pub fn with_sort(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self { pk: pk.into(), sk: Some(sk.into()) }
    }
}

/// Resolved table and key attribute names for one request group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNames {
    /// Destination table.
    pub table_name: String,
    /// Partition key attribute name.
    pub pk_name: String,
    /// Sort key attribute name, when the table has one.
    pub sk_name: Option<String>,
}

impl KeyNames {
    /// Builds the key map for `key`.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when the partition value is empty, or a
    /// sort-key value is supplied without a configured sort-key name.
    pub fn key_for(&self, key: &SearchKey) -> GatewayResult<Key> {
        if key.pk.is_empty() {
            return Err(ClassifiedError::precondition("partition key value is required"));
        }
        let mut map = Key::new();
        map.insert(self.pk_name.clone(), AttributeValue::S(key.pk.clone()));
        match (&key.sk, &self.sk_name) {
            (Some(sk), Some(sk_name)) if !sk.is_empty() => {
                map.insert(sk_name.clone(), AttributeValue::S(sk.clone()));
            },
            (Some(sk), None) if !sk.is_empty() => {
                return Err(ClassifiedError::precondition(format!(
                    "sort key value supplied for table {} without a sort key name",
                    self.table_name
                )));
            },
            _ => {},
        }
        Ok(map)
    }
}

/// Partition key name assumed for tables other than the gateway's own.
pub const FALLBACK_PK_NAME: &str = "PK";

/// Sort key name assumed for tables other than the gateway's own.
pub const FALLBACK_SK_NAME: &str = "SK";

/// Caller-side table and key-name overrides for one request group.
///
/// Unset fields resolve against the gateway's configured [`KeyNames`] when
/// the group targets the gateway's table, and against
/// [`FALLBACK_PK_NAME`] / [`FALLBACK_SK_NAME`] when it targets another one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRef {
    /// Destination table; `None` is the gateway's table.
    pub table_name: Option<String>,
    /// Partition key attribute override.
    pub pk_name: Option<String>,
    /// Sort key attribute override. `None` inherits; `Some(None)` declares
    /// a partition-only table.
    pub sk_name: Option<Option<String>>,
}

impl TableRef {
    /// The gateway's own table with its configured key names.
    #[must_use]
    pub fn gateway_default() -> Self {
        Self::default()
    }

    /// Another table, with fallback key names unless overridden.
    pub fn named(table_name: impl Into<String>) -> Self {
        Self { table_name: Some(table_name.into()), ..Self::default() }
    }

    /// Returns this reference with explicit key names. An `sk_name` of
    /// `None` means the table has no sort key.
    #[must_use]
    pub fn with_key_names(mut self, pk_name: &str, sk_name: Option<&str>) -> Self {
        self.pk_name = Some(pk_name.to_owned());
        self.sk_name = Some(sk_name.map(str::to_owned));
        self
    }

    /// Resolves to concrete names against the gateway's `defaults`.
    #[must_use]
    pub fn resolve(&self, defaults: &KeyNames) -> KeyNames {
        let table_name = self.table_name.clone().unwrap_or_else(|| defaults.table_name.clone());
        if table_name == defaults.table_name {
            KeyNames {
                table_name,
                pk_name: self.pk_name.clone().unwrap_or_else(|| defaults.pk_name.clone()),
                sk_name: self.sk_name.clone().unwrap_or_else(|| defaults.sk_name.clone()),
            }
        } else {
            KeyNames {
                table_name,
                pk_name: self.pk_name.clone().unwrap_or_else(|| FALLBACK_PK_NAME.to_owned()),
                sk_name: self.sk_name.clone().unwrap_or_else(|| Some(FALLBACK_SK_NAME.to_owned())),
            }
        }
    }
}

/// Capacity units consumed against one table or index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    /// Total capacity units.
    pub capacity_units: f64,
    /// Read capacity units.
    pub read_capacity_units: f64,
    /// Write capacity units.
    pub write_capacity_units: f64,
}

impl Capacity {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Capacity) {
        self.capacity_units += other.capacity_units;
        self.read_capacity_units += other.read_capacity_units;
        self.write_capacity_units += other.write_capacity_units;
    }
}

/// Capacity consumed by one call, with per-index breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumedCapacity {
    /// Table the capacity was consumed against.
    pub table_name: Option<String>,
    /// Total capacity units.
    pub capacity_units: f64,
    /// Read capacity units.
    pub read_capacity_units: f64,
    /// Write capacity units.
    pub write_capacity_units: f64,
    /// Capacity consumed by the base table.
    pub table: Option<Capacity>,
    /// Capacity consumed per local secondary index.
    pub local_secondary_indexes: BTreeMap<String, Capacity>,
    /// Capacity consumed per global secondary index.
    pub global_secondary_indexes: BTreeMap<String, Capacity>,
}

impl ConsumedCapacity {
    /// Merges `other` into `self` by numeric addition, including the nested
    /// table and per-index breakdowns.
    pub fn merge(&mut self, other: &ConsumedCapacity) {
        if self.table_name.is_none() {
            self.table_name.clone_from(&other.table_name);
        }
        self.capacity_units += other.capacity_units;
        self.read_capacity_units += other.read_capacity_units;
        self.write_capacity_units += other.write_capacity_units;

        if let Some(theirs) = &other.table {
            self.table.get_or_insert_with(Capacity::default).merge(theirs);
        }
        for (index, capacity) in &other.local_secondary_indexes {
            self.local_secondary_indexes.entry(index.clone()).or_default().merge(capacity);
        }
        for (index, capacity) in &other.global_secondary_indexes {
            self.global_secondary_indexes.entry(index.clone()).or_default().merge(capacity);
        }
    }
}

/// Point read request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetItemInput {
    pub table_name: String,
    pub key: Key,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub consistent_read: bool,
}

/// Point write request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutItemInput {
    pub table_name: String,
    pub item: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub expression_attribute_values: ExpressionValues,
}

/// Update request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateItemInput {
    pub table_name: String,
    pub key: Key,
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub expression_attribute_values: ExpressionValues,
}

/// Point delete request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteItemInput {
    pub table_name: String,
    pub key: Key,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub expression_attribute_values: ExpressionValues,
}

/// Key-condition query over a table or index.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInput {
    pub table_name: String,
    pub index_name: Option<String>,
    pub key_condition_expression: String,
    pub filter_expression: Option<String>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub expression_attribute_values: ExpressionValues,
    /// Page size hint handed to the backend.
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Key>,
    pub consistent_read: bool,
    pub scan_index_forward: bool,
}

impl Default for QueryInput {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            index_name: None,
            key_condition_expression: String::new(),
            filter_expression: None,
            projection_expression: None,
            expression_attribute_names: ExpressionNames::new(),
            expression_attribute_values: ExpressionValues::new(),
            limit: None,
            exclusive_start_key: None,
            consistent_read: false,
            scan_index_forward: true,
        }
    }
}

/// Full table (or index) scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanInput {
    pub table_name: String,
    pub index_name: Option<String>,
    pub filter_expression: Option<String>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub expression_attribute_values: ExpressionValues,
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Key>,
    pub consistent_read: bool,
}

/// One page of a query or scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// Items returned on this page (after filtering).
    pub count: u64,
    /// Items evaluated on this page (before filtering).
    pub scanned_count: u64,
    /// Cursor for the next page; `None` on the last page.
    pub last_evaluated_key: Option<Key>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

/// Keys requested from one table in a batch read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeysAndAttributes {
    pub keys: Vec<Key>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
    pub consistent_read: bool,
}

/// Batch read request, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetInput {
    pub request_items: BTreeMap<String, KeysAndAttributes>,
}

/// Batch read response. `responses` is flattened per table, in no
/// particular order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutput {
    pub responses: BTreeMap<String, Vec<Item>>,
    pub unprocessed_keys: BTreeMap<String, KeysAndAttributes>,
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// One write inside a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put { item: Item },
    Delete { key: Key },
}

/// Batch write request, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteInput {
    pub request_items: BTreeMap<String, Vec<WriteRequest>>,
}

/// Batch write response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    pub unprocessed_items: BTreeMap<String, Vec<WriteRequest>>,
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// One keyed read inside a transactional read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactGetItem {
    pub table_name: String,
    pub key: Key,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: ExpressionNames,
}

/// Transactional read request. Entries may repeat tables and keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactGetInput {
    pub items: Vec<TransactGetItem>,
}

/// Transactional read response, positionally aligned with the request.
/// `None` marks a key with no matching item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactGetOutput {
    pub responses: Vec<Option<Item>>,
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// One operation inside a transactional write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactWriteItem {
    Put {
        table_name: String,
        item: Item,
        condition_expression: Option<String>,
        expression_attribute_names: ExpressionNames,
        expression_attribute_values: ExpressionValues,
    },
    Delete {
        table_name: String,
        key: Key,
        condition_expression: Option<String>,
        expression_attribute_names: ExpressionNames,
        expression_attribute_values: ExpressionValues,
    },
    Update {
        table_name: String,
        key: Key,
        update_expression: String,
        condition_expression: Option<String>,
        expression_attribute_names: ExpressionNames,
        expression_attribute_values: ExpressionValues,
    },
}

impl TransactWriteItem {
    /// Destination table of this operation.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::Put { table_name, .. }
            | Self::Delete { table_name, .. }
            | Self::Update { table_name, .. } => table_name,
        }
    }
}

/// Transactional write request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactWriteInput {
    pub items: Vec<TransactWriteItem>,
    pub client_request_token: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn names(sk: Option<&str>) -> KeyNames {
        KeyNames {
            table_name: "orders".into(),
            pk_name: "PK".into(),
            sk_name: sk.map(Into::into),
        }
    }

    #[test]
    fn test_key_for_partition_only() {
        let key = names(None).key_for(&SearchKey::new("a")).unwrap();
        assert_eq!(key.len(), 1);
        assert_eq!(key["PK"].as_s(), Some("a"));
    }

    #[test]
    fn test_key_for_with_sort() {
        let key = names(Some("SK")).key_for(&SearchKey::with_sort("a", "b")).unwrap();
        assert_eq!(key["SK"].as_s(), Some("b"));
    }

    #[test]
    fn test_key_for_rejects_sort_value_without_name() {
        let err = names(None).key_for(&SearchKey::with_sort("a", "b")).unwrap_err();
        assert!(err.message().contains("without a sort key name"));
    }

    #[test]
    fn test_key_for_rejects_empty_partition() {
        assert!(names(None).key_for(&SearchKey::new("")).is_err());
    }

    #[test]
    fn test_table_ref_resolution() {
        let defaults = names(Some("sort"));

        let own = TableRef::gateway_default().resolve(&defaults);
        assert_eq!(own, defaults);

        let foreign = TableRef::named("audit").resolve(&defaults);
        assert_eq!(foreign.pk_name, FALLBACK_PK_NAME);
        assert_eq!(foreign.sk_name.as_deref(), Some(FALLBACK_SK_NAME));

        let renamed = TableRef::named("orders").with_key_names("id", Some("at")).resolve(&defaults);
        assert_eq!(renamed.pk_name, "id");
        assert_eq!(renamed.sk_name.as_deref(), Some("at"));
    }

    #[test]
    fn test_table_ref_partition_only_override() {
        let defaults = names(Some("sort"));

        let users = TableRef::named("users").with_key_names("id", None).resolve(&defaults);
        assert_eq!(users.pk_name, "id");
        assert_eq!(users.sk_name, None);

        let own = TableRef::gateway_default().with_key_names("PK", None).resolve(&defaults);
        assert_eq!(own.sk_name, None);

        let key = users.key_for(&SearchKey::new("u1")).unwrap();
        assert_eq!(key.keys().collect::<Vec<_>>(), ["id"]);
        let err = users.key_for(&SearchKey::with_sort("u1", "x")).unwrap_err();
        assert!(err.message().contains("without a sort key name"));
    }

    #[test]
    fn test_consumed_capacity_merge_sums_nested_indexes() {
        let mut total = ConsumedCapacity {
            table_name: Some("orders".into()),
            capacity_units: 1.0,
            ..Default::default()
        };
        let mut page = ConsumedCapacity {
            capacity_units: 2.5,
            read_capacity_units: 2.5,
            table: Some(Capacity { capacity_units: 2.0, ..Default::default() }),
            ..Default::default()
        };
        page.global_secondary_indexes
            .insert("by-status".into(), Capacity { capacity_units: 0.5, ..Default::default() });

        total.merge(&page);
        total.merge(&page);

        assert_eq!(total.capacity_units, 6.0);
        assert_eq!(total.read_capacity_units, 5.0);
        assert_eq!(total.table.unwrap().capacity_units, 4.0);
        assert_eq!(total.global_secondary_indexes["by-status"].capacity_units, 1.0);
        assert_eq!(total.table_name.as_deref(), Some("orders"));
    }
}
