//! All-or-nothing multi-item reads and writes.
//!
//! # Writes
//!
//! [`build_write`] flattens a [`TransactionWrite`] into one operation list in
//! a fixed order: deletes, then puts, then updates. The whole call is
//! rejected before anything is sent if it holds no operation, more than 25,
//! or a malformed key.
//!
//! # Reads
//!
//! [`build_get`] flattens [`TransactGetGroup`]s into one keyed list. Unlike
//! the batch read, groups may name the same table (and the same key) more
//! than once, so results cannot be matched back by table or by key value.
//! The plan records how many keys each group contributed, and
//! [`distribute`] hands the positionally aligned response back by slicing
//! it with a running offset:
//!
//! ```text
//! groups:    [ g0: 2 keys ][ g1: 1 key ][ g2: 2 keys ]
//! responses: [  r0   r1   ][    r2     ][  r3   r4   ]
//! ```
//!
//! A response shorter or longer than the request is a `Reconciliation`
//! error, and an item that fails to decode is a `Serialization` error;
//! nothing is delivered in either case.
//!
//! # Failures
//!
//! | Cause | Kind |
//! |-------|------|
//! | empty / oversized / malformed request | `Precondition` |
//! | item fails to marshal or unmarshal | `Serialization` |
//! | backend cancelled the transaction | `Backend(TransactionCanceled)`, with `conditional_check_failed` when a condition failed |
//! | response does not line up with request | `Reconciliation` |

use serde::Serialize;

use crate::{
    backend::BackendClient,
    batch::ResultSink,
    classify::classify_result,
    codec,
    error::{ClassifiedError, GatewayResult},
    types::{
        ConsumedCapacity, ExpressionNames, ExpressionValues, Item, KeyNames, SearchKey, TableRef,
        TransactGetInput, TransactGetItem, TransactGetOutput, TransactWriteInput, TransactWriteItem,
    },
};

/// Maximum operations per transaction.
pub const MAX_TRANSACTION_ITEMS: usize = 25;

/// Keys to delete from one table, sharing one optional condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactDeleteGroup {
    /// Target table and key-name overrides.
    pub table: TableRef,
    /// Keys to delete.
    pub keys: Vec<SearchKey>,
    /// Condition every operation in the group must satisfy.
    pub condition_expression: Option<String>,
    /// `#name` placeholders used by the condition.
    pub expression_attribute_names: ExpressionNames,
    /// `:value` placeholders used by the condition.
    pub expression_attribute_values: ExpressionValues,
}

/// Items to put into one table, sharing one optional condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactPutGroup {
    /// Target table and key-name overrides.
    pub table: TableRef,
    /// Marshaled items to write.
    pub items: Vec<Item>,
    /// Condition every operation in the group must satisfy.
    pub condition_expression: Option<String>,
    /// `#name` placeholders used by the condition.
    pub expression_attribute_names: ExpressionNames,
    /// `:value` placeholders used by the condition.
    pub expression_attribute_values: ExpressionValues,
}

impl TransactPutGroup {
    /// Marshals `values` into an unconditional group for `table`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if any value fails to marshal.
    pub fn from_values<T: Serialize>(table: TableRef, values: &[T]) -> GatewayResult<Self> {
        let items = codec::to_items(values).map_err(|e| e.with_prefix("(Marshal Transaction Items)"))?;
        Ok(Self { table, items, ..Self::default() })
    }
}

/// One update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactUpdate {
    /// Target table and key-name overrides.
    pub table: TableRef,
    /// Item to update.
    pub key: SearchKey,
    /// `SET` / `REMOVE` clauses to apply.
    pub update_expression: String,
    /// Condition the item must satisfy.
    pub condition_expression: Option<String>,
    /// `#name` placeholders used by either expression.
    pub expression_attribute_names: ExpressionNames,
    /// `:value` placeholders used by either expression.
    pub expression_attribute_values: ExpressionValues,
}

/// The operations of one transactional write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionWrite {
    /// Sent first.
    pub deletes: Vec<TransactDeleteGroup>,
    /// Sent after the deletes.
    pub puts: Vec<TransactPutGroup>,
    /// Sent last.
    pub updates: Vec<TransactUpdate>,
    /// Idempotency token passed through to the backend.
    pub client_request_token: Option<String>,
}

impl TransactionWrite {
    /// Operations across all groups.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.deletes.iter().map(|g| g.keys.len()).sum::<usize>()
            + self.puts.iter().map(|g| g.items.len()).sum::<usize>()
            + self.updates.len()
    }
}

fn check_count(count: usize, what: &str) -> GatewayResult<()> {
    if count == 0 || count > MAX_TRANSACTION_ITEMS {
        return Err(ClassifiedError::precondition(format!(
            "({what}) transaction must contain between 1 and {MAX_TRANSACTION_ITEMS} operations, got {count}"
        )));
    }
    Ok(())
}

/// Flattens `write` into deletes, puts, then updates.
///
/// # Errors
///
/// Returns a precondition error for an empty or oversized transaction, or a
/// malformed key.
pub fn build_write(defaults: &KeyNames, write: TransactionWrite) -> GatewayResult<TransactWriteInput> {
    check_count(write.operation_count(), "TransactWriteItems")?;
    let prefix = |e: ClassifiedError| e.with_prefix("(TransactWriteItems)");

    let mut items = Vec::with_capacity(write.operation_count());
    for group in write.deletes {
        let names = group.table.resolve(defaults);
        for key in &group.keys {
            items.push(TransactWriteItem::Delete {
                table_name: names.table_name.clone(),
                key: names.key_for(key).map_err(prefix)?,
                condition_expression: group.condition_expression.clone(),
                expression_attribute_names: group.expression_attribute_names.clone(),
                expression_attribute_values: group.expression_attribute_values.clone(),
            });
        }
    }
    for group in write.puts {
        let names = group.table.resolve(defaults);
        for item in group.items {
            items.push(TransactWriteItem::Put {
                table_name: names.table_name.clone(),
                item,
                condition_expression: group.condition_expression.clone(),
                expression_attribute_names: group.expression_attribute_names.clone(),
                expression_attribute_values: group.expression_attribute_values.clone(),
            });
        }
    }
    for update in write.updates {
        let names = update.table.resolve(defaults);
        if update.update_expression.trim().is_empty() {
            return Err(ClassifiedError::precondition(
                "(TransactWriteItems) update expression is required",
            ));
        }
        items.push(TransactWriteItem::Update {
            key: names.key_for(&update.key).map_err(prefix)?,
            table_name: names.table_name,
            update_expression: update.update_expression,
            condition_expression: update.condition_expression,
            expression_attribute_names: update.expression_attribute_names,
            expression_attribute_values: update.expression_attribute_values,
        });
    }

    Ok(TransactWriteInput { items, client_request_token: write.client_request_token })
}

/// Sends a built transactional write.
///
/// # Errors
///
/// Returns the classified backend error; a cancellation caused by a failed
/// condition has [`conditional_check_failed`](ClassifiedError::conditional_check_failed) set.
pub async fn execute_write(client: &dyn BackendClient, input: TransactWriteInput) -> GatewayResult<()> {
    classify_result(client.transact_write_items(input).await, Some("TransactWriteItems"))
}

/// Keys to read from one table, and where to put the results.
pub struct TransactGetGroup<'a> {
    /// Source table and key-name overrides.
    pub table: TableRef,
    /// Keys to read, in order. Repeats are allowed.
    pub keys: Vec<SearchKey>,
    /// Attributes to return; `None` returns whole items.
    pub projection_expression: Option<String>,
    /// Receives the decoded items of this group.
    pub sink: &'a mut dyn ResultSink,
}

impl<'a> TransactGetGroup<'a> {
    /// A group reading `keys` from `table` into `sink`.
    pub fn new(table: TableRef, keys: Vec<SearchKey>, sink: &'a mut dyn ResultSink) -> Self {
        Self { table, keys, projection_expression: None, sink }
    }
}

/// A flattened transactional read and the key count each group contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetPlan {
    /// The flattened request.
    pub input: TransactGetInput,
    /// Keys contributed by each group, in group order.
    pub group_counts: Vec<usize>,
}

/// Result of a transactional read. Items were delivered into the sinks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactGetOutcome {
    /// Keys requested across all groups.
    pub requested: usize,
    /// Keys that matched an item.
    pub found: usize,
    /// Capacity reported by the backend.
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// Flattens `groups` into one keyed read, recording each group's key count.
///
/// # Errors
///
/// Returns a precondition error for an empty or oversized read, or a
/// malformed key.
pub fn build_get(defaults: &KeyNames, groups: &[TransactGetGroup<'_>]) -> GatewayResult<GetPlan> {
    let total = groups.iter().map(|g| g.keys.len()).sum();
    check_count(total, "TransactGetItems")?;

    let mut plan = GetPlan::default();
    for group in groups {
        let names = group.table.resolve(defaults);
        for key in &group.keys {
            plan.input.items.push(TransactGetItem {
                table_name: names.table_name.clone(),
                key: names.key_for(key).map_err(|e| e.with_prefix("(TransactGetItems)"))?,
                projection_expression: group.projection_expression.clone(),
                expression_attribute_names: ExpressionNames::new(),
            });
        }
        plan.group_counts.push(group.keys.len());
    }
    Ok(plan)
}

/// Slices `responses` back into `groups` by position.
///
/// Returns the number of items delivered; `None` responses (absent keys) are
/// skipped. Delivery is all or nothing: a decode failure anywhere leaves
/// every sink as it was.
///
/// # Errors
///
/// Returns a reconciliation error if the response length differs from the
/// planned key count, or a serialization error if an item does not decode.
pub fn distribute(
    groups: &mut [TransactGetGroup<'_>],
    group_counts: &[usize],
    responses: Vec<Option<Item>>,
) -> GatewayResult<usize> {
    let expected: usize = group_counts.iter().sum();
    if responses.len() != expected || groups.len() != group_counts.len() {
        return Err(ClassifiedError::reconciliation(format!(
            "(TransactGetItems) response count {} does not match request count {expected}",
            responses.len()
        )));
    }

    let marks: Vec<usize> = groups.iter().map(|g| g.sink.len()).collect();
    let mut responses = responses.into_iter();
    let mut found = 0;
    let mut failure = None;
    'groups: for (group, &count) in groups.iter_mut().zip(group_counts) {
        for item in responses.by_ref().take(count).flatten() {
            if let Err(err) = group.sink.push_item(item) {
                failure = Some(err);
                break 'groups;
            }
            found += 1;
        }
    }
    if let Some(err) = failure {
        for (group, &mark) in groups.iter_mut().zip(&marks) {
            group.sink.truncate(mark);
        }
        return Err(err.with_prefix("(Unmarshal Result Items)"));
    }
    Ok(found)
}

/// Sends a planned transactional read without distributing it.
///
/// # Errors
///
/// Returns the classified backend error.
pub async fn fetch_get(client: &dyn BackendClient, plan: &GetPlan) -> GatewayResult<TransactGetOutput> {
    classify_result(client.transact_get_items(plan.input.clone()).await, Some("TransactGetItems"))
}

/// Distributes a fetched response into `groups`.
///
/// # Errors
///
/// See [`distribute`].
pub fn deliver_get(
    plan: &GetPlan,
    groups: &mut [TransactGetGroup<'_>],
    output: TransactGetOutput,
) -> GatewayResult<TransactGetOutcome> {
    let found = distribute(groups, &plan.group_counts, output.responses)?;
    Ok(TransactGetOutcome {
        requested: plan.input.items.len(),
        found,
        consumed_capacity: output.consumed_capacity,
    })
}
