//! The expression subset understood by [`MemoryClient`](super::MemoryClient).
//!
//! Conditions are `AND`-joined clauses over top-level attributes:
//!
//! | Clause | Example |
//! |--------|---------|
//! | existence | `attribute_exists(#pk)`, `attribute_not_exists(PK)` |
//! | prefix | `begins_with(SK, :prefix)` |
//! | comparison | `status = :s`, `age >= :min`, `kind <> :k` |
//!
//! Updates are `SET a = :v, b = :w` and `REMOVE c, d` sections in any
//! order. Anything else is rejected with a validation error, the same way
//! the real service rejects malformed expressions.

use std::{cmp::Ordering, collections::BTreeSet};

use crate::{
    error::{BackendError, ErrorCode},
    types::{AttributeValue, ExpressionNames, ExpressionValues, Item},
};

fn invalid(message: impl Into<String>) -> BackendError {
    BackendError::service(ErrorCode::Validation, message)
}

/// Placeholder resolution for one request.
#[derive(Debug, Clone, Copy)]
pub(super) struct Placeholders<'a> {
    pub names: &'a ExpressionNames,
    pub values: &'a ExpressionValues,
}

impl Placeholders<'_> {
    fn name(&self, token: &str) -> Result<String, BackendError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid("empty attribute name in expression"));
        }
        if token.starts_with('#') {
            return self.names.get(token).cloned().ok_or_else(|| {
                invalid(format!("An expression attribute name used in the document path is not defined; attribute name: {token}"))
            });
        }
        Ok(token.to_owned())
    }

    fn value(&self, token: &str) -> Result<AttributeValue, BackendError> {
        let token = token.trim();
        if !token.starts_with(':') {
            return Err(invalid(format!("expected a value placeholder, got {token:?}")));
        }
        self.values.get(token).cloned().ok_or_else(|| {
            invalid(format!("An expression attribute value used in expression is not defined; attribute value: {token}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

// Two-character operators first so `<=` is not read as `<`.
const COMPARATORS: [(&str, Comparator); 6] = [
    ("<=", Comparator::Le),
    (">=", Comparator::Ge),
    ("<>", Comparator::Ne),
    ("=", Comparator::Eq),
    ("<", Comparator::Lt),
    (">", Comparator::Gt),
];

/// One clause of a condition.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Clause {
    Exists(String),
    NotExists(String),
    BeginsWith(String, AttributeValue),
    Compare(String, Comparator, AttributeValue),
}

impl Clause {
    /// Attribute the clause tests.
    pub fn attribute(&self) -> &str {
        match self {
            Self::Exists(name)
            | Self::NotExists(name)
            | Self::BeginsWith(name, _)
            | Self::Compare(name, ..) => name,
        }
    }

    /// Evaluates against `item`; `None` is an absent item.
    pub fn matches(&self, item: Option<&Item>) -> bool {
        let attr = item.and_then(|i| i.get(self.attribute()));
        match self {
            Self::Exists(_) => attr.is_some(),
            Self::NotExists(_) => attr.is_none(),
            Self::BeginsWith(_, prefix) => match (attr, prefix) {
                (Some(AttributeValue::S(s)), AttributeValue::S(p)) => s.starts_with(p.as_str()),
                _ => false,
            },
            Self::Compare(_, op, expected) => attr.is_some_and(|actual| compare(actual, *op, expected)),
        }
    }
}

fn compare(actual: &AttributeValue, op: Comparator, expected: &AttributeValue) -> bool {
    let ordering = match (actual, expected) {
        (AttributeValue::S(a), AttributeValue::S(b)) => Some(a.cmp(b)),
        (AttributeValue::N(a), AttributeValue::N(b)) => {
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => None,
            }
        },
        _ => None,
    };
    match op {
        Comparator::Eq => ordering.map_or(actual == expected, |o| o == Ordering::Equal),
        Comparator::Ne => ordering.map_or(actual != expected, |o| o != Ordering::Equal),
        Comparator::Lt => ordering == Some(Ordering::Less),
        Comparator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        Comparator::Gt => ordering == Some(Ordering::Greater),
        Comparator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn call_args<'e>(clause: &'e str, function: &str) -> Option<&'e str> {
    clause.strip_prefix(function)?.trim_start().strip_prefix('(')?.strip_suffix(')')
}

fn split_and(expr: &str) -> impl Iterator<Item = &str> {
    expr.split(" AND ").flat_map(|part| part.split(" and ")).map(str::trim)
}

/// Parses a condition, filter or key-condition expression.
pub(super) fn parse_condition(
    expr: &str,
    placeholders: Placeholders<'_>,
) -> Result<Vec<Clause>, BackendError> {
    split_and(expr).map(|clause| parse_clause(clause, placeholders)).collect()
}

fn parse_clause(clause: &str, p: Placeholders<'_>) -> Result<Clause, BackendError> {
    if let Some(args) = call_args(clause, "attribute_exists") {
        return Ok(Clause::Exists(p.name(args)?));
    }
    if let Some(args) = call_args(clause, "attribute_not_exists") {
        return Ok(Clause::NotExists(p.name(args)?));
    }
    if let Some(args) = call_args(clause, "begins_with") {
        let (name, value) = args
            .split_once(',')
            .ok_or_else(|| invalid(format!("begins_with takes two arguments: {clause:?}")))?;
        return Ok(Clause::BeginsWith(p.name(name)?, p.value(value)?));
    }
    for (symbol, op) in COMPARATORS {
        if let Some((name, value)) = clause.split_once(symbol) {
            return Ok(Clause::Compare(p.name(name)?, op, p.value(value)?));
        }
    }
    Err(invalid(format!("unsupported expression clause: {clause:?}")))
}

/// Evaluates an optional condition; no condition always holds.
pub(super) fn condition_holds(
    expr: Option<&str>,
    placeholders: Placeholders<'_>,
    item: Option<&Item>,
) -> Result<bool, BackendError> {
    match expr {
        None => Ok(true),
        Some(expr) => {
            Ok(parse_condition(expr, placeholders)?.iter().all(|clause| clause.matches(item)))
        },
    }
}

/// One action of an update expression.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum UpdateAction {
    Set(String, AttributeValue),
    Remove(String),
}

/// Parses `SET` / `REMOVE` sections.
pub(super) fn parse_update(
    expr: &str,
    placeholders: Placeholders<'_>,
) -> Result<Vec<UpdateAction>, BackendError> {
    let mut sections: Vec<(String, String)> = Vec::new();
    for token in expr.split_whitespace() {
        let upper = token.to_ascii_uppercase();
        if upper == "SET" || upper == "REMOVE" {
            sections.push((upper, String::new()));
            continue;
        }
        let (_, body) = sections
            .last_mut()
            .ok_or_else(|| invalid(format!("update expression must start with SET or REMOVE: {expr:?}")))?;
        body.push(' ');
        body.push_str(token);
    }
    if sections.is_empty() {
        return Err(invalid("update expression is empty"));
    }

    let mut actions = Vec::new();
    for (keyword, body) in sections {
        for part in body.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let action = if keyword == "SET" {
                let (name, value) = part
                    .split_once('=')
                    .ok_or_else(|| invalid(format!("SET action needs `name = :value`: {part:?}")))?;
                UpdateAction::Set(placeholders.name(name)?, placeholders.value(value)?)
            } else {
                UpdateAction::Remove(placeholders.name(part)?)
            };
            actions.push(action);
        }
    }
    Ok(actions)
}

/// Keeps only the attributes named by a projection expression.
pub(super) fn project(
    item: Item,
    projection: Option<&str>,
    names: &ExpressionNames,
) -> Result<Item, BackendError> {
    let Some(projection) = projection else {
        return Ok(item);
    };
    let empty = ExpressionValues::new();
    let placeholders = Placeholders { names, values: &empty };
    let wanted = projection
        .split(',')
        .map(|name| placeholders.name(name))
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(item.into_iter().filter(|(name, _)| wanted.contains(name)).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn values() -> ExpressionValues {
        ExpressionValues::from([
            (":pk".to_owned(), AttributeValue::S("user#1".into())),
            (":prefix".to_owned(), AttributeValue::S("order#".into())),
            (":min".to_owned(), AttributeValue::N("10".into())),
        ])
    }

    fn names() -> ExpressionNames {
        ExpressionNames::from([("#pk".to_owned(), "PK".to_owned())])
    }

    fn item() -> Item {
        Item::from([
            ("PK".to_owned(), AttributeValue::S("user#1".into())),
            ("SK".to_owned(), AttributeValue::S("order#9".into())),
            ("total".to_owned(), AttributeValue::N("12".into())),
        ])
    }

    #[test]
    fn test_key_condition_with_prefix() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        let clauses = parse_condition("#pk = :pk AND begins_with(SK, :prefix)", p).unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].attribute(), "PK");
        assert!(clauses.iter().all(|c| c.matches(Some(&item()))));
    }

    #[test]
    fn test_numeric_comparison() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        assert!(condition_holds(Some("total >= :min"), p, Some(&item())).unwrap());
        assert!(!condition_holds(Some("total < :min"), p, Some(&item())).unwrap());
    }

    #[test]
    fn test_existence_against_absent_item() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        assert!(condition_holds(Some("attribute_not_exists(#pk)"), p, None).unwrap());
        assert!(!condition_holds(Some("attribute_exists(#pk)"), p, None).unwrap());
    }

    #[test]
    fn test_undefined_placeholder_rejected() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        let err = parse_condition("#missing = :pk", p).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Validation));
    }

    #[test]
    fn test_update_sections() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        let actions = parse_update("SET total = :min, status = :prefix REMOVE note, tmp", p).unwrap();
        assert_eq!(actions, vec![
            UpdateAction::Set("total".into(), AttributeValue::N("10".into())),
            UpdateAction::Set("status".into(), AttributeValue::S("order#".into())),
            UpdateAction::Remove("note".into()),
            UpdateAction::Remove("tmp".into()),
        ]);
    }

    #[test]
    fn test_update_requires_keyword() {
        let (names, values) = (names(), values());
        let p = Placeholders { names: &names, values: &values };
        assert!(parse_update("total = :min", p).is_err());
    }

    #[test]
    fn test_projection() {
        let projected = project(item(), Some("#pk, total"), &names()).unwrap();
        assert_eq!(projected.keys().collect::<Vec<_>>(), vec!["PK", "total"]);
    }
}
