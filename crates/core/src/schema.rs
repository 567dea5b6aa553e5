//! Work record mapping.
//!
//! Every work kind is backed by its own table. Besides the kind-specific
//! payload columns described here, each table carries two implicit columns:
//!
//! - `work_id`: database-assigned, monotonically increasing; defines claim order
//! - `not_before`: the record is not claimable before this instant
//!
//! A kind may name one of its payload columns as the *group column*. Pending
//! records that share a group value are redundant: when one of them is
//! claimed, the others are discarded in the same transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::WorkId;

/// Name of the implicit ordering column.
pub const WORK_ID_COLUMN: &str = "work_id";

/// Name of the implicit eligibility column.
pub const NOT_BEFORE_COLUMN: &str = "not_before";

/// Storage type of a payload column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

/// A kind-specific payload column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl Column {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub const fn text(name: &'static str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub const fn timestamp(name: &'static str) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }
}

/// Static description of one work kind's table.
///
/// Declared once per kind as a `static`/`const`:
///
/// ```
/// use davq_core::{Column, WorkTable};
///
/// static PUSH: WorkTable = WorkTable::new("push_notification_work", &[Column::text("push_id")])
///     .grouped_by("push_id");
/// assert_eq!(PUSH.group_column(), Some("push_id"));
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorkTable {
    name: &'static str,
    columns: &'static [Column],
    group_column: Option<&'static str>,
}

impl WorkTable {
    pub const fn new(name: &'static str, columns: &'static [Column]) -> Self {
        Self {
            name,
            columns,
            group_column: None,
        }
    }

    /// Declare `column` as the coalescing group column.
    pub const fn grouped_by(mut self, column: &'static str) -> Self {
        self.group_column = Some(column);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn columns(&self) -> &'static [Column] {
        self.columns
    }

    pub fn group_column(&self) -> Option<&'static str> {
        self.group_column
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check that `fields` supplies exactly this table's payload columns,
    /// each with the declared type.
    pub fn validate(&self, fields: &WorkFields) -> QueueResult<()> {
        for (name, value) in fields.iter() {
            let column = self.column(name).ok_or_else(|| {
                QueueError::schema(format!("{} has no column {name}", self.name))
            })?;
            if value.column_type() != column.ty {
                return Err(QueueError::schema(format!(
                    "{}.{name} expects {}, got {}",
                    self.name,
                    column.ty.as_str(),
                    value.column_type().as_str()
                )));
            }
        }

        if let Some(missing) = self.columns.iter().find(|c| fields.get(c.name).is_none()) {
            return Err(QueueError::schema(format!(
                "{} requires column {}",
                self.name, missing.name
            )));
        }

        if let Some(group) = self.group_column {
            if self.column(group).is_none() {
                return Err(QueueError::schema(format!(
                    "{} groups by undeclared column {group}",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Integer(_) => ColumnType::Integer,
            FieldValue::Text(_) => ColumnType::Text,
            FieldValue::Timestamp(_) => ColumnType::Timestamp,
        }
    }
}

impl core::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Kind-specific payload of a work record, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkFields(BTreeMap<String, FieldValue>);

impl WorkFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.0.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A claimed (or inspected) row of a work table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: WorkId,
    pub not_before: DateTime<Utc>,
    pub fields: WorkFields,
}

impl WorkRecord {
    pub fn new(id: WorkId, not_before: DateTime<Utc>, fields: WorkFields) -> Self {
        Self {
            id,
            not_before,
            fields,
        }
    }

    /// Whether the record may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    /// The record's coalescing key, if its table declares a group column.
    pub fn group_key(&self, table: &WorkTable) -> Option<&FieldValue> {
        table.group_column().and_then(|c| self.fields.get(c))
    }

    pub fn integer(&self, table: &WorkTable, column: &str) -> QueueResult<i64> {
        match self.fields.get(column) {
            Some(FieldValue::Integer(v)) => Ok(*v),
            other => Err(field_mismatch(table, column, "integer", other)),
        }
    }

    pub fn text(&self, table: &WorkTable, column: &str) -> QueueResult<&str> {
        match self.fields.get(column) {
            Some(FieldValue::Text(v)) => Ok(v.as_str()),
            other => Err(field_mismatch(table, column, "text", other)),
        }
    }

    pub fn timestamp(&self, table: &WorkTable, column: &str) -> QueueResult<DateTime<Utc>> {
        match self.fields.get(column) {
            Some(FieldValue::Timestamp(v)) => Ok(*v),
            other => Err(field_mismatch(table, column, "timestamp", other)),
        }
    }
}

fn field_mismatch(
    table: &WorkTable,
    column: &str,
    expected: &str,
    found: Option<&FieldValue>,
) -> QueueError {
    match found {
        Some(value) => QueueError::decode(
            table.name(),
            format!(
                "column {column} is {}, expected {expected}",
                value.column_type().as_str()
            ),
        ),
        None => QueueError::decode(table.name(), format!("column {column} is missing")),
    }
}
