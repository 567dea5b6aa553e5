//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Database-assigned identifier of a work record.
///
/// Ids are monotonically increasing per table and define claim order:
/// among eligible records the lowest id is claimed first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(i64);

impl WorkId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for WorkId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for WorkId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<WorkId> for i64 {
    fn from(value: WorkId) -> Self {
        value.0
    }
}

impl FromStr for WorkId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| QueueError::schema(format!("WorkId: {e}")))
    }
}
