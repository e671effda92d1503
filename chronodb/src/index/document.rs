use serde_derive::{Deserialize, Serialize};

use crate::{Timestamp, TIMESTAMP_MAX};

/// One index document: an indexed value of a key on a branch, valid over
/// `[valid_from, valid_to)`. Documents are created open
/// (`valid_to = TIMESTAMP_MAX`), have their end set exactly once when a
/// later commit replaces or removes the value, and are immutable afterwards.
///
/// For a fixed `(branch, keyspace, key, index)`, the validity intervals of
/// distinct values never overlap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub branch: String,
    pub keyspace: String,
    pub key: String,
    pub index: String,
    pub value: String,
    #[serde(rename = "validFrom")]
    pub valid_from: Timestamp,
    #[serde(rename = "validTo")]
    pub valid_to: Timestamp,
}

impl Document {
    pub fn is_open(&self) -> bool {
        self.valid_to == TIMESTAMP_MAX
    }

    /// Whether the document is valid at `t`.
    pub fn valid_at(&self, t: Timestamp) -> bool {
        self.valid_from <= t && t < self.valid_to
    }
}

/// A predicate over indexed values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SearchCondition {
    Equals(String),
    NotEquals(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    In(Vec<String>),
}

impl SearchCondition {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            SearchCondition::Equals(want) => value == want,
            SearchCondition::NotEquals(want) => value != want,
            SearchCondition::Contains(infix) => value.contains(infix.as_str()),
            SearchCondition::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            SearchCondition::EndsWith(suffix) => value.ends_with(suffix.as_str()),
            SearchCondition::In(wanted) => wanted.iter().any(|want| want == value),
        }
    }
}

/// A search over one index: which index to consult and the value predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub index: String,
    pub condition: SearchCondition,
}

impl SearchSpec {
    pub fn new(index: impl Into<String>, condition: SearchCondition) -> Self {
        Self { index: index.into(), condition }
    }

    /// A stable key for caching query results.
    pub fn fingerprint(&self) -> String {
        format!("{}:{:?}", self.index, self.condition)
    }
}
