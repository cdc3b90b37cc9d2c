//! Core data models for the vectorization pipeline.
//!
//! A [`VectorizableRecord`] is a call transcript or an email message that
//! upstream ingestion wrote into the CRM store, pre-joined with the display
//! fields of its related contact, organization, and deal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of records that carry an embedding column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Call,
    Email,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Call, RecordKind::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Call => "call",
            RecordKind::Email => "email",
        }
    }

    /// The table holding records of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Call => "calls",
            RecordKind::Email => "emails",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" | "calls" => Ok(RecordKind::Call),
            "email" | "emails" => Ok(RecordKind::Email),
            other => Err(format!(
                "unknown record kind '{}': expected call or email",
                other
            )),
        }
    }
}

/// Unique address of a record across kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub id: String,
}

impl RecordKey {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Direction of an email relative to the CRM owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailDirection {
    Inbound,
    Outbound,
}

impl FromStr for EmailDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(EmailDirection::Inbound),
            "outbound" => Ok(EmailDirection::Outbound),
            other => Err(format!("unknown email direction '{}'", other)),
        }
    }
}

/// Related-entity attributes joined onto a record at selection time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordContext {
    /// Call title or email subject.
    pub subject: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub organization: Option<String>,
    pub deal: Option<String>,
    /// Only set for emails.
    pub direction: Option<EmailDirection>,
}

/// A record that may or may not have been vectorized yet.
///
/// `vector.is_some() == processed` holds for every record at rest.
#[derive(Debug, Clone)]
pub struct VectorizableRecord {
    pub key: RecordKey,
    /// Transcript or message body.
    pub primary_text: String,
    pub context: RecordContext,
    /// Call time or send time; `None` if the stored timestamp is out of range.
    pub occurred_at: Option<DateTime<Utc>>,
    pub vector: Option<Vec<f32>>,
    pub processed: bool,
}

/// Aggregate counts for one record kind, used for the end-of-run check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyCounts {
    pub total: i64,
    pub with_vector: i64,
    pub flagged: i64,
    /// Stored vectors whose length differs from the configured dimensionality.
    pub wrong_dims: i64,
}

impl ConsistencyCounts {
    /// Vector presence and the processed flag agree for every row.
    pub fn is_consistent(&self) -> bool {
        self.with_vector == self.flagged && self.wrong_dims == 0
    }

    /// Every row has a vector.
    pub fn is_complete(&self) -> bool {
        self.is_consistent() && self.total == self.with_vector
    }

    pub fn remaining(&self) -> i64 {
        self.total - self.with_vector
    }
}

impl std::ops::Add for ConsistencyCounts {
    type Output = ConsistencyCounts;

    fn add(self, rhs: Self) -> Self::Output {
        ConsistencyCounts {
            total: self.total + rhs.total,
            with_vector: self.with_vector + rhs.with_vector,
            flagged: self.flagged + rhs.flagged,
            wrong_dims: self.wrong_dims + rhs.wrong_dims,
        }
    }
}
