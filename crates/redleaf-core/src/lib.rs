//! Core domain model for RedLeaf draw tracking.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "redleaf-core";

/// Stream label used when neither a column nor a sub-heading names one.
pub const UNKNOWN_STREAM: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Draw,
    Summary,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Draw => "draw",
            RecordKind::Summary => "summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draw" => Some(RecordKind::Draw),
            "summary" => Some(RecordKind::Summary),
            _ => None,
        }
    }
}

/// A single named metric value. Serialized untagged so stored JSON stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl MetricValue {
    pub fn as_display(&self) -> String {
        match self {
            MetricValue::Integer(v) => v.to_string(),
            MetricValue::Text(v) => v.clone(),
            MetricValue::List(items) => items.join("; "),
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// Semantically meaningful fields of a record. Everything here feeds the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordContent {
    pub kind: RecordKind,
    pub year: i32,
    pub stream: String,
    pub date_issued: Option<NaiveDate>,
    pub metrics: Metrics,
}

/// Persisted draw or summary entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub content: RecordContent,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub notified_fingerprint: Option<String>,
}

impl Record {
    /// Draw records whose current fingerprint has not been fully delivered.
    pub fn is_eligible_for_notification(&self) -> bool {
        self.content.kind == RecordKind::Draw
            && self.notified_fingerprint.as_deref() != Some(self.fingerprint.as_str())
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.content.metrics.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Html,
    Json,
}

impl SourceFormat {
    /// Best-effort guess from a response content-type header.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("json") {
            SourceFormat::Json
        } else {
            SourceFormat::Html
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawOrigin {
    TableRow,
    List,
    JsonEntry,
}

/// Untyped extraction output. Discarded once normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub origin: RawOrigin,
    /// Normalized column label -> cell text.
    pub fields: BTreeMap<String, String>,
    /// List item text, in document order (list-derived records only).
    pub items: Vec<String>,
    pub section_heading: Option<String>,
    pub sub_heading: Option<String>,
}

impl RawRecord {
    pub fn new(origin: RawOrigin) -> Self {
        Self {
            origin,
            fields: BTreeMap::new(),
            items: Vec::new(),
            section_heading: None,
            sub_heading: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub opted_in: bool,
}

/// Latest scrape of the IRCC notices page: the inner HTML of its `<main>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeSnapshot {
    pub source_url: String,
    pub content: String,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    Inserted,
    Updated,
    Unchanged,
}

/// Counters accumulated over one run (or one source within a run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub fetched: usize,
    pub extracted: usize,
    pub normalized: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub emailed: usize,
    pub email_failed: usize,
    pub notified: usize,
}

impl SyncCounts {
    pub fn absorb(&mut self, other: &SyncCounts) {
        self.fetched += other.fetched;
        self.extracted += other.extracted;
        self.normalized += other.normalized;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.emailed += other.emailed;
        self.email_failed += other.email_failed;
        self.notified += other.notified;
    }

    pub fn record_action(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::Inserted => self.inserted += 1,
            ReconcileAction::Updated => self.updated += 1,
            ReconcileAction::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub source_id: String,
    #[serde(flatten)]
    pub counts: SyncCounts,
}

/// Result of one end-to-end sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub totals: SyncCounts,
    pub sources: Vec<SourceReport>,
}
