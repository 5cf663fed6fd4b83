use std::collections::HashSet;

use async_trait::async_trait;
use redleaf_core::{NoticeSnapshot, Record, Subscriber};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("record {0} not found")]
    Missing(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Keyed document store for normalized records. Implementations never delete.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, id: &str) -> Result<Option<Record>, StoreError>;

    /// Create-if-absent. Returns `false` when a record with the same id already exists.
    async fn insert_record(&self, record: &Record) -> Result<bool, StoreError>;

    /// Overwrites content, fingerprint and `updated_at`. `created_at` and
    /// `notified_fingerprint` are left as stored.
    async fn update_content(&self, record: &Record) -> Result<(), StoreError>;

    /// Sets `notified_fingerprint` only while the stored fingerprint equals `fingerprint`.
    async fn mark_notified(&self, id: &str, fingerprint: &str) -> Result<bool, StoreError>;

    /// All records, newest issue date first.
    async fn list_records(&self) -> Result<Vec<Record>, StoreError>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn list_opted_in_subscribers(&self) -> Result<Vec<Subscriber>, StoreError>;

    /// Subscribers whose delivery marker for `record_id` already equals `fingerprint`.
    async fn delivered_subscriber_ids(
        &self,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<HashSet<String>, StoreError>;

    async fn record_delivery(
        &self,
        subscriber_id: &str,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError>;
}

/// Single-slot store for the notices page; each save replaces the previous one.
#[async_trait]
pub trait NoticeStore: Send + Sync {
    async fn save_latest_notice(&self, notice: &NoticeSnapshot) -> Result<(), StoreError>;

    async fn latest_notice(&self) -> Result<Option<NoticeSnapshot>, StoreError>;
}
