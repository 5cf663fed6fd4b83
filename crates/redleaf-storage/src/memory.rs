use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use redleaf_core::{NoticeSnapshot, Record, Subscriber};
use tokio::sync::Mutex;

use crate::store::{NoticeStore, RecordStore, StoreError, SubscriberStore};

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
    subscribers: Mutex<Vec<Subscriber>>,
    deliveries: Mutex<HashMap<(String, String), String>>,
    notice: Mutex<Option<NoticeSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscribers(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
            ..Self::default()
        }
    }

    pub async fn delivery_marker(&self, subscriber_id: &str, record_id: &str) -> Option<String> {
        self.deliveries
            .lock()
            .await
            .get(&(subscriber_id.to_string(), record_id.to_string()))
            .cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

pub(crate) fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.content
            .date_issued
            .cmp(&a.content.date_issued)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn insert_record(&self, record: &Record) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn update_content(&self, record: &Record) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::Missing(record.id.clone()))?;
        stored.content = record.content.clone();
        stored.fingerprint = record.fingerprint.clone();
        stored.updated_at = record.updated_at;
        Ok(())
    }

    async fn mark_notified(&self, id: &str, fingerprint: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let stored = records
            .get_mut(id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        if stored.fingerprint != fingerprint {
            return Ok(false);
        }
        stored.notified_fingerprint = Some(fingerprint.to_string());
        Ok(true)
    }

    async fn list_records(&self) -> Result<Vec<Record>, StoreError> {
        let mut records: Vec<Record> = self.records.lock().await.values().cloned().collect();
        sort_newest_first(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn list_opted_in_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self
            .subscribers
            .lock()
            .await
            .iter()
            .filter(|s| s.opted_in)
            .cloned()
            .collect())
    }

    async fn delivered_subscriber_ids(
        &self,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .deliveries
            .lock()
            .await
            .iter()
            .filter(|(key, fp)| key.1 == record_id && fp.as_str() == fingerprint)
            .map(|(key, _)| key.0.clone())
            .collect())
    }

    async fn record_delivery(
        &self,
        subscriber_id: &str,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        self.deliveries.lock().await.insert(
            (subscriber_id.to_string(), record_id.to_string()),
            fingerprint.to_string(),
        );
        Ok(())
    }
}

#[async_trait]
impl NoticeStore for MemoryStore {
    async fn save_latest_notice(&self, notice: &NoticeSnapshot) -> Result<(), StoreError> {
        *self.notice.lock().await = Some(notice.clone());
        Ok(())
    }

    async fn latest_notice(&self) -> Result<Option<NoticeSnapshot>, StoreError> {
        Ok(self.notice.lock().await.clone())
    }
}
