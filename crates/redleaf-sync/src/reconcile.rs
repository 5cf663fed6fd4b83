use std::sync::Arc;

use chrono::Utc;
use redleaf_core::{ReconcileAction, Record, RecordContent};
use redleaf_storage::{RecordStore, StoreError};
use tracing::debug;

use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: ReconcileAction,
    pub stored: Record,
}

/// Insert / update / no-op against the record store. Never deletes.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        identity: Identity,
        content: RecordContent,
    ) -> Result<ReconcileOutcome, StoreError> {
        let now = Utc::now();
        let existing = match self.store.get_record(&identity.id).await? {
            Some(existing) => existing,
            None => {
                let record = Record {
                    id: identity.id.clone(),
                    content: content.clone(),
                    fingerprint: identity.fingerprint.clone(),
                    created_at: now,
                    updated_at: now,
                    notified_fingerprint: None,
                };
                if self.store.insert_record(&record).await? {
                    return Ok(ReconcileOutcome {
                        action: ReconcileAction::Inserted,
                        stored: record,
                    });
                }
                debug!(id = %identity.id, "lost insert race; treating as existing");
                self.store
                    .get_record(&identity.id)
                    .await?
                    .ok_or_else(|| StoreError::Missing(identity.id.clone()))?
            }
        };

        if existing.fingerprint == identity.fingerprint {
            return Ok(ReconcileOutcome {
                action: ReconcileAction::Unchanged,
                stored: existing,
            });
        }

        let updated = Record {
            content,
            fingerprint: identity.fingerprint,
            updated_at: now,
            ..existing
        };
        self.store.update_content(&updated).await?;
        Ok(ReconcileOutcome {
            action: ReconcileAction::Updated,
            stored: updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::assign_identity;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use redleaf_core::{MetricValue, Metrics, RecordKind};
    use redleaf_storage::MemoryStore;

    fn content(invitations: i64) -> RecordContent {
        RecordContent {
            kind: RecordKind::Draw,
            year: 2025,
            stream: "In-Demand Skills".into(),
            date_issued: NaiveDate::from_ymd_opt(2025, 6, 6),
            metrics: Metrics::from([(
                "invitationsIssued".to_string(),
                MetricValue::Integer(invitations),
            )]),
        }
    }

    fn reconcile_args(invitations: i64) -> (Identity, RecordContent) {
        let c = content(invitations);
        (assign_identity(&c, None), c)
    }

    #[tokio::test]
    async fn insert_then_unchanged_then_updated() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());

        let (identity, c) = reconcile_args(600);
        let first = reconciler.reconcile(identity.clone(), c.clone()).await.unwrap();
        assert_eq!(first.action, ReconcileAction::Inserted);
        assert_eq!(first.stored.created_at, first.stored.updated_at);
        assert!(first.stored.notified_fingerprint.is_none());

        let second = reconciler.reconcile(identity, c).await.unwrap();
        assert_eq!(second.action, ReconcileAction::Unchanged);
        assert_eq!(second.stored, first.stored);

        store.mark_notified(&first.stored.id, &first.stored.fingerprint).await.unwrap();

        let (identity, c) = reconcile_args(650);
        let third = reconciler.reconcile(identity, c).await.unwrap();
        assert_eq!(third.action, ReconcileAction::Updated);
        assert_eq!(third.stored.created_at, first.stored.created_at);
        assert_eq!(
            third.stored.notified_fingerprint.as_deref(),
            Some(first.stored.fingerprint.as_str())
        );
        assert!(third.stored.is_eligible_for_notification());
        assert_eq!(store.record_count().await, 1);
    }

    /// Reports "absent" on the first lookup, as if another writer inserted in between.
    struct RacingStore {
        inner: MemoryStore,
        first_lookup: tokio::sync::Mutex<bool>,
    }

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn get_record(&self, id: &str) -> Result<Option<Record>, StoreError> {
            let mut first = self.first_lookup.lock().await;
            if *first {
                *first = false;
                return Ok(None);
            }
            self.inner.get_record(id).await
        }
        async fn insert_record(&self, record: &Record) -> Result<bool, StoreError> {
            self.inner.insert_record(record).await
        }
        async fn update_content(&self, record: &Record) -> Result<(), StoreError> {
            self.inner.update_content(record).await
        }
        async fn mark_notified(&self, id: &str, fingerprint: &str) -> Result<bool, StoreError> {
            self.inner.mark_notified(id, fingerprint).await
        }
        async fn list_records(&self) -> Result<Vec<Record>, StoreError> {
            self.inner.list_records().await
        }
    }

    #[tokio::test]
    async fn lost_insert_race_continues_as_found() {
        let (identity, c) = reconcile_args(600);
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            first_lookup: tokio::sync::Mutex::new(true),
        });
        let winner = Reconciler::new(Arc::new(MemoryStore::new()))
            .reconcile(identity.clone(), c.clone())
            .await
            .unwrap()
            .stored;
        store.inner.insert_record(&winner).await.unwrap();

        let outcome = Reconciler::new(store).reconcile(identity, c).await.unwrap();
        assert_eq!(outcome.action, ReconcileAction::Unchanged);
        assert_eq!(outcome.stored.created_at, winner.created_at);
    }
}
