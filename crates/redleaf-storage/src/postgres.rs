use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use redleaf_core::{Metrics, NoticeSnapshot, Record, RecordContent, RecordKind, Subscriber};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::store::{NoticeStore, RecordStore, StoreError, SubscriberStore};

const RECORD_COLUMNS: &str = "id, kind, year, stream, date_issued, metrics, fingerprint, \
                              created_at, updated_at, notified_fingerprint";

/// Postgres-backed record, subscriber and notices store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<Record, StoreError> {
    let id: String = row.try_get("id")?;
    let kind_text: String = row.try_get("kind")?;
    let kind = RecordKind::parse(&kind_text).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("unknown kind {kind_text:?}"),
    })?;
    let metrics: Json<Metrics> = row.try_get("metrics")?;
    Ok(Record {
        content: RecordContent {
            kind,
            year: row.try_get("year")?,
            stream: row.try_get("stream")?,
            date_issued: row.try_get("date_issued")?,
            metrics: metrics.0,
        },
        fingerprint: row.try_get("fingerprint")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        notified_fingerprint: row.try_get("notified_fingerprint")?,
        id,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get_record(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_record(&self, record: &Record) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (id, kind, year, stream, date_issued, metrics, fingerprint,
                                 created_at, updated_at, notified_fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.content.kind.as_str())
        .bind(record.content.year)
        .bind(&record.content.stream)
        .bind(record.content.date_issued)
        .bind(Json(&record.content.metrics))
        .bind(&record.fingerprint)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.notified_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_content(&self, record: &Record) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE records
               SET kind = $2,
                   year = $3,
                   stream = $4,
                   date_issued = $5,
                   metrics = $6,
                   fingerprint = $7,
                   updated_at = $8
             WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(record.content.kind.as_str())
        .bind(record.content.year)
        .bind(&record.content.stream)
        .bind(record.content.date_issued)
        .bind(Json(&record.content.metrics))
        .bind(&record.fingerprint)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(record.id.clone()));
        }
        Ok(())
    }

    async fn mark_notified(&self, id: &str, fingerprint: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE records
               SET notified_fingerprint = $2
             WHERE id = $1
               AND fingerprint = $2
            "#,
        )
        .bind(id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_records(&self) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records ORDER BY date_issued DESC NULLS LAST, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl SubscriberStore for PgStore {
    async fn list_opted_in_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, full_name, opted_in
              FROM subscribers
             WHERE opted_in
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Subscriber {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                full_name: row.try_get("full_name")?,
                opted_in: row.try_get("opted_in")?,
            });
        }
        Ok(out)
    }

    async fn delivered_subscriber_ids(
        &self,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT subscriber_id
              FROM subscriber_deliveries
             WHERE record_id = $1
               AND fingerprint = $2
            "#,
        )
        .bind(record_id)
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("subscriber_id")?);
        }
        Ok(out)
    }

    async fn record_delivery(
        &self,
        subscriber_id: &str,
        record_id: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriber_deliveries (subscriber_id, record_id, fingerprint, delivered_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (subscriber_id, record_id)
            DO UPDATE SET fingerprint = EXCLUDED.fingerprint,
                          delivered_at = EXCLUDED.delivered_at
            "#,
        )
        .bind(subscriber_id)
        .bind(record_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NoticeStore for PgStore {
    async fn save_latest_notice(&self, notice: &NoticeSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notices (slot, source_url, content, scraped_at)
            VALUES ('latest', $1, $2, $3)
            ON CONFLICT (slot)
            DO UPDATE SET source_url = EXCLUDED.source_url,
                          content = EXCLUDED.content,
                          scraped_at = EXCLUDED.scraped_at
            "#,
        )
        .bind(&notice.source_url)
        .bind(&notice.content)
        .bind(notice.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_notice(&self) -> Result<Option<NoticeSnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT source_url, content, scraped_at FROM notices WHERE slot = 'latest'",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(NoticeSnapshot {
            source_url: row.try_get("source_url")?,
            content: row.try_get("content")?,
            scraped_at: row.try_get("scraped_at")?,
        }))
    }
}
