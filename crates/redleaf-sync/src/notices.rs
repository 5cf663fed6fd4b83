//! Latest-snapshot scrape of the IRCC notices page.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redleaf_adapters::{main_content, AdapterError};
use redleaf_core::NoticeSnapshot;
use redleaf_storage::{FetchError, Fetcher, NoticeStore, StoreError};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const DEFAULT_NOTICES_URL: &str =
    "https://www.canada.ca/en/immigration-refugees-citizenship/news/notices.html";

#[derive(Debug, Error)]
pub enum NoticeError {
    #[error("notices are not configured")]
    NotConfigured,
    #[error("fetching notices: {0}")]
    Fetch(#[from] FetchError),
    #[error("fetching notices: no response within {0:?}")]
    FetchTimeout(Duration),
    #[error("no content found inside <main> on {url}")]
    NoContent { url: String },
    #[error("reading notices page: {0}")]
    Extract(#[from] AdapterError),
    #[error("storing notices: {0}")]
    Store(#[from] StoreError),
}

impl NoticeError {
    /// Upstream could not be reached.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, NoticeError::Fetch(_) | NoticeError::FetchTimeout(_))
    }
}

#[derive(Clone)]
pub struct NoticeScraper {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn NoticeStore>,
    url: String,
    deadline: Duration,
}

impl NoticeScraper {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn NoticeStore>,
        url: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            url: url.into(),
            deadline,
        }
    }

    /// Fetches the page, keeps its `<main>` and replaces the stored snapshot.
    /// Nothing is stored when the page has no usable `<main>`.
    pub async fn scrape(&self) -> Result<NoticeSnapshot, NoticeError> {
        self.scrape_inner()
            .instrument(info_span!("notices_scrape", url = %self.url))
            .await
    }

    async fn scrape_inner(&self) -> Result<NoticeSnapshot, NoticeError> {
        let page = tokio::time::timeout(self.deadline, self.fetcher.fetch(&self.url))
            .await
            .map_err(|_| NoticeError::FetchTimeout(self.deadline))??;
        let content = main_content(&page.text())?.ok_or_else(|| NoticeError::NoContent {
            url: page.url.clone(),
        })?;
        let snapshot = NoticeSnapshot {
            source_url: self.url.clone(),
            content,
            scraped_at: Utc::now(),
        };
        self.store.save_latest_notice(&snapshot).await?;
        info!(bytes = snapshot.content.len(), "notices snapshot saved");
        Ok(snapshot)
    }

    pub async fn latest(&self) -> Result<Option<NoticeSnapshot>, NoticeError> {
        Ok(self.store.latest_notice().await?)
    }
}
