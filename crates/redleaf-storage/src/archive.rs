use std::path::PathBuf;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::fetch::FetchedPage;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

/// Content-addressed archive of fetched source pages, one directory per source and day.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn extension_for(content_type: &str) -> &'static str {
        let lower = content_type.to_ascii_lowercase();
        if lower.contains("json") {
            "json"
        } else if lower.contains("html") {
            "html"
        } else {
            "bin"
        }
    }

    pub fn relative_path_for(&self, source_id: &str, page: &FetchedPage, sha256: &str) -> PathBuf {
        PathBuf::from(source_id)
            .join(page.fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{sha256}.{}", Self::extension_for(&page.content_type)))
    }

    /// Writes the page body once per content hash; repeated identical pages are not rewritten.
    pub async fn archive(&self, source_id: &str, page: &FetchedPage) -> anyhow::Result<ArchivedPage> {
        let sha256 = Self::sha256_hex(&page.body);
        let relative_path = self.relative_path_for(source_id, page, &sha256);
        let absolute_path = self.root.join(&relative_path);
        let Some(parent) = absolute_path.parent() else {
            anyhow::bail!("archive path {} has no parent", absolute_path.display());
        };

        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let already_present = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !already_present {
            let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
            fs::write(&temp_path, &page.body)
                .await
                .with_context(|| format!("writing {}", temp_path.display()))?;
            if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!("moving archived page into {}", absolute_path.display())
                });
            }
        }

        Ok(ArchivedPage {
            sha256,
            relative_path,
            absolute_path,
            byte_size: page.body.len(),
            already_present,
        })
    }
}
