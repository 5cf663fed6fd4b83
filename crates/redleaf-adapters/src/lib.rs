//! Source adapters: section-aware extraction, record normalization and the
//! notices page cut.

use redleaf_core::{RecordContent, SourceFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub mod extract;
pub mod normalize;
pub mod notices;
pub mod text;

pub use extract::{extract, Extraction, ExtractorConfig};
pub use normalize::{
    normalize, parse_count, parse_issue_date, NormalizeContext, INVITATIONS_ISSUED, SCORE_RANGE,
    SUMMARY_ITEMS,
};
pub use notices::main_content;

pub const CRATE_NAME: &str = "redleaf-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn default_section_heading() -> String {
    "h2".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    /// Short program label for alert subjects ("OINP"). Falls back to `display_name`.
    #[serde(default)]
    pub short_name: Option<String>,
    pub enabled: bool,
    pub url: String,
    /// Inferred from the response content type when absent.
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default = "default_section_heading")]
    pub section_heading: String,
    #[serde(default)]
    pub section_heading_contains: Option<String>,
    #[serde(default)]
    pub json_records_key: Option<String>,
    /// Prefix for record ids, so programs sharing a store never collide.
    #[serde(default)]
    pub id_namespace: Option<String>,
}

impl SourceConfig {
    pub fn program_label(&self) -> &str {
        self.short_name.as_deref().unwrap_or(&self.display_name)
    }

    pub fn adapter(&self) -> Result<SourceAdapter, AdapterError> {
        let level = self
            .section_heading
            .trim()
            .to_ascii_lowercase()
            .strip_prefix('h')
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=6).contains(n))
            .ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {}: section_heading must be h1..h6, got {:?}",
                    self.source_id, self.section_heading
                ))
            })?;
        Ok(SourceAdapter {
            source_id: self.source_id.clone(),
            format: self.format,
            extractor: ExtractorConfig {
                section_level: level,
                section_heading_contains: self.section_heading_contains.clone(),
                json_records_key: self.json_records_key.clone(),
            },
            context: NormalizeContext::default(),
        })
    }
}

/// Outcome of parsing one fetched page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub extracted: usize,
    pub skipped: usize,
    pub records: Vec<RecordContent>,
}

/// Extract + normalize for one configured source.
#[derive(Debug, Clone)]
pub struct SourceAdapter {
    source_id: String,
    format: Option<SourceFormat>,
    extractor: ExtractorConfig,
    context: NormalizeContext,
}

impl SourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        format: Option<SourceFormat>,
        extractor: ExtractorConfig,
        context: NormalizeContext,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            format,
            extractor,
            context,
        }
    }

    pub fn format_for(&self, content_type: &str) -> SourceFormat {
        self.format
            .unwrap_or_else(|| SourceFormat::from_content_type(content_type))
    }

    pub fn parse(&self, content: &str, content_type: &str) -> Result<ParsedPage, AdapterError> {
        let extraction = extract(content, self.format_for(content_type), &self.extractor)?;
        let mut page = ParsedPage {
            extracted: extraction.records.len(),
            skipped: extraction.skipped,
            records: Vec::with_capacity(extraction.records.len()),
        };
        for raw in &extraction.records {
            match normalize(raw, &self.context) {
                Some(content) => page.records.push(content),
                None => {
                    debug!(source_id = %self.source_id, fields = ?raw.fields, "raw record dropped by normalizer");
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redleaf_core::{MetricValue, RecordKind};

    const REGISTRY: &str = r#"
sources:
  - source_id: oinp
    display_name: Ontario Immigrant Nominee Program
    enabled: true
    url: https://www.ontario.ca/page/ontario-immigrant-nominee-program-oinp-invitations-apply
    format: html
    section_heading_contains: Invitations to apply issued in
  - source_id: express-entry
    display_name: Express Entry
    enabled: false
    url: https://www.canada.ca/content/dam/ircc/documents/json/ee_rounds_123_en.json
    json_records_key: rounds
    id_namespace: ee
"#;

    #[test]
    fn registry_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);

        let oinp = &registry.sources[0];
        assert_eq!(oinp.format, Some(SourceFormat::Html));
        assert_eq!(oinp.section_heading, "h2");

        let ee = &registry.sources[1];
        assert_eq!(ee.format, None);
        assert_eq!(ee.id_namespace.as_deref(), Some("ee"));
    }

    #[test]
    fn bad_heading_level_is_rejected() {
        let mut registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        registry.sources[0].section_heading = "h9".into();
        assert!(matches!(registry.sources[0].adapter(), Err(AdapterError::Message(_))));
    }

    #[test]
    fn adapter_parses_and_counts_drops() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        let adapter = registry.sources[0].adapter().unwrap();
        let html = r#"
            <h2>Invitations to apply issued in 2025</h2>
            <table>
              <thead><tr><th>Date issued</th><th>Stream</th><th>Score range</th><th>Invitations issued</th></tr></thead>
              <tbody>
                <tr><td>June 6, 2025</td><td>In-Demand Skills</td><td>470-480</td><td>600</td></tr>
                <tr><td>TBD</td><td>In-Demand Skills</td><td>-</td><td>10</td></tr>
                <tr><td>June 1, 2025</td><td>In-Demand Skills</td></tr>
              </tbody>
            </table>"#;
        let page = adapter.parse(html, "text/html").unwrap();
        assert_eq!(page.extracted, 2);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].kind, RecordKind::Draw);
        assert_eq!(page.records[0].metrics[INVITATIONS_ISSUED], MetricValue::Integer(600));
    }

    #[test]
    fn format_follows_content_type_when_unset() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        let adapter = registry.sources[1].adapter().unwrap();
        assert_eq!(adapter.format_for("application/json"), SourceFormat::Json);
        assert_eq!(adapter.format_for("text/html"), SourceFormat::Html);
    }
}
