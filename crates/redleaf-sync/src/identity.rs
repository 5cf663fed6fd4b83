//! Stable record ids and content fingerprints.

use redleaf_core::{RecordContent, RecordKind};
use serde_json::json;
use sha2::{Digest, Sha256};

const CONTENT_HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub fingerprint: String,
}

/// Lowercase; alphanumerics and `-` kept; any other run becomes one `_`.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() || ch == '-' {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

fn canonical_json(content: &RecordContent) -> String {
    json!({
        "kind": content.kind,
        "year": content.year,
        "stream": content.stream,
        "dateIssued": content.date_issued,
        "metrics": content.metrics,
    })
    .to_string()
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// SHA-256 over the semantic fields only. Bookkeeping never participates.
pub fn fingerprint(content: &RecordContent) -> String {
    sha256_hex(&canonical_json(content))
}

fn base_id(content: &RecordContent, fingerprint: &str) -> String {
    match content.date_issued {
        Some(date) => {
            let key = format!("{}_{}_{}", content.year, slug(&content.stream), date.format("%Y-%m-%d"));
            match content.kind {
                RecordKind::Draw => key,
                other => format!("{}_{key}", other.as_str()),
            }
        }
        None => {
            // The fingerprint already covers every field; salt keeps kinds apart.
            let salted = sha256_hex(&format!("{}|{}|{fingerprint}", content.kind.as_str(), content.year));
            format!(
                "{}_{}_{}",
                content.kind.as_str(),
                content.year,
                &salted[..CONTENT_HASH_PREFIX_LEN]
            )
        }
    }
}

pub fn assign_identity(content: &RecordContent, namespace: Option<&str>) -> Identity {
    let fingerprint = fingerprint(content);
    let id = base_id(content, &fingerprint);
    let id = match namespace.map(slug) {
        Some(ns) => format!("{ns}_{id}"),
        None => id,
    };
    Identity { id, fingerprint }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use redleaf_core::{MetricValue, Metrics};

    fn in_demand_skills() -> RecordContent {
        RecordContent {
            kind: RecordKind::Draw,
            year: 2025,
            stream: "In-Demand Skills".into(),
            date_issued: NaiveDate::from_ymd_opt(2025, 6, 6),
            metrics: Metrics::from([
                ("scoreRange".to_string(), MetricValue::Text("470-480".into())),
                ("invitationsIssued".to_string(), MetricValue::Integer(600)),
            ]),
        }
    }

    #[test]
    fn draw_id_is_the_composite_key() {
        let identity = assign_identity(&in_demand_skills(), None);
        assert_eq!(identity.id, "2025_in-demand_skills_2025-06-06");
        assert_eq!(identity.fingerprint.len(), 64);
    }

    #[test]
    fn namespace_prefixes_the_id() {
        let identity = assign_identity(&in_demand_skills(), Some("ee"));
        assert_eq!(identity.id, "ee_2025_in-demand_skills_2025-06-06");
    }

    #[test]
    fn metric_change_moves_fingerprint_not_id() {
        let before = assign_identity(&in_demand_skills(), None);
        let mut changed = in_demand_skills();
        changed
            .metrics
            .insert("invitationsIssued".into(), MetricValue::Integer(601));
        let after = assign_identity(&changed, None);
        assert_eq!(before.id, after.id);
        assert_ne!(before.fingerprint, after.fingerprint);
        assert_eq!(before, assign_identity(&in_demand_skills(), None));
    }

    #[test]
    fn undated_records_use_a_salted_content_hash() {
        let summary = RecordContent {
            kind: RecordKind::Summary,
            year: 2025,
            stream: "Unknown".into(),
            date_issued: None,
            metrics: Metrics::from([(
                "summaryItems".to_string(),
                MetricValue::List(vec!["Total invitations issued: 9,105".into()]),
            )]),
        };
        let identity = assign_identity(&summary, None);
        assert!(identity.id.starts_with("summary_2025_"));
        assert_eq!(identity.id.len(), "summary_2025_".len() + CONTENT_HASH_PREFIX_LEN);

        let mut next_year = summary.clone();
        next_year.year = 2026;
        assert_ne!(assign_identity(&next_year, None).id, identity.id);
    }

    #[test]
    fn dated_summaries_carry_a_kind_prefix() {
        let mut content = in_demand_skills();
        content.kind = RecordKind::Summary;
        assert_eq!(
            assign_identity(&content, None).id,
            "summary_2025_in-demand_skills_2025-06-06"
        );
    }

    #[test]
    fn slug_rules() {
        assert_eq!(slug("Employer Job Offer: Foreign Worker stream"), "employer_job_offer_foreign_worker_stream");
        assert_eq!(slug("  French-Speaking Skilled Worker "), "french-speaking_skilled_worker");
        assert_eq!(slug("***"), "unknown");
    }
}
