use chrono::{Datelike, NaiveDate};
use redleaf_core::{MetricValue, Metrics, RawOrigin, RawRecord, RecordContent, RecordKind, UNKNOWN_STREAM};
use serde::{Deserialize, Serialize};

use crate::text::{camel_key, collapse_whitespace, text_or_none, year_in_text};

const DATE_KEYS: &[&str] = &[
    "date_issued",
    "issue_date",
    "date_of_issue",
    "draw_date",
    "drawdate",
    "date",
];
const INVITATION_KEYS: &[&str] = &[
    "invitations_issued",
    "number_of_invitations",
    "number_of_invitations_issued",
    "invitations",
    "draw_size",
    "drawsize",
];
const SCORE_KEYS: &[&str] = &[
    "score_range",
    "crs_range",
    "crs_score_range",
    "score",
    "drawcrs",
    "crs_score",
];
const STREAM_KEYS: &[&str] = &["stream", "stream_name", "draw_name", "drawname"];

pub const SCORE_RANGE: &str = "scoreRange";
pub const INVITATIONS_ISSUED: &str = "invitationsIssued";
pub const SUMMARY_ITEMS: &str = "summaryItems";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeContext {
    /// Stream label when neither a column nor a sub-heading provides one.
    pub default_stream: String,
}

impl Default for NormalizeContext {
    fn default() -> Self {
        Self {
            default_stream: UNKNOWN_STREAM.to_string(),
        }
    }
}

/// Cleans and types a raw record. `None` means the record is unusable and should be skipped.
pub fn normalize(raw: &RawRecord, ctx: &NormalizeContext) -> Option<RecordContent> {
    let context_year = raw.section_heading.as_deref().and_then(year_in_text);
    let stream_context = raw
        .sub_heading
        .as_deref()
        .and_then(text_or_none)
        .unwrap_or_else(|| ctx.default_stream.clone());

    match raw.origin {
        RawOrigin::List => normalize_list(raw, context_year, stream_context),
        RawOrigin::TableRow | RawOrigin::JsonEntry => {
            normalize_fields(raw, context_year, stream_context)
        }
    }
}

fn normalize_list(
    raw: &RawRecord,
    context_year: Option<i32>,
    stream: String,
) -> Option<RecordContent> {
    let items: Vec<String> = raw.items.iter().filter_map(|i| text_or_none(i)).collect();
    if items.is_empty() {
        return None;
    }
    Some(RecordContent {
        kind: RecordKind::Summary,
        year: context_year?,
        stream,
        date_issued: None,
        metrics: Metrics::from([(SUMMARY_ITEMS.to_string(), MetricValue::List(items))]),
    })
}

fn first_present<'a>(fields: &[(&'a str, String)], keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| fields.iter().find(|(k, _)| k == key).map(|(k, _)| *k))
}

fn normalize_fields(
    raw: &RawRecord,
    context_year: Option<i32>,
    stream_context: String,
) -> Option<RecordContent> {
    let fields: Vec<(&str, String)> = raw
        .fields
        .iter()
        .map(|(k, v)| (k.as_str(), collapse_whitespace(v)))
        .collect();
    let value_of = |key: &str| {
        fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    };

    let date_key = first_present(&fields, DATE_KEYS);
    let invitations_key = first_present(&fields, INVITATION_KEYS);
    let score_key = first_present(&fields, SCORE_KEYS);
    let stream_key = first_present(&fields, STREAM_KEYS);

    let kind = if date_key.is_some() || invitations_key.is_some() {
        RecordKind::Draw
    } else {
        RecordKind::Summary
    };

    let date_issued = date_key
        .and_then(value_of)
        .and_then(|text| parse_issue_date(text, context_year));
    if kind == RecordKind::Draw && date_issued.is_none() {
        return None;
    }
    let year = context_year.or_else(|| date_issued.map(|d| d.year()))?;

    let stream = stream_key
        .and_then(value_of)
        .map(ToString::to_string)
        .unwrap_or(stream_context);

    let mut metrics = Metrics::new();
    for (key, value) in &fields {
        if value.is_empty() || Some(*key) == date_key || Some(*key) == stream_key {
            continue;
        }
        if Some(*key) == invitations_key {
            metrics.insert(INVITATIONS_ISSUED.to_string(), parse_count(value));
        } else if Some(*key) == score_key {
            metrics.insert(SCORE_RANGE.to_string(), MetricValue::Text(value.clone()));
        } else {
            let name = camel_key(key);
            if !name.is_empty() {
                metrics.insert(name, MetricValue::Text(value.clone()));
            }
        }
    }

    if kind == RecordKind::Summary && metrics.is_empty() {
        return None;
    }

    Some(RecordContent {
        kind,
        year,
        stream,
        date_issued,
        metrics,
    })
}

/// Strips everything but digits. Text without digits is kept as-is.
pub fn parse_count(text: &str) -> MetricValue {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    match digits.parse::<i64>() {
        Ok(n) if !digits.is_empty() => MetricValue::Integer(n),
        _ => MetricValue::Text(text.to_string()),
    }
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    let lower = token.to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(&lower))
        .and_then(|idx| u32::try_from(idx + 1).ok())
}

/// "6", "6th", "5-6" -> 6 / 6 / 5.
fn day_number(token: &str) -> Option<u32> {
    let head = token.split(['-', '–']).next()?;
    let digits: String = head.chars().take_while(char::is_ascii_digit).collect();
    let rest = &head[digits.len()..];
    if digits.is_empty() || digits.len() > 2 || !matches!(rest, "" | "st" | "nd" | "rd" | "th") {
        return None;
    }
    digits.parse().ok().filter(|d| (1..=31).contains(d))
}

/// "2025-06-06", "2025/06/06", "2025-06-06T..", "06/06/2025".
/// Day-first only when the leading part cannot be a month.
fn numeric_date(token: &str) -> Option<NaiveDate> {
    let date_part = token.split('T').next()?;
    let parts: Vec<&str> = date_part.split(['-', '/']).collect();
    let all_digits = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if parts.len() != 3 || !all_digits {
        return None;
    }
    let number = |p: &str| p.parse::<u32>().ok();
    if parts[0].len() == 4 {
        let year = parts[0].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, number(parts[1])?, number(parts[2])?);
    }
    if parts[2].len() != 4 {
        return None;
    }
    let year = parts[2].parse().ok()?;
    let (first, second) = (number(parts[0])?, number(parts[1])?);
    if first > 12 {
        NaiveDate::from_ymd_opt(year, second, first)
    } else {
        NaiveDate::from_ymd_opt(year, first, second)
    }
}

/// Parses the date formats seen on draw pages. A missing year comes from `context_year`.
pub fn parse_issue_date(text: &str, context_year: Option<i32>) -> Option<NaiveDate> {
    let cleaned = collapse_whitespace(text);
    let tokens: Vec<&str> = cleaned
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .collect();
    if let Some(date) = tokens.iter().find_map(|t| numeric_date(t)) {
        return Some(date);
    }

    let mut month = None;
    let mut day = None;
    let mut year = None;
    for token in tokens {
        if token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
            year = year.or_else(|| token.parse::<i32>().ok());
        } else if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            day = day.or_else(|| day_number(token));
        } else {
            month = month.or_else(|| month_number(token));
        }
    }

    NaiveDate::from_ymd_opt(year.or(context_year)?, month?, day?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(fields: &[(&str, &str)], heading: &str, sub: Option<&str>) -> RawRecord {
        let mut raw = RawRecord::new(RawOrigin::TableRow);
        raw.fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        raw.section_heading = Some(heading.to_string());
        raw.sub_heading = sub.map(ToString::to_string);
        raw
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn in_demand_skills_row_becomes_a_draw() {
        let raw = row(
            &[
                ("date_issued", "June 6, 2025"),
                ("stream", " In-Demand   Skills "),
                ("score_range", "470-480"),
                ("invitations_issued", "600"),
            ],
            "Invitations to apply issued in 2025",
            None,
        );
        let content = normalize(&raw, &NormalizeContext::default()).unwrap();
        assert_eq!(content.kind, RecordKind::Draw);
        assert_eq!(content.year, 2025);
        assert_eq!(content.stream, "In-Demand Skills");
        assert_eq!(content.date_issued, Some(ymd(2025, 6, 6)));
        assert_eq!(
            content.metrics,
            Metrics::from([
                (SCORE_RANGE.to_string(), MetricValue::Text("470-480".into())),
                (INVITATIONS_ISSUED.to_string(), MetricValue::Integer(600)),
            ])
        );
    }

    #[test]
    fn stream_falls_back_to_sub_heading_then_default() {
        let fields = [("date_issued", "May 2, 2025"), ("number_of_invitations", "1,200*")];
        let with_sub = normalize(
            &row(&fields, "Invitations to apply issued in 2025", Some("Masters Graduate stream")),
            &NormalizeContext::default(),
        )
        .unwrap();
        assert_eq!(with_sub.stream, "Masters Graduate stream");
        assert_eq!(with_sub.metrics[INVITATIONS_ISSUED], MetricValue::Integer(1200));

        let without = normalize(
            &row(&fields, "Invitations to apply issued in 2025", None),
            &NormalizeContext::default(),
        )
        .unwrap();
        assert_eq!(without.stream, UNKNOWN_STREAM);
    }

    #[test]
    fn draw_without_date_is_dropped() {
        let raw = row(
            &[("date_issued", "to be announced"), ("number_of_invitations", "50")],
            "Invitations to apply issued in 2025",
            None,
        );
        assert!(normalize(&raw, &NormalizeContext::default()).is_none());
    }

    #[test]
    fn year_comes_from_date_when_heading_has_none() {
        let mut raw = RawRecord::new(RawOrigin::JsonEntry);
        raw.fields.insert("drawdate".into(), "2025-06-04".into());
        raw.fields.insert("drawname".into(), "Provincial Nominee Program".into());
        raw.fields.insert("drawsize".into(), "503".into());
        raw.fields.insert("drawcrs".into(), "752".into());
        raw.fields.insert("drawnumber".into(), "350".into());
        let content = normalize(&raw, &NormalizeContext::default()).unwrap();
        assert_eq!(content.year, 2025);
        assert_eq!(content.stream, "Provincial Nominee Program");
        assert_eq!(content.metrics[SCORE_RANGE], MetricValue::Text("752".into()));
        assert_eq!(content.metrics[INVITATIONS_ISSUED], MetricValue::Integer(503));
        assert_eq!(content.metrics["drawnumber"], MetricValue::Text("350".into()));
    }

    #[test]
    fn non_numeric_invitations_keep_text() {
        assert_eq!(parse_count("not published"), MetricValue::Text("not published".into()));
        assert_eq!(parse_count("1,005"), MetricValue::Integer(1005));
    }

    #[test]
    fn rows_without_draw_columns_are_summaries() {
        let raw = row(
            &[("stream", "Human Capital Priorities"), ("total_invitations", "2,000")],
            "Invitations to apply issued in 2024",
            None,
        );
        let content = normalize(&raw, &NormalizeContext::default()).unwrap();
        assert_eq!(content.kind, RecordKind::Summary);
        assert_eq!(content.year, 2024);
        assert_eq!(content.metrics["totalInvitations"], MetricValue::Text("2,000".into()));

        let empty = row(&[("notes", "  ")], "Invitations to apply issued in 2024", None);
        assert!(normalize(&empty, &NormalizeContext::default()).is_none());
    }

    #[test]
    fn lists_become_summaries_with_items() {
        let mut raw = RawRecord::new(RawOrigin::List);
        raw.section_heading = Some("Invitations to apply issued in 2025".into());
        raw.items = vec!["Total invitations: 8,000".into(), " ".into()];
        let content = normalize(&raw, &NormalizeContext::default()).unwrap();
        assert_eq!(content.kind, RecordKind::Summary);
        assert_eq!(content.date_issued, None);
        assert_eq!(
            content.metrics[SUMMARY_ITEMS],
            MetricValue::List(vec!["Total invitations: 8,000".into()])
        );

        raw.section_heading = Some("Invitations to apply".into());
        assert!(normalize(&raw, &NormalizeContext::default()).is_none(), "no year");
    }

    #[test]
    fn date_formats() {
        let expected = Some(ymd(2025, 6, 6));
        assert_eq!(parse_issue_date("June 6, 2025", None), expected);
        assert_eq!(parse_issue_date("Jun 6 2025", None), expected);
        assert_eq!(parse_issue_date("6 June 2025", None), expected);
        assert_eq!(parse_issue_date("June 6th, 2025", None), expected);
        assert_eq!(parse_issue_date("2025-06-06", None), expected);
        assert_eq!(parse_issue_date("2025-06-06T00:00:00Z", None), expected);
        assert_eq!(parse_issue_date("June 6", Some(2025)), expected);
        assert_eq!(parse_issue_date("Sept. 9, 2025", None), Some(ymd(2025, 9, 9)));
        assert_eq!(parse_issue_date("June 5-6, 2025", None), Some(ymd(2025, 6, 5)));
        assert_eq!(parse_issue_date("June 6", None), None);
        assert_eq!(parse_issue_date("February 30, 2025", None), None);
        assert_eq!(parse_issue_date("", Some(2025)), None);
    }

    #[test]
    fn numeric_dates_anywhere_in_the_cell() {
        let expected = Some(ymd(2025, 6, 6));
        assert_eq!(parse_issue_date("2025/06/06", None), expected);
        assert_eq!(parse_issue_date("06/06/2025", None), expected);
        assert_eq!(parse_issue_date("Issued 2025-06-06", None), expected);
        assert_eq!(parse_issue_date("Issued: 2025-06-06 (updated)", None), expected);
        assert_eq!(parse_issue_date("07/04/2025", None), Some(ymd(2025, 7, 4)));
        assert_eq!(parse_issue_date("13/06/2025", None), Some(ymd(2025, 6, 13)));
        assert_eq!(parse_issue_date("13/13/2025", None), None);
        assert_eq!(parse_issue_date("06/06/25", None), None);
    }
}
