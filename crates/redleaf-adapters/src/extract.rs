//! Raw content -> raw records. Pure: no I/O, never fails on a single bad unit.

use redleaf_core::{RawOrigin, RawRecord, SourceFormat};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::text::{collapse_whitespace, header_key};
use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Heading rank (1..=6) that opens a section.
    pub section_level: u8,
    /// Case-insensitive filter on section heading text; sections that miss it are skipped.
    pub section_heading_contains: Option<String>,
    /// Key holding the entry array in JSON sources. `None` means the document is the array.
    pub json_records_key: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            section_level: 2,
            section_heading_contains: None,
            json_records_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub records: Vec<RawRecord>,
    /// Malformed rows, header-less tables and unusable JSON entries.
    pub skipped: usize,
}

pub fn extract(
    content: &str,
    format: SourceFormat,
    config: &ExtractorConfig,
) -> Result<Extraction, AdapterError> {
    match format {
        SourceFormat::Html => extract_html(content, config),
        SourceFormat::Json => Ok(extract_json(content, config)),
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(e.to_string()))
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn has_ancestor(element: ElementRef<'_>, names: &[&str]) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| names.contains(&a.value().name()))
}

fn heading_accepted(text: &str, config: &ExtractorConfig) -> bool {
    match config.section_heading_contains.as_deref() {
        Some(needle) => text.to_lowercase().contains(&needle.to_lowercase()),
        None => true,
    }
}

struct SectionContext<'a> {
    heading: &'a str,
    sub_heading: Option<&'a str>,
}

fn extract_html(content: &str, config: &ExtractorConfig) -> Result<Extraction, AdapterError> {
    let document = Html::parse_document(content);
    let blocks = selector("h1, h2, h3, h4, h5, h6, table, ul, ol")?;
    let rows = selector("tr")?;

    let mut out = Extraction::default();
    let mut section: Option<String> = None;
    let mut sub_heading: Option<String> = None;

    for element in document.select(&blocks) {
        let name = element.value().name();
        if let Some(level) = heading_level(name) {
            let text = element_text(element);
            if level <= config.section_level {
                sub_heading = None;
                section = (level == config.section_level && heading_accepted(&text, config))
                    .then_some(text);
            } else if section.is_some() && !text.is_empty() {
                sub_heading = Some(text);
            }
            continue;
        }

        let Some(heading) = section.as_deref() else {
            continue;
        };
        let ctx = SectionContext {
            heading,
            sub_heading: sub_heading.as_deref(),
        };
        match name {
            "table" if !has_ancestor(element, &["table", "ul", "ol"]) => {
                extract_table(element, &rows, &ctx, &mut out);
            }
            "ul" | "ol" if !has_ancestor(element, &["table", "ul", "ol"]) => {
                extract_list(element, &ctx, &mut out);
            }
            _ => {}
        }
    }

    Ok(out)
}

fn row_cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .collect()
}

fn in_thead(row: ElementRef<'_>) -> bool {
    row.parent()
        .and_then(ElementRef::wrap)
        .is_some_and(|p| p.value().name() == "thead")
}

fn all_header_cells(cells: &[ElementRef<'_>]) -> bool {
    !cells.is_empty() && cells.iter().all(|c| c.value().name() == "th")
}

fn extract_table(
    table: ElementRef<'_>,
    rows: &Selector,
    ctx: &SectionContext<'_>,
    out: &mut Extraction,
) {
    // Rows of nested tables belong to those tables, not this one.
    let own_rows: Vec<ElementRef<'_>> = table
        .select(rows)
        .filter(|row| {
            row.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|a| a.value().name() == "table")
                .is_some_and(|t| t.id() == table.id())
        })
        .collect();

    let header_idx = own_rows
        .iter()
        .position(|row| in_thead(*row))
        .or_else(|| own_rows.iter().position(|row| all_header_cells(&row_cells(*row))));
    let Some(header_idx) = header_idx else {
        debug!(section = ctx.heading, "table without header row skipped");
        out.skipped += 1;
        return;
    };
    let headers: Vec<String> = row_cells(own_rows[header_idx])
        .into_iter()
        .map(|c| header_key(&element_text(c)))
        .collect();

    for (idx, row) in own_rows.iter().enumerate() {
        if idx == header_idx {
            continue;
        }
        let cells = row_cells(*row);
        if cells.is_empty() || all_header_cells(&cells) {
            continue;
        }
        if cells.len() != headers.len() {
            debug!(
                section = ctx.heading,
                expected = headers.len(),
                found = cells.len(),
                "row cell count mismatch; skipped"
            );
            out.skipped += 1;
            continue;
        }
        let mut raw = RawRecord::new(RawOrigin::TableRow);
        raw.section_heading = Some(ctx.heading.to_string());
        raw.sub_heading = ctx.sub_heading.map(ToString::to_string);
        for (key, cell) in headers.iter().zip(cells) {
            raw.fields.insert(key.clone(), element_text(cell));
        }
        out.records.push(raw);
    }
}

fn extract_list(list: ElementRef<'_>, ctx: &SectionContext<'_>, out: &mut Extraction) {
    let items: Vec<String> = list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li")
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if items.is_empty() {
        return;
    }
    let mut raw = RawRecord::new(RawOrigin::List);
    raw.section_heading = Some(ctx.heading.to_string());
    raw.sub_heading = ctx.sub_heading.map(ToString::to_string);
    raw.items = items;
    out.records.push(raw);
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn extract_json(content: &str, config: &ExtractorConfig) -> Extraction {
    let mut out = Extraction::default();
    let document: JsonValue = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "source JSON does not parse");
            out.skipped += 1;
            return out;
        }
    };
    let entries = match config.json_records_key.as_deref() {
        Some(key) => document.get(key),
        None => Some(&document),
    }
    .and_then(JsonValue::as_array);
    let Some(entries) = entries else {
        warn!(key = ?config.json_records_key, "source JSON has no entry array");
        out.skipped += 1;
        return out;
    };

    for entry in entries {
        let Some(object) = entry.as_object() else {
            out.skipped += 1;
            continue;
        };
        let mut raw = RawRecord::new(RawOrigin::JsonEntry);
        for (key, value) in object {
            if let Some(text) = scalar_text(value) {
                raw.fields.insert(header_key(key), collapse_whitespace(&text));
            }
        }
        if raw.fields.is_empty() {
            out.skipped += 1;
            continue;
        }
        out.records.push(raw);
    }
    out
}
