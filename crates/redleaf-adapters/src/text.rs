//! Small text helpers shared by extraction and normalization.

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn text_or_none(value: &str) -> Option<String> {
    let cleaned = collapse_whitespace(value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Column label -> lowercase `snake_case` key. "Number of invitations*" -> "number_of_invitations".
pub fn header_key(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for ch in label.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// `snake_case` key -> `camelCase` metric name.
pub fn camel_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (idx, part) in key.split('_').filter(|p| !p.is_empty()).enumerate() {
        if idx == 0 {
            out.push_str(part);
            continue;
        }
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// First plausible four-digit year in free text.
pub fn year_in_text(text: &str) -> Option<i32> {
    let mut run = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            run.push(ch);
            continue;
        }
        if run.len() == 4 {
            if let Ok(year) = run.parse::<i32>() {
                if (1900..=2100).contains(&year) {
                    return Some(year);
                }
            }
        }
        run.clear();
    }
    None
}
