//! IRCC notices page: the page is kept as-is, only its `<main>` is cut out.

use scraper::{Html, Selector};

use crate::AdapterError;

/// Inner HTML of the first `<main>` element, trimmed. `None` when the page has
/// no `<main>` or it is empty.
pub fn main_content(html: &str) -> Result<Option<String>, AdapterError> {
    let main = Selector::parse("main").map_err(|e| AdapterError::Selector(e.to_string()))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&main)
        .next()
        .map(|el| el.inner_html().trim().to_string())
        .filter(|inner| !inner.is_empty()))
}
