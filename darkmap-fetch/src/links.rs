use crate::error::{FetchError, Result};
use crate::page::Page;
use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// Extract all same-host links from a page body, resolved against the
/// requested URL, fragment stripped and trailing slash trimmed.
pub fn extract_internal_links(page: &Page) -> Result<Vec<String>> {
    let base = Url::parse(&page.url)
        .map_err(|e| FetchError::Extraction(format!("bad base URL {}: {e}", page.url)))?;
    let domain = base
        .host_str()
        .ok_or_else(|| FetchError::Extraction(format!("no host in {}", page.url)))?
        .to_string();

    let document = Html::parse_document(&page.body);
    let selector = Selector::parse("a[href]").expect("static selector");

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(resolved) = resolve_link(&base, href) else {
            continue;
        };

        if resolved.host_str() != Some(domain.as_str()) {
            debug!("Skipping external link {}", resolved);
            continue;
        }

        let normalized = resolved.as_str().trim_end_matches('/').to_string();
        if seen.insert(normalized.clone()) {
            links.push(normalized);
        }
    }

    Ok(links)
}

fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    let mut resolved = base.join(href).ok()?;
    resolved.set_fragment(None);
    Some(resolved)
}
