use serde::{Deserialize, Serialize};

/// One hop of a redirect chain: the URL that answered and where it pointed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub status: u16,
    pub url: String,
    pub location: String,
}

/// Immutable snapshot of one completed fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// The URL that was requested.
    pub url: String,
    /// The URL that finally answered, after any redirects.
    pub final_url: String,
    pub status: u16,
    pub body: String,
    /// Redirect responses observed on the way to `final_url`, in order.
    pub history: Vec<Hop>,
}

impl Page {
    pub fn new(url: String) -> Self {
        Self {
            final_url: url.clone(),
            url,
            status: 0,
            body: String::new(),
            history: Vec::new(),
        }
    }

    pub fn was_redirected(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A unit of work for the download queue. The task carries its own URL and
/// cookie so a completed result never needs an identity-based lookup.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub cookie: Option<String>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, cookie: Option<String>) -> Self {
        Self {
            url: url.into(),
            cookie,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_not_redirected() {
        let page = Page::new("http://example.onion/".to_string());
        assert_eq!(page.url, page.final_url);
        assert!(!page.was_redirected());
        assert!(!page.is_success());
    }

    #[test]
    fn test_is_success_bounds() {
        let mut page = Page::new("http://example.onion/".to_string());
        page.status = 200;
        assert!(page.is_success());
        page.status = 299;
        assert!(page.is_success());
        page.status = 300;
        assert!(!page.is_success());
        page.status = 302;
        assert!(!page.is_success());
    }
}
