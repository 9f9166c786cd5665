//! Stateless heuristics over fetched pages: captcha interstitials and
//! redirects back to a login landing page, both signs that the session
//! cookie used for the fetch is no longer accepted.

use crate::page::Page;
use scraper::{Html, Selector};
use tracing::debug;

/// A 302 somewhere in the history while the final URL differs from the one
/// requested. On its own this is common; combined with a captcha marker it
/// means the site bounced us to a challenge page.
pub fn has_anomalous_redirect(page: &Page) -> bool {
    page.history.iter().any(|hop| hop.status == 302) && page.final_url != page.url
}

/// True when the page carries a captcha image and was reached through an
/// anomalous redirect.
pub fn has_captcha(page: &Page) -> bool {
    let document = Html::parse_document(&page.body);
    let selector = Selector::parse("img[src]").expect("static selector");

    let marker = document.select(&selector).any(|img| {
        img.value()
            .attr("src")
            .is_some_and(|src| src.to_ascii_lowercase().contains("captcha"))
    });

    if marker && has_anomalous_redirect(page) {
        debug!("Captcha marker and anomalous redirect found in {}", page.url);
        return true;
    }

    false
}

/// True when some 302 in the page's history targets the captured "no
/// session" landing page, meaning the cookie used for the fetch expired.
pub fn is_login_redirect(page: &Page, login_page: Option<&Page>) -> bool {
    let Some(login_page) = login_page else {
        debug!("No login landing page captured yet");
        return false;
    };

    page.history
        .iter()
        .any(|hop| hop.status == 302 && hop.location == login_page.final_url)
}

/// Whether the page must be refetched with a fresh cookie. Seeds without a
/// cookie requirement never retry on content grounds.
pub fn needs_retry(page: &Page, login_page: Option<&Page>, cookie_gated: bool) -> bool {
    if !cookie_gated {
        return false;
    }

    if has_captcha(page) {
        debug!("Captcha found in {}, requesting a new cookie", page.url);
        return true;
    }
    if is_login_redirect(page, login_page) {
        debug!(
            "Redirection to the login page from {}, cookie expired",
            page.url
        );
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Hop;

    fn page_with(url: &str, final_url: &str, body: &str, history: Vec<Hop>) -> Page {
        Page {
            url: url.to_string(),
            final_url: final_url.to_string(),
            status: 200,
            body: body.to_string(),
            history,
        }
    }

    fn hop_302(url: &str, location: &str) -> Hop {
        Hop {
            status: 302,
            url: url.to_string(),
            location: location.to_string(),
        }
    }

    #[test]
    fn test_captcha_requires_marker_and_redirect() {
        let body = r#"<html><body><img src="/images/CAPTCHA_42.png"></body></html>"#;

        // Marker alone is not enough.
        let direct = page_with("http://x.onion/a", "http://x.onion/a", body, vec![]);
        assert!(!has_captcha(&direct));

        // Marker plus a 302 that landed us somewhere else fires.
        let bounced = page_with(
            "http://x.onion/a",
            "http://x.onion/challenge",
            body,
            vec![hop_302("http://x.onion/a", "http://x.onion/challenge")],
        );
        assert!(has_captcha(&bounced));
    }

    #[test]
    fn test_redirect_without_marker_is_not_captcha() {
        let bounced = page_with(
            "http://x.onion/a",
            "http://x.onion/b",
            "<html><body>no images here</body></html>",
            vec![hop_302("http://x.onion/a", "http://x.onion/b")],
        );
        assert!(!has_captcha(&bounced));
    }

    #[test]
    fn test_login_redirect_matches_landing_page() {
        let login = page_with("http://x.onion/", "http://x.onion/login", "", vec![]);
        let page = page_with(
            "http://x.onion/item/7",
            "http://x.onion/login",
            "",
            vec![hop_302("http://x.onion/item/7", "http://x.onion/login")],
        );

        assert!(is_login_redirect(&page, Some(&login)));
        assert!(!is_login_redirect(&page, None));

        let elsewhere = page_with(
            "http://x.onion/item/7",
            "http://x.onion/other",
            "",
            vec![hop_302("http://x.onion/item/7", "http://x.onion/other")],
        );
        assert!(!is_login_redirect(&elsewhere, Some(&login)));
    }

    #[test]
    fn test_cookieless_seed_never_retries() {
        let login = page_with("http://x.onion/", "http://x.onion/login", "", vec![]);
        let page = page_with(
            "http://x.onion/item/7",
            "http://x.onion/login",
            "",
            vec![hop_302("http://x.onion/item/7", "http://x.onion/login")],
        );

        assert!(needs_retry(&page, Some(&login), true));
        assert!(!needs_retry(&page, Some(&login), false));
    }
}
