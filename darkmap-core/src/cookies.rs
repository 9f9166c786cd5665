//! Session cookie rotation for cookie-gated onion services.
//!
//! Cookies live in the configuration file, which is the authoritative set;
//! an operator adds fresh ones there while a crawl is running. Draws come
//! out of an in-memory bucket without replacement so every cookie gets used
//! before any is reused, which keeps per-session request rates low.

use crate::config::ConfigFile;
use crate::error::{CrawlError, Result};
use darkmap_fetch::{validator, Page, TorClient};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// How long a crawl is willing to stall waiting for an operator to supply
/// fresh cookies before giving up on the seed.
pub const MAX_COOKIE_WAIT: Duration = Duration::from_secs(36_000);

const WAIT_POLL: Duration = Duration::from_secs(1);

pub struct CookieSessionManager {
    client: Arc<TorClient>,
    config: Arc<Mutex<ConfigFile>>,
    buckets: Mutex<HashMap<String, Vec<String>>>,
    login_page: Mutex<Option<Page>>,
}

impl CookieSessionManager {
    pub fn new(client: Arc<TorClient>, config: Arc<Mutex<ConfigFile>>) -> Self {
        Self {
            client,
            config,
            buckets: Mutex::new(HashMap::new()),
            login_page: Mutex::new(None),
        }
    }

    /// Record the page a cookieless request lands on. Later fetches that get
    /// 302-bounced back to this page are treated as expired sessions.
    pub fn set_login_page(&self, page: Page) {
        debug!("Captured login landing page: {}", page.final_url);
        *self.login_page.lock().expect("login page lock") = Some(page);
    }

    pub fn login_page(&self) -> Option<Page> {
        self.login_page.lock().expect("login page lock").clone()
    }

    /// Draw one cookie for `seed` without replacement, refilling the bucket
    /// from the configured set once it runs dry. Returns `None` when the
    /// seed has no cookies configured at all.
    ///
    /// With `validate` set, each drawn cookie is probed against the seed
    /// before being handed out; cookies the site no longer accepts are
    /// removed from the configuration permanently and the draw moves on.
    pub async fn draw_random(&self, seed: &str, validate: bool) -> Result<Option<String>> {
        loop {
            let Some(cookie) = self.draw_from_bucket(seed)? else {
                return Ok(None);
            };

            if !validate {
                return Ok(Some(cookie));
            }

            if self.probe(seed, &cookie).await? {
                return Ok(Some(cookie));
            }

            warn!("Cookie rejected by {seed}, removing it");
            self.remove_cookie(seed, &cookie)?;
        }
    }

    /// Drop a cookie from the seed's authoritative set. Cookies already gone
    /// from the configuration are tolerated; stale bucket copies are filtered
    /// out on the next draw.
    pub fn remove_cookie(&self, seed: &str, cookie: &str) -> Result<()> {
        self.config
            .lock()
            .expect("config lock")
            .remove_cookie(seed, cookie)
    }

    fn draw_from_bucket(&self, seed: &str) -> Result<Option<String>> {
        let mut config = self.config.lock().expect("config lock");
        config.refresh_if_stale()?;

        let authoritative = match config.cookies_for(seed) {
            Some(cookies) if !cookies.is_empty() => cookies,
            _ => return Ok(None),
        };
        drop(config);

        let mut buckets = self.buckets.lock().expect("bucket lock");
        let bucket = buckets.entry(seed.to_string()).or_default();

        // Cookies removed from the configuration must not come back out of
        // a stale bucket.
        bucket.retain(|c| authoritative.contains(c));
        if bucket.is_empty() {
            debug!("Refilling cookie bucket for {seed}");
            *bucket = authoritative;
        }

        let index = rand::rng().random_range(0..bucket.len());
        Ok(Some(bucket.swap_remove(index)))
    }

    /// Fetch the seed with the cookie and check the response for captcha or
    /// login-redirect signs. True means the cookie still works.
    async fn probe(&self, seed: &str, cookie: &str) -> Result<bool> {
        let page = self.client.fetch(seed, Some(cookie)).await?;
        let login_page = self.login_page();
        Ok(!validator::needs_retry(&page, login_page.as_ref(), true))
    }

    /// Probe every configured cookie for `seed` once, dropping the ones the
    /// site rejects. Returns how many survived.
    pub async fn validate_all(&self, seed: &str) -> Result<usize> {
        let cookies = {
            let mut config = self.config.lock().expect("config lock");
            config.refresh_if_stale()?;
            config.cookies_for(seed).unwrap_or_default()
        };

        let mut kept = 0;
        for cookie in &cookies {
            if self.probe(seed, cookie).await? {
                kept += 1;
            } else {
                warn!("Dropping invalid cookie for {seed}");
                self.remove_cookie(seed, cookie)?;
            }
        }

        info!("{kept}/{} cookies valid for {seed}", cookies.len());
        Ok(kept)
    }

    /// Block until a cookie can be drawn for `seed`, polling the (possibly
    /// operator-edited) configuration. Gives up with a tagged error once
    /// `timeout` has elapsed; crawls pass [`MAX_COOKIE_WAIT`].
    pub async fn wait_for_cookie(
        &self,
        seed: &str,
        timeout: Duration,
        validate: bool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut announced = false;

        loop {
            if let Some(cookie) = self.draw_random(seed, validate).await? {
                return Ok(cookie);
            }

            if Instant::now() >= deadline {
                return Err(CrawlError::CookieTimeout(seed.to_string()));
            }

            if !announced {
                info!("No cookies left for {seed}, waiting for new ones in the config");
                announced = true;
            }
            sleep(WAIT_POLL).await;
        }
    }
}
