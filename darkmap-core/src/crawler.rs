//! Breadth-first crawl orchestration for a single seed.
//!
//! The orchestrator is the only owner of per-run crawl state (visited set,
//! pending depths, retry counts). Network I/O, page persistence and CSV
//! flushing all happen in background tasks; this loop just polls completed
//! downloads, applies validation/depth/retry policy and feeds the monitor.

use crate::config::ConfigFile;
use crate::cookies::{CookieSessionManager, MAX_COOKIE_WAIT};
use crate::error::{CrawlError, Result};
use crate::monitor::{CrawlMonitor, SkipReason};
use crate::store::PageStore;
use crate::summary::{CrawlSummary, TerminationReason};
use darkmap_fetch::{links, validator, Downloader, Page, TorClient};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Validation failures get this many fetches before the URL is written off.
const MAX_RETRIES: usize = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Crawl limits snapshotted from the configuration at startup. Unlike
/// cookies, these do not hot-reload mid-run.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_links: usize,
    max_time: Duration,
    max_depth: usize,
    cookie_wait: Duration,
}

pub struct Crawler {
    seed: String,
    project_dir: PathBuf,
    limits: Limits,
    cookie_gated: bool,

    client: Arc<TorClient>,
    config: Arc<Mutex<ConfigFile>>,
    cookies: CookieSessionManager,
    downloader: Downloader,
    monitor: CrawlMonitor,
    store: PageStore,

    visited: HashMap<String, NodeIndex>,
    unvisited: HashSet<String>,
    pending_depth: HashMap<String, usize>,
    attempts: HashMap<String, usize>,
    crawled: usize,
}

impl Crawler {
    /// Set up the project directory and all per-seed collaborators. Refuses
    /// to reuse an existing directory rather than mix two runs' output.
    pub async fn new(
        seed: String,
        project_dir: PathBuf,
        client: Arc<TorClient>,
        config: Arc<Mutex<ConfigFile>>,
    ) -> Result<Self> {
        if project_dir.exists() {
            return Err(CrawlError::ProjectDirExists(project_dir));
        }
        std::fs::create_dir_all(&project_dir)?;

        let exit_ip = match client.current_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Could not determine exit identity: {e}");
                "unknown".to_string()
            }
        };

        let (limits, workers, wait_request) = {
            let config = config.lock().expect("config lock");
            let data = config.data();
            (
                Limits {
                    max_links: data.max_links,
                    max_time: Duration::from_secs(data.max_time),
                    max_depth: data.max_depth,
                    cookie_wait: MAX_COOKIE_WAIT,
                },
                data.workers,
                Duration::from_millis(data.wait_request),
            )
        };

        let monitor = CrawlMonitor::create(&project_dir, &exit_ip)?;
        let store = PageStore::create(&project_dir)?;
        let downloader = Downloader::new(Arc::clone(&client), workers, wait_request);
        let cookies = CookieSessionManager::new(Arc::clone(&client), Arc::clone(&config));

        Ok(Self {
            seed,
            project_dir,
            limits,
            cookie_gated: false,
            client,
            config,
            cookies,
            downloader,
            monitor,
            store,
            visited: HashMap::new(),
            unvisited: HashSet::new(),
            pending_depth: HashMap::new(),
            attempts: HashMap::new(),
            crawled: 0,
        })
    }

    pub fn project_dir(&self) -> &PathBuf {
        &self.project_dir
    }

    /// Crawl until a termination condition fires. Errors inside the loop end
    /// this seed's run with an `Aborted` summary instead of propagating.
    pub async fn run(mut self) -> Result<CrawlSummary> {
        self.monitor.start();
        self.store.start();
        self.downloader.start();

        let reason = match self.crawl().await {
            Ok(reason) => reason,
            Err(CrawlError::CookieTimeout(seed)) => {
                warn!("Gave up waiting for cookies for {seed}");
                TerminationReason::CookieTimeout
            }
            Err(e) => {
                error!("Crawl of {} aborted: {e}", self.seed);
                TerminationReason::Aborted
            }
        };

        info!("Crawl of {} terminated: {reason}", self.seed);
        self.downloader.stop();

        // Let the body writer drain before flipping its stop flag; bodies
        // still queued past the deadline are dropped.
        let drain_deadline = Instant::now() + Duration::from_secs(10);
        while !self.store.is_idle() && Instant::now() < drain_deadline {
            sleep(POLL_INTERVAL).await;
        }
        self.store.stop();
        self.monitor.update_request_count(self.client.requests_sent());
        if let Err(e) = self.monitor.stop() {
            error!("Final monitor flush failed: {e}");
        }

        Ok(CrawlSummary {
            seed: self.seed,
            reason,
            counters: self.monitor.snapshot_counters(),
            crawled: self.crawled,
        })
    }

    async fn crawl(&mut self) -> Result<TerminationReason> {
        self.cookie_gated = {
            let mut config = self.config.lock().expect("config lock");
            config.refresh_if_stale()?;
            config.has_cookies(&self.seed)
        };

        if self.cookie_gated {
            self.bootstrap_cookies().await?;
        }

        // Seed node is created at visit time, not here.
        self.pending_depth.insert(self.seed.clone(), 0);
        let cookie = self.draw_cookie(false).await?;
        self.downloader.enqueue(&self.seed, cookie);

        let started = Instant::now();
        loop {
            if self.downloader.is_idle() {
                return Ok(TerminationReason::AllCrawled);
            }
            if self.crawled >= self.limits.max_links {
                return Ok(TerminationReason::LinkLimit);
            }
            if started.elapsed() >= self.limits.max_time {
                return Ok(TerminationReason::TimeLimit);
            }

            let completed = self.downloader.poll();
            if completed.is_empty() {
                sleep(POLL_INTERVAL).await;
                continue;
            }

            for (url, result) in completed {
                self.process(url, result).await?;
            }
            self.monitor.update_request_count(self.client.requests_sent());
        }
    }

    /// Capture the landing page a cookieless request bounces to, then weed
    /// out already-dead cookies before the crawl proper starts.
    async fn bootstrap_cookies(&self) -> Result<()> {
        info!("Capturing login landing page for {}", self.seed);
        let landing = self.client.fetch(&self.seed, None).await?;
        self.cookies.set_login_page(landing);

        let kept = self.cookies.validate_all(&self.seed).await?;
        if kept == 0 {
            warn!("No working cookies for {} at startup", self.seed);
        }
        Ok(())
    }

    async fn process(
        &mut self,
        url: String,
        result: std::result::Result<Page, darkmap_fetch::FetchError>,
    ) -> Result<()> {
        let depth = *self
            .pending_depth
            .get(&url)
            .ok_or_else(|| CrawlError::MissingDepth(url.clone()))?;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("Transport failure for {url}: {e}");
                self.mark_unvisited(&url, SkipReason::Error);
                return Ok(());
            }
        };

        let login_page = self.cookies.login_page();
        if validator::needs_retry(&page, login_page.as_ref(), self.cookie_gated) {
            let attempts = self.attempts.get(&url).copied().unwrap_or(0);
            if attempts < MAX_RETRIES {
                self.attempts.insert(url.clone(), attempts + 1);
                info!("Refetching {url} with a fresh cookie (attempt {})", attempts + 1);
                let cookie = self.draw_cookie(true).await?;
                self.downloader.enqueue(&url, cookie);
            } else {
                warn!("Giving up on {url} after {MAX_RETRIES} retries");
                self.mark_unvisited(&url, SkipReason::Error);
            }
            return Ok(());
        }

        if !page.is_success() {
            // Recorded with its status, but no links come out of it and no
            // node is created beyond any it gained at schedule time.
            if let Some(node) = self.monitor.node_for(&url) {
                self.visited.entry(url.clone()).or_insert(node);
            }
            self.monitor.record_visit(&url, page.status);
            self.pending_depth.remove(&url);
            self.attempts.remove(&url);
            return Ok(());
        }

        let targets = match links::extract_internal_links(&page) {
            Ok(targets) => targets,
            Err(e) => {
                warn!("Skipping {url}, link extraction failed: {e}");
                self.pending_depth.remove(&url);
                self.attempts.remove(&url);
                return Ok(());
            }
        };

        let node = self.record_visited(&url, depth, page.status);
        for target in targets {
            self.consider_link(node, &target, depth + 1).await?;
        }

        self.store.save(node.index(), page.body);
        self.crawled += 1;
        Ok(())
    }

    /// Apply depth and visited policy to one extracted link. Targets that
    /// already have a node only gain an edge; new in-depth targets get a
    /// node at schedule time and go straight into the download queue.
    async fn consider_link(&mut self, from: NodeIndex, target: &str, depth: usize) -> Result<()> {
        if let Some(existing) = self.monitor.node_for(target) {
            self.monitor.add_edge(from, existing);
            return Ok(());
        }

        if self.unvisited.contains(target) {
            return Ok(());
        }

        if depth > self.limits.max_depth {
            self.mark_unvisited(target, SkipReason::MaxDepth);
            return Ok(());
        }

        self.pending_depth.insert(target.to_string(), depth);
        let node = self.monitor.add_node(target, depth);
        self.monitor.record_scheduled(target, depth);
        let cookie = self.draw_cookie(false).await?;
        self.downloader.enqueue(target, cookie);
        self.monitor.add_edge(from, node);
        Ok(())
    }

    /// Node assignment plus the visit record. First visit wins; the URL's
    /// pending depth and retry count are settled here.
    fn record_visited(&mut self, url: &str, depth: usize, status: u16) -> NodeIndex {
        let node = match self.visited.get(url) {
            Some(&node) => node,
            None => {
                let node = self.monitor.add_node(url, depth);
                self.visited.insert(url.to_string(), node);
                node
            }
        };
        self.monitor.record_visit(url, status);
        self.pending_depth.remove(url);
        self.attempts.remove(url);
        node
    }

    fn mark_unvisited(&mut self, url: &str, reason: SkipReason) {
        if self.unvisited.insert(url.to_string()) {
            self.monitor.record_skipped(url, reason);
        }
        self.pending_depth.remove(url);
        self.attempts.remove(url);
    }

    /// Cookie for the next request, or `None` for cookieless seeds. When the
    /// bucket and the authoritative set are both empty this blocks until the
    /// operator supplies fresh cookies, bounded by the manager's wait limit.
    async fn draw_cookie(&self, validate: bool) -> Result<Option<String>> {
        if !self.cookie_gated {
            return Ok(None);
        }

        match self.cookies.draw_random(&self.seed, validate).await? {
            Some(cookie) => Ok(Some(cookie)),
            None => self
                .cookies
                .wait_for_cookie(&self.seed, self.limits.cookie_wait, validate)
                .await
                .map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_crawler(seed: &str, cookie_line: Option<&str>) -> (TempDir, NamedTempFile, Crawler) {
        let out = TempDir::new().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project_name: t\ndata_directory: /tmp\ncrawler.max_links: 50\ncrawler.max_time: 60\ncrawler.wait_request: 0\ncrawler.depth: 2\ncrawler.workers: 2"
        )
        .unwrap();
        if let Some(cookie) = cookie_line {
            writeln!(
                file,
                "crawler.cookies:\n  - seed: {seed}\n    cookies:\n      - \"{cookie}\""
            )
            .unwrap();
        }
        file.flush().unwrap();
        let config = Arc::new(Mutex::new(ConfigFile::load(file.path()).unwrap()));

        let client = Arc::new(
            TorClient::new(darkmap_fetch::TorClientConfig {
                proxy: None,
                // Unroutable on purpose so identity lookup fails fast.
                ip_echo_url: "http://127.0.0.1:1/ip".to_string(),
                ..Default::default()
            })
            .unwrap(),
        );

        let crawler = Crawler::new(
            seed.to_string(),
            out.path().join("run"),
            client,
            config,
        )
        .await
        .unwrap();
        (out, file, crawler)
    }

    #[tokio::test]
    async fn test_unextractable_page_settles_tracking_state() {
        let (_out, _file, mut crawler) = test_crawler("http://s.onion", None).await;

        // A request URL the link extractor cannot use as a join base.
        let url = "not a base url".to_string();
        crawler.pending_depth.insert(url.clone(), 1);
        crawler.attempts.insert(url.clone(), 2);

        let mut page = Page::new(url.clone());
        page.status = 200;
        page.body = "<html><body><a href=\"/next\">next</a></body></html>".to_string();
        crawler.process(url.clone(), Ok(page)).await.unwrap();

        assert!(!crawler.pending_depth.contains_key(&url));
        assert!(!crawler.attempts.contains_key(&url));
        assert_eq!(crawler.crawled, 0);
        assert_eq!(crawler.monitor.snapshot_counters().nodes, 0);
    }

    #[tokio::test]
    async fn test_exhausted_cookie_pool_ends_run_with_cookie_timeout() {
        let server = MockServer::start().await;

        // The only configured cookie is rejected with a bounce to the login
        // page, so startup validation empties the pool.
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/login"))
            .mount(&server)
            .await;

        let seed = server.uri();
        let (_out, _file, mut crawler) = test_crawler(&seed, Some("dead=1")).await;
        crawler.limits.cookie_wait = Duration::from_millis(50);

        let summary = crawler.run().await.unwrap();
        assert_eq!(summary.reason, TerminationReason::CookieTimeout);
        assert_eq!(summary.crawled, 0);
    }

    #[tokio::test]
    async fn test_failed_status_page_creates_no_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("<html>down</html>"))
            .mount(&server)
            .await;

        let seed = server.uri();
        let (_out, _file, crawler) = test_crawler(&seed, None).await;

        let summary = crawler.run().await.unwrap();
        assert_eq!(summary.reason, TerminationReason::AllCrawled);
        assert_eq!(summary.crawled, 0);
        assert_eq!(summary.counters.n_5xx, 1);
        assert_eq!(summary.counters.nodes, 0);
    }
}
