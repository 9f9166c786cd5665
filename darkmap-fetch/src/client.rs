use crate::error::{FetchError, Result};
use crate::page::{Hop, Page};
use rand::prelude::IndexedRandom;
use reqwest::header::{COOKIE, LOCATION, USER_AGENT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

const MAX_REDIRECTS: usize = 5;

/// Browser user agents rotated per request so the exit traffic does not
/// carry a stable fingerprint.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Connection settings for [`TorClient`].
#[derive(Debug, Clone)]
pub struct TorClientConfig {
    /// SOCKS/HTTP proxy URL. `None` connects directly (used by tests).
    pub proxy: Option<String>,
    /// Address of the anonymity network's control channel.
    pub control_addr: String,
    /// Shared secret for the control channel.
    pub control_password: String,
    /// Public IP-echo endpoint polled during identity renewal.
    pub ip_echo_url: String,
    pub timeout_secs: u64,
}

impl Default for TorClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            control_addr: "127.0.0.1:9051".to_string(),
            control_password: String::new(),
            ip_echo_url: "https://ident.me".to_string(),
            // Hidden services routinely take the better part of a minute.
            timeout_secs: 120,
        }
    }
}

/// HTTP client routed through an anonymizing proxy.
///
/// Redirects are followed manually so every fetch exposes its full redirect
/// history, which the content validator needs. Identity renewal takes an
/// exclusive lock; fetches issued during a renewal block until the new exit
/// identity is confirmed.
pub struct TorClient {
    http: reqwest::Client,
    renew_lock: RwLock<()>,
    config: TorClientConfig,
    requests_sent: AtomicU64,
}

impl TorClient {
    pub fn new(config: TorClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs / 2))
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy_url) = config.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            http: builder.build()?,
            renew_lock: RwLock::new(()),
            config,
            requests_sent: AtomicU64::new(0),
        })
    }

    /// Total number of HTTP requests issued, redirect hops included.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Fetch one URL through the proxy, following redirects manually and
    /// recording each hop. Blocks while an identity renewal is in progress.
    /// No retry happens here; failures propagate to the caller.
    pub async fn fetch(&self, url: &str, cookie: Option<&str>) -> Result<Page> {
        let _traffic = self.renew_lock.read().await;
        self.fetch_unlocked(url, cookie).await
    }

    async fn fetch_unlocked(&self, url: &str, cookie: Option<&str>) -> Result<Page> {
        let mut current =
            Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        let mut history = Vec::new();

        for _ in 0..=MAX_REDIRECTS {
            debug!("Fetching {}", current);
            let mut request = self
                .http
                .get(current.clone())
                .header(USER_AGENT, random_user_agent());
            if let Some(cookie) = cookie {
                request = request.header(COOKIE, cookie);
            }

            let response = request.send().await?;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);

            let status = response.status().as_u16();
            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    // Redirect status without a target; treat as the final page.
                    let body = response.text().await?;
                    return Ok(Page {
                        url: url.to_string(),
                        final_url: current.to_string(),
                        status,
                        body,
                        history,
                    });
                };

                let next = current
                    .join(location)
                    .map_err(|e| FetchError::InvalidUrl(format!("{location}: {e}")))?;
                history.push(Hop {
                    status,
                    url: current.to_string(),
                    location: next.to_string(),
                });
                current = next;
                continue;
            }

            let body = response.text().await?;
            debug!("Fetched {} -> {}", url, status);
            return Ok(Page {
                url: url.to_string(),
                final_url: current.to_string(),
                status,
                body,
                history,
            });
        }

        Err(FetchError::TooManyRedirects(url.to_string()))
    }

    /// Probe the IP-echo endpoint for the currently observed exit address.
    pub async fn current_ip(&self) -> Result<String> {
        let _traffic = self.renew_lock.read().await;
        self.probe_ip().await
    }

    async fn probe_ip(&self) -> Result<String> {
        let echo_url = self.config.ip_echo_url.clone();
        let page = self.fetch_unlocked(&echo_url, None).await?;
        Ok(page.body.trim().to_string())
    }

    /// Request a fresh exit identity from the control channel and wait until
    /// the observed address changes. Holds an exclusive lock for the whole
    /// operation, so all concurrent fetches on this client stall until the
    /// new identity is confirmed.
    pub async fn renew_identity(&self) -> Result<()> {
        let _exclusive = self.renew_lock.write().await;

        let old_ip = self.probe_ip().await?;
        debug!("Renewing identity, current exit address {}", old_ip);

        self.signal_new_identity().await?;

        loop {
            let new_ip = self.probe_ip().await?;
            if new_ip != old_ip {
                info!("Exit identity renewed: {} -> {}", old_ip, new_ip);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn signal_new_identity(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.config.control_addr).await?;

        let auth = format!("AUTHENTICATE \"{}\"\r\n", self.config.control_password);
        stream.write_all(auth.as_bytes()).await?;
        read_control_ok(&mut stream, "AUTHENTICATE").await?;

        stream.write_all(b"SIGNAL NEWNYM\r\n").await?;
        read_control_ok(&mut stream, "SIGNAL NEWNYM").await?;

        stream.write_all(b"QUIT\r\n").await?;
        Ok(())
    }
}

async fn read_control_ok(stream: &mut TcpStream, command: &str) -> Result<()> {
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    if reply.starts_with("250") {
        Ok(())
    } else {
        Err(FetchError::Control(format!(
            "{command} rejected: {}",
            reply.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn direct_client() -> TorClient {
        TorClient::new(TorClientConfig::default()).unwrap()
    }

    #[test]
    fn test_random_user_agent_is_from_pool() {
        for _ in 0..20 {
            assert!(USER_AGENTS.contains(&random_user_agent()));
        }
    }

    #[tokio::test]
    async fn test_fetch_attaches_cookie_header() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("cookie", "session=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let client = direct_client();
        let page = client
            .fetch(&mock_server.uri(), Some("session=abc123"))
            .await
            .unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.body, "ok");
        assert!(page.history.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_records_redirect_history() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/login"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("login page"))
            .mount(&mock_server)
            .await;

        let client = direct_client();
        let start = format!("{}/start", mock_server.uri());
        let page = client.fetch(&start, None).await.unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.url, start);
        assert_eq!(page.final_url, format!("{}/login", mock_server.uri()));
        assert_eq!(page.history.len(), 1);
        assert_eq!(page.history[0].status, 302);
        assert_eq!(
            page.history[0].location,
            format!("{}/login", mock_server.uri())
        );
    }

    #[tokio::test]
    async fn test_fetch_gives_up_on_redirect_loop() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&mock_server)
            .await;

        let client = direct_client();
        let url = format!("{}/loop", mock_server.uri());
        let err = client.fetch(&url, None).await.unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects(_)));
    }

    #[tokio::test]
    async fn test_request_counter_counts_hops() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/b"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let client = direct_client();
        client
            .fetch(&format!("{}/a", mock_server.uri()), None)
            .await
            .unwrap();
        assert_eq!(client.requests_sent(), 2);
    }

    #[tokio::test]
    async fn test_renew_identity_waits_for_new_address() {
        let mock_server = MockServer::start().await;

        // First probe sees the old address once, every later probe the new one.
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_string("10.0.0.1\n"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_string("10.0.0.2\n"))
            .mount(&mock_server)
            .await;

        // Fake control channel that accepts everything.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 || buf[..n].starts_with(b"QUIT") {
                    break;
                }
                socket.write_all(b"250 OK\r\n").await.unwrap();
            }
        });

        let client = Arc::new(
            TorClient::new(TorClientConfig {
                control_addr,
                ip_echo_url: format!("{}/ip", mock_server.uri()),
                ..TorClientConfig::default()
            })
            .unwrap(),
        );

        client.renew_identity().await.unwrap();
        assert_eq!(client.current_ip().await.unwrap(), "10.0.0.2");
    }
}
