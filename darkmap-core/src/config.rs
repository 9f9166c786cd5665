use crate::error::{CrawlError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

fn default_project_name() -> String {
    "default".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_control_port() -> u16 {
    9051
}

fn default_ip_echo() -> String {
    "https://ident.me".to_string()
}

/// The authoritative cookie list for one seed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedCookies {
    pub seed: String,
    #[serde(default)]
    pub cookies: Vec<String>,
}

/// On-disk configuration schema. Key names keep the flat dotted style of
/// the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Proxy for all crawl traffic. Empty or absent connects directly,
    /// which is only sensible in tests.
    #[serde(default)]
    pub http_proxy: Option<String>,

    pub data_directory: String,

    #[serde(rename = "crawler.max_links")]
    pub max_links: usize,

    /// Seconds.
    #[serde(rename = "crawler.max_time")]
    pub max_time: u64,

    /// Milliseconds between task submissions to the worker pool.
    #[serde(rename = "crawler.wait_request")]
    pub wait_request: u64,

    #[serde(rename = "crawler.depth")]
    pub max_depth: usize,

    #[serde(rename = "crawler.workers", default = "default_workers")]
    pub workers: usize,

    #[serde(rename = "tor.control_port", default = "default_control_port")]
    pub control_port: u16,

    #[serde(rename = "tor.control_password", default)]
    pub control_password: String,

    #[serde(rename = "tor.ip_echo", default = "default_ip_echo")]
    pub ip_echo: String,

    #[serde(
        rename = "crawler.cookies",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cookies: Vec<SeedCookies>,
}

/// YAML configuration file with explicit staleness checking. Cookie
/// mutations are persisted straight back to the same file, which an
/// operator may also be editing by hand while a crawl runs.
pub struct ConfigFile {
    path: PathBuf,
    last_checked: Option<SystemTime>,
    data: ConfigData,
}

impl ConfigFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(CrawlError::Config(format!(
                "invalid path: '{}' does not exist",
                path.display()
            )));
        }

        let raw = fs::read_to_string(&path)?;
        let data = serde_yaml::from_str(&raw)?;
        let last_checked = Some(fs::metadata(&path)?.modified()?);
        debug!("Loaded configuration from {}", path.display());

        Ok(Self {
            path,
            last_checked,
            data,
        })
    }

    fn reload(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)?;
        self.data = serde_yaml::from_str(&raw)?;
        self.last_checked = Some(fs::metadata(&self.path)?.modified()?);
        debug!("Loaded configuration from {}", self.path.display());
        Ok(())
    }

    /// Re-read the file iff its modification time advanced since the last
    /// read. Returns whether a reload happened.
    pub fn refresh_if_stale(&mut self) -> Result<bool> {
        let modified = fs::metadata(&self.path)?.modified()?;
        match self.last_checked {
            Some(last) if modified <= last => Ok(false),
            _ => {
                self.reload()?;
                Ok(true)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &ConfigData {
        &self.data
    }

    pub fn has_cookies(&self, seed: &str) -> bool {
        self.data
            .cookies
            .iter()
            .any(|entry| entry.seed == seed && !entry.cookies.is_empty())
    }

    pub fn cookies_for(&self, seed: &str) -> Option<Vec<String>> {
        self.data
            .cookies
            .iter()
            .find(|entry| entry.seed == seed)
            .map(|entry| entry.cookies.clone())
    }

    /// Remove one cookie from a seed's set and persist. A cookie that is
    /// already gone is not an error.
    pub fn remove_cookie(&mut self, seed: &str, cookie: &str) -> Result<()> {
        if let Some(entry) = self.data.cookies.iter_mut().find(|e| e.seed == seed) {
            entry.cookies.retain(|c| c != cookie);
        }
        self.persist()
    }

    /// Append a cookie to a seed's set, creating the seed entry if needed,
    /// and persist.
    pub fn add_cookie(&mut self, seed: &str, cookie: &str) -> Result<()> {
        match self.data.cookies.iter_mut().find(|e| e.seed == seed) {
            Some(entry) => entry.cookies.push(cookie.to_string()),
            None => self.data.cookies.push(SeedCookies {
                seed: seed.to_string(),
                cookies: vec![cookie.to_string()],
            }),
        }
        self.persist()
    }

    /// Drop a seed's whole cookie entry and persist.
    pub fn remove_seed(&mut self, seed: &str) -> Result<()> {
        self.data.cookies.retain(|e| e.seed != seed);
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        let raw = serde_yaml::to_string(&self.data)?;
        fs::write(&self.path, raw)?;
        // Our own write is not an external update.
        self.last_checked = Some(fs::metadata(&self.path)?.modified()?);
        Ok(())
    }
}
