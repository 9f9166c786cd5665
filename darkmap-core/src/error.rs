use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] darkmap_fetch::FetchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Project directory already exists: {0}")]
    ProjectDirExists(PathBuf),

    #[error("Invalid seed URL: {0}")]
    InvalidSeed(String),

    #[error("Timed out waiting for a cookie for seed {0}")]
    CookieTimeout(String),

    #[error("No depth recorded for {0}")]
    MissingDepth(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
