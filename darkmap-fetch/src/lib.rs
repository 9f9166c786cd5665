pub mod client;
pub mod downloader;
pub mod error;
pub mod links;
pub mod page;
pub mod validator;

pub use client::{TorClient, TorClientConfig};
pub use downloader::Downloader;
pub use error::FetchError;
pub use page::{DownloadTask, Hop, Page};
