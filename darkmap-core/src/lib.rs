pub mod config;
pub mod cookies;
pub mod crawler;
pub mod error;
pub mod monitor;
pub mod seeds;
pub mod store;
pub mod summary;

pub use config::{ConfigData, ConfigFile, SeedCookies};
pub use cookies::CookieSessionManager;
pub use crawler::Crawler;
pub use error::CrawlError;
pub use monitor::{CrawlMonitor, SkipReason};
pub use store::PageStore;
pub use summary::{Counters, CrawlSummary, TerminationReason};

pub fn print_banner() {
    println!(
        r#"
     _            _
  __| | __ _ _ __| | ___ __ ___   __ _ _ __
 / _` |/ _` | '__| |/ / '_ ` _ \ / _` | '_ \
| (_| | (_| | |  |   <| | | | | | (_| | |_) |
 \__,_|\__,_|_|  |_|\_\_| |_| |_|\__,_| .__/
                                      |_|
"#
    );
    println!(
        "darkmap v{} - onion-service crawler",
        env!("CARGO_PKG_VERSION")
    );
}
