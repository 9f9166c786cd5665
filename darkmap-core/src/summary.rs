//! End-of-crawl accounting.

use std::fmt;

/// What ended the crawl, in decreasing order of how complete the run was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Frontier exhausted with no work in flight.
    AllCrawled,
    /// The configured link budget was reached.
    LinkLimit,
    /// A cookie-gated seed starved waiting for fresh cookies.
    CookieTimeout,
    /// The configured wall-clock budget elapsed.
    TimeLimit,
    /// The crawl loop hit an unrecoverable error.
    Aborted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TerminationReason::AllCrawled => "all links crawled",
            TerminationReason::LinkLimit => "link limit reached",
            TerminationReason::CookieTimeout => "timed out waiting for cookies",
            TerminationReason::TimeLimit => "time limit reached",
            TerminationReason::Aborted => "aborted on error",
        };
        write!(f, "{reason}")
    }
}

/// Aggregate counters over the whole run. Status codes bucket by hundreds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub n_2xx: usize,
    pub n_3xx: usize,
    pub n_4xx: usize,
    pub n_5xx: usize,
    pub skipped: usize,
    pub nodes: usize,
    pub requests: u64,
}

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub seed: String,
    pub reason: TerminationReason,
    pub counters: Counters,
    pub crawled: usize,
}

impl CrawlSummary {
    /// Share of discovered URLs that were actually visited.
    pub fn coverage(&self) -> f64 {
        if self.counters.nodes == 0 {
            return 0.0;
        }
        self.crawled as f64 / self.counters.nodes as f64 * 100.0
    }
}
