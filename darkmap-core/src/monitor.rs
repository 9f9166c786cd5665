//! In-memory crawl event log and link graph with periodic CSV persistence.
//!
//! Everything is append-only: visit, schedule and skip records accumulate in
//! vectors, URLs become nodes in a petgraph `DiGraph`, and link relations
//! become directed edges (parallel edges are meaningful and kept). A
//! background task rewrites each CSV file on a fixed interval, but only for
//! collections that grew since the previous flush.

use crate::error::Result;
use crate::summary::Counters;
use chrono::Local;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Why a discovered URL will never be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MaxDepth,
    Error,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MaxDepth => "MAX_DEPTH",
            SkipReason::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub url: String,
    pub depth: usize,
    pub filename: String,
}

struct VisitRecord {
    timestamp: String,
    url: String,
    status: u16,
}

struct ScheduledRecord {
    timestamp: String,
    url: String,
    depth: usize,
}

struct SkipRecord {
    timestamp: String,
    url: String,
    reason: SkipReason,
}

#[derive(Default)]
struct FlushMarks {
    visits: usize,
    scheduled: usize,
    skipped: usize,
    nodes: usize,
    edges: usize,
}

struct MonitorInner {
    graph: DiGraph<NodeRecord, ()>,
    nodes_by_url: HashMap<String, NodeIndex>,
    visits: Vec<VisitRecord>,
    scheduled: Vec<ScheduledRecord>,
    skipped: Vec<SkipRecord>,
    requests: u64,
    marks: FlushMarks,
}

pub struct CrawlMonitor {
    inner: Arc<Mutex<MonitorInner>>,
    monitor_dir: PathBuf,
    graph_dir: PathBuf,
    ip_client: String,
    running: Arc<AtomicBool>,
}

fn now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

impl CrawlMonitor {
    /// Set up `monitor/` and `graph/` under the project directory and write
    /// the header row of every output file.
    pub fn create(project_dir: &Path, ip_client: &str) -> Result<Self> {
        let monitor_dir = project_dir.join("monitor");
        let graph_dir = project_dir.join("graph");
        fs::create_dir_all(&monitor_dir)?;
        fs::create_dir_all(&graph_dir)?;

        let monitor = Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                graph: DiGraph::new(),
                nodes_by_url: HashMap::new(),
                visits: Vec::new(),
                scheduled: Vec::new(),
                skipped: Vec::new(),
                requests: 0,
                marks: FlushMarks::default(),
            })),
            monitor_dir,
            graph_dir,
            ip_client: ip_client.to_string(),
            running: Arc::new(AtomicBool::new(false)),
        };
        monitor.flush(true)?;
        Ok(monitor)
    }

    /// Node for `url`, creating it at `depth` if this URL is new. The page
    /// body filename is derived from the node index.
    pub fn add_node(&self, url: &str, depth: usize) -> NodeIndex {
        let mut inner = self.inner.lock().expect("monitor lock");
        if let Some(&index) = inner.nodes_by_url.get(url) {
            return index;
        }

        let index = inner.graph.add_node(NodeRecord {
            url: url.to_string(),
            depth,
            filename: String::new(),
        });
        inner.graph[index].filename = format!("{}.html", index.index());
        inner.nodes_by_url.insert(url.to_string(), index);
        debug!("New node {} for {url} at depth {depth}", index.index());
        index
    }

    pub fn node_for(&self, url: &str) -> Option<NodeIndex> {
        self.inner
            .lock()
            .expect("monitor lock")
            .nodes_by_url
            .get(url)
            .copied()
    }

    pub fn add_edge(&self, from: NodeIndex, to: NodeIndex) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.graph.add_edge(from, to, ());
    }

    pub fn record_visit(&self, url: &str, status: u16) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.visits.push(VisitRecord {
            timestamp: now(),
            url: url.to_string(),
            status,
        });
    }

    pub fn record_scheduled(&self, url: &str, depth: usize) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.scheduled.push(ScheduledRecord {
            timestamp: now(),
            url: url.to_string(),
            depth,
        });
    }

    pub fn record_skipped(&self, url: &str, reason: SkipReason) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.skipped.push(SkipRecord {
            timestamp: now(),
            url: url.to_string(),
            reason,
        });
    }

    pub fn update_request_count(&self, requests: u64) {
        self.inner.lock().expect("monitor lock").requests = requests;
    }

    /// Aggregate view of the crawl so far. The histogram buckets by hundreds;
    /// anything below 200 lands in the server-error bucket together with 5xx.
    pub fn snapshot_counters(&self) -> Counters {
        let inner = self.inner.lock().expect("monitor lock");
        let mut counters = Counters {
            nodes: inner.graph.node_count(),
            skipped: inner.skipped.len(),
            requests: inner.requests,
            ..Default::default()
        };

        for visit in &inner.visits {
            match visit.status / 100 {
                2 => counters.n_2xx += 1,
                3 => counters.n_3xx += 1,
                4 => counters.n_4xx += 1,
                _ => counters.n_5xx += 1,
            }
        }

        counters
    }

    pub fn crawled(&self) -> usize {
        self.inner.lock().expect("monitor lock").visits.len()
    }

    /// Spawn the periodic flush task. Runs until [`stop`](Self::stop).
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let monitor = self.clone_handle();
        tokio::spawn(async move {
            while monitor.running.load(Ordering::SeqCst) {
                sleep(FLUSH_INTERVAL).await;
                if let Err(e) = monitor.flush(false) {
                    error!("Periodic monitor flush failed: {e}");
                }
            }
        });
    }

    /// Stop the flush task and do one last unconditional flush.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.flush(true)
    }

    fn clone_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            monitor_dir: self.monitor_dir.clone(),
            graph_dir: self.graph_dir.clone(),
            ip_client: self.ip_client.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Rewrite each CSV whose backing collection grew since the last flush.
    /// `force` rewrites everything, growth or not.
    pub fn flush(&self, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("monitor lock");

        if force || inner.visits.len() > inner.marks.visits {
            let mut writer = csv::Writer::from_path(self.monitor_dir.join("crawledpages.csv"))?;
            writer.write_record(["timestamp", "url", "ip_client", "status_code"])?;
            for visit in &inner.visits {
                let status = visit.status.to_string();
                writer.write_record([
                    visit.timestamp.as_str(),
                    visit.url.as_str(),
                    self.ip_client.as_str(),
                    status.as_str(),
                ])?;
            }
            writer.flush()?;
            inner.marks.visits = inner.visits.len();
        }

        if force || inner.scheduled.len() > inner.marks.scheduled {
            let mut writer = csv::Writer::from_path(self.monitor_dir.join("scheduled.csv"))?;
            writer.write_record(["timestamp", "url", "ip_client", "depth"])?;
            for entry in &inner.scheduled {
                let depth = entry.depth.to_string();
                writer.write_record([
                    entry.timestamp.as_str(),
                    entry.url.as_str(),
                    self.ip_client.as_str(),
                    depth.as_str(),
                ])?;
            }
            writer.flush()?;
            inner.marks.scheduled = inner.scheduled.len();
        }

        if force || inner.skipped.len() > inner.marks.skipped {
            let mut writer = csv::Writer::from_path(self.monitor_dir.join("unvisitedlinks.csv"))?;
            writer.write_record(["timestamp", "url", "reason"])?;
            for entry in &inner.skipped {
                writer.write_record([
                    entry.timestamp.as_str(),
                    entry.url.as_str(),
                    entry.reason.as_str(),
                ])?;
            }
            writer.flush()?;
            inner.marks.skipped = inner.skipped.len();
        }

        if force || inner.graph.node_count() > inner.marks.nodes {
            let mut writer = csv::Writer::from_path(self.graph_dir.join("nodes.csv"))?;
            writer.write_record(["url", "index", "depth_level", "filename"])?;
            for index in inner.graph.node_indices() {
                let node = &inner.graph[index];
                let node_index = index.index().to_string();
                let depth = node.depth.to_string();
                writer.write_record([
                    node.url.as_str(),
                    node_index.as_str(),
                    depth.as_str(),
                    node.filename.as_str(),
                ])?;
            }
            writer.flush()?;
            inner.marks.nodes = inner.graph.node_count();
        }

        if force || inner.graph.edge_count() > inner.marks.edges {
            let mut writer = csv::Writer::from_path(self.graph_dir.join("edges.csv"))?;
            writer.write_record(["node", "node"])?;
            for edge in inner.graph.edge_indices() {
                if let Some((from, to)) = inner.graph.edge_endpoints(edge) {
                    writer.write_record([from.index().to_string(), to.index().to_string()])?;
                }
            }
            writer.flush()?;
            inner.marks.edges = inner.graph.edge_count();
        }

        Ok(())
    }
}
