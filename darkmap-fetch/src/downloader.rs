use crate::client::TorClient;
use crate::error::FetchError;
use crate::page::{DownloadTask, Page};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const IDLE_POLL: Duration = Duration::from_millis(100);

/// A completed download: the URL it was for, and what came back.
pub type Completed = (String, Result<Page, FetchError>);

/// Asynchronous, rate-limited producer-consumer download queue.
///
/// Callers [`enqueue`](Downloader::enqueue) `(url, cookie)` pairs; a
/// background dispatch loop drains the queue into a bounded worker pool,
/// waiting the configured delay between dispatches. Finished work is
/// collected with a non-blocking [`poll`](Downloader::poll). Completion
/// order is as-completed, never FIFO.
///
/// [`stop`](Downloader::stop) is best-effort: the dispatch loop exits on its
/// next iteration and any in-flight work is abandoned, not drained.
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    client: Arc<TorClient>,
    pending: Mutex<VecDeque<DownloadTask>>,
    completed: Mutex<Vec<Completed>>,
    in_flight: AtomicUsize,
    running: AtomicBool,
    workers: Arc<Semaphore>,
    wait_between: Duration,
}

impl Downloader {
    pub fn new(client: Arc<TorClient>, workers: usize, wait_between: Duration) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                client,
                pending: Mutex::new(VecDeque::new()),
                completed: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(true),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                wait_between,
            }),
        }
    }

    /// Spawn the background dispatch loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(dispatch_loop(inner));
    }

    pub fn enqueue(&self, url: &str, cookie: Option<String>) {
        debug!("Enqueuing {}", url);
        self.inner
            .pending
            .lock()
            .unwrap()
            .push_back(DownloadTask::new(url, cookie));
    }

    /// Take every task that completed since the previous poll. Never blocks.
    pub fn poll(&self) -> Vec<Completed> {
        std::mem::take(&mut *self.inner.completed.lock().unwrap())
    }

    /// True iff nothing is queued, nothing is in flight, and nothing
    /// completed is waiting to be polled.
    pub fn is_idle(&self) -> bool {
        let pending_empty = self.inner.pending.lock().unwrap().is_empty();
        pending_empty
            && self.inner.in_flight.load(Ordering::SeqCst) == 0
            && self.inner.completed.lock().unwrap().is_empty()
    }

    /// Signal the dispatch loop to exit. In-flight work is dropped.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

async fn dispatch_loop(inner: Arc<DownloaderInner>) {
    debug!("Downloader dispatch loop started");

    while inner.running.load(Ordering::SeqCst) {
        // Pop and mark in-flight under the same lock so an observer never
        // sees an empty queue while the task is still unaccounted for.
        let task = {
            let mut pending = inner.pending.lock().unwrap();
            let task = pending.pop_front();
            if task.is_some() {
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
            }
            task
        };

        let Some(task) = task else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let Ok(permit) = inner.workers.clone().acquire_owned().await else {
            break;
        };

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            let result = worker_inner
                .client
                .fetch(&task.url, task.cookie.as_deref())
                .await;
            if let Err(e) = &result {
                warn!("Download failed for {}: {}", task.url, e);
            }
            worker_inner.completed.lock().unwrap().push((task.url, result));
            worker_inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });

        // Inter-submission delay, required etiquette on the overlay network.
        if !inner.wait_between.is_zero() {
            tokio::time::sleep(inner.wait_between).await;
        }
    }

    debug!("Downloader dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TorClientConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_downloader(wait_ms: u64) -> Downloader {
        let client = Arc::new(TorClient::new(TorClientConfig::default()).unwrap());
        Downloader::new(client, 3, Duration::from_millis(wait_ms))
    }

    async fn poll_until(downloader: &Downloader, n: usize) -> Vec<Completed> {
        let mut collected = Vec::new();
        for _ in 0..200 {
            collected.extend(downloader.poll());
            if collected.len() >= n {
                return collected;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} completed tasks, got {}", n, collected.len());
    }

    #[tokio::test]
    async fn test_enqueue_poll_roundtrip() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&mock_server)
            .await;

        let downloader = test_downloader(0);
        downloader.start();

        let url = format!("{}/page", mock_server.uri());
        downloader.enqueue(&url, None);

        let completed = poll_until(&downloader, 1).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, url);
        assert_eq!(completed[0].1.as_ref().unwrap().body, "hello");

        downloader.stop();
    }

    #[tokio::test]
    async fn test_idleness_tracks_task_lifecycle() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(100)),
            )
            .mount(&mock_server)
            .await;

        let downloader = test_downloader(0);
        downloader.start();
        assert!(downloader.is_idle());

        downloader.enqueue(&format!("{}/slow", mock_server.uri()), None);
        assert!(!downloader.is_idle());

        // Completed but not yet polled still counts as busy.
        let completed = poll_until(&downloader, 1).await;
        assert_eq!(completed.len(), 1);
        assert!(downloader.is_idle());

        downloader.stop();
    }

    #[tokio::test]
    async fn test_transport_errors_are_delivered_not_lost() {
        // Nothing listens on this port.
        let downloader = test_downloader(0);
        downloader.start();

        downloader.enqueue("http://127.0.0.1:1/unreachable", None);

        let completed = poll_until(&downloader, 1).await;
        assert_eq!(completed[0].0, "http://127.0.0.1:1/unreachable");
        assert!(completed[0].1.is_err());
        assert!(downloader.is_idle());

        downloader.stop();
    }

    #[tokio::test]
    async fn test_stop_abandons_queued_work() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        // Long inter-submission delay so the queue cannot drain quickly.
        let downloader = test_downloader(5_000);
        downloader.start();

        downloader.enqueue(&format!("{}/a", mock_server.uri()), None);
        downloader.enqueue(&format!("{}/b", mock_server.uri()), None);
        downloader.stop();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // At most the first task was dispatched; the rest stays queued.
        assert!(downloader.poll().len() <= 1);
        assert!(!downloader.is_idle());
    }
}
