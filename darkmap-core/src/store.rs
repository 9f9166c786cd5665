//! Background page body writer.

use crate::error::Result;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Writes fetched bodies to `pages/<node_index>.html` off the crawl loop's
/// critical path. Queued bodies not yet written when `stop` is called are
/// dropped.
pub struct PageStore {
    pages_dir: PathBuf,
    queue: Arc<Mutex<VecDeque<(usize, String)>>>,
    writing: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl PageStore {
    pub fn create(project_dir: &Path) -> Result<Self> {
        let pages_dir = project_dir.join("pages");
        fs::create_dir_all(&pages_dir)?;
        Ok(Self {
            pages_dir,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            writing: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let queue = Arc::clone(&self.queue);
        let writing = Arc::clone(&self.writing);
        let running = Arc::clone(&self.running);
        let pages_dir = self.pages_dir.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                // The writing flag flips inside the queue lock so idleness
                // never shows a gap between dequeue and write.
                let next = {
                    let mut queue = queue.lock().expect("page queue lock");
                    let item = queue.pop_front();
                    if item.is_some() {
                        writing.store(true, Ordering::SeqCst);
                    }
                    item
                };
                match next {
                    Some((index, body)) => {
                        let path = pages_dir.join(format!("{index}.html"));
                        if let Err(e) = fs::write(&path, body) {
                            error!("Failed to write {}: {e}", path.display());
                        }
                        writing.store(false, Ordering::SeqCst);
                    }
                    None => sleep(IDLE_POLL).await,
                }
            }
            let dropped = queue.lock().expect("page queue lock").len();
            if dropped > 0 {
                debug!("Dropping {dropped} unwritten page bodies on stop");
            }
        });
    }

    pub fn save(&self, node_index: usize, body: String) {
        self.queue
            .lock()
            .expect("page queue lock")
            .push_back((node_index, body));
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().expect("page queue lock").is_empty()
            && !self.writing.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
