//! Upstream log capture: byte ring plus subscriber fan-out.
//!
//! Child stdout/stderr readers push tagged lines into a fixed-size byte
//! ring (oldest bytes overwritten) and publish each line on a broadcast
//! channel. A slow subscriber lags and drops; the writer never stalls.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tracing::debug;

/// Default ring capacity in bytes.
pub const DEFAULT_LOG_RING_CAPACITY: usize = 10 * 1024;

/// Broadcast backlog before subscribers start lagging.
const SUBSCRIBER_BACKLOG: usize = 1024;

/// Fixed-capacity byte ring.
#[derive(Debug)]
pub struct LogRing {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes, dropping the oldest once full.
    pub fn push(&mut self, data: &[u8]) {
        for &b in data {
            if self.bytes.len() == self.capacity {
                self.bytes.pop_front();
            }
            self.bytes.push_back(b);
        }
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Shared log sink for all upstream processes and the proxy itself.
pub struct LogMonitor {
    ring: RwLock<LogRing>,
    tx: broadcast::Sender<String>,
}

impl LogMonitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            ring: RwLock::new(LogRing::new(capacity)),
            tx,
        }
    }

    /// Record one line, tagged with the model it came from.
    pub fn write_line(&self, model: &str, line: &str) {
        let tagged = format!("[{model}] {line}\n");
        {
            let mut ring = self.ring.write().expect("log ring lock poisoned");
            ring.push(tagged.as_bytes());
        }
        // No receivers is fine; lagged receivers drop on their own.
        let _ = self.tx.send(tagged);
    }

    /// Snapshot of the ring contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.ring.read().expect("log ring lock poisoned").snapshot()
    }

    /// Live feed of tagged lines.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for LogMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RING_CAPACITY)
    }
}

/// Spawn reader tasks that drain a child's stdout and stderr into the
/// monitor. The tasks exit when the streams close.
pub fn spawn_log_readers(child: &mut tokio::process::Child, model: &str, monitor: Arc<LogMonitor>) {
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, model.to_string(), Arc::clone(&monitor));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, model.to_string(), monitor);
    }
}

fn spawn_reader<R>(stream: R, model: String, monitor: Arc<LogMonitor>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            monitor.write_line(&model, &line);
        }
        debug!(model = %model, "log reader task exiting");
    });
}
