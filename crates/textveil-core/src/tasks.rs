//! Background task queue
//!
//! Audit appends, co-occurrence updates, and map persistence all run off
//! the request path. Tasks are fire-and-forget: a handful of retries with
//! exponential backoff, then the failure is logged and dropped. A task
//! kind that keeps exhausting its retries gets disabled so a broken sink
//! cannot eat the worker.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub struct BackgroundTask {
    pub kind: &'static str,
    run: Arc<dyn Fn() -> TaskFuture + Send + Sync>,
}

impl BackgroundTask {
    pub fn new<F, Fut>(kind: &'static str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            kind,
            run: Arc::new(move || Box::pin(f())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Consecutive exhausted-retry failures before a kind is disabled.
    pub disable_after: u32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            disable_after: 3,
        }
    }
}

pub struct TaskQueue {
    /// `None` once shutdown has begun; the worker drains and exits when the
    /// sender drops.
    tx: Option<mpsc::UnboundedSender<BackgroundTask>>,
    disabled: Arc<Mutex<HashSet<&'static str>>>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let disabled: Arc<Mutex<HashSet<&'static str>>> = Arc::new(Mutex::new(HashSet::new()));

        let worker = tokio::spawn(worker_loop(rx, config, disabled.clone()));

        Self {
            tx: Some(tx),
            disabled,
            worker: Some(worker),
        }
    }

    /// Enqueue a task. Never blocks and never fails the caller: a full
    /// shutdown or a disabled kind just drops the task with a log line.
    pub fn submit(&self, task: BackgroundTask) {
        if self.is_disabled(task.kind) {
            warn!("Dropping task of disabled kind '{}'", task.kind);
            return;
        }
        let sent = self
            .tx
            .as_ref()
            .map(|tx| tx.send(task).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("Task queue is shut down, dropping task");
        }
    }

    pub fn is_disabled(&self, kind: &str) -> bool {
        self.disabled
            .lock()
            .map(|set| set.contains(kind))
            .unwrap_or(false)
    }

    /// Drop the sender and wait for the worker to drain. Test and shutdown
    /// hook only.
    pub async fn shutdown(mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<BackgroundTask>,
    config: TaskQueueConfig,
    disabled: Arc<Mutex<HashSet<&'static str>>>,
) {
    let mut consecutive_failures: HashMap<&'static str, u32> = HashMap::new();

    while let Some(task) = rx.recv().await {
        if disabled
            .lock()
            .map(|set| set.contains(task.kind))
            .unwrap_or(false)
        {
            continue;
        }

        match run_with_retries(&task, &config).await {
            Ok(()) => {
                consecutive_failures.remove(task.kind);
            }
            Err(e) => {
                let failures = consecutive_failures.entry(task.kind).or_insert(0);
                *failures += 1;
                error!(
                    "Task '{}' failed after {} retries ({} consecutive): {}",
                    task.kind, config.max_retries, failures, e
                );

                if *failures >= config.disable_after {
                    warn!("Disabling task kind '{}' after repeated failures", task.kind);
                    if let Ok(mut set) = disabled.lock() {
                        set.insert(task.kind);
                    }
                }
            }
        }
    }
    debug!("Task queue worker exiting");
}

async fn run_with_retries(task: &BackgroundTask, config: &TaskQueueConfig) -> Result<()> {
    let mut attempt = 0;
    loop {
        match (task.run)().await {
            Ok(()) => {
                debug!("Task '{}' completed on attempt {}", task.kind, attempt + 1);
                return Ok(());
            }
            Err(e) if attempt < config.max_retries => {
                let backoff = config.base_backoff * 2u32.pow(attempt);
                warn!(
                    "Task '{}' attempt {} failed, retrying in {:?}: {}",
                    task.kind,
                    attempt + 1,
                    backoff,
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
