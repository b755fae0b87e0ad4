//! Loader plus fire-and-forget savers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use vmsched_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use super::{Endpoint, EndpointError, Sample, SubsetView};
use crate::actors::BackoffPolicy;

/// Per-saver worker settings.
#[derive(Debug, Clone)]
pub struct SaverConfig {
    /// Batches queued before new ones are dropped.
    pub queue_depth: usize,
    /// Store attempts per batch.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Failed batches tolerated within `failure_window` before the saver is
    /// suspended until the window rolls over.
    pub max_failures: u32,
    pub failure_window: Duration,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            max_failures: DEFAULT_MAX_RETRIES,
            failure_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

enum SaverJob {
    Store(Vec<Sample>),
    Flush(oneshot::Sender<()>),
}

struct SaverWorker {
    name: String,
    tx: mpsc::Sender<SaverJob>,
    failures: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

/// One loader and any number of savers.
///
/// Sampling never waits on a saver: each saver has its own worker task fed
/// through a bounded queue.
pub struct EndpointPool {
    loader: Arc<dyn Endpoint>,
    savers: Vec<SaverWorker>,
}

impl EndpointPool {
    pub fn new(loader: Arc<dyn Endpoint>) -> Self {
        Self {
            loader,
            savers: Vec::new(),
        }
    }

    /// Attach a saver. Must be called inside a tokio runtime.
    pub fn with_saver(mut self, saver: Arc<dyn Endpoint>, config: SaverConfig) -> Self {
        let name = saver.name().to_string();
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let failures = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_saver(
            saver,
            rx,
            config,
            failures.clone(),
            dropped.clone(),
        ));
        debug!(saver = %name, "Saver attached");

        self.savers.push(SaverWorker {
            name,
            tx,
            failures,
            dropped,
            task,
        });
        self
    }

    pub fn loader_name(&self) -> &str {
        self.loader.name()
    }

    pub fn saver_names(&self) -> Vec<&str> {
        self.savers.iter().map(|s| s.name.as_str()).collect()
    }

    /// Load samples for one subset and hand a copy to every saver.
    pub async fn sample(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        let samples = self.loader.load_subset(timestamp, view).await?;
        self.record(&samples);
        Ok(samples)
    }

    /// Load machine-wide samples and hand a copy to every saver.
    pub async fn sample_global(
        &self,
        timestamp: DateTime<Utc>,
        views: &[SubsetView],
    ) -> Result<Vec<Sample>, EndpointError> {
        let samples = self.loader.load_global(timestamp, views).await?;
        self.record(&samples);
        Ok(samples)
    }

    /// Hand samples produced elsewhere to every saver.
    pub fn record(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        for saver in &self.savers {
            match saver.tx.try_send(SaverJob::Store(samples.to_vec())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    saver.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(saver = %saver.name, "Saver queue full, dropping batch");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    saver.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(saver = %saver.name, "Saver stopped, dropping batch");
                }
            }
        }
    }

    /// Wait until every saver has processed its queue and flushed.
    pub async fn flush(&self) {
        let mut acks = Vec::with_capacity(self.savers.len());
        for saver in &self.savers {
            let (ack_tx, ack_rx) = oneshot::channel();
            if saver.tx.send(SaverJob::Flush(ack_tx)).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Batches that ultimately failed, per saver.
    pub fn saver_failures(&self) -> BTreeMap<String, u64> {
        self.savers
            .iter()
            .map(|s| (s.name.clone(), s.failures.load(Ordering::Relaxed)))
            .collect()
    }

    /// Batches dropped without an attempt (full queue or suspended saver).
    pub fn dropped_batches(&self) -> BTreeMap<String, u64> {
        self.savers
            .iter()
            .map(|s| (s.name.clone(), s.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Flush and stop every saver worker.
    pub async fn shutdown(self) {
        self.flush().await;
        for saver in self.savers {
            drop(saver.tx);
            if let Err(e) = saver.task.await {
                error!(saver = %saver.name, error = %e, "Saver task panicked");
            }
        }
    }
}

async fn run_saver(
    saver: Arc<dyn Endpoint>,
    mut rx: mpsc::Receiver<SaverJob>,
    config: SaverConfig,
    failures: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) {
    let name = saver.name().to_string();
    let mut tracker = RetryTracker::new(config.max_failures, config.failure_window);

    while let Some(job) = rx.recv().await {
        match job {
            SaverJob::Store(samples) => {
                if tracker.is_exhausted(&name) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                match store_with_retry(saver.as_ref(), &samples, &config).await {
                    Ok(()) => tracker.clear(&name),
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        if tracker.record_failure(&name) {
                            error!(saver = %name, error = %e, "Saver failing repeatedly, suspending");
                        } else {
                            warn!(saver = %name, error = %e, "Failed to store samples");
                        }
                    }
                }
            }
            SaverJob::Flush(ack) => {
                if let Err(e) = saver.flush().await {
                    warn!(saver = %name, error = %e, "Failed to flush saver");
                }
                let _ = ack.send(());
            }
        }
    }
    debug!(saver = %name, "Saver stopped");
}

async fn store_with_retry(
    saver: &dyn Endpoint,
    samples: &[Sample],
    config: &SaverConfig,
) -> Result<(), EndpointError> {
    let mut attempt = 0;
    loop {
        match saver.store(samples).await {
            Ok(()) => return Ok(()),
            // Retrying cannot help an endpoint that does not store.
            Err(e @ EndpointError::Unsupported { .. }) => return Err(e),
            Err(e) if attempt + 1 >= config.max_attempts => return Err(e),
            Err(e) => {
                debug!(saver = saver.name(), attempt, error = %e, "Store failed, retrying");
                tokio::time::sleep(config.backoff.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
