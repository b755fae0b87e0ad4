//! JSON record and replay.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{replay_at, Endpoint, EndpointError, Sample, SubsetView};

/// Accumulates stored samples in memory and dumps them as one JSON array
/// on flush. Optionally replays a previously dumped file.
pub struct JsonEndpoint {
    output: Option<PathBuf>,
    replay: Vec<Sample>,
    recorded: Mutex<Vec<Sample>>,
}

impl JsonEndpoint {
    pub async fn open(
        replay: Option<&Path>,
        output: Option<PathBuf>,
    ) -> Result<Self, EndpointError> {
        let replay = match replay {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                let samples: Vec<Sample> = serde_json::from_str(&content)?;
                debug!(path = %path.display(), records = samples.len(), "Loaded JSON replay");
                samples
            }
            None => Vec::new(),
        };
        Ok(Self {
            output,
            replay,
            recorded: Mutex::new(Vec::new()),
        })
    }

    /// Write everything recorded so far to the output file.
    pub async fn dump(&self) -> Result<(), EndpointError> {
        let Some(path) = &self.output else {
            return Ok(());
        };
        let recorded = self.recorded.lock().await;
        let body = serde_json::to_vec_pretty(&*recorded)?;
        tokio::fs::write(path, body).await?;
        info!(path = %path.display(), records = recorded.len(), "Dumped samples");
        Ok(())
    }
}

#[async_trait]
impl Endpoint for JsonEndpoint {
    fn name(&self) -> &str {
        "json"
    }

    async fn load_subset(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        Ok(replay_at(&self.replay, timestamp, view))
    }

    async fn store(&self, samples: &[Sample]) -> Result<(), EndpointError> {
        if self.output.is_none() {
            return Err(self.unsupported("store"));
        }
        self.recorded.lock().await.extend_from_slice(samples);
        Ok(())
    }

    async fn flush(&self) -> Result<(), EndpointError> {
        self.dump().await
    }
}
