//! CSV record and replay.
//!
//! One record per row: `timestamp,type,resource,subset,uuid,name,value`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{replay_at, Endpoint, EndpointError, Sample, SampleKind, SubsetView};
use crate::subset::SubsetId;
use crate::topology::ResourceKind;

/// One CSV row. Empty cells map to `None`.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: SampleKind,
    resource: ResourceKind,
    subset: Option<SubsetId>,
    uuid: Option<String>,
    name: Option<String>,
    value: Option<f64>,
}

impl From<&Sample> for Row {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp,
            kind: sample.kind,
            resource: sample.resource,
            subset: sample.subset_id,
            uuid: sample.consumer_id.clone(),
            name: sample.consumer_name.clone(),
            value: sample.value,
        }
    }
}

impl From<Row> for Sample {
    fn from(row: Row) -> Self {
        Self {
            timestamp: row.timestamp,
            kind: row.kind,
            resource: row.resource,
            subset_id: row.subset,
            consumer_id: row.uuid,
            consumer_name: row.name,
            value: row.value,
            counters: None,
        }
    }
}

struct Output {
    file: File,
    /// The file was empty when opened; the next write carries the header.
    fresh: bool,
}

/// Appends samples to a CSV file and/or replays a recorded one.
pub struct CsvEndpoint {
    output: Option<PathBuf>,
    file: Mutex<Option<Output>>,
    replay: Vec<Sample>,
}

impl CsvEndpoint {
    /// Store-only endpoint appending to `path`.
    pub fn recorder(path: impl Into<PathBuf>) -> Self {
        Self {
            output: Some(path.into()),
            file: Mutex::new(None),
            replay: Vec::new(),
        }
    }

    /// Load-only endpoint replaying a recorded file.
    pub async fn replay(path: impl AsRef<Path>) -> Result<Self, EndpointError> {
        let content = tokio::fs::read(path.as_ref()).await?;
        let replay = parse(&content)?;
        debug!(path = %path.as_ref().display(), records = replay.len(), "Loaded CSV replay");
        Ok(Self {
            output: None,
            file: Mutex::new(None),
            replay,
        })
    }

    async fn open(path: &Path) -> Result<Output, EndpointError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let fresh = file.metadata().await?.len() == 0;
        Ok(Output { file, fresh })
    }
}

#[async_trait]
impl Endpoint for CsvEndpoint {
    fn name(&self) -> &str {
        "csv"
    }

    async fn load_subset(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        if self.output.is_some() && self.replay.is_empty() {
            return Err(self.unsupported("load_subset"));
        }
        Ok(replay_at(&self.replay, timestamp, view))
    }

    async fn store(&self, samples: &[Sample]) -> Result<(), EndpointError> {
        let Some(path) = &self.output else {
            return Err(self.unsupported("store"));
        };
        if samples.is_empty() {
            return Ok(());
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(Self::open(path).await?);
        }
        let Some(output) = guard.as_mut() else {
            return Ok(());
        };

        let buf = encode(samples, output.fresh)?;
        output.file.write_all(&buf).await?;
        output.fresh = false;
        Ok(())
    }

    async fn flush(&self) -> Result<(), EndpointError> {
        if let Some(output) = self.file.lock().await.as_mut() {
            output.file.flush().await?;
        }
        Ok(())
    }
}

/// Serialize `samples` as rows, preceded by the header row when `header`.
fn encode(samples: &[Sample], header: bool) -> Result<Vec<u8>, EndpointError> {
    let mut writer = WriterBuilder::new()
        .has_headers(header)
        .from_writer(Vec::new());
    for sample in samples {
        writer
            .serialize(Row::from(sample))
            .map_err(|e| EndpointError::Serialization(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| EndpointError::Serialization(e.to_string()))
}

fn parse(content: &[u8]) -> Result<Vec<Sample>, EndpointError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(content);
    reader
        .deserialize::<Row>()
        .enumerate()
        .map(|(index, row)| {
            row.map(Sample::from)
                .map_err(|e| EndpointError::Format(format!("record {}: {e}", index + 1)))
        })
        .collect()
}
