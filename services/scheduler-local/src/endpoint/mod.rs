//! Sampling endpoints.
//!
//! An [`Endpoint`] loads usage samples for a subset (or the whole machine)
//! and/or stores samples for observability. Backends:
//!
//! - [`LiveEndpoint`]: hypervisor counters, load only
//! - [`CsvEndpoint`]: CSV record and replay
//! - [`JsonEndpoint`]: JSON record and replay
//! - [`InfluxEndpoint`]: time-series database
//!
//! [`EndpointPool`] composes one loader with any number of savers.

mod csv;
mod influx;
mod json;
mod live;
mod pool;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CpuTime, DomainId};
use crate::hypervisor::HypervisorError;
use crate::subset::SubsetId;
use crate::topology::ResourceKind;

pub use self::csv::CsvEndpoint;
pub use influx::{InfluxConfig, InfluxEndpoint};
pub use json::JsonEndpoint;
pub use live::LiveEndpoint;
pub use pool::{EndpointPool, SaverConfig};

/// Endpoint failures. Never fatal to sampling.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("endpoint '{endpoint}' does not support {operation}")]
    Unsupported {
        endpoint: String,
        operation: &'static str,
    },

    #[error("malformed record: {0}")]
    Format(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl EndpointError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Http(_) => "http",
            Self::Unsupported { .. } => "unsupported",
            Self::Format(_) => "format",
            Self::Hypervisor(_) => "hypervisor_error",
        }
    }
}

impl From<serde_json::Error> for EndpointError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for EndpointError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

// =============================================================================
// Samples
// =============================================================================

/// What a sample describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Domain,
    Subset,
    Global,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Subset => "subset",
            Self::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(Self::Domain),
            "subset" => Some(Self::Subset),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// One usage record.
///
/// A domain record carrying neither `value` nor `counters` means the domain
/// is present but could not be read this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub kind: SampleKind,
    pub resource: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset_id: Option<SubsetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<CpuTime>,
}

impl Sample {
    pub fn domain(
        timestamp: DateTime<Utc>,
        view: &SubsetView,
        domain: &DomainView,
        value: Option<f64>,
        counters: Option<CpuTime>,
    ) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Domain,
            resource: view.kind,
            subset_id: Some(view.id),
            consumer_id: Some(domain.uuid.to_string()),
            consumer_name: Some(domain.name.clone()),
            value,
            counters,
        }
    }

    pub fn subset(timestamp: DateTime<Utc>, view: &SubsetView, value: f64) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Subset,
            resource: view.kind,
            subset_id: Some(view.id),
            consumer_id: None,
            consumer_name: None,
            value: Some(value),
            counters: None,
        }
    }

    pub fn global(timestamp: DateTime<Utc>, resource: ResourceKind, value: f64) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Global,
            resource,
            subset_id: None,
            consumer_id: None,
            consumer_name: None,
            value: Some(value),
            counters: None,
        }
    }

    /// The domain this record is about, if it is a domain record.
    pub fn domain_id(&self) -> Option<DomainId> {
        if self.kind != SampleKind::Domain {
            return None;
        }
        self.consumer_id.as_deref().and_then(|id| id.parse().ok())
    }
}

// =============================================================================
// Views
// =============================================================================

/// A hosted domain as seen by a loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainView {
    pub uuid: DomainId,
    pub name: String,
    /// Configured request for the subset's kind.
    pub request: f64,
    /// Last stored CPU-time sample.
    pub last_time: Option<CpuTime>,
}

/// Read-only snapshot of a subset handed to loaders, taken outside the
/// partition's critical section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetView {
    pub id: SubsetId,
    pub kind: ResourceKind,
    pub numa_node: u32,
    pub raw_capacity: f64,
    pub ratio: f64,
    pub domains: Vec<DomainView>,
}

// =============================================================================
// Endpoint
// =============================================================================

/// Uniform load/store contract over sampling backends.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Name used in logs and failure counters.
    fn name(&self) -> &str;

    /// Samples for one subset at `timestamp`.
    async fn load_subset(
        &self,
        _timestamp: DateTime<Utc>,
        _view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        Err(self.unsupported("load_subset"))
    }

    /// Machine-wide samples, one per resource kind, aggregated from the
    /// subset records of every view.
    async fn load_global(
        &self,
        timestamp: DateTime<Utc>,
        views: &[SubsetView],
    ) -> Result<Vec<Sample>, EndpointError> {
        let mut totals: BTreeMap<ResourceKind, f64> = BTreeMap::new();
        for view in views {
            let samples = self.load_subset(timestamp, view).await?;
            let subset_total: f64 = samples
                .iter()
                .filter(|s| s.kind == SampleKind::Subset)
                .filter_map(|s| s.value)
                .sum();
            *totals.entry(view.kind).or_default() += subset_total;
        }
        Ok(totals
            .into_iter()
            .map(|(resource, value)| Sample::global(timestamp, resource, value))
            .collect())
    }

    /// Persist samples.
    async fn store(&self, _samples: &[Sample]) -> Result<(), EndpointError> {
        Err(self.unsupported("store"))
    }

    /// Make buffered samples durable.
    async fn flush(&self) -> Result<(), EndpointError> {
        Ok(())
    }

    fn unsupported(&self, operation: &'static str) -> EndpointError {
        EndpointError::Unsupported {
            endpoint: self.name().to_string(),
            operation,
        }
    }
}

/// Records of a recorded series that apply to `view` at `timestamp`: those
/// of the latest recorded instant not after `timestamp`.
///
/// Domain records are matched by uuid, falling back to the domain name so a
/// recording can be replayed against freshly deployed domains.
pub(crate) fn replay_at(
    series: &[Sample],
    timestamp: DateTime<Utc>,
    view: &SubsetView,
) -> Vec<Sample> {
    let matching = || {
        series.iter().filter(move |s| {
            s.subset_id == Some(view.id) && s.resource == view.kind && s.timestamp <= timestamp
        })
    };
    let Some(at) = matching().map(|s| s.timestamp).max() else {
        return Vec::new();
    };

    matching()
        .filter(|s| s.timestamp == at)
        .filter_map(|s| {
            let mut sample = s.clone();
            if sample.kind != SampleKind::Domain {
                return Some(sample);
            }
            let domain = view
                .domains
                .iter()
                .find(|d| sample.domain_id() == Some(d.uuid))
                .or_else(|| {
                    view.domains
                        .iter()
                        .find(|d| sample.consumer_name.as_deref() == Some(d.name.as_str()))
                })?;
            sample.consumer_id = Some(domain.uuid.to_string());
            sample.consumer_name = Some(domain.name.clone());
            Some(sample)
        })
        .collect()
}
