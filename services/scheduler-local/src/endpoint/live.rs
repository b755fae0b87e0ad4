//! Live endpoint: reads counters straight from the hypervisor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::warn;

use super::{Endpoint, EndpointError, Sample, SubsetView};
use crate::domain::utilization_between;
use crate::hypervisor::Hypervisor;
use crate::topology::ResourceKind;

/// Immediate snapshot of hypervisor counters. Cannot store.
pub struct LiveEndpoint {
    hypervisor: Arc<dyn Hypervisor>,
}

impl LiveEndpoint {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl Endpoint for LiveEndpoint {
    fn name(&self) -> &str {
        "live"
    }

    async fn load_subset(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        let active = self.hypervisor.list_active().await?;
        let present: Vec<_> = view
            .domains
            .iter()
            .filter(|d| active.contains(&d.uuid))
            .collect();

        let mut samples = Vec::with_capacity(present.len() + 1);
        let mut total = 0.0;

        match view.kind {
            ResourceKind::Cpu => {
                let reads = join_all(
                    present
                        .iter()
                        .map(|d| self.hypervisor.read_counters(d.uuid)),
                )
                .await;

                for (domain, read) in present.into_iter().zip(reads) {
                    match read {
                        Ok(counters) => {
                            let value = domain
                                .last_time
                                .and_then(|prev| utilization_between(&prev, &counters));
                            total += value.unwrap_or(0.0);
                            samples.push(Sample::domain(
                                timestamp,
                                view,
                                domain,
                                value,
                                Some(counters),
                            ));
                        }
                        Err(e) => {
                            warn!(uuid = %domain.uuid, error = %e, "Counters unreadable, skipping domain");
                            samples.push(Sample::domain(timestamp, view, domain, None, None));
                        }
                    }
                }
            }
            ResourceKind::Memory => {
                for domain in present {
                    total += domain.request;
                    samples.push(Sample::domain(
                        timestamp,
                        view,
                        domain,
                        Some(domain.request),
                        None,
                    ));
                }
            }
        }

        samples.push(Sample::subset(timestamp, view, total));
        Ok(samples)
    }
}
