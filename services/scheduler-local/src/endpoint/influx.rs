//! InfluxDB v2 endpoint.
//!
//! Stores samples as line protocol (measurement = sample type, tags =
//! resource/subset/uuid/name, fields = value and raw counters) and loads
//! the latest value of each series with a Flux query.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use csv::ReaderBuilder;
use influxdb_line_protocol::LineProtocolBuilder;
use tracing::{debug, error};

use super::{Endpoint, EndpointError, Sample, SampleKind, SubsetView};
use crate::subset::SubsetId;
use crate::topology::ResourceKind;

/// Connection settings, read from the `INFLUXDB_*` environment.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// How far back a load looks for the latest record of a series.
    pub lookback: Duration,
    pub timeout: Duration,
}

impl InfluxConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| std::env::var(name).with_context(|| format!("{name} is not set"));

        let lookback = std::env::var("INFLUXDB_LOOKBACK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Ok(Self {
            url: var("INFLUXDB_URL")?.trim_end_matches('/').to_string(),
            token: var("INFLUXDB_TOKEN")?,
            org: var("INFLUXDB_ORG")?,
            bucket: var("INFLUXDB_BUCKET")?,
            lookback,
            timeout: Duration::from_secs(10),
        })
    }
}

pub struct InfluxEndpoint {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxEndpoint {
    pub fn new(config: InfluxConfig) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn query(&self, timestamp: DateTime<Utc>, view: &SubsetView) -> String {
        let lookback =
            chrono::Duration::from_std(self.config.lookback).unwrap_or(chrono::Duration::zero());
        let start = timestamp - lookback;
        let stop = timestamp + chrono::Duration::nanoseconds(1);
        format!(
            "from(bucket: \"{bucket}\")\n\
             \x20 |> range(start: {start}, stop: {stop})\n\
             \x20 |> filter(fn: (r) => r._measurement == \"domain\" or r._measurement == \"subset\")\n\
             \x20 |> filter(fn: (r) => r.resource == \"{resource}\" and r.subset == \"{subset}\")\n\
             \x20 |> filter(fn: (r) => r._field == \"value\")\n\
             \x20 |> last()",
            bucket = self.config.bucket.replace('"', "\\\""),
            start = start.to_rfc3339_opts(SecondsFormat::Nanos, true),
            stop = stop.to_rfc3339_opts(SecondsFormat::Nanos, true),
            resource = view.kind.as_str(),
            subset = view.id.0,
        )
    }
}

#[async_trait]
impl Endpoint for InfluxEndpoint {
    fn name(&self) -> &str {
        "influx"
    }

    async fn load_subset(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        let url = format!("{}/api/v2/query", self.config.url);
        let response = self
            .client
            .post(&url)
            .query(&[("org", self.config.org.as_str())])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(self.query(timestamp, view))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Query failed");
            return Err(EndpointError::Http(format!("query failed: {status} - {body}")));
        }

        let body = response.text().await?;
        let samples = parse_annotated_csv(&body)?
            .into_iter()
            .filter(|s| match s.kind {
                SampleKind::Domain => view
                    .domains
                    .iter()
                    .any(|d| s.domain_id() == Some(d.uuid)),
                _ => true,
            })
            .collect::<Vec<_>>();
        debug!(subset = %view.id, records = samples.len(), "Loaded samples");
        Ok(samples)
    }

    async fn store(&self, samples: &[Sample]) -> Result<(), EndpointError> {
        let body = encode(samples)?;
        if body.is_empty() {
            return Ok(());
        }

        let url = format!("{}/api/v2/write", self.config.url);
        let response = self
            .client
            .post(&url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointError::Http(format!("write failed: {status} - {body}")));
        }
        Ok(())
    }
}

/// Encode samples as line protocol. Samples with no field are skipped.
fn encode(samples: &[Sample]) -> Result<String, EndpointError> {
    let mut builder = LineProtocolBuilder::new();

    for sample in samples {
        if sample.value.is_none() && sample.counters.is_none() {
            continue;
        }

        let mut line = builder
            .measurement(sample.kind.as_str())
            .tag("resource", sample.resource.as_str());
        if let Some(subset) = sample.subset_id {
            line = line.tag("subset", &subset.0.to_string());
        }
        if let Some(uuid) = sample.consumer_id.as_deref().filter(|s| !s.is_empty()) {
            line = line.tag("uuid", uuid);
        }
        if let Some(name) = sample.consumer_name.as_deref().filter(|s| !s.is_empty()) {
            line = line.tag("name", name);
        }

        let mut line = match sample.value {
            Some(value) => line.field("value", value),
            None => line.field(
                "total_ns",
                sample.counters.map(|c| c.total_ns).unwrap_or_default(),
            ),
        };
        if let Some(c) = sample.counters {
            if sample.value.is_some() {
                line = line.field("total_ns", c.total_ns);
            }
            line = line
                .field("system_ns", c.system_ns)
                .field("user_ns", c.user_ns);
        }

        let ts = sample.timestamp.timestamp_nanos_opt().unwrap_or_default();
        builder = line.timestamp(ts).close_line();
    }

    String::from_utf8(builder.build()).map_err(|e| EndpointError::Serialization(e.to_string()))
}

/// Parse a Flux annotated-CSV response into samples.
///
/// Each table starts with a header row naming its columns; annotation rows
/// (`#datatype`, `#group`, `#default`) and blank separators are skipped.
fn parse_annotated_csv(body: &str) -> Result<Vec<Sample>, EndpointError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());
    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut samples = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| EndpointError::Format(e.to_string()))?;
        if record.iter().any(|f| f == "_time") && record.iter().any(|f| f == "_value") {
            columns = record
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), i))
                .collect();
            continue;
        }
        if columns.is_empty() {
            return Err(EndpointError::Format("row before header".to_string()));
        }

        let get = |name: &str| {
            columns
                .get(name)
                .and_then(|&i| record.get(i))
                .filter(|s| !s.is_empty())
        };

        let timestamp = get("_time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| EndpointError::Format(format!("bad _time in {record:?}")))?;
        let Some(kind) = get("_measurement").and_then(SampleKind::parse) else {
            continue;
        };
        let Some(resource) = get("resource").and_then(ResourceKind::parse) else {
            continue;
        };

        samples.push(Sample {
            timestamp,
            kind,
            resource,
            subset_id: get("subset").and_then(|s| s.parse().ok()).map(SubsetId),
            consumer_id: get("uuid").map(str::to_string),
            consumer_name: get("name").map(str::to_string),
            value: get("_value").and_then(|v| v.parse().ok()),
            counters: None,
        });
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CpuTime;
    use crate::endpoint::tests::view;

    #[test]
    fn test_encode_line_protocol() {
        let v = view(ResourceKind::Cpu, &[("web 1", 2.0)]);
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let counters = CpuTime {
            epoch_ns: 1,
            total_ns: 40,
            system_ns: 4,
            user_ns: 36,
        };
        let samples = vec![
            Sample::domain(ts, &v, &v.domains[0], Some(0.5), Some(counters)),
            Sample::domain(ts, &v, &v.domains[0], None, None),
            Sample::subset(ts, &v, 0.5),
        ];

        let body = encode(&samples).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("domain,resource=cpu,subset=1,uuid="));
        assert!(lines[0].contains("name=web\\ 1"));
        assert!(lines[0].contains("value=0.5"));
        assert!(lines[0].contains("total_ns=40u"));
        assert!(lines[0].ends_with(" 1700000000000000000"));
        assert_eq!(
            lines[1],
            "subset,resource=cpu,subset=1 value=0.5 1700000000000000000"
        );
    }

    #[test]
    fn test_parse_annotated_csv() {
        let v = view(ResourceKind::Cpu, &[("vm-a", 1.0)]);
        let body = format!(
            "#datatype,string,long,dateTime:RFC3339,double,string,string,string,string,string,string\n\
             #group,false,false,false,false,true,true,true,true,true,true\n\
             ,result,table,_time,_value,_field,_measurement,name,resource,subset,uuid\n\
             ,_result,0,2024-01-01T00:00:05Z,0.25,value,domain,vm-a,cpu,1,{uuid}\n\
             \n\
             ,result,table,_time,_value,_field,_measurement,resource,subset\n\
             ,_result,1,2024-01-01T00:00:05Z,0.25,value,subset,cpu,1\n",
            uuid = v.domains[0].uuid,
        );

        let samples = parse_annotated_csv(&body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].domain_id(), Some(v.domains[0].uuid));
        assert_eq!(samples[0].value, Some(0.25));
        assert_eq!(samples[1].kind, SampleKind::Subset);
        assert_eq!(samples[1].subset_id, Some(SubsetId(1)));
    }

    #[test]
    fn test_query_targets_subset() {
        let endpoint = InfluxEndpoint::new(InfluxConfig {
            url: "http://localhost:8086".to_string(),
            token: "t".to_string(),
            org: "o".to_string(),
            bucket: "vm".to_string(),
            lookback: Duration::from_secs(60),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let v = view(ResourceKind::Memory, &[]);
        let query = endpoint.query(Utc::now(), &v);
        assert!(query.starts_with("from(bucket: \"vm\")"));
        assert!(query.contains("r.resource == \"memory\" and r.subset == \"1\""));
        assert!(query.ends_with("|> last()"));
    }
}
