//! Info command: subsets and placed domains.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{compact_ranges, print_heading, print_output, print_single, OutputFormat};

use super::CommandContext;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Show the current partition.
#[derive(Debug, Args)]
pub struct InfoCommand {}

#[derive(Debug, Serialize, Deserialize)]
struct SubsetInfo {
    id: u32,
    kind: String,
    numa_node: u32,
    units: Vec<u32>,
    ratio: f64,
    raw_capacity: f64,
    capacity: f64,
    demand: f64,
    #[serde(default)]
    utilization: Option<f64>,
    #[serde(default)]
    reserved: bool,
    domains: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DomainInfo {
    uuid: String,
    name: String,
    cpu_count: u32,
    memory_bytes: u64,
    cpu_ratio: f64,
    cpu_subset: Option<u32>,
    memory_subset: Option<u32>,
}

/// Partition snapshot as served by `/info`.
#[derive(Debug, Serialize, Deserialize)]
struct InfoResponse {
    subsets: Vec<SubsetInfo>,
    domains: Vec<DomainInfo>,
    free_cpus: Vec<u32>,
    free_memory_bytes: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct SubsetRow {
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Node")]
    node: u32,
    #[tabled(rename = "Units")]
    units: String,
    #[tabled(rename = "Ratio")]
    ratio: String,
    #[tabled(rename = "Demand/Capacity")]
    load: String,
    #[tabled(rename = "Utilization")]
    utilization: String,
    #[tabled(rename = "Domains")]
    domains: usize,
}

#[derive(Debug, Serialize, Tabled)]
struct DomainRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "vCPU")]
    cpu: u32,
    #[tabled(rename = "Memory (GiB)")]
    memory: String,
    #[tabled(rename = "Max ratio")]
    ratio: String,
    #[tabled(rename = "CPU subset")]
    cpu_subset: String,
    #[tabled(rename = "Memory subset")]
    memory_subset: String,
}

impl SubsetInfo {
    fn row(&self) -> SubsetRow {
        // Memory quantities are bytes; show them in GiB.
        let scale = if self.kind == "memory" { GIB } else { 1.0 };
        SubsetRow {
            id: self.id,
            kind: self.kind.clone(),
            node: self.numa_node,
            units: compact_ranges(&self.units),
            ratio: format!("{:.2}", self.ratio),
            load: format!("{:.1}/{:.1}", self.demand / scale, self.capacity / scale),
            utilization: self
                .utilization
                .map(|u| format!("{:.2}", u / scale))
                .unwrap_or_else(|| "-".to_string()),
            domains: self.domains.len(),
        }
    }
}

impl DomainInfo {
    fn row(&self) -> DomainRow {
        let subset = |id: Option<u32>| id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
        DomainRow {
            name: self.name.clone(),
            uuid: self.uuid.clone(),
            cpu: self.cpu_count,
            memory: format!("{:.2}", self.memory_bytes as f64 / GIB),
            ratio: format!("{:.2}", self.cpu_ratio),
            cpu_subset: subset(self.cpu_subset),
            memory_subset: subset(self.memory_subset),
        }
    }
}

impl InfoCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let response: InfoResponse = client.get("/info").await?;

        match ctx.format {
            OutputFormat::Json => print_single(&response),
            OutputFormat::Table => {
                let subsets: Vec<SubsetRow> = response.subsets.iter().map(SubsetInfo::row).collect();
                let domains: Vec<DomainRow> = response.domains.iter().map(DomainInfo::row).collect();

                print_heading("Subsets");
                print_output(&subsets, ctx.format);
                println!();
                print_heading("Domains");
                print_output(&domains, ctx.format);
                println!();
                println!(
                    "Free CPUs: {}   Free memory: {:.2} GiB",
                    compact_ranges(&response.free_cpus),
                    response.free_memory_bytes as f64 / GIB
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_snapshot() {
        let json = serde_json::json!({
            "subsets": [{
                "id": 0,
                "kind": "memory",
                "numa_node": 1,
                "units": [4, 5, 6, 7],
                "ratio": 1.0,
                "raw_capacity": 1073741824.0,
                "capacity": 1073741824.0,
                "demand": 536870912.0,
                "utilization": null,
                "reserved": false,
                "domains": ["4b2d6f0e-8a41-4c1e-9f3b-2a7d5c9e1f00"]
            }],
            "domains": [],
            "free_cpus": [0, 1, 2],
            "free_memory_bytes": 0
        });
        let info: InfoResponse = serde_json::from_value(json).unwrap();
        let row = info.subsets[0].row();
        assert_eq!(row.units, "4-7");
        assert_eq!(row.load, "0.5/1.0");
        assert_eq!(row.utilization, "-");
        assert_eq!(row.domains, 1);
    }
}
