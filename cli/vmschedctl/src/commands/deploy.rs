//! Deploy command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// Deploy a domain onto the host.
#[derive(Debug, Args)]
pub struct DeployCommand {
    /// Domain name (unique on the host).
    #[arg(long)]
    name: String,

    /// Number of vCPUs.
    #[arg(long)]
    cpu: u32,

    /// Memory in GiB.
    #[arg(long)]
    memory: f64,

    /// Highest CPU oversubscription the domain accepts.
    #[arg(long, default_value_t = 1.0)]
    ratio: f64,

    /// Disk image passed through to the hypervisor.
    #[arg(long)]
    disk: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeployQuery<'a> {
    name: &'a str,
    cpu: u32,
    memory: f64,
    oc: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    qcow2: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeployResponse {
    uuid: String,
    cpu_subset: u32,
    memory_subset: u32,
}

impl DeployCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let query = DeployQuery {
            name: &self.name,
            cpu: self.cpu,
            memory: self.memory,
            oc: self.ratio,
            qcow2: self.disk.as_deref(),
        };

        let response: DeployResponse = client.post_query("/deploy", &query).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&response),
            OutputFormat::Table => print_success(&format!(
                "Deployed {} ({}) on CPU subset {} and memory subset {}",
                self.name, response.uuid, response.cpu_subset, response.memory_subset
            )),
        }
        Ok(())
    }
}
