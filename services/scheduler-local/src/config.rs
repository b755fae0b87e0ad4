//! Configuration for the local scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use vmsched_reconcile::RatioPolicy;

use crate::manager::ManagerConfig;
use crate::scheduler::SchedulerConfig;
use crate::topology::DEFAULT_MEMORY_GRANULE_BYTES;

/// Command-line switches.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "scheduler-local", version, about = "Node-local VM subset scheduler")]
pub struct Args {
    /// Load the topology from a JSON file instead of exploring the host.
    #[arg(short, long)]
    pub topology: Option<PathBuf>,

    /// Debug level. Above 0, dumps the topology and records samples to CSV
    /// under `debug/`.
    #[arg(short, long, default_value_t = 0)]
    pub debug: u8,

    /// Replay samples from a JSON recording instead of reading the hypervisor.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Record samples to a JSON file, written on shutdown.
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Store samples in InfluxDB (configured from INFLUXDB_*).
    #[arg(long)]
    pub influx: bool,

    /// Hypervisor connector. Only the in-memory `mock` is built in: it
    /// simulates domains and their CPU time, and controls no real VMs.
    #[arg(long, value_enum, default_value_t = HypervisorKind::Mock)]
    pub hypervisor: HypervisorKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum HypervisorKind {
    /// Simulated domains held in memory.
    #[default]
    Mock,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sampling period.
    pub tick: Duration,

    /// Command API listen address.
    pub api_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Memory allocation unit.
    pub memory_granule_bytes: u64,

    /// CPUs removed from the topology before partitioning.
    pub excluded_cpus: Vec<u32>,

    pub manager: ManagerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: SchedulerConfig::default().tick,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8099)),
            log_level: "info".to_string(),
            memory_granule_bytes: DEFAULT_MEMORY_GRANULE_BYTES,
            excluded_cpus: Vec::new(),
            manager: ManagerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let policy_defaults = RatioPolicy::default();

        let tick = parsed(&var, "VMSCHED_TICK_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick);
        if tick.is_zero() {
            anyhow::bail!("VMSCHED_TICK_MS must be at least 1");
        }

        let api_addr = parsed(&var, "VMSCHED_API_ADDR")?.unwrap_or(defaults.api_addr);

        let log_level = var("VMSCHED_LOG_LEVEL").unwrap_or(defaults.log_level);

        let memory_granule_bytes = match parsed::<u64>(&var, "VMSCHED_MEMORY_GRANULE_MB")? {
            Some(0) => anyhow::bail!("VMSCHED_MEMORY_GRANULE_MB must be at least 1"),
            Some(mb) => mb
                .checked_mul(1024 * 1024)
                .with_context(|| format!("VMSCHED_MEMORY_GRANULE_MB {mb} overflows"))?,
            None => defaults.memory_granule_bytes,
        };

        let excluded_cpus = match var("TOPO_EXCLUDE") {
            Some(list) => parse_cpu_list(&list).context("invalid TOPO_EXCLUDE")?,
            None => Vec::new(),
        };

        let policy = RatioPolicy {
            window: parsed(&var, "VMSCHED_SMOOTHING_TICKS")?.unwrap_or(policy_defaults.window),
            step: parsed(&var, "VMSCHED_RATIO_STEP")?.unwrap_or(policy_defaults.step),
            low_water: parsed(&var, "VMSCHED_LOW_WATER")?.unwrap_or(policy_defaults.low_water),
            high_water: parsed(&var, "VMSCHED_HIGH_WATER")?.unwrap_or(policy_defaults.high_water),
        };
        policy.validate()?;

        let manager_defaults = defaults.manager;
        let manager = ManagerConfig {
            cpu_default_ratio: parsed(&var, "VMSCHED_CPU_RATIO_DEFAULT")?
                .unwrap_or(manager_defaults.cpu_default_ratio),
            cpu_ratio_ceiling: parsed(&var, "VMSCHED_CPU_RATIO_CEILING")?
                .unwrap_or(manager_defaults.cpu_ratio_ceiling),
            memory_default_ratio: parsed(&var, "VMSCHED_MEM_RATIO_DEFAULT")?
                .unwrap_or(manager_defaults.memory_default_ratio),
            memory_ratio_ceiling: parsed(&var, "VMSCHED_MEM_RATIO_CEILING")?
                .unwrap_or(manager_defaults.memory_ratio_ceiling),
            policy,
        };
        for (name, default, ceiling) in [
            ("cpu", manager.cpu_default_ratio, manager.cpu_ratio_ceiling),
            ("memory", manager.memory_default_ratio, manager.memory_ratio_ceiling),
        ] {
            if !(1.0..=ceiling).contains(&default) {
                anyhow::bail!(
                    "{name} default ratio {default} must be within [1.0, ceiling {ceiling}]"
                );
            }
        }

        Ok(Self {
            tick,
            api_addr,
            log_level,
            memory_granule_bytes,
            excluded_cpus,
            manager,
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: self.tick,
            ..SchedulerConfig::default()
        }
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| raw.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {name}"))
}

/// Parse `"1,3,8-11"` into CPU ids.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse()?;
                let end: u32 = end.trim().parse()?;
                if end < start {
                    anyhow::bail!("descending range '{part}'");
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.parse()?),
        }
    }
    Ok(cpus)
}
