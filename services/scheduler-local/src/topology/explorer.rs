//! Host topology exploration.
//!
//! Reads the NUMA layout from sysfs. Hosts without a NUMA sysfs tree (or
//! non-Linux hosts) fall back to a single node sized from the online CPU
//! count and total memory.

use std::path::Path;

use tracing::{debug, warn};

use super::{CpuInfo, MemoryNode, RawTopology, TopologyError};

const SYSFS_SYSTEM: &str = "/sys/devices/system";

/// Explore the running host.
pub fn explore() -> Result<RawTopology, TopologyError> {
    let root = Path::new(SYSFS_SYSTEM);
    if root.join("node").is_dir() {
        match explore_from(root) {
            Ok(raw) => return Ok(raw),
            Err(e) => warn!(error = %e, "NUMA sysfs exploration failed, using flat topology"),
        }
    }
    Ok(flat_topology())
}

/// Explore a sysfs-shaped tree rooted at `root` (`<root>/node`, `<root>/cpu`).
pub fn explore_from(root: &Path) -> Result<RawTopology, TopologyError> {
    let node_dir = root.join("node");
    let entries = std::fs::read_dir(&node_dir)
        .map_err(|e| TopologyError::Explore(format!("{}: {e}", node_dir.display())))?;

    let mut node_ids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|id| id.parse().ok())
        })
        .collect();
    node_ids.sort_unstable();

    if node_ids.is_empty() {
        return Err(TopologyError::Explore("no NUMA nodes found".to_string()));
    }

    let mut cpus = Vec::new();
    let mut memory = Vec::new();
    let mut raw_distances = Vec::new();

    for node in &node_ids {
        let dir = node_dir.join(format!("node{node}"));

        let cpulist = read_trimmed(&dir.join("cpulist"))?;
        for cpu_id in parse_cpulist(&cpulist)? {
            let core_path = root.join(format!("cpu/cpu{cpu_id}/topology/core_id"));
            let core_id = read_trimmed(&core_path)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(cpu_id);
            cpus.push(CpuInfo {
                cpu_id,
                numa_node: *node,
                core_id,
            });
        }

        let meminfo = read_trimmed(&dir.join("meminfo"))?;
        memory.push(MemoryNode {
            numa_node: *node,
            capacity_bytes: parse_node_meminfo(&meminfo),
        });

        let distance = read_trimmed(&dir.join("distance")).unwrap_or_default();
        raw_distances.push(
            distance
                .split_whitespace()
                .filter_map(|d| d.parse::<u32>().ok())
                .collect::<Vec<_>>(),
        );
    }

    debug!(
        nodes = node_ids.len(),
        cpus = cpus.len(),
        "Explored NUMA topology"
    );

    Ok(RawTopology {
        cpus,
        memory,
        distances: normalize_distances(raw_distances),
    })
}

fn read_trimmed(path: &Path) -> Result<String, TopologyError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| TopologyError::Explore(format!("{}: {e}", path.display())))
}

/// Parse a kernel cpulist such as `0-3,8,10-11`.
pub(crate) fn parse_cpulist(list: &str) -> Result<Vec<u32>, TopologyError> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = || TopologyError::Explore(format!("invalid cpulist entry '{part}'"));
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.parse().map_err(|_| invalid())?;
                let end: u32 = end.parse().map_err(|_| invalid())?;
                if end < start {
                    return Err(invalid());
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    Ok(cpus)
}

/// Extract `MemTotal` from a per-node meminfo file, in bytes.
fn parse_node_meminfo(content: &str) -> u64 {
    const KB_TO_BYTES: u64 = 1024;
    content
        .lines()
        .find_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            // "Node 0 MemTotal:       16329348 kB"
            match parts.as_slice() {
                ["Node", _, "MemTotal:", value, ..] => value.parse::<u64>().ok(),
                _ => None,
            }
        })
        .unwrap_or(0)
        * KB_TO_BYTES
}

/// Shift SLIT distances so the local distance is zero.
fn normalize_distances(raw: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
    let count = raw.len();
    if raw.iter().any(|row| row.len() != count) {
        return Vec::new();
    }
    (0..count)
        .map(|i| {
            (0..count)
                .map(|j| {
                    if i == j {
                        0
                    } else {
                        let local = raw[i][i].min(raw[j][j]);
                        raw[i][j].saturating_sub(local)
                    }
                })
                .collect()
        })
        .collect()
}

fn flat_topology() -> RawTopology {
    let cpu_count = get_cpu_count();
    let cpus = (0..cpu_count)
        .map(|cpu_id| CpuInfo {
            cpu_id,
            numa_node: 0,
            core_id: cpu_id,
        })
        .collect();

    RawTopology {
        cpus,
        memory: vec![MemoryNode {
            numa_node: 0,
            capacity_bytes: get_total_memory(),
        }],
        distances: vec![vec![0]],
    }
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn get_total_memory() -> u64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let total = parse_meminfo_total(&meminfo);
        if total > 0 {
            return total;
        }
    }

    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            return (page_size as u64) * (total_pages as u64);
        }
    }

    16 * 1024 * 1024 * 1024
}

fn parse_meminfo_total(content: &str) -> u64 {
    const KB_TO_BYTES: u64 = 1024;
    content
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("MemTotal:"), Some(value)) => value.parse::<u64>().ok(),
                _ => None,
            }
        })
        .unwrap_or(0)
        * KB_TO_BYTES
}
