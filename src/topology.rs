//! CPU topology: online cpu set, per-cpu numa/socket ids and the chip
//! family the event catalog keys its static tables on.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{Error, Result};

const CPU_ONLINE_PATH: &str = "/sys/devices/system/cpu/online";
const MIDR_EL1_PATH: &str = "/sys/devices/system/cpu/cpu0/regs/identification/midr_el1";
const NODE_DIR: &str = "/sys/devices/system/node";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChipFamily {
    HipA,
    HipB,
    HipC,
    HipE,
    HipF,
    X86,
}

impl ChipFamily {
    fn from_midr(midr: &str) -> Option<Self> {
        match midr.trim() {
            "0x00000000481fd010" => Some(ChipFamily::HipA),
            "0x00000000480fd020" => Some(ChipFamily::HipB),
            "0x00000000480fd030" => Some(ChipFamily::HipC),
            "0x00000000480fd220" => Some(ChipFamily::HipF),
            "0x00000000480fd450" => Some(ChipFamily::HipE),
            _ => None,
        }
    }
}

/// Identify the running chip. Memoized; `ChipUnsupported` if MIDR_EL1 is
/// absent (non-ARM, non-x86) or unknown.
pub fn chip_family() -> Result<ChipFamily> {
    static FAMILY: OnceLock<Option<ChipFamily>> = OnceLock::new();
    FAMILY
        .get_or_init(|| {
            if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
                return Some(ChipFamily::X86);
            }
            let midr = fs::read_to_string(MIDR_EL1_PATH).ok()?;
            ChipFamily::from_midr(&midr)
        })
        .ok_or(Error::ChipUnsupported)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CpuTopology {
    pub core_id: i32,
    pub numa_id: i32,
    pub socket_id: i32,
}

impl CpuTopology {
    /// Placeholder used for `cpu = -1` cells (attach-to-pid, any cpu).
    pub fn any() -> Self {
        CpuTopology {
            core_id: -1,
            numa_id: -1,
            socket_id: -1,
        }
    }
}

/// Parse the kernel's comma-separated range list, e.g. `0-3,8,10-11`.
pub fn parse_cpu_ranges(text: &str) -> Vec<i32> {
    let mut cpus = Vec::new();
    for token in text.trim().split(',') {
        if token.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = token.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<i32>(), hi.trim().parse::<i32>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = token.trim().parse::<i32>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// The online cpu ids, read once from sysfs. Falls back to `0..ncpu` when
/// the file is unreadable (containers without a full sysfs).
pub fn online_cpus() -> &'static [i32] {
    static ONLINE: OnceLock<Vec<i32>> = OnceLock::new();
    ONLINE.get_or_init(|| match fs::read_to_string(CPU_ONLINE_PATH) {
        Ok(text) => parse_cpu_ranges(&text),
        Err(_) => (0..num_cpus::get() as i32).collect(),
    })
}

fn numa_map() -> &'static Vec<(i32, Vec<i32>)> {
    static NODES: OnceLock<Vec<(i32, Vec<i32>)>> = OnceLock::new();
    NODES.get_or_init(|| {
        let mut nodes = Vec::new();
        let Ok(entries) = fs::read_dir(NODE_DIR) else {
            return nodes;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_prefix("node").and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            let cpulist = entry.path().join("cpulist");
            if let Ok(text) = fs::read_to_string(cpulist) {
                nodes.push((id, parse_cpu_ranges(&text)));
            }
        }
        nodes
    })
}

fn numa_node_of_cpu(cpu: i32) -> i32 {
    for (node, cpus) in numa_map() {
        if cpus.contains(&cpu) {
            return *node;
        }
    }
    0
}

fn read_package_id(cpu: i32) -> Option<i32> {
    let path = format!("/sys/bus/cpu/devices/cpu{cpu}/topology/physical_package_id");
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Topology for one cpu. `cpu = -1` yields the "any cpu" placeholder.
pub fn cpu_topology(cpu: i32) -> Result<CpuTopology> {
    if cpu == -1 {
        return Ok(CpuTopology::any());
    }
    let socket_id = read_package_id(cpu).ok_or(Error::FailGetCpu(cpu))?;
    Ok(CpuTopology {
        core_id: cpu,
        numa_id: numa_node_of_cpu(cpu),
        socket_id,
    })
}

/// Which tracing root this kernel exposes, if any.
pub fn tracing_root() -> Option<&'static Path> {
    static ROOT: OnceLock<Option<&'static Path>> = OnceLock::new();
    *ROOT.get_or_init(|| {
        for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
            if Path::new(root).join("events").is_dir() {
                return Some(Path::new(root));
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singleton_list() {
        assert_eq!(parse_cpu_ranges("0"), vec![0]);
    }

    #[test]
    fn parses_ranges_and_singletons() {
        assert_eq!(parse_cpu_ranges("0-3,8,10-11\n"), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn ignores_garbage_tokens() {
        assert_eq!(parse_cpu_ranges("0-1,,x,4"), vec![0, 1, 4]);
    }

    #[test]
    fn midr_table() {
        assert_eq!(
            ChipFamily::from_midr("0x00000000480fd020\n"),
            Some(ChipFamily::HipB)
        );
        assert_eq!(ChipFamily::from_midr("0xdeadbeef"), None);
    }

    #[test]
    fn any_cpu_topology() {
        let topo = cpu_topology(-1).unwrap();
        assert_eq!(topo.core_id, -1);
        assert_eq!(topo.numa_id, -1);
    }
}
