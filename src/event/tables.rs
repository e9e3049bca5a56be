//! Compile-time event tables.
//!
//! These are the names `perf list` prints for the supported chip families,
//! resolved without touching sysfs. Anything missing here falls through to
//! the kernel-published sysfs events.

use crate::sys::*;
use crate::topology::ChipFamily;

pub struct CoreConfig {
    pub name: &'static str,
    pub type_: u32,
    pub config: u64,
}

macro_rules! evt {
    ($name:literal, $type_:expr, $config:expr) => {
        CoreConfig {
            name: $name,
            type_: $type_,
            config: $config,
        }
    };
}

/// Events every family shares: the generic hardware names, the software
/// clock/fault counters and the hw-cache aliases.
pub static COMMON_EVENTS: &[CoreConfig] = &[
    evt!("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    evt!("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    evt!("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    evt!("cache-references", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
    evt!("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    evt!("branches", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    evt!("branch-instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    evt!("branch-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
    evt!("bus-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
    evt!("stalled-cycles-frontend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    evt!("idle-cycles-frontend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    evt!("stalled-cycles-backend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    evt!("idle-cycles-backend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    evt!("ref-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
    evt!("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    evt!("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    evt!("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    evt!("faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    evt!("context-switches", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
    evt!("cs", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
    evt!("cpu-migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
    evt!("migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
    evt!("minor-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
    evt!("major-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    evt!("alignment-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_ALIGNMENT_FAULTS),
    evt!("emulation-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_EMULATION_FAULTS),
    evt!("dummy", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_DUMMY),
    evt!("bpf-output", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_BPF_OUTPUT),
    evt!("L1-dcache-loads", PERF_TYPE_HW_CACHE, 0x0),
    evt!("L1-dcache-load-misses", PERF_TYPE_HW_CACHE, 0x10000),
    evt!("L1-icache-loads", PERF_TYPE_HW_CACHE, 0x1),
    evt!("L1-icache-load-misses", PERF_TYPE_HW_CACHE, 0x10001),
    evt!("LLC-loads", PERF_TYPE_HW_CACHE, 0x2),
    evt!("LLC-load-misses", PERF_TYPE_HW_CACHE, 0x10002),
    evt!("LLC-stores", PERF_TYPE_HW_CACHE, 0x102),
    evt!("LLC-store-misses", PERF_TYPE_HW_CACHE, 0x10102),
    evt!("dTLB-loads", PERF_TYPE_HW_CACHE, 0x3),
    evt!("dTLB-load-misses", PERF_TYPE_HW_CACHE, 0x10003),
    evt!("dTLB-stores", PERF_TYPE_HW_CACHE, 0x103),
    evt!("dTLB-store-misses", PERF_TYPE_HW_CACHE, 0x10103),
    evt!("iTLB-loads", PERF_TYPE_HW_CACHE, 0x4),
    evt!("iTLB-load-misses", PERF_TYPE_HW_CACHE, 0x10004),
    evt!("branch-loads", PERF_TYPE_HW_CACHE, 0x5),
    evt!("branch-load-misses", PERF_TYPE_HW_CACHE, 0x10005),
];

/// ARMv8 micro-architectural events exposed by name on the HIP families,
/// programmed as raw configs.
static ARM_UARCH_EVENTS: &[CoreConfig] = &[
    evt!("l1d_cache_rd", PERF_TYPE_RAW, 0x40),
    evt!("l1d_cache_wr", PERF_TYPE_RAW, 0x41),
    evt!("l1d_cache_refill_rd", PERF_TYPE_RAW, 0x42),
    evt!("l1d_cache_refill_wr", PERF_TYPE_RAW, 0x43),
    evt!("l1d_cache_wb_victim", PERF_TYPE_RAW, 0x46),
    evt!("l1d_cache_wb_clean", PERF_TYPE_RAW, 0x47),
    evt!("l1d_cache_inval", PERF_TYPE_RAW, 0x48),
    evt!("l1d_tlb_refill_rd", PERF_TYPE_RAW, 0x4c),
    evt!("l1d_tlb_refill_wr", PERF_TYPE_RAW, 0x4d),
    evt!("l1d_tlb_rd", PERF_TYPE_RAW, 0x4e),
    evt!("l1d_tlb_wr", PERF_TYPE_RAW, 0x4f),
    evt!("l2d_cache_rd", PERF_TYPE_RAW, 0x50),
    evt!("l2d_cache_wr", PERF_TYPE_RAW, 0x51),
    evt!("l2d_cache_refill_rd", PERF_TYPE_RAW, 0x52),
    evt!("l2d_cache_refill_wr", PERF_TYPE_RAW, 0x53),
    evt!("l2d_cache_wb_victim", PERF_TYPE_RAW, 0x56),
    evt!("l2d_cache_wb_clean", PERF_TYPE_RAW, 0x57),
    evt!("l2d_cache_inval", PERF_TYPE_RAW, 0x58),
    evt!("l1i_cache_prf", PERF_TYPE_RAW, 0x102e),
    evt!("l1i_cache_prf_refill", PERF_TYPE_RAW, 0x102f),
    evt!("iq_is_empty", PERF_TYPE_RAW, 0x1043),
    evt!("if_is_stall", PERF_TYPE_RAW, 0x1044),
    evt!("fetch_bubble", PERF_TYPE_RAW, 0x2014),
    evt!("prf_req", PERF_TYPE_RAW, 0x6013),
    evt!("hit_on_prf", PERF_TYPE_RAW, 0x6014),
    evt!("exe_stall_cycle", PERF_TYPE_RAW, 0x7001),
    evt!("mem_stall_anyload", PERF_TYPE_RAW, 0x7004),
    evt!("mem_stall_l1miss", PERF_TYPE_RAW, 0x7006),
    evt!("mem_stall_l2miss", PERF_TYPE_RAW, 0x7007),
];

/// The per-family table, consulted before any sysfs lookup.
pub fn family_events(family: ChipFamily) -> impl Iterator<Item = &'static CoreConfig> {
    let arm = match family {
        ChipFamily::X86 => &[][..],
        _ => ARM_UARCH_EVENTS,
    };
    COMMON_EVENTS.iter().chain(arm.iter())
}

pub fn lookup(family: ChipFamily, name: &str) -> Option<&'static CoreConfig> {
    family_events(family).find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_names_resolve_everywhere() {
        for family in [ChipFamily::HipA, ChipFamily::HipB, ChipFamily::X86] {
            let cycles = lookup(family, "cycles").unwrap();
            assert_eq!(cycles.type_, PERF_TYPE_HARDWARE);
            assert_eq!(cycles.config, PERF_COUNT_HW_CPU_CYCLES);
            let cs = lookup(family, "context-switches").unwrap();
            assert_eq!(cs.type_, PERF_TYPE_SOFTWARE);
            assert_eq!(cs.config, PERF_COUNT_SW_CONTEXT_SWITCHES);
        }
    }

    #[test]
    fn uarch_events_are_arm_only() {
        assert!(lookup(ChipFamily::HipB, "l1d_cache_rd").is_some());
        assert!(lookup(ChipFamily::X86, "l1d_cache_rd").is_none());
    }

    #[test]
    fn cache_alias_configs() {
        let miss = lookup(ChipFamily::HipA, "dTLB-load-misses").unwrap();
        assert_eq!(miss.config, 0x10003);
        assert_eq!(miss.type_, PERF_TYPE_HW_CACHE);
    }
}
