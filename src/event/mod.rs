//! Event naming: translation from user-facing event names to the
//! `(type, config, config1, config2)` tuples the kernel expects.

mod catalog;
mod format;
mod tables;

pub use catalog::{available_events, resolve, spe_spec, EventKindFilter};
pub use format::parse_format_bitfield;

/// Where an event is counted, which decides open-time quirks (tid forcing,
/// cpumask pinning, group eligibility).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PmuKind {
    Core,
    Raw,
    Uncore,
    UncoreRaw,
    Tracepoint,
    Spe,
    Software,
}

impl PmuKind {
    pub fn is_uncore(self) -> bool {
        matches!(self, PmuKind::Uncore | PmuKind::UncoreRaw)
    }
}

/// A fully resolved event, ready to be programmed into a
/// `perf_event_attr`.
#[derive(Clone, Debug)]
pub struct EventSpec {
    pub name: String,
    pub kind: PmuKind,
    pub type_: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
    /// For uncore devices: the single cpu the kernel accepts the fd on.
    pub device_cpu: Option<i32>,
}

impl EventSpec {
    pub(crate) fn core(name: &str, type_: u32, config: u64) -> Self {
        let kind = if type_ == crate::sys::PERF_TYPE_SOFTWARE {
            PmuKind::Software
        } else {
            PmuKind::Core
        };
        EventSpec {
            name: name.to_string(),
            kind,
            type_,
            config,
            config1: 0,
            config2: 0,
            device_cpu: None,
        }
    }
}
