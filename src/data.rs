//! The records surfaced to callers.

use crate::records::BranchEntry;
use crate::symbols::FrameId;
use crate::topology::CpuTopology;

/// ARM SPE extension payload: one row per decoded SPE record.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SpeExt {
    /// Physical address of the access, when PA collection was enabled.
    pub pa: u64,
    /// Virtual address of the access.
    pub va: u64,
    /// Bit map of SPE events (see `SpeEventBits`).
    pub event: u64,
    /// Total latency in cycles.
    pub lat: u16,
}

/// Raw tracepoint payload; field access goes through
/// [`crate::trace::FormatCache`].
#[derive(Clone, Debug)]
pub struct TraceData {
    /// `<system>:<event>` name the payload belongs to, keying the format.
    pub event: String,
    pub data: Vec<u8>,
}

/// One measurement record: a counter delta for counting tasks, one sample
/// for sampling and SPE tasks.
#[derive(Clone, Debug, Default)]
pub struct PmuData {
    /// Resolved event name. After uncore aggregation this is the parent
    /// name the caller asked for, not the per-instance child.
    pub evt: String,
    /// Nanosecond timestamp: the sample time, or the read time for counts.
    pub ts: u64,
    pub pid: i32,
    pub tid: i32,
    pub cpu: i32,
    pub cpu_topo: Option<CpuTopology>,
    pub comm: String,
    /// Sampling period of the record; zero for counting.
    pub period: u64,
    /// Multiplex-corrected count; zero when the event never ran.
    pub count: u64,
    /// Fraction of wall time the event was actually on hardware, or -1.0
    /// when it did not run during the window.
    pub count_percent: f64,
    /// Group id the event was opened under, -1 when ungrouped.
    pub group_id: i32,
    /// Raw instruction pointers, top of stack first. Consumed by symbol
    /// hydration; kept so callers can re-resolve.
    pub ips: Vec<u64>,
    /// Head of the deduplicated call-stack in the session's resolver,
    /// filled during `read` when a symbol mode is active.
    pub stack: Option<FrameId>,
    /// Taken-branch records, present when a branch filter was configured.
    pub branches: Vec<BranchEntry>,
    /// Raw tracepoint payload, present for tracepoint samples.
    pub raw: Option<TraceData>,
    /// SPE extension, present for SPE samples.
    pub spe: Option<SpeExt>,
}
