//! Program the Linux kernel PMU interface (`perf_event_open` and its
//! ring-buffer protocol) to measure hardware and software events on
//! behalf of other processes.
//!
//! Three measurement modes are exposed through one session API:
//!
//! - **counting**: multiplex-corrected counter deltas per cpu × thread,
//! - **sampling**: ring-buffer samples with call stacks, resolved against
//!   ELF symbol tables and DWARF line tables,
//! - **SPE sampling**: ARM Statistical Profiling Extension records with
//!   virtual/physical addresses and latencies.
//!
//! On top of those sit derived services: per-device metric aggregation
//! (DDR bandwidth, L3 traffic, PCIe bandwidth, SMMU transactions) and
//! syscall latency from paired enter/exit tracepoints.
//!
//! ```no_run
//! use pmu_collector::{Pmu, SessionConfig, TaskKind};
//!
//! let pmu = Pmu::new();
//! let cd = pmu.open(
//!     TaskKind::Counting,
//!     &SessionConfig {
//!         events: vec!["cycles".into(), "instructions".into()],
//!         pids: vec![1234],
//!         ..SessionConfig::default()
//!     },
//! )?;
//! pmu.collect(cd, 1000, 100)?;
//! let buffer = pmu.read(cd)?;
//! pmu.with_data(cd, buffer, |records, _resolver| {
//!     for record in records {
//!         println!("{} {} = {}", record.evt, record.tid, record.count);
//!     }
//! })?;
//! pmu.close(cd)?;
//! # Ok::<(), pmu_collector::Error>(())
//! ```

pub mod data;
pub mod error;
pub mod event;
pub mod metrics;
pub mod process;
pub mod records;
pub mod ring_buffer;
pub mod session;
pub mod symbols;
pub mod sys;
pub mod topology;
pub mod trace;

mod event_list;
mod fork_observer;
mod perf_event;

pub use data::{PmuData, SpeExt, TraceData};
pub use error::{Error, Result, Warning};
pub use event::{available_events, EventKindFilter, EventSpec, PmuKind};
pub use perf_event::{BranchFilter, SpeFilter};
pub use session::{BufferId, Cd, Pmu, Session, SessionConfig};
pub use symbols::{Symbol, SymbolMode};

/// What a session measures and how.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    /// Multiplex-corrected counter reads, no ring buffer.
    Counting,
    /// Overflow sampling into ring buffers, with call chains.
    Sampling,
    /// ARM SPE sampling into aux buffers.
    SpeSampling,
}
