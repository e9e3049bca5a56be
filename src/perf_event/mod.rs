//! One kernel fd per `(cpu, tid, event)` cell, in three flavors:
//! counters, samplers and SPE. The flavors share fd lifecycle and the
//! attr-building entry point.

mod counter;
mod sampler;
mod spe;

pub use counter::{Counter, CounterValue, GroupRole};
pub use sampler::{SampleSink, Sampler};
pub use spe::{SpeCollector, SpeFilter, SpeRecord};

use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::debug;

use crate::error::{Error, Result};
use crate::event::EventSpec;
use crate::sys;

bitflags! {
    /// `PERF_SAMPLE_BRANCH_*` selector bits for branch-stack sampling.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct BranchFilter: u64 {
        const USER = 1 << 0;
        const KERNEL = 1 << 1;
        const HV = 1 << 2;
        const ANY = 1 << 3;
        const ANY_CALL = 1 << 4;
        const ANY_RETURN = 1 << 5;
        const IND_CALL = 1 << 6;
        const ABORT_TX = 1 << 7;
        const IN_TX = 1 << 8;
        const NO_TX = 1 << 9;
        const COND = 1 << 10;
        const CALL_STACK = 1 << 11;
        const IND_JUMP = 1 << 12;
        const CALL = 1 << 13;
        const NO_FLAGS = 1 << 14;
        const NO_CYCLES = 1 << 15;
        const TYPE_SAVE = 1 << 16;
        const HW_INDEX = 1 << 17;
        const PRIV_SAVE = 1 << 18;
    }
}

/// A raw perf fd with ioctl lifecycle. Closes on drop.
#[derive(Debug)]
pub struct PerfFd {
    fd: RawFd,
}

impl PerfFd {
    pub fn open(
        attr: &sys::PerfEventAttr,
        tid: i32,
        cpu: i32,
        group_fd: RawFd,
        flags: libc::c_ulong,
        evt: &str,
    ) -> Result<Self> {
        let fd = sys::sys_perf_event_open(attr, tid, cpu, group_fd, flags);
        if fd < 0 {
            let err = Error::from_open_errno(-fd, evt);
            debug!("perf_event_open({evt}, tid={tid}, cpu={cpu}, group={group_fd}) failed: {err}");
            return Err(err);
        }
        debug!("opened {evt} tid={tid} cpu={cpu} group={group_fd} -> fd {fd}");
        Ok(PerfFd { fd })
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    fn ioctl(&self, request: libc::c_ulong) -> Result<()> {
        let rc = unsafe { libc::ioctl(self.fd, request as _, 0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Unknown(nix::errno::Errno::last()))
        }
    }

    pub fn enable(&self) -> Result<()> {
        self.ioctl(sys::PERF_EVENT_IOC_ENABLE)
    }

    pub fn disable(&self) -> Result<()> {
        self.ioctl(sys::PERF_EVENT_IOC_DISABLE)
    }

    pub fn reset(&self) -> Result<()> {
        self.ioctl(sys::PERF_EVENT_IOC_RESET)
    }
}

impl Drop for PerfFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Open-time knobs shared by every cell of an event list.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub period_or_freq: u64,
    pub use_freq: bool,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    /// Collect whole call chains (true) or only the top frame (false).
    pub call_stack: bool,
    /// `PERF_SAMPLE_BRANCH_*` selector bits; zero disables branch stacks.
    pub branch_filter: u64,
    /// When set, the target of the open is this cgroup fd, not a tid.
    pub cgroup_fd: Option<RawFd>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            period_or_freq: 0,
            use_freq: false,
            exclude_user: false,
            exclude_kernel: false,
            call_stack: true,
            branch_filter: 0,
            cgroup_fd: None,
        }
    }
}

impl OpenOptions {
    /// The pid/flags pair for the syscall: a cgroup fd replaces the tid
    /// and switches the flag word.
    pub(crate) fn target(&self, tid: i32) -> (i32, libc::c_ulong) {
        match self.cgroup_fd {
            Some(cg) => (cg, sys::PERF_FLAG_PID_CGROUP | sys::PERF_FLAG_FD_CLOEXEC),
            None => (tid, 0),
        }
    }
}

/// Whether an uncore event must be opened with `tid = -1` on this target.
pub(crate) fn uncore_forces_any_tid(spec: &EventSpec) -> bool {
    if !spec.kind.is_uncore() {
        return false;
    }
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        !spec.name.starts_with("cpu/")
    } else {
        true
    }
}
