//! Counting-mode events: plain `read(2)` of the counter value with
//! multiplex correction, single or group layout.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::event::EventSpec;
use crate::sys;

use super::{uncore_forces_any_tid, OpenOptions, PerfFd};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupRole {
    Ungrouped,
    Leader,
    Member,
}

/// One corrected counter reading for one `(cpu, tid)` cell. For group
/// leaders, one value per group slot is produced in member order.
#[derive(Clone, Copy, Debug)]
pub struct CounterValue {
    pub tid: i32,
    pub cpu: i32,
    /// Delta since the previous read, scaled by the multiplex factor.
    pub count: u64,
    /// enabled/running ratio reciprocal; -1.0 when the event did not run.
    pub percent: f64,
}

/// Delta state between reads: last raw value per slot plus the
/// enabled/running baselines.
#[derive(Debug, Default)]
struct Accumulator {
    prev: Vec<u64>,
    enabled: u64,
    running: u64,
}

impl Accumulator {
    fn reset(&mut self) {
        self.prev.clear();
        self.enabled = 0;
        self.running = 0;
    }

    fn ensure_slots(&mut self, n: usize) {
        // The group can grow between reads when a forked thread joins; a
        // fresh slot starts from zero so its first delta is its count.
        if self.prev.len() < n {
            self.prev.resize(n, 0);
        }
    }

    /// Delta for one slot. Does not advance the time baselines; the
    /// caller commits them once per read so every slot of a group sees
    /// the same window.
    fn delta(&mut self, slot: usize, value: u64, enabled: u64, running: u64) -> Result<(u64, f64)> {
        let prev = self.prev[slot];
        if value < prev || enabled < self.enabled || running < self.running {
            return Err(Error::CountOverflow);
        }
        let out = if value == prev || running == self.running {
            (0, -1.0)
        } else {
            let scale = (enabled - self.enabled) as f64 / (running - self.running) as f64;
            (((value - prev) as f64 * scale) as u64, 1.0 / scale)
        };
        self.prev[slot] = value;
        Ok(out)
    }

    fn commit_window(&mut self, enabled: u64, running: u64) {
        self.enabled = enabled;
        self.running = running;
    }
}

#[derive(Debug)]
pub struct Counter {
    fd: PerfFd,
    cpu: i32,
    tid: i32,
    role: GroupRole,
    accum: Accumulator,
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let len = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if len < 0 {
        return Err(Error::Unknown(nix::errno::Errno::last()));
    }
    Ok(len as usize)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_ne_bytes(buf[at..at + 8].try_into().unwrap())
}

impl Counter {
    pub fn open(
        spec: &EventSpec,
        cpu: i32,
        tid: i32,
        role: GroupRole,
        group_fd: RawFd,
        opts: &OpenOptions,
    ) -> Result<Self> {
        let mut attr = sys::PerfEventAttr::zeroed();
        attr.kind = spec.type_;
        attr.config = spec.config;
        attr.bp_addr_or_config1 = spec.config1;
        attr.bp_len_or_config2 = spec.config2;
        attr.flags = sys::PERF_ATTR_FLAG_DISABLED | sys::PERF_ATTR_FLAG_INHERIT;
        attr.read_format = sys::PERF_FORMAT_TOTAL_TIME_ENABLED
            | sys::PERF_FORMAT_TOTAL_TIME_RUNNING
            | sys::PERF_FORMAT_ID;
        if opts.exclude_user {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if opts.exclude_kernel {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        match role {
            GroupRole::Ungrouped => {}
            GroupRole::Leader => {
                attr.read_format |= sys::PERF_FORMAT_GROUP;
            }
            GroupRole::Member => {
                // Members start armed and ride the leader's enable state;
                // arming them here would skew their window otherwise.
                attr.read_format |= sys::PERF_FORMAT_GROUP;
                attr.flags &= !sys::PERF_ATTR_FLAG_DISABLED;
            }
        }

        let (target, flags) = opts.target(tid);
        let target = if uncore_forces_any_tid(spec) { -1 } else { target };
        let group_fd = if role == GroupRole::Member { group_fd } else { -1 };
        let fd = PerfFd::open(&attr, target, cpu, group_fd, flags, &spec.name)?;
        Ok(Counter {
            fd,
            cpu,
            tid,
            role,
            accum: Accumulator::default(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    /// Only leaders and ungrouped counters drive ioctls; members ride the
    /// leader's schedule.
    pub fn enable(&mut self) -> Result<()> {
        if self.role == GroupRole::Member {
            return Ok(());
        }
        self.fd.enable()?;
        self.accum.reset();
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        if self.role == GroupRole::Member {
            return Ok(());
        }
        self.fd.disable()
    }

    pub fn reset(&self) -> Result<()> {
        if self.role == GroupRole::Member {
            return Ok(());
        }
        self.fd.reset()
    }

    fn read_single(&mut self, out: &mut Vec<CounterValue>) -> Result<()> {
        // {value, time_enabled, time_running, id}
        let mut buf = [0u8; 32];
        let len = read_fd(self.fd.raw(), &mut buf)?;
        if len < 24 {
            return Err(Error::Unknown(nix::errno::Errno::EINVAL));
        }
        let value = u64_at(&buf, 0);
        let enabled = u64_at(&buf, 8);
        let running = u64_at(&buf, 16);
        self.accum.ensure_slots(1);
        let (count, percent) = self.accum.delta(0, value, enabled, running)?;
        self.accum.commit_window(enabled, running);
        out.push(CounterValue {
            tid: self.tid,
            cpu: self.cpu,
            count,
            percent,
        });
        Ok(())
    }

    fn read_group(&mut self, member_count: usize, out: &mut Vec<CounterValue>) -> Result<()> {
        // {nr, time_enabled, time_running, values[nr] = {value, id}},
        // sized from the list's member count.
        let slots = member_count + 1;
        let mut buf = vec![0u8; 24 + slots * 16];
        let len = read_fd(self.fd.raw(), &mut buf)?;
        if len < 24 {
            return Err(Error::Unknown(nix::errno::Errno::EINVAL));
        }
        let nr = (u64_at(&buf, 0) as usize).min(slots);
        if len < 24 + nr * 16 {
            return Err(Error::Unknown(nix::errno::Errno::EINVAL));
        }
        let enabled = u64_at(&buf, 8);
        let running = u64_at(&buf, 16);
        self.accum.ensure_slots(nr);
        for slot in 0..nr {
            let value = u64_at(&buf, 24 + slot * 16);
            let (count, percent) = self.accum.delta(slot, value, enabled, running)?;
            out.push(CounterValue {
                tid: self.tid,
                cpu: self.cpu,
                count,
                percent,
            });
        }
        self.accum.commit_window(enabled, running);
        Ok(())
    }

    /// Read the counter. Leaders return one value per group slot; members
    /// return nothing (the leader covers them).
    pub fn read(&mut self, member_count: usize, out: &mut Vec<CounterValue>) -> Result<()> {
        match self.role {
            GroupRole::Ungrouped => self.read_single(out),
            GroupRole::Leader => self.read_group(member_count, out),
            GroupRole::Member => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmultiplexed_delta_is_exact() {
        let mut acc = Accumulator::default();
        acc.ensure_slots(1);
        let (count, percent) = acc.delta(0, 1000, 100, 100).unwrap();
        acc.commit_window(100, 100);
        assert_eq!(count, 1000);
        assert!((percent - 1.0).abs() < f64::EPSILON);
        let (count, _) = acc.delta(0, 1500, 200, 200).unwrap();
        assert_eq!(count, 500);
    }

    #[test]
    fn multiplexed_delta_is_scaled() {
        let mut acc = Accumulator::default();
        acc.ensure_slots(1);
        // Ran half the time: count doubles, percent halves.
        let (count, percent) = acc.delta(0, 1000, 200, 100).unwrap();
        assert_eq!(count, 2000);
        assert!((percent - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_window_yields_sentinels() {
        let mut acc = Accumulator::default();
        acc.ensure_slots(1);
        acc.delta(0, 1000, 100, 100).unwrap();
        acc.commit_window(100, 100);
        let (count, percent) = acc.delta(0, 1000, 150, 100).unwrap();
        assert_eq!(count, 0);
        assert_eq!(percent, -1.0);
    }

    #[test]
    fn backwards_counter_is_overflow() {
        let mut acc = Accumulator::default();
        acc.ensure_slots(1);
        acc.delta(0, 1000, 100, 100).unwrap();
        acc.commit_window(100, 100);
        assert!(matches!(acc.delta(0, 900, 200, 200), Err(Error::CountOverflow)));
    }

    #[test]
    fn group_slots_share_one_window() {
        let mut acc = Accumulator::default();
        acc.ensure_slots(2);
        let (a, _) = acc.delta(0, 100, 50, 50).unwrap();
        let (b, _) = acc.delta(1, 200, 50, 50).unwrap();
        acc.commit_window(50, 50);
        assert_eq!((a, b), (100, 200));
        let (a, _) = acc.delta(0, 150, 100, 100).unwrap();
        let (b, _) = acc.delta(1, 260, 100, 100).unwrap();
        assert_eq!((a, b), (50, 60));
    }
}
