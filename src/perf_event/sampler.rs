//! Sampling-mode events: the fd plus its mapped ring buffer, and the
//! demultiplexer that turns ring records into caller-visible rows.

use std::os::unix::io::RawFd;

use log::debug;

use crate::data::{PmuData, TraceData};
use crate::error::Result;
use crate::event::{EventSpec, PmuKind};
use crate::records::{CommRecord, LostRecord, MmapRecord, SampleRecord, TaskRecord};
use crate::ring_buffer::{RingBuffer, DEFAULT_DATA_PAGES};
use crate::sys;

use super::{uncore_forces_any_tid, OpenOptions, PerfFd};

/// Receiver for everything a drain produces besides samples: module maps,
/// forks, comm updates and loss accounting.
pub trait SampleSink {
    fn sample(&mut self, data: PmuData);
    fn module_mapped(&mut self, pid: i32, filename: &str, addr: u64);
    fn forked(&mut self, ptid: i32, tid: i32);
    fn comm_changed(&mut self, pid: i32, tid: i32, comm: String);
    fn lost(&mut self, count: u64);
}

#[derive(Debug)]
pub struct Sampler {
    fd: PerfFd,
    ring: RingBuffer,
    cpu: i32,
    tid: i32,
    sample_type: u64,
    /// Keep the whole chain, or only its first valid frame.
    call_stack: bool,
    is_tracepoint: bool,
    event_name: String,
}

impl Sampler {
    pub fn open(
        spec: &EventSpec,
        cpu: i32,
        tid: i32,
        group_fd: Option<RawFd>,
        opts: &OpenOptions,
    ) -> Result<Self> {
        let mut attr = sys::PerfEventAttr::zeroed();
        attr.kind = spec.type_;
        attr.config = spec.config;
        attr.bp_addr_or_config1 = spec.config1;
        attr.bp_len_or_config2 = spec.config2;
        let mut sample_type = sys::PERF_SAMPLE_IP
            | sys::PERF_SAMPLE_TID
            | sys::PERF_SAMPLE_TIME
            | sys::PERF_SAMPLE_CALLCHAIN
            | sys::PERF_SAMPLE_ID
            | sys::PERF_SAMPLE_CPU
            | sys::PERF_SAMPLE_PERIOD
            | sys::PERF_SAMPLE_IDENTIFIER
            | sys::PERF_SAMPLE_RAW;
        if opts.branch_filter != 0 {
            sample_type |= sys::PERF_SAMPLE_BRANCH_STACK;
            attr.branch_sample_type = opts.branch_filter;
        }
        attr.sample_type = sample_type;
        attr.sample_period_or_freq = opts.period_or_freq;
        attr.read_format = sys::PERF_FORMAT_ID;
        attr.flags = sys::PERF_ATTR_FLAG_DISABLED
            | sys::PERF_ATTR_FLAG_INHERIT
            | sys::PERF_ATTR_FLAG_PINNED
            | sys::PERF_ATTR_FLAG_MMAP
            | sys::PERF_ATTR_FLAG_MMAP2
            | sys::PERF_ATTR_FLAG_COMM
            | sys::PERF_ATTR_FLAG_TASK
            | sys::PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | sys::PERF_ATTR_FLAG_EXCLUDE_GUEST;
        if opts.use_freq {
            attr.flags |= sys::PERF_ATTR_FLAG_FREQ;
        }
        if opts.exclude_user {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if opts.exclude_kernel {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if group_fd.is_some() {
            // Group members must not be pinned and must start armed.
            attr.flags &= !(sys::PERF_ATTR_FLAG_PINNED | sys::PERF_ATTR_FLAG_DISABLED);
        }

        let (target, flags) = opts.target(tid);
        let target = if uncore_forces_any_tid(spec) { -1 } else { target };
        let fd = PerfFd::open(&attr, target, cpu, group_fd.unwrap_or(-1), flags, &spec.name)?;
        let ring = RingBuffer::map(fd.raw(), DEFAULT_DATA_PAGES)?;
        Ok(Sampler {
            fd,
            ring,
            cpu,
            tid,
            sample_type,
            call_stack: opts.call_stack,
            is_tracepoint: spec.kind == PmuKind::Tracepoint,
            event_name: spec.name.clone(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    pub fn enable(&self) -> Result<()> {
        self.fd.enable()
    }

    pub fn disable(&self) -> Result<()> {
        self.fd.disable()
    }

    pub fn reset(&self) -> Result<()> {
        self.fd.reset()
    }

    fn sample_to_data(&self, sample: SampleRecord) -> PmuData {
        let trace_event = self.is_tracepoint.then_some(self.event_name.as_str());
        convert_sample(sample, self.call_stack, trace_event)
    }

    /// Drain everything pending, reading while the event is disabled so
    /// the kernel producer is quiet.
    pub fn read(&mut self, sink: &mut dyn SampleSink) -> Result<()> {
        let sample_type = self.sample_type;
        let mut produced = 0usize;
        let mut parse_failures = 0usize;
        // Decode records into owning values first; the sink may want to
        // re-enter this sampler's state.
        enum Decoded {
            Sample(SampleRecord),
            Mmap(MmapRecord),
            Fork(TaskRecord),
            Comm(CommRecord),
            Lost(u64),
        }
        let mut batch = Vec::new();
        self.ring.drain(|ring, record| {
            let data = record.data(ring);
            let decoded = match record.kind {
                sys::PERF_RECORD_SAMPLE => {
                    SampleRecord::parse(data, sample_type).map(Decoded::Sample)
                }
                sys::PERF_RECORD_MMAP => MmapRecord::parse(data, false).map(Decoded::Mmap),
                sys::PERF_RECORD_MMAP2 => MmapRecord::parse(data, true).map(Decoded::Mmap),
                sys::PERF_RECORD_FORK => TaskRecord::parse(data).map(Decoded::Fork),
                sys::PERF_RECORD_COMM => CommRecord::parse(data).map(Decoded::Comm),
                sys::PERF_RECORD_LOST => {
                    LostRecord::parse(data).map(|lost| Decoded::Lost(lost.lost))
                }
                // EXIT, THROTTLE and anything newer are not interesting.
                _ => return,
            };
            match decoded {
                Some(decoded) => batch.push(decoded),
                None => parse_failures += 1,
            }
        });
        for decoded in batch {
            match decoded {
                Decoded::Sample(sample) => {
                    produced += 1;
                    sink.sample(self.sample_to_data(sample));
                }
                Decoded::Mmap(mmap) => sink.module_mapped(mmap.pid, &mmap.filename, mmap.addr),
                Decoded::Fork(fork) => sink.forked(fork.ptid, fork.tid),
                Decoded::Comm(comm) => sink.comm_changed(comm.pid, comm.tid, comm.comm),
                Decoded::Lost(count) => sink.lost(count),
            }
        }
        if produced > 0 || parse_failures > 0 {
            debug!(
                "drained {produced} samples ({parse_failures} undecodable) from {} cpu={} tid={}",
                self.event_name, self.cpu, self.tid
            );
        }
        Ok(())
    }
}

/// Shape one parsed sample into the caller-visible row. The ip chain is
/// copied whole or reduced to its first valid frame; tracepoint payloads
/// keep the event name so field lookups can find their format.
fn convert_sample(sample: SampleRecord, call_stack: bool, trace_event: Option<&str>) -> PmuData {
    let mut ips: Vec<u64> = Vec::new();
    if call_stack {
        ips.extend(sample.valid_ips());
    } else if let Some(ip) = sample.valid_ips().next() {
        ips.push(ip);
    }
    let raw = match trace_event {
        Some(event) if !sample.raw.is_empty() => Some(TraceData {
            event: event.to_string(),
            data: sample.raw,
        }),
        _ => None,
    };
    PmuData {
        ts: sample.time,
        pid: sample.pid,
        tid: sample.tid,
        cpu: sample.cpu as i32,
        period: sample.period,
        ips,
        branches: sample.branches,
        raw,
        ..PmuData::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleRecord {
        SampleRecord {
            ip: 0x1000,
            pid: 5,
            tid: 6,
            time: 99,
            id: 1,
            cpu: 3,
            period: 4000,
            callchain: vec![sys::PERF_CONTEXT_MAX, 0x1000, 0x2000, 0x3000],
            raw: vec![1, 2, 3, 4],
            branches: Vec::new(),
        }
    }

    #[test]
    fn whole_chain_mode_keeps_every_valid_ip() {
        let data = convert_sample(sample(), true, None);
        assert_eq!(data.ips, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!((data.pid, data.tid, data.cpu), (5, 6, 3));
        assert_eq!(data.period, 4000);
        assert!(data.raw.is_none());
    }

    #[test]
    fn top_frame_mode_keeps_one_ip() {
        let data = convert_sample(sample(), false, None);
        assert_eq!(data.ips, vec![0x1000]);
    }

    #[test]
    fn tracepoint_samples_carry_their_payload() {
        let data = convert_sample(sample(), true, Some("syscalls:sys_enter_write"));
        let raw = data.raw.unwrap();
        assert_eq!(raw.event, "syscalls:sys_enter_write");
        assert_eq!(raw.data, vec![1, 2, 3, 4]);
    }
}
