//! ARM Statistical Profiling Extension: one collector per cpu, reading
//! decoded SPE records out of the event's aux area.
//!
//! The aux payload is a packet stream (ARM SPE profiling packet format):
//! a record is a run of address/counter/event/context packets terminated
//! by an End or Timestamp packet.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use libc::c_void;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::event::EventSpec;
use crate::ring_buffer::{RingBuffer, DEFAULT_DATA_PAGES, PAGE_SIZE};
use crate::sys;

use super::{OpenOptions, PerfFd};

bitflags! {
    /// SPE data-filter bits; these are the `config` word of the SPE event,
    /// matching the device's `format/` declarations.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct SpeFilter: u64 {
        const TS_ENABLE = 1 << 0;
        const PA_ENABLE = 1 << 1;
        const PCT_ENABLE = 1 << 2;
        const JITTER = 1 << 16;
        const BRANCH_FILTER = 1 << 32;
        const LOAD_FILTER = 1 << 33;
        const STORE_FILTER = 1 << 34;
    }
}

/// One decoded SPE sample.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SpeRecord {
    pub tid: i32,
    pub pc: u64,
    pub va: u64,
    pub pa: u64,
    pub events: u64,
    pub lat: u16,
    pub timestamp: u64,
}

// SPE packet header encodings, short format.
const HDR_PAD: u8 = 0x00;
const HDR_END: u8 = 0x01;
const HDR_TIMESTAMP: u8 = 0x71;
const HDR_MASK_EVENTS: u8 = 0xcf;
const HDR_EVENTS: u8 = 0x42;
const HDR_SOURCE: u8 = 0x43;
const HDR_MASK_CONTEXT: u8 = 0xfc;
const HDR_CONTEXT: u8 = 0x64;
const HDR_OP_TYPE: u8 = 0x48;
const HDR_EXTENDED: u8 = 0x20;
const HDR_MASK_EXTENDED: u8 = 0xfc;
const HDR_MASK_ADDR: u8 = 0xf8;
const HDR_ADDRESS: u8 = 0xb0;
const HDR_COUNTER: u8 = 0x98;

// Address packet indexes.
const ADDR_INDEX_PC: u8 = 0;
const ADDR_INDEX_BRANCH_TARGET: u8 = 1;
const ADDR_INDEX_DATA_VA: u8 = 2;
const ADDR_INDEX_DATA_PA: u8 = 3;
// Counter packet indexes.
const COUNTER_INDEX_TOTAL_LAT: u8 = 0;

#[inline]
fn payload_len(hdr: u8) -> usize {
    1 << ((hdr >> 4) & 0x3)
}

fn read_payload(buf: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(8) {
        value |= (*byte as u64) << (8 * i);
    }
    value
}

/// Decode one aux byte stream into records. Returns true if any record
/// lacked a context (tid) packet.
pub fn decode_packets(buf: &[u8], records: &mut Vec<SpeRecord>) -> bool {
    let mut missing_context = false;
    let mut current = SpeRecord {
        tid: -1,
        ..SpeRecord::default()
    };
    let mut have_any = false;
    let mut pos = 0usize;

    let mut flush = |current: &mut SpeRecord, have_any: &mut bool, ts: u64| {
        if *have_any {
            current.timestamp = ts;
            if current.tid == -1 {
                missing_context = true;
            }
            records.push(*current);
        }
        *current = SpeRecord {
            tid: current.tid,
            ..SpeRecord::default()
        };
        *have_any = false;
    };

    while pos < buf.len() {
        let hdr0 = buf[pos];
        pos += 1;
        if hdr0 == HDR_PAD {
            continue;
        }
        if hdr0 == HDR_END {
            flush(&mut current, &mut have_any, 0);
            continue;
        }
        // Extended format: a second header byte widens the index space.
        let (hdr, ext_bits) = if hdr0 & HDR_MASK_EXTENDED == HDR_EXTENDED {
            if pos >= buf.len() {
                break;
            }
            let hdr1 = buf[pos];
            pos += 1;
            (hdr1, (hdr0 & 0x3) << 3)
        } else {
            (hdr0, 0)
        };

        let len = payload_len(hdr);
        if pos + len > buf.len() {
            break;
        }
        let payload = read_payload(&buf[pos..pos + len]);
        pos += len;

        if hdr == HDR_TIMESTAMP {
            flush(&mut current, &mut have_any, payload);
        } else if hdr & HDR_MASK_EVENTS == HDR_EVENTS {
            current.events = payload;
            have_any = true;
        } else if hdr & HDR_MASK_EVENTS == HDR_SOURCE {
            // Data source; not surfaced.
        } else if hdr & HDR_MASK_CONTEXT == HDR_CONTEXT {
            current.tid = payload as u32 as i32;
        } else if hdr & HDR_MASK_CONTEXT == HDR_OP_TYPE {
            // Operation class; not surfaced.
        } else if hdr & HDR_MASK_ADDR == HDR_ADDRESS {
            let index = (hdr & 0x7) | ext_bits;
            // Bits [55:0] are the address; the top byte carries el/ns tags.
            let addr = payload & 0x00ff_ffff_ffff_ffff;
            match index {
                ADDR_INDEX_PC | ADDR_INDEX_BRANCH_TARGET => {
                    if index == ADDR_INDEX_PC {
                        current.pc = addr;
                        have_any = true;
                    }
                }
                ADDR_INDEX_DATA_VA => current.va = addr,
                ADDR_INDEX_DATA_PA => current.pa = addr,
                _ => {}
            }
        } else if hdr & HDR_MASK_ADDR == HDR_COUNTER {
            let index = (hdr & 0x7) | ext_bits;
            if index == COUNTER_INDEX_TOTAL_LAT {
                current.lat = payload as u16;
            }
        } else {
            // Unknown packet; resynchronize at the next byte.
            pos -= len;
        }
    }
    missing_context
}

/// The aux area of an SPE fd: mapped separately from the data ring, with
/// its own head/tail pair in the shared metadata page.
#[derive(Debug)]
struct AuxBuffer {
    base: *mut u8,
    size: u64,
    metadata: *mut sys::PerfEventMmapPage,
}

unsafe impl Send for AuxBuffer {}

const AUX_PAGES: usize = 256;

impl AuxBuffer {
    fn map(fd: RawFd, ring: &RingBuffer) -> Result<Self> {
        let metadata = ring.metadata();
        let size = (AUX_PAGES * PAGE_SIZE) as u64;
        let offset = ((DEFAULT_DATA_PAGES + 1) * PAGE_SIZE) as i64;
        unsafe {
            (*metadata).aux_offset = offset as u64;
            (*metadata).aux_size = size;
        }
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if base == libc::MAP_FAILED {
            warn!("aux mmap failed for fd {fd}: {}", std::io::Error::last_os_error());
            return Err(Error::MmapFailed);
        }
        Ok(AuxBuffer {
            base: base as *mut u8,
            size,
            metadata,
        })
    }

    /// Copy out everything between aux_tail and aux_head, then publish
    /// the new tail.
    fn take_pending(&mut self) -> Vec<u8> {
        let head = unsafe { ptr::read_volatile(&(*self.metadata).aux_head) };
        fence(Ordering::Acquire);
        let tail = unsafe { ptr::read_volatile(&(*self.metadata).aux_tail) };
        if head == tail {
            return Vec::new();
        }
        let data = unsafe { slice::from_raw_parts(self.base, self.size as usize) };
        let mut out = Vec::with_capacity((head - tail) as usize);
        for pos in tail..head {
            out.push(data[(pos % self.size) as usize]);
        }
        fence(Ordering::AcqRel);
        unsafe { ptr::write_volatile(&mut (*self.metadata).aux_tail, head) };
        out
    }
}

impl Drop for AuxBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.size as usize);
        }
    }
}

// One SPE engine exists per cpu; a second session asking for the same cpu
// must see DeviceBusy rather than a confusing EBUSY from the driver later.
static ENGAGED_CPUS: Mutex<Vec<i32>> = Mutex::new(Vec::new());

pub(crate) fn reserve_cpu(cpu: i32) -> Result<()> {
    let mut engaged = ENGAGED_CPUS.lock().unwrap();
    if engaged.contains(&cpu) {
        return Err(Error::DeviceBusy);
    }
    engaged.push(cpu);
    Ok(())
}

pub(crate) fn release_cpu(cpu: i32) {
    let mut engaged = ENGAGED_CPUS.lock().unwrap();
    engaged.retain(|&c| c != cpu);
}

#[derive(Debug)]
pub struct SpeCollector {
    fd: PerfFd,
    #[allow(dead_code)]
    ring: RingBuffer,
    aux: AuxBuffer,
    cpu: i32,
    /// Decoded records, bucketed per tid; tid -1 collects contextless
    /// records.
    records: HashMap<i32, Vec<SpeRecord>>,
    context_lost: bool,
}

impl SpeCollector {
    pub fn open(spec: &EventSpec, cpu: i32, opts: &OpenOptions) -> Result<Self> {
        reserve_cpu(cpu)?;
        let mut attr = sys::PerfEventAttr::zeroed();
        attr.kind = spec.type_;
        attr.config = spec.config;
        attr.bp_addr_or_config1 = spec.config1;
        attr.bp_len_or_config2 = spec.config2;
        attr.sample_period_or_freq = opts.period_or_freq.max(1);
        attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME | sys::PERF_SAMPLE_CPU;
        attr.read_format = sys::PERF_FORMAT_ID;
        attr.flags = sys::PERF_ATTR_FLAG_DISABLED | sys::PERF_ATTR_FLAG_SAMPLE_ID_ALL;
        if opts.exclude_user {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if opts.exclude_kernel {
            attr.flags |= sys::PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        let open = (|| {
            let fd = PerfFd::open(&attr, -1, cpu, -1, 0, &spec.name)?;
            let ring = RingBuffer::map(fd.raw(), DEFAULT_DATA_PAGES)?;
            let aux = AuxBuffer::map(fd.raw(), &ring)?;
            Ok::<_, Error>((fd, ring, aux))
        })();
        let (fd, ring, aux) = match open {
            Ok(parts) => parts,
            Err(err) => {
                release_cpu(cpu);
                return Err(err);
            }
        };
        debug!("spe collector open on cpu {cpu}, fd {}", fd.raw());
        Ok(SpeCollector {
            fd,
            ring,
            aux,
            cpu,
            records: HashMap::new(),
            context_lost: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }

    pub fn enable(&self) -> Result<()> {
        self.fd.enable()
    }

    pub fn disable(&self) -> Result<()> {
        self.fd.disable()
    }

    /// Decode whatever the engine produced since the last read. Call with
    /// the event disabled.
    pub fn read(&mut self) -> Result<()> {
        let payload = self.aux.take_pending();
        if payload.is_empty() {
            return Ok(());
        }
        let mut decoded = Vec::new();
        if decode_packets(&payload, &mut decoded) {
            self.context_lost = true;
        }
        debug!("spe cpu {}: {} records from {} aux bytes", self.cpu, decoded.len(), payload.len());
        for record in decoded {
            self.records.entry(record.tid).or_default().push(record);
        }
        Ok(())
    }

    /// Records decoded so far, drained per tid.
    pub fn take_records(&mut self) -> HashMap<i32, Vec<SpeRecord>> {
        std::mem::take(&mut self.records)
    }

    pub fn take_context_lost(&mut self) -> bool {
        std::mem::replace(&mut self.context_lost, false)
    }
}

impl Drop for SpeCollector {
    fn drop(&mut self) {
        release_cpu(self.cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_packet(index: u8, addr: u64) -> Vec<u8> {
        let mut v = vec![HDR_ADDRESS | index | 0x30]; // 8-byte payload
        v.extend_from_slice(&addr.to_le_bytes());
        v
    }

    fn counter_packet(index: u8, value: u16) -> Vec<u8> {
        let mut v = vec![HDR_COUNTER | index | 0x10]; // 2-byte payload
        v.extend_from_slice(&value.to_le_bytes());
        v
    }

    fn events_packet(bits: u8) -> Vec<u8> {
        vec![HDR_EVENTS, bits] // 1-byte payload
    }

    fn context_packet(tid: u32) -> Vec<u8> {
        let mut v = vec![HDR_CONTEXT | 0x20]; // 4-byte payload
        v.extend_from_slice(&tid.to_le_bytes());
        v
    }

    fn timestamp_packet(ts: u64) -> Vec<u8> {
        let mut v = vec![HDR_TIMESTAMP];
        v.extend_from_slice(&ts.to_le_bytes());
        v
    }

    #[test]
    fn decodes_one_record() {
        let mut buf = Vec::new();
        buf.push(HDR_PAD);
        buf.extend(context_packet(4242));
        buf.extend(addr_packet(ADDR_INDEX_PC, 0x4000_1234));
        buf.extend(addr_packet(ADDR_INDEX_DATA_VA, 0x7fff_0000));
        buf.extend(addr_packet(ADDR_INDEX_DATA_PA, 0x8_0000));
        buf.extend(counter_packet(COUNTER_INDEX_TOTAL_LAT, 17));
        buf.extend(events_packet(0x8)); // l1d refill
        buf.extend(timestamp_packet(999));

        let mut records = Vec::new();
        let missing = decode_packets(&buf, &mut records);
        assert!(!missing);
        assert_eq!(records.len(), 1);
        let r = records[0];
        assert_eq!(r.tid, 4242);
        assert_eq!(r.pc, 0x4000_1234);
        assert_eq!(r.va, 0x7fff_0000);
        assert_eq!(r.pa, 0x8_0000);
        assert_eq!(r.lat, 17);
        assert_eq!(r.events, 0x8);
        assert_eq!(r.timestamp, 999);
    }

    #[test]
    fn end_packet_terminates_without_timestamp() {
        let mut buf = Vec::new();
        buf.extend(context_packet(7));
        buf.extend(addr_packet(ADDR_INDEX_PC, 0x1000));
        buf.push(HDR_END);
        buf.extend(addr_packet(ADDR_INDEX_PC, 0x2000));
        buf.push(HDR_END);

        let mut records = Vec::new();
        decode_packets(&buf, &mut records);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pc, 0x1000);
        assert_eq!(records[1].pc, 0x2000);
        // Context sticks across records on the same cpu.
        assert_eq!(records[1].tid, 7);
    }

    #[test]
    fn contextless_record_is_flagged() {
        let mut buf = Vec::new();
        buf.extend(addr_packet(ADDR_INDEX_PC, 0x1000));
        buf.push(HDR_END);
        let mut records = Vec::new();
        assert!(decode_packets(&buf, &mut records));
        assert_eq!(records[0].tid, -1);
    }

    #[test]
    fn address_top_byte_is_stripped() {
        let mut buf = Vec::new();
        buf.extend(context_packet(1));
        buf.extend(addr_packet(ADDR_INDEX_PC, 0xff00_0000_0000_4321));
        buf.push(HDR_END);
        let mut records = Vec::new();
        decode_packets(&buf, &mut records);
        assert_eq!(records[0].pc, 0x4321);
    }

    #[test]
    fn spe_filter_bits_match_format_fields() {
        assert_eq!(SpeFilter::TS_ENABLE.bits(), 1);
        assert_eq!(SpeFilter::PA_ENABLE.bits(), 2);
        assert_eq!(SpeFilter::BRANCH_FILTER.bits(), 1 << 32);
        assert_eq!(SpeFilter::STORE_FILTER.bits(), 1 << 34);
    }
}
