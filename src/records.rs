//! Parsing of kernel ring-buffer records.
//!
//! Record payloads arrive either as one contiguous slice or as two
//! fragments when a record straddles the ring's wrap point; [`RawData`]
//! makes both look the same to the field readers. Field order is the
//! kernel ABI order for the `sample_type` mask configured at open time.

use byteorder::{ByteOrder, NativeEndian};

use crate::sys;

/// A byte view over ring-buffer memory, possibly split at the wrap.
#[derive(Clone, Copy, Debug)]
pub enum RawData<'a> {
    Single(&'a [u8]),
    Split(&'a [u8], &'a [u8]),
}

impl<'a> RawData<'a> {
    pub fn len(&self) -> usize {
        match self {
            RawData::Single(s) => s.len(),
            RawData::Split(a, b) => a.len() + b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            RawData::Single(s) => s.to_vec(),
            RawData::Split(a, b) => {
                let mut v = Vec::with_capacity(a.len() + b.len());
                v.extend_from_slice(a);
                v.extend_from_slice(b);
                v
            }
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Option<()> {
        let n = buf.len();
        match *self {
            RawData::Single(s) => {
                if s.len() < n {
                    return None;
                }
                buf.copy_from_slice(&s[..n]);
                *self = RawData::Single(&s[n..]);
            }
            RawData::Split(a, b) => {
                if a.len() + b.len() < n {
                    return None;
                }
                if n <= a.len() {
                    buf.copy_from_slice(&a[..n]);
                    *self = if n == a.len() {
                        RawData::Single(b)
                    } else {
                        RawData::Split(&a[n..], b)
                    };
                } else {
                    let rest = n - a.len();
                    buf[..a.len()].copy_from_slice(a);
                    buf[a.len()..].copy_from_slice(&b[..rest]);
                    *self = RawData::Single(&b[rest..]);
                }
            }
        }
        Some(())
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Some(NativeEndian::read_u64(&buf))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Some(NativeEndian::read_u32(&buf))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn split_off_prefix(&mut self, n: usize) -> Option<RawData<'a>> {
        if self.len() < n {
            return None;
        }
        let prefix = match *self {
            RawData::Single(s) => {
                let (head, tail) = s.split_at(n);
                *self = RawData::Single(tail);
                RawData::Single(head)
            }
            RawData::Split(a, b) => {
                if n <= a.len() {
                    let (head, tail) = a.split_at(n);
                    *self = if tail.is_empty() {
                        RawData::Single(b)
                    } else {
                        RawData::Split(tail, b)
                    };
                    RawData::Single(head)
                } else {
                    let rest = n - a.len();
                    let (bhead, btail) = b.split_at(rest);
                    *self = RawData::Single(btail);
                    RawData::Split(a, bhead)
                }
            }
        };
        Some(prefix)
    }

    /// Read a NUL-terminated string from a fixed-size field.
    fn read_cstr(&mut self, field_len: usize) -> Option<String> {
        let bytes = self.split_off_prefix(field_len)?.to_vec();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// One taken-branch entry from `PERF_SAMPLE_BRANCH_STACK`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
    pub cycles: u16,
}

/// Parsed `PERF_RECORD_SAMPLE`, restricted to the masks this crate opens
/// with (`IDENTIFIER|IP|TID|TIME|ID|CPU|PERIOD|CALLCHAIN|RAW` and
/// optionally `BRANCH_STACK`).
#[derive(Clone, Debug, Default)]
pub struct SampleRecord {
    pub ip: u64,
    pub pid: i32,
    pub tid: i32,
    pub time: u64,
    pub id: u64,
    pub cpu: u32,
    pub period: u64,
    pub callchain: Vec<u64>,
    pub raw: Vec<u8>,
    pub branches: Vec<BranchEntry>,
}

impl SampleRecord {
    pub fn parse(mut data: RawData, sample_type: u64) -> Option<Self> {
        let mut record = SampleRecord::default();
        if sample_type & sys::PERF_SAMPLE_IDENTIFIER != 0 {
            record.id = data.read_u64()?;
        }
        if sample_type & sys::PERF_SAMPLE_IP != 0 {
            record.ip = data.read_u64()?;
        }
        if sample_type & sys::PERF_SAMPLE_TID != 0 {
            record.pid = data.read_i32()?;
            record.tid = data.read_i32()?;
        }
        if sample_type & sys::PERF_SAMPLE_TIME != 0 {
            record.time = data.read_u64()?;
        }
        if sample_type & sys::PERF_SAMPLE_ID != 0 {
            record.id = data.read_u64()?;
        }
        if sample_type & sys::PERF_SAMPLE_CPU != 0 {
            record.cpu = data.read_u32()?;
            let _reserved = data.read_u32()?;
        }
        if sample_type & sys::PERF_SAMPLE_PERIOD != 0 {
            record.period = data.read_u64()?;
        }
        if sample_type & sys::PERF_SAMPLE_CALLCHAIN != 0 {
            let nr = data.read_u64()? as usize;
            record.callchain.reserve(nr);
            for _ in 0..nr {
                record.callchain.push(data.read_u64()?);
            }
        }
        if sample_type & sys::PERF_SAMPLE_RAW != 0 {
            let size = data.read_u32()? as usize;
            record.raw = data.split_off_prefix(size)?.to_vec();
        }
        if sample_type & sys::PERF_SAMPLE_BRANCH_STACK != 0 {
            let nr = data.read_u64()? as usize;
            record.branches.reserve(nr);
            for _ in 0..nr {
                let from = data.read_u64()?;
                let to = data.read_u64()?;
                let flags = data.read_u64()?;
                record.branches.push(BranchEntry {
                    from,
                    to,
                    // flags bitfield: mispred:1 predicted:1 in_tx:1 abort:1
                    // cycles:16, starting at bit 4.
                    cycles: ((flags >> 4) & 0xffff) as u16,
                });
            }
        }
        Some(record)
    }

    /// Instruction pointers with the kernel's context markers removed.
    pub fn valid_ips(&self) -> impl Iterator<Item = u64> + '_ {
        self.callchain
            .iter()
            .copied()
            .filter(|&ip| ip < sys::PERF_CONTEXT_MAX && ip != 0)
    }
}

/// `PERF_RECORD_MMAP` / `PERF_RECORD_MMAP2` reduced to what the resolver
/// consumes.
#[derive(Clone, Debug)]
pub struct MmapRecord {
    pub pid: i32,
    pub tid: i32,
    pub addr: u64,
    pub len: u64,
    pub filename: String,
}

impl MmapRecord {
    pub fn parse(mut data: RawData, is_mmap2: bool) -> Option<Self> {
        let pid = data.read_i32()?;
        let tid = data.read_i32()?;
        let addr = data.read_u64()?;
        let len = data.read_u64()?;
        let _pgoff = data.read_u64()?;
        if is_mmap2 {
            // maj, min, ino, ino_generation, prot+flags.
            let _maj = data.read_u32()?;
            let _min = data.read_u32()?;
            let _ino = data.read_u64()?;
            let _ino_gen = data.read_u64()?;
            let _prot = data.read_u32()?;
            let _flags = data.read_u32()?;
        }
        let filename = data.read_cstr(data.len())?;
        Some(MmapRecord {
            pid,
            tid,
            addr,
            len,
            filename,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CommRecord {
    pub pid: i32,
    pub tid: i32,
    pub comm: String,
}

impl CommRecord {
    pub fn parse(mut data: RawData) -> Option<Self> {
        let pid = data.read_i32()?;
        let tid = data.read_i32()?;
        let comm = data.read_cstr(data.len())?;
        Some(CommRecord { pid, tid, comm })
    }
}

/// `PERF_RECORD_FORK` and `PERF_RECORD_EXIT` share this layout.
#[derive(Clone, Copy, Debug)]
pub struct TaskRecord {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub time: u64,
}

impl TaskRecord {
    pub fn parse(mut data: RawData) -> Option<Self> {
        Some(TaskRecord {
            pid: data.read_i32()?,
            ppid: data.read_i32()?,
            tid: data.read_i32()?,
            ptid: data.read_i32()?,
            time: data.read_u64()?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
}

impl LostRecord {
    pub fn parse(mut data: RawData) -> Option<Self> {
        Some(LostRecord {
            id: data.read_u64()?,
            lost: data.read_u64()?,
        })
    }
}
