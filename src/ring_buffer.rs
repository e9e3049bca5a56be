//! Consumer side of the kernel perf ring buffer.
//!
//! The kernel produces records into the data pages and publishes
//! `data_head`; we consume `[data_tail, data_head)` and publish the new
//! tail when a batch is done. Head is loaded with acquire semantics,
//! tail stored with release semantics; a record that straddles the ring's
//! wrap point is surfaced as a split view, never copied by this layer.

use std::ops::Range;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void};
use log::warn;

use crate::error::{Error, Result};
use crate::records::RawData;
use crate::sys::{PerfEventHeader, PerfEventMmapPage};

pub const PAGE_SIZE: usize = 4096;

/// Default ring size: 128 data pages plus the metadata page.
pub const DEFAULT_DATA_PAGES: usize = 128;

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

#[derive(Clone, Debug)]
enum SliceLocation {
    Single(Range<usize>),
    Split(Range<usize>, Range<usize>),
}

impl SliceLocation {
    #[inline]
    fn get<'a>(&self, buffer: &'a [u8]) -> RawData<'a> {
        match self {
            SliceLocation::Single(range) => RawData::Single(&buffer[range.clone()]),
            SliceLocation::Split(left, right) => {
                RawData::Split(&buffer[left.clone()], &buffer[right.clone()])
            }
        }
    }
}

/// One undecoded record: its type, misc bits and payload location.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub kind: u32,
    pub misc: u16,
    location: SliceLocation,
}

impl RawRecord {
    #[inline]
    pub fn data<'a>(&self, ring: &'a RingBuffer) -> RawData<'a> {
        self.location.get(ring.data())
    }
}

/// A mapped perf ring buffer. Owns the mapping, not the fd.
#[derive(Debug)]
pub struct RingBuffer {
    base: *mut u8,
    size: u64,
    position: u64,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map `1 + data_pages` pages over the fd. `data_pages` must be a
    /// power of two (kernel requirement).
    pub fn map(fd: i32, data_pages: usize) -> Result<Self> {
        debug_assert!(data_pages.is_power_of_two());
        let full_size = (data_pages + 1) * PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                full_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            warn!("ring buffer mmap failed for fd {fd}: {}", std::io::Error::last_os_error());
            return Err(Error::MmapFailed);
        }
        Ok(RingBuffer {
            base: base as *mut u8,
            size: (data_pages * PAGE_SIZE) as u64,
            position: 0,
        })
    }

    #[inline]
    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(PAGE_SIZE), self.size as usize) }
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        unsafe { read_head(self.base) != self.position }
    }

    /// Metadata page, for aux offsets (SPE).
    pub(crate) fn metadata(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    fn next_record(&mut self) -> Option<RawRecord> {
        let head = unsafe { read_head(self.base) };
        if head == self.position {
            return None;
        }

        let size = self.size as usize;
        let record_start = (self.position % self.size) as usize;
        // Positions are 8-aligned and the ring size is a multiple of 8, so
        // the header itself never straddles the wrap.
        let header = unsafe {
            (self.data()[record_start..].as_ptr() as *const PerfEventHeader).read_unaligned()
        };
        let payload_start = record_start + std::mem::size_of::<PerfEventHeader>();
        let record_end = record_start + header.size as usize;

        let location = if record_end > size {
            SliceLocation::Split(payload_start..size, 0..record_end % size)
        } else {
            SliceLocation::Single(payload_start..record_end)
        };

        let record = RawRecord {
            kind: header.kind,
            misc: header.misc,
            location,
        };
        self.position += header.size as u64;
        Some(record)
    }

    /// Drain every pending record through `consume`, then publish the new
    /// tail. Never blocks; the producer is free to keep appending while we
    /// read records that were already published.
    pub fn drain(&mut self, mut consume: impl FnMut(&RingBuffer, &RawRecord)) {
        while let Some(record) = self.next_record() {
            consume(self, &record);
        }
        unsafe { write_tail(self.base, self.position) };
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, (self.size as usize) + PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A fake ring assembled in plain memory: metadata page plus data pages,
    // with records written the way the kernel writes them.
    struct FakeRing {
        storage: Vec<u8>,
    }

    impl FakeRing {
        fn new(data_pages: usize) -> Self {
            FakeRing {
                storage: vec![0u8; (data_pages + 1) * PAGE_SIZE],
            }
        }

        fn ring(&mut self, data_pages: usize) -> RingBuffer {
            RingBuffer {
                base: self.storage.as_mut_ptr(),
                size: (data_pages * PAGE_SIZE) as u64,
                position: 0,
            }
        }

        fn push_record(&mut self, head: &mut u64, size: u64, kind: u32, payload: &[u8]) {
            let total = 8 + payload.len();
            assert_eq!(total % 8, 0);
            let header = [
                &kind.to_ne_bytes()[..],
                &0u16.to_ne_bytes()[..],
                &(total as u16).to_ne_bytes()[..],
            ]
            .concat();
            for (i, byte) in header.iter().chain(payload.iter()).enumerate() {
                let off = ((*head + i as u64) % size) as usize;
                self.storage[PAGE_SIZE + off] = *byte;
            }
            *head += total as u64;
            let page = self.storage.as_mut_ptr() as *mut PerfEventMmapPage;
            unsafe { (*page).data_head = *head };
        }
    }

    #[test]
    fn drains_contiguous_records() {
        let mut fake = FakeRing::new(1);
        let mut head = 0;
        fake.push_record(&mut head, PAGE_SIZE as u64, 9, &[1u8; 16]);
        fake.push_record(&mut head, PAGE_SIZE as u64, 2, &[2u8; 8]);

        let mut ring = fake.ring(1);
        let mut seen = Vec::new();
        ring.drain(|ring, record| {
            seen.push((record.kind, record.data(ring).len()));
        });
        assert_eq!(seen, vec![(9, 16), (2, 8)]);

        // Tail was published; a second drain sees nothing.
        let mut count = 0;
        ring.drain(|_, _| count += 1);
        assert_eq!(count, 0);
        std::mem::forget(ring); // storage is owned by FakeRing
    }

    #[test]
    fn reassembles_wrapped_record() {
        let size = PAGE_SIZE as u64;
        let mut fake = FakeRing::new(1);
        let mut head = 0;
        // Fill until only 16 bytes remain before the wrap, then write a
        // 24-byte record that must straddle it.
        while size - (head % size) > 16 {
            fake.push_record(&mut head, size, 1, &[0u8; 8]);
        }
        let payload: Vec<u8> = (0u8..16).collect();
        fake.push_record(&mut head, size, 9, &payload);

        let mut ring = fake.ring(1);
        let mut wrapped_payload = None;
        ring.drain(|ring, record| {
            if record.kind == 9 {
                wrapped_payload = Some(record.data(ring).to_vec());
            }
        });
        assert_eq!(wrapped_payload.unwrap(), payload);
        std::mem::forget(ring);
    }

    #[test]
    fn pending_tracks_head() {
        let mut fake = FakeRing::new(1);
        let ring = fake.ring(1);
        assert!(!ring.has_pending());
        std::mem::forget(ring);
        let mut head = 0;
        fake.push_record(&mut head, PAGE_SIZE as u64, 1, &[0u8; 8]);
        let ring = fake.ring(1);
        assert!(ring.has_pending());
        std::mem::forget(ring);
    }
}
