//! Fork observation for counting sessions: a software-dummy event per
//! watched pid whose ring carries FORK/EXIT records, drained by a
//! producer thread; a consumer thread adopts every new tid into the
//! session's event lists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::error::Result;
use crate::event_list::EventList;
use crate::perf_event::PerfFd;
use crate::records::{RawData, TaskRecord};
use crate::ring_buffer::RingBuffer;
use crate::sys;

const DUMMY_DATA_PAGES: usize = 16;
const DRAIN_PAUSE: Duration = Duration::from_millis(20);

/// A list together with its group leader, so adopted tids join groups at
/// the right leader fd. Leaders precede their members in the vector.
pub type ObservedList = (Arc<Mutex<EventList>>, Option<Arc<Mutex<EventList>>>);

struct DummyEvent {
    pid: i32,
    fd: PerfFd,
    ring: RingBuffer,
}

fn open_dummy(pid: i32) -> Result<DummyEvent> {
    let mut attr = sys::PerfEventAttr::zeroed();
    attr.kind = sys::PERF_TYPE_SOFTWARE;
    attr.config = sys::PERF_COUNT_SW_DUMMY;
    attr.sample_period_or_freq = 1;
    attr.sample_type = sys::PERF_SAMPLE_TIME;
    attr.read_format = sys::PERF_FORMAT_ID;
    attr.flags = sys::PERF_ATTR_FLAG_DISABLED
        | sys::PERF_ATTR_FLAG_EXCLUDE_KERNEL
        | sys::PERF_ATTR_FLAG_EXCLUDE_GUEST
        | sys::PERF_ATTR_FLAG_TASK
        | sys::PERF_ATTR_FLAG_SAMPLE_ID_ALL;
    let fd = PerfFd::open(&attr, pid, -1, -1, 0, "dummy")?;
    let ring = RingBuffer::map(fd.raw(), DUMMY_DATA_PAGES)?;
    fd.enable()?;
    Ok(DummyEvent { pid, fd, ring })
}

fn drain_dummy(dummy: &mut DummyEvent, forks: &Sender<i32>) -> bool {
    let mut watched_exited = false;
    let watched = dummy.pid;
    dummy.ring.drain(|ring, record| {
        let data: RawData = record.data(ring);
        match record.kind {
            sys::PERF_RECORD_FORK => {
                if let Some(fork) = TaskRecord::parse(data) {
                    debug!("fork observed: ptid {} -> tid {}", fork.ptid, fork.tid);
                    let _ = forks.send(fork.tid);
                }
            }
            sys::PERF_RECORD_EXIT => {
                if let Some(exit) = TaskRecord::parse(data) {
                    if exit.pid == exit.tid && exit.pid == watched {
                        watched_exited = true;
                    }
                }
            }
            _ => {}
        }
    });
    watched_exited
}

fn producer_loop(pids: Vec<i32>, forks: Sender<i32>, stop: Arc<AtomicBool>) {
    let mut dummies: Vec<DummyEvent> = pids
        .into_iter()
        .filter(|&pid| pid > 0)
        .filter_map(|pid| match open_dummy(pid) {
            Ok(dummy) => Some(dummy),
            Err(err) => {
                warn!("could not open dummy event for pid {pid}: {err}");
                None
            }
        })
        .collect();

    while !stop.load(Ordering::Relaxed) && !dummies.is_empty() {
        let mut retired = Vec::new();
        for (idx, dummy) in dummies.iter_mut().enumerate() {
            if drain_dummy(dummy, &forks) {
                retired.push(idx);
            }
        }
        for idx in retired.into_iter().rev() {
            let dummy = dummies.remove(idx);
            debug!("watched pid {} exited, retiring its dummy event", dummy.pid);
            let _ = dummy.fd.disable();
        }
        thread::sleep(DRAIN_PAUSE);
    }
}

fn consumer_loop(lists: Vec<ObservedList>, forks: Receiver<i32>, stop: Arc<AtomicBool>) {
    loop {
        match forks.recv_timeout(DRAIN_PAUSE) {
            Ok(tid) => {
                for (list, leader) in &lists {
                    match leader {
                        Some(leader) => {
                            // Leader before member, always, so group joins
                            // see the leader's fresh column.
                            let mut leader = leader.lock().unwrap();
                            leader.add_new_process(tid, None);
                            list.lock().unwrap().add_new_process(tid, Some(&*leader));
                        }
                        None => list.lock().unwrap().add_new_process(tid, None),
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Owns the two observer threads; both stop when this is dropped.
pub struct ForkObserver {
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl ForkObserver {
    pub fn start(pids: Vec<i32>, lists: Vec<ObservedList>) -> ForkObserver {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();
        let producer = thread::spawn({
            let stop = stop.clone();
            move || producer_loop(pids, tx, stop)
        });
        let consumer = thread::spawn({
            let stop = stop.clone();
            move || consumer_loop(lists, rx, stop)
        });
        ForkObserver {
            stop,
            producer: Some(producer),
            consumer: Some(consumer),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

impl Drop for ForkObserver {
    fn drop(&mut self) {
        self.stop();
    }
}
