//! Session management: the collection-descriptor registry, the open
//! pipeline (validation, uncore splitting, group wiring, fd budgeting,
//! epoll), the collect loops and the read/append/free buffer protocol.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::data::PmuData;
use crate::error::{Error, Result, Warning};
use crate::event::{self, EventKindFilter, EventSpec};
use crate::event_list::{EventList, SideEvents};
use crate::fork_observer::ForkObserver;
use crate::perf_event::OpenOptions;
use crate::process::{self, ProcInfo};
use crate::symbols::{Resolver, SymbolMode};
use crate::topology;
use crate::TaskKind;

const MIN_INTERVAL_MS: u64 = 100;
const FD_HEADROOM: u64 = 50;

/// Everything `open` needs to describe one measurement task.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Event names; empty only for SPE tasks.
    pub events: Vec<String>,
    /// Group id per event, aligned with `events`; -1 or absent means
    /// ungrouped.
    pub group_ids: Vec<i32>,
    pub pids: Vec<i32>,
    pub cpus: Vec<i32>,
    pub period_or_freq: u64,
    pub use_freq: bool,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub symbol_mode: SymbolMode,
    /// Whole call chains (true) or only the sampled frame.
    pub call_stack: bool,
    /// `PERF_SAMPLE_BRANCH_*` selector; zero disables branch stacks.
    pub branch_filter: u64,
    /// SPE knobs.
    pub spe_data_filter: u64,
    pub spe_event_filter: u64,
    pub spe_min_latency: u64,
    /// Adopt threads forked after open (counting only).
    pub include_new_forks: bool,
}

/// A caller-held buffer of records, stable until freed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(u64);

struct ListEntry {
    list: Arc<Mutex<EventList>>,
    leader: Option<Arc<Mutex<EventList>>>,
}

struct EpollSet {
    fd: i32,
    registered: usize,
}

impl EpollSet {
    fn new(fds: &[i32]) -> Result<EpollSet> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(Error::Unknown(nix::errno::Errno::last()));
        }
        for &fd in fds {
            let mut event = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                u64: fd as u64,
            };
            let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
            if rc != 0 {
                unsafe { libc::close(epfd) };
                return Err(Error::Unknown(nix::errno::Errno::last()));
            }
        }
        Ok(EpollSet {
            fd: epfd,
            registered: fds.len(),
        })
    }

    /// All watched fds hung up, meaning every monitored task exited.
    fn all_hung_up(&self) -> bool {
        if self.registered == 0 {
            return false;
        }
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered];
        let n = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, 0)
        };
        if n < self.registered as i32 {
            return false;
        }
        events[..n as usize]
            .iter()
            .all(|e| e.events & libc::EPOLLHUP as u32 != 0)
    }
}

impl Drop for EpollSet {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn max_sample_rate() -> Option<u64> {
    let text = fs::read_to_string("/proc/sys/kernel/perf_event_max_sample_rate").ok()?;
    text.trim().parse().ok()
}

fn known_branch_bits() -> u64 {
    crate::perf_event::BranchFilter::all().bits()
}

fn raise_fd_limit(needed: u64) -> Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)
        .map_err(|e| Error::RaiseFdFailed(e.to_string()))?;
    let wanted = needed + FD_HEADROOM;
    if wanted <= soft {
        return Ok(());
    }
    if wanted > hard {
        return Err(Error::TooManyFds {
            needed: wanted,
            hard,
        });
    }
    debug!("raising RLIMIT_NOFILE {soft} -> {wanted}");
    setrlimit(Resource::RLIMIT_NOFILE, wanted, hard)
        .map_err(|e| Error::RaiseFdFailed(e.to_string()))
}

/// Expand an uncore parent name (`hisi_sccl1_ddrc/flux_rd/`, no instance
/// digit on the device) into its per-instance children. Returns the
/// children and records child → parent for read-side folding.
fn split_uncore_events(
    events: &[String],
    group_ids: &[i32],
) -> Result<(Vec<String>, Vec<i32>, HashMap<String, String>)> {
    let mut out_events = Vec::new();
    let mut out_groups = Vec::new();
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut uncore_list: Option<Vec<String>> = None;

    for (idx, name) in events.iter().enumerate() {
        let group = group_ids.get(idx).copied().unwrap_or(-1);
        let is_parent_form = match name.split_once('/') {
            Some((device, _)) if !device.is_empty() => {
                !device.ends_with(|c: char| c.is_ascii_digit())
            }
            _ => false,
        };
        if !is_parent_form {
            out_events.push(name.clone());
            out_groups.push(group);
            continue;
        }
        let (device, rest) = name.split_once('/').expect("checked above");
        let uncore = uncore_list
            .get_or_insert_with(|| event::available_events(EventKindFilter::Uncore));
        let mut found = false;
        for candidate in uncore.iter() {
            let Some((cand_device, cand_rest)) = candidate.split_once('/') else {
                continue;
            };
            let instance_ok = cand_device
                .strip_prefix(device)
                .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()));
            if instance_ok && cand_rest == rest {
                parents.insert(candidate.clone(), name.clone());
                out_events.push(candidate.clone());
                out_groups.push(group);
                found = true;
            }
        }
        if !found {
            return Err(Error::InvalidEvent(name.clone()));
        }
    }
    Ok((out_events, out_groups, parents))
}

fn check_config(task: TaskKind, config: &SessionConfig) -> Result<()> {
    let online = topology::online_cpus();
    let max_cpu = online.iter().copied().max().unwrap_or(0);
    if config.cpus.len() > online.len() {
        return Err(Error::InvalidCpuList(format!(
            "{} cpus requested, {} online",
            config.cpus.len(),
            online.len()
        )));
    }
    for &cpu in &config.cpus {
        if cpu < 0 || cpu > max_cpu {
            return Err(Error::InvalidCpuList(format!("cpu id {cpu}")));
        }
    }
    for &pid in &config.pids {
        if pid < 0 {
            return Err(Error::InvalidPidList(format!("pid {pid}")));
        }
    }
    match task {
        TaskKind::Counting | TaskKind::Sampling => {
            if config.events.is_empty() {
                return Err(Error::InvalidEvtList);
            }
        }
        TaskKind::SpeSampling => {
            if config.group_ids.iter().any(|&g| g != -1) {
                return Err(Error::InvalidGroupSpe);
            }
        }
    }
    if config.branch_filter != 0 {
        if task != TaskKind::Sampling {
            return Err(Error::BranchRequiresSampling);
        }
        if config.branch_filter & !known_branch_bits() != 0 {
            return Err(Error::InvalidBranchFilter);
        }
    }
    if task == TaskKind::Sampling && config.use_freq {
        if let Some(max) = max_sample_rate() {
            if config.period_or_freq > max {
                return Err(Error::InvalidSampleRate(config.period_or_freq));
            }
        }
    }
    Ok(())
}

fn effective_cpus(task: TaskKind, config: &SessionConfig) -> Vec<i32> {
    if !config.cpus.is_empty() {
        return config.cpus.clone();
    }
    if !config.pids.is_empty() && task == TaskKind::Counting {
        // Attach to the pid on whatever cpu it runs.
        return vec![-1];
    }
    topology::online_cpus().to_vec()
}

fn effective_procs(config: &SessionConfig, warnings: &mut Vec<Warning>) -> Result<Vec<ProcInfo>> {
    if config.pids.is_empty() {
        return Ok(vec![ProcInfo::whole_system()]);
    }
    let mut procs = Vec::new();
    for &pid in &config.pids {
        let tids = process::tids(pid)?;
        let mut found = false;
        for tid in tids {
            match process::proc_info(tid, pid) {
                Some(info) => {
                    found = true;
                    procs.push(info);
                }
                None => warnings.push(Warning::ProcessVanished { tid }),
            }
        }
        if !found {
            return Err(Error::FailGetProc(pid));
        }
    }
    Ok(procs)
}

pub struct Session {
    task: TaskKind,
    lists: Vec<ListEntry>,
    epoll: Option<EpollSet>,
    resolver: Resolver,
    observer: Option<ForkObserver>,
    /// child uncore event → the parent name the caller asked for.
    uncore_parents: HashMap<String, String>,
    buffer: Vec<PmuData>,
    user_buffers: HashMap<BufferId, Vec<PmuData>>,
    next_buffer: u64,
    warnings: Vec<Warning>,
    pids: Vec<i32>,
    enabled: bool,
}

impl Session {
    pub fn open(task: TaskKind, config: &SessionConfig) -> Result<Session> {
        check_config(task, config)?;
        let mut warnings = Vec::new();

        let (events, group_ids, uncore_parents) = if task == TaskKind::SpeSampling {
            (Vec::new(), Vec::new(), HashMap::new())
        } else {
            split_uncore_events(&config.events, &config.group_ids)?
        };

        let cpus = effective_cpus(task, config);
        let procs = effective_procs(config, &mut warnings)?;

        let opts = OpenOptions {
            period_or_freq: config.period_or_freq,
            use_freq: config.use_freq,
            exclude_user: config.exclude_user,
            exclude_kernel: config.exclude_kernel,
            call_stack: config.call_stack,
            branch_filter: config.branch_filter,
            cgroup_fd: None,
        };

        // Resolve every event before opening anything.
        let specs: Vec<EventSpec> = if task == TaskKind::SpeSampling {
            vec![event::spe_spec(
                config.spe_data_filter,
                config.spe_event_filter,
                config.spe_min_latency,
            )?]
        } else {
            events
                .iter()
                .map(|name| event::resolve(name))
                .collect::<Result<_>>()?
        };

        // Group composition: an all-uncore group is an error, a mixed one
        // degrades to ungrouped events.
        let mut group_ids = group_ids;
        if task == TaskKind::SpeSampling {
            group_ids = vec![-1];
        }
        let mut kinds_by_group: HashMap<i32, (usize, usize)> = HashMap::new();
        for (spec, &group) in specs.iter().zip(&group_ids) {
            if group == -1 {
                continue;
            }
            let entry = kinds_by_group.entry(group).or_default();
            entry.0 += 1;
            if spec.kind.is_uncore() {
                entry.1 += 1;
            }
        }
        for (&group, &(total, uncore)) in &kinds_by_group {
            if total < 2 {
                continue;
            }
            if uncore == total {
                return Err(Error::InvalidGroupAllUncore);
            }
            if uncore > 0 {
                warnings.push(Warning::GroupHasUncore);
                for (idx, &g) in group_ids.clone().iter().enumerate() {
                    if g == group {
                        group_ids[idx] = -1;
                    }
                }
            }
        }

        // Fd budget before any open.
        let mut fd_budget: u64 = 0;
        for spec in &specs {
            let cells = if spec.kind.is_uncore() {
                1
            } else {
                cpus.len() as u64 * procs.len() as u64
            };
            fd_budget += cells;
        }
        if task == TaskKind::SpeSampling {
            fd_budget *= 2;
        }
        raise_fd_limit(fd_budget)?;

        // Instantiate and init lists; group leaders first.
        let mut lists: Vec<ListEntry> = Vec::new();
        let mut group_leaders: HashMap<i32, usize> = HashMap::new();
        for (idx, spec) in specs.into_iter().enumerate() {
            let group = group_ids[idx];
            let list = EventList::new(
                spec,
                task,
                group,
                opts.clone(),
                cpus.clone(),
                procs.clone(),
            )?;
            let list = Arc::new(Mutex::new(list));
            let leader_idx = if group == -1 {
                None
            } else {
                group_leaders.get(&group).copied()
            };
            match leader_idx {
                None => {
                    let has_members = group != -1
                        && group_ids.iter().filter(|&&g| g == group).count() > 1;
                    list.lock().unwrap().init(has_members, None, &mut warnings)?;
                    if group != -1 {
                        group_leaders.insert(group, lists.len());
                    }
                    lists.push(ListEntry { list, leader: None });
                }
                Some(leader_idx) => {
                    let leader = lists[leader_idx].list.clone();
                    {
                        let leader_guard = leader.lock().unwrap();
                        list.lock()
                            .unwrap()
                            .init(false, Some(&*leader_guard), &mut warnings)?;
                        let member_name = list.lock().unwrap().spec().name.clone();
                        drop(leader_guard);
                        let mut leader_guard = leader.lock().unwrap();
                        let mut names = leader_guard.member_names().to_vec();
                        names.push(member_name);
                        leader_guard.set_member_names(names);
                    }
                    lists.push(ListEntry {
                        list,
                        leader: Some(leader),
                    });
                }
            }
        }

        let fds: Vec<i32> = lists
            .iter()
            .flat_map(|entry| entry.list.lock().unwrap().fds())
            .collect();
        let epoll = EpollSet::new(&fds)?;

        let mut resolver = Resolver::new(config.symbol_mode);
        if task != TaskKind::Counting && config.symbol_mode != SymbolMode::None {
            resolver.record_kernel()?;
            for &pid in &config.pids {
                resolver.record_module(pid)?;
            }
        }

        let observer = if config.include_new_forks
            && task == TaskKind::Counting
            && !config.pids.is_empty()
        {
            let observed = lists
                .iter()
                .map(|entry| (entry.list.clone(), entry.leader.clone()))
                .collect();
            Some(ForkObserver::start(config.pids.clone(), observed))
        } else {
            None
        };

        Ok(Session {
            task,
            lists,
            epoll: Some(epoll),
            resolver,
            observer,
            uncore_parents,
            buffer: Vec::new(),
            user_buffers: HashMap::new(),
            next_buffer: 1,
            warnings,
            pids: config.pids.clone(),
            enabled: false,
        })
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn enable(&mut self) -> Result<()> {
        for entry in &self.lists {
            let mut list = entry.list.lock().unwrap();
            list.reset()?;
            list.enable()?;
        }
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        for entry in &self.lists {
            entry.list.lock().unwrap().disable()?;
        }
        self.enabled = false;
        Ok(())
    }

    fn all_pmu_dead(&self) -> bool {
        self.epoll.as_ref().is_some_and(EpollSet::all_hung_up)
    }

    fn all_pids_exited(&self) -> bool {
        !self.pids.is_empty() && self.pids.iter().all(|&pid| !process::alive(pid))
    }

    /// Drain every list into the session buffer; sampling data is read
    /// while disabled.
    pub fn read_to_buffer(&mut self) -> Result<()> {
        let ts = now_ns();
        let mut side = SideEvents::default();
        for entry in &self.lists {
            let mut list = entry.list.lock().unwrap();
            list.set_timestamp(ts);
            list.read(&mut self.buffer, &mut side, &mut self.warnings)?;
        }
        for (pid, path, addr) in side.mmaps {
            self.resolver.register_segment(pid, &path, addr);
        }
        for (_ptid, tid) in side.forks {
            // New threads inherit sampling fds; the resolver picks their
            // modules up lazily on the first sample.
            debug!("sample stream observed fork of tid {tid}");
        }
        if side.lost > 0 {
            self.warnings.push(Warning::SamplesLost { lost: side.lost });
        }
        Ok(())
    }

    /// One blocking collection pass. `milliseconds = -1` runs until every
    /// monitored process exits or `running` is cleared.
    pub fn collect(
        &mut self,
        milliseconds: i64,
        interval_ms: u64,
        running: &AtomicBool,
    ) -> Result<()> {
        if interval_ms < MIN_INTERVAL_MS || milliseconds < -1 {
            return Err(Error::InvalidTime);
        }
        let unlimited = milliseconds == -1;
        let mut remaining = milliseconds.max(0) as u64;

        if self.task == TaskKind::Counting {
            self.enable()?;
            while unlimited || remaining > 0 {
                let tick = if unlimited {
                    interval_ms
                } else {
                    interval_ms.min(remaining)
                };
                thread::sleep(Duration::from_millis(tick));
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if unlimited && self.all_pids_exited() {
                    break;
                }
                remaining = remaining.saturating_sub(tick);
            }
            self.disable()?;
            return self.read_to_buffer();
        }

        while unlimited || remaining > 0 {
            let tick = if unlimited {
                interval_ms
            } else {
                interval_ms.min(remaining)
            };
            self.enable()?;
            thread::sleep(Duration::from_millis(tick));
            self.disable()?;
            self.read_to_buffer()?;
            if self.all_pmu_dead() {
                debug!("all monitored fds hung up, collection done");
                break;
            }
            if !running.load(Ordering::Relaxed) {
                break;
            }
            remaining = remaining.saturating_sub(tick);
        }
        Ok(())
    }

    /// Counting reads collapse duplicates: one row per (evt, tid, cpu).
    fn aggregate_counts(records: Vec<PmuData>) -> Vec<PmuData> {
        let mut index: HashMap<(String, i32, i32), usize> = HashMap::new();
        let mut out: Vec<PmuData> = Vec::new();
        for record in records {
            let key = (record.evt.clone(), record.tid, record.cpu);
            match index.get(&key) {
                Some(&at) => out[at].count += record.count,
                None => {
                    index.insert(key, out.len());
                    out.push(record);
                }
            }
        }
        out
    }

    /// Fold split uncore children back into the parent name the caller
    /// asked for; counts sum across instances.
    fn fold_uncore(&self, records: Vec<PmuData>) -> Vec<PmuData> {
        if self.uncore_parents.is_empty() {
            return records;
        }
        let mut out: Vec<PmuData> = Vec::new();
        let mut folded: HashMap<String, usize> = HashMap::new();
        for mut record in records {
            let Some(parent) = self.uncore_parents.get(&record.evt) else {
                out.push(record);
                continue;
            };
            match folded.get(parent) {
                Some(&at) => out[at].count += record.count,
                None => {
                    record.evt = parent.clone();
                    record.cpu = 0;
                    record.cpu_topo = None;
                    folded.insert(parent.clone(), out.len());
                    out.push(record);
                }
            }
        }
        out
    }

    /// Exchange the internal buffer for a caller-visible one. Sampling
    /// records get their symbols hydrated here.
    pub fn read(&mut self) -> Result<BufferId> {
        if self.buffer.is_empty() {
            self.read_to_buffer()?;
        }
        let mut records = std::mem::take(&mut self.buffer);
        match self.task {
            TaskKind::Counting => {
                records = Self::aggregate_counts(records);
                records = self.fold_uncore(records);
            }
            TaskKind::Sampling | TaskKind::SpeSampling => {
                if self.resolver.mode() != SymbolMode::None {
                    for record in &mut records {
                        if record.stack.is_none() && !record.ips.is_empty() {
                            let ips = std::mem::take(&mut record.ips);
                            record.stack = self.resolver.hydrate(record.pid, &ips);
                            record.ips = ips;
                        }
                    }
                }
            }
        }
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.user_buffers.insert(id, records);
        Ok(id)
    }

    pub fn data(&self, id: BufferId) -> Option<&[PmuData]> {
        self.user_buffers.get(&id).map(Vec::as_slice)
    }

    /// Concatenate `from` onto `to` (or a fresh buffer), returning the
    /// buffer that now holds the union. The target id stays valid.
    pub fn append_data(&mut self, from: BufferId, to: Option<BufferId>) -> Result<BufferId> {
        if !self.user_buffers.contains_key(&from) {
            return Err(Error::InvalidPmuData);
        }
        let to = match to {
            Some(to) if self.user_buffers.contains_key(&to) => to,
            Some(_) | None => {
                let records = self.user_buffers[&from].clone();
                let id = BufferId(self.next_buffer);
                self.next_buffer += 1;
                self.user_buffers.insert(id, records);
                return Ok(id);
            }
        };
        let from_records = self.user_buffers[&from].clone();
        self.user_buffers
            .get_mut(&to)
            .expect("checked above")
            .extend(from_records);
        Ok(to)
    }

    /// Release one caller buffer; freeing twice warns and does nothing.
    pub fn free_data(&mut self, id: BufferId) {
        if self.user_buffers.remove(&id).is_none() {
            self.warnings.push(Warning::DoubleFree);
        }
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        let mut warnings = std::mem::take(&mut self.warnings);
        warnings.extend(self.resolver.take_warnings());
        warnings
    }

    fn close(&mut self) {
        if let Some(mut observer) = self.observer.take() {
            observer.stop();
        }
        for entry in &self.lists {
            let mut list = entry.list.lock().unwrap();
            let _ = list.disable();
            list.close();
        }
        self.lists.clear();
        self.epoll = None;
        for &pid in &self.pids.clone() {
            self.resolver.purge_pid(pid);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

struct Slot {
    session: Arc<Mutex<Session>>,
    running: Arc<AtomicBool>,
}

/// The collection-descriptor table: small integer handles, reused after
/// close, each owning one session.
#[derive(Default)]
pub struct Pmu {
    slots: Mutex<Vec<Option<Slot>>>,
}

/// Opaque collection descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Cd(usize);

impl Pmu {
    pub fn new() -> Pmu {
        Pmu::default()
    }

    pub fn open(&self, task: TaskKind, config: &SessionConfig) -> Result<Cd> {
        let session = Session::open(task, config)?;
        let slot = Slot {
            session: Arc::new(Mutex::new(session)),
            running: Arc::new(AtomicBool::new(false)),
        };
        let mut slots = self.slots.lock().unwrap();
        for (idx, entry) in slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return Ok(Cd(idx + 1));
            }
        }
        slots.push(Some(slot));
        Ok(Cd(slots.len()))
    }

    fn slot(&self, cd: Cd) -> Result<(Arc<Mutex<Session>>, Arc<AtomicBool>)> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(cd.0.wrapping_sub(1))
            .and_then(Option::as_ref)
            .map(|slot| (slot.session.clone(), slot.running.clone()))
            .ok_or(Error::InvalidPd(cd.0))
    }

    pub fn enable(&self, cd: Cd) -> Result<()> {
        let (session, _) = self.slot(cd)?;
        let mut session = session.lock().unwrap();
        session.enable()
    }

    pub fn disable(&self, cd: Cd) -> Result<()> {
        let (session, _) = self.slot(cd)?;
        let mut session = session.lock().unwrap();
        session.disable()
    }

    /// Blocking collection; `stop` interrupts it from another thread.
    pub fn collect(&self, cd: Cd, milliseconds: i64, interval_ms: u64) -> Result<()> {
        let (session, running) = self.slot(cd)?;
        running.store(true, Ordering::Relaxed);
        let result = {
            let mut session = session.lock().unwrap();
            session.collect(milliseconds, interval_ms, &running)
        };
        running.store(false, Ordering::Relaxed);
        result
    }

    /// Collect several descriptors in lock step: enable all, sleep,
    /// disable all, drain each.
    pub fn collect_multi(&self, cds: &[Cd], milliseconds: i64) -> Result<()> {
        let interval_ms = MIN_INTERVAL_MS;
        if milliseconds < -1 {
            return Err(Error::InvalidTime);
        }
        let mut slots = Vec::with_capacity(cds.len());
        for &cd in cds {
            slots.push(self.slot(cd)?);
        }
        for (_, running) in &slots {
            running.store(true, Ordering::Relaxed);
        }
        let unlimited = milliseconds == -1;
        let mut remaining = milliseconds.max(0) as u64;
        'outer: while unlimited || remaining > 0 {
            let tick = if unlimited {
                interval_ms
            } else {
                interval_ms.min(remaining)
            };
            for (session, _) in &slots {
                session.lock().unwrap().enable()?;
            }
            thread::sleep(Duration::from_millis(tick));
            for (session, _) in &slots {
                session.lock().unwrap().disable()?;
            }
            for (session, _) in &slots {
                session.lock().unwrap().read_to_buffer()?;
            }
            let mut all_dead = true;
            for (session, _) in &slots {
                let session = session.lock().unwrap();
                if session.task() == TaskKind::Counting || !session.all_pmu_dead() {
                    all_dead = false;
                    break;
                }
            }
            if all_dead {
                break;
            }
            for (_, running) in &slots {
                if !running.load(Ordering::Relaxed) {
                    break 'outer;
                }
            }
            remaining = remaining.saturating_sub(tick);
        }
        for (_, running) in &slots {
            running.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Signal a running collect to wind down at its next tick.
    pub fn stop(&self, cd: Cd) -> Result<()> {
        let (_, running) = self.slot(cd)?;
        running.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn read(&self, cd: Cd) -> Result<BufferId> {
        let (session, _) = self.slot(cd)?;
        let mut session = session.lock().unwrap();
        session.read()
    }

    /// Run `f` over a previously read buffer.
    pub fn with_data<R>(&self, cd: Cd, id: BufferId, f: impl FnOnce(&[PmuData], &Resolver) -> R) -> Result<R> {
        let (session, _) = self.slot(cd)?;
        let session = session.lock().unwrap();
        let data = session.data(id).ok_or(Error::InvalidPd(cd.0))?;
        Ok(f(data, session.resolver()))
    }

    pub fn append_data(&self, cd: Cd, from: BufferId, to: Option<BufferId>) -> Result<BufferId> {
        let (session, _) = self.slot(cd)?;
        let mut session = session.lock().unwrap();
        session.append_data(from, to)
    }

    pub fn free_data(&self, cd: Cd, id: BufferId) -> Result<()> {
        let (session, _) = self.slot(cd)?;
        session.lock().unwrap().free_data(id);
        Ok(())
    }

    pub fn take_warnings(&self, cd: Cd) -> Result<Vec<Warning>> {
        let (session, _) = self.slot(cd)?;
        let mut session = session.lock().unwrap();
        Ok(session.take_warnings())
    }

    /// Close the descriptor; its number is free for reuse.
    pub fn close(&self, cd: Cd) -> Result<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .get_mut(cd.0.wrapping_sub(1))
                .and_then(|entry| entry.take())
        };
        let Some(slot) = slot else {
            return Err(Error::InvalidPd(cd.0));
        };
        slot.running.store(false, Ordering::Relaxed);
        drop(slot.session);
        Ok(())
    }

    pub fn is_open(&self, cd: Cd) -> bool {
        self.slot(cd).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(evt: &str, tid: i32, cpu: i32, count: u64) -> PmuData {
        PmuData {
            evt: evt.to_string(),
            tid,
            cpu,
            count,
            ..PmuData::default()
        }
    }

    #[test]
    fn aggregate_merges_same_key() {
        let records = vec![
            record("cycles", 1, 0, 10),
            record("cycles", 1, 0, 5),
            record("cycles", 2, 0, 7),
            record("instructions", 1, 0, 3),
        ];
        let out = Session::aggregate_counts(records);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].count, 15);
        assert_eq!(out[1].count, 7);
        assert_eq!(out[2].count, 3);
    }

    #[test]
    fn ops_on_unknown_descriptor_fail() {
        let pmu = Pmu::new();
        assert!(matches!(pmu.stop(Cd(3)), Err(Error::InvalidPd(3))));
        assert!(matches!(
            pmu.collect(Cd(1), 100, 10),
            Err(Error::InvalidPd(1))
        ));
        assert!(matches!(pmu.read(Cd(0)), Err(Error::InvalidPd(0))));
    }

    #[test]
    fn cpu_validation_rejects_out_of_range() {
        let config = SessionConfig {
            events: vec!["cycles".into()],
            cpus: vec![100_000],
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_config(TaskKind::Counting, &config),
            Err(Error::InvalidCpuList(_))
        ));
    }

    #[test]
    fn pid_validation_rejects_negative() {
        let config = SessionConfig {
            events: vec!["cycles".into()],
            pids: vec![-4],
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_config(TaskKind::Counting, &config),
            Err(Error::InvalidPidList(_))
        ));
    }

    #[test]
    fn counting_without_events_is_invalid() {
        let config = SessionConfig::default();
        assert!(matches!(
            check_config(TaskKind::Counting, &config),
            Err(Error::InvalidEvtList)
        ));
    }

    #[test]
    fn branch_filter_requires_sampling() {
        let config = SessionConfig {
            events: vec!["cycles".into()],
            branch_filter: 1,
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_config(TaskKind::Counting, &config),
            Err(Error::BranchRequiresSampling)
        ));
        let config = SessionConfig {
            events: vec!["cycles".into()],
            branch_filter: 1 << 40,
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_config(TaskKind::Sampling, &config),
            Err(Error::InvalidBranchFilter)
        ));
    }

    #[test]
    fn spe_with_groups_is_rejected() {
        let config = SessionConfig {
            group_ids: vec![1],
            ..SessionConfig::default()
        };
        assert!(matches!(
            check_config(TaskKind::SpeSampling, &config),
            Err(Error::InvalidGroupSpe)
        ));
    }

    #[test]
    fn effective_cpus_rules() {
        let mut config = SessionConfig::default();
        // Both empty: all online.
        assert_eq!(
            effective_cpus(TaskKind::Counting, &config),
            topology::online_cpus().to_vec()
        );
        // Counting with pids: attach-to-pid.
        config.pids = vec![1234];
        assert_eq!(effective_cpus(TaskKind::Counting, &config), vec![-1]);
        // Sampling with pids still walks every cpu.
        assert_eq!(
            effective_cpus(TaskKind::Sampling, &config),
            topology::online_cpus().to_vec()
        );
        // Explicit cpu list wins.
        config.cpus = vec![0];
        assert_eq!(effective_cpus(TaskKind::Counting, &config), vec![0]);
    }

    #[test]
    fn fold_uncore_sums_children_into_parent() {
        let mut session_parents = HashMap::new();
        session_parents.insert(
            "hisi_sccl1_ddrc0/flux_rd/".to_string(),
            "hisi_sccl1_ddrc/flux_rd/".to_string(),
        );
        session_parents.insert(
            "hisi_sccl1_ddrc1/flux_rd/".to_string(),
            "hisi_sccl1_ddrc/flux_rd/".to_string(),
        );
        let session = Session {
            task: TaskKind::Counting,
            lists: Vec::new(),
            epoll: None,
            resolver: Resolver::new(SymbolMode::None),
            observer: None,
            uncore_parents: session_parents,
            buffer: Vec::new(),
            user_buffers: HashMap::new(),
            next_buffer: 1,
            warnings: Vec::new(),
            pids: Vec::new(),
            enabled: false,
        };
        let records = vec![
            record("hisi_sccl1_ddrc0/flux_rd/", -1, 3, 100),
            record("cycles", 1, 0, 5),
            record("hisi_sccl1_ddrc1/flux_rd/", -1, 4, 200),
        ];
        let out = session.fold_uncore(records);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].evt, "hisi_sccl1_ddrc/flux_rd/");
        assert_eq!(out[0].count, 300);
        assert_eq!(out[0].cpu, 0);
        assert_eq!(out[1].evt, "cycles");
    }

    #[test]
    fn buffer_protocol_append_and_free() {
        let mut session = Session {
            task: TaskKind::Counting,
            lists: Vec::new(),
            epoll: None,
            resolver: Resolver::new(SymbolMode::None),
            observer: None,
            uncore_parents: HashMap::new(),
            buffer: Vec::new(),
            user_buffers: HashMap::new(),
            next_buffer: 1,
            warnings: Vec::new(),
            pids: Vec::new(),
            enabled: false,
        };
        session.user_buffers.insert(BufferId(1), vec![record("a", 1, 0, 1)]);
        session.user_buffers.insert(BufferId(2), vec![record("b", 2, 0, 2)]);
        session.next_buffer = 3;

        // Append into an existing buffer keeps its id.
        let to = session.append_data(BufferId(1), Some(BufferId(2))).unwrap();
        assert_eq!(to, BufferId(2));
        assert_eq!(session.data(BufferId(2)).unwrap().len(), 2);

        // Append into nothing materializes a fresh buffer.
        let fresh = session.append_data(BufferId(1), None).unwrap();
        assert_eq!(session.data(fresh).unwrap().len(), 1);

        // Free is idempotent-with-warning.
        session.free_data(BufferId(1));
        session.free_data(BufferId(1));
        assert!(session
            .take_warnings()
            .contains(&Warning::DoubleFree));
    }

    #[test]
    fn descriptor_numbers_are_reused_after_close() {
        let pmu = Pmu::new();
        // No real kernel opens here: exercise the slot table directly.
        let slot = Slot {
            session: Arc::new(Mutex::new(Session {
                task: TaskKind::Counting,
                lists: Vec::new(),
                epoll: None,
                resolver: Resolver::new(SymbolMode::None),
                observer: None,
                uncore_parents: HashMap::new(),
                buffer: Vec::new(),
                user_buffers: HashMap::new(),
                next_buffer: 1,
                warnings: Vec::new(),
                pids: Vec::new(),
                enabled: false,
            })),
            running: Arc::new(AtomicBool::new(false)),
        };
        pmu.slots.lock().unwrap().push(Some(slot));
        let cd = Cd(1);
        assert!(pmu.is_open(cd));
        pmu.close(cd).unwrap();
        assert!(!pmu.is_open(cd));
        assert!(matches!(pmu.close(cd), Err(Error::InvalidPd(1))));
    }
}
