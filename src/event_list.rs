//! The per-event fd matrix: one fd per `(cpu, tid)` cell, uniform
//! lifecycle, dynamic thread adoption and retirement, and the read
//! fan-out that stamps records with event metadata.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use log::{debug, warn};

use crate::data::PmuData;
use crate::error::{Error, Result, Warning};
use crate::event::EventSpec;
use crate::perf_event::{Counter, GroupRole, OpenOptions, SampleSink, Sampler, SpeCollector};
use crate::process::{self, ProcInfo};
use crate::topology::{self, CpuTopology};
use crate::TaskKind;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ListState {
    Closed,
    Disabled,
    Enabled,
}

#[derive(Debug)]
enum Cell {
    Counter(Counter),
    Sampler(Sampler),
}

impl Cell {
    fn fd(&self) -> RawFd {
        match self {
            Cell::Counter(c) => c.fd(),
            Cell::Sampler(s) => s.fd(),
        }
    }

    fn enable(&mut self) -> Result<()> {
        match self {
            Cell::Counter(c) => c.enable(),
            Cell::Sampler(s) => s.enable(),
        }
    }

    fn disable(&self) -> Result<()> {
        match self {
            Cell::Counter(c) => c.disable(),
            Cell::Sampler(s) => s.disable(),
        }
    }

    fn reset(&self) -> Result<()> {
        match self {
            Cell::Counter(c) => c.reset(),
            Cell::Sampler(s) => s.reset(),
        }
    }
}

/// Non-sample records surfaced by a drain; the session feeds these to the
/// resolver and the process probe.
#[derive(Debug, Default)]
pub struct SideEvents {
    pub mmaps: Vec<(i32, String, u64)>,
    pub forks: Vec<(i32, i32)>,
    pub lost: u64,
}

struct ListSink<'a> {
    out: &'a mut Vec<PmuData>,
    side: &'a mut SideEvents,
    comms: &'a mut HashMap<i32, String>,
}

impl SampleSink for ListSink<'_> {
    fn sample(&mut self, data: PmuData) {
        self.out.push(data);
    }

    fn module_mapped(&mut self, pid: i32, filename: &str, addr: u64) {
        self.side.mmaps.push((pid, filename.to_string(), addr));
    }

    fn forked(&mut self, ptid: i32, tid: i32) {
        self.side.forks.push((ptid, tid));
    }

    fn comm_changed(&mut self, _pid: i32, tid: i32, comm: String) {
        self.comms.insert(tid, comm);
    }

    fn lost(&mut self, count: u64) {
        self.side.lost += count;
    }
}

#[derive(Debug)]
pub struct EventList {
    spec: EventSpec,
    task: TaskKind,
    group_id: i32,
    opts: OpenOptions,
    state: ListState,
    cpus: Vec<i32>,
    cpu_topos: Vec<CpuTopology>,
    procs: Vec<ProcInfo>,
    /// `cells[row][col]` ↔ `(cpus[row], procs[col])`.
    cells: Vec<Vec<Cell>>,
    /// SPE engines, one per cpu row; only for SPE lists.
    spe: Vec<SpeCollector>,
    /// tid → comm, refreshed from COMM records and lazy probes.
    comms: HashMap<i32, String>,
    /// Read timestamp stamped on every record of one read pass.
    timestamp: u64,
    /// Names of group members, leader first excluded; set on leaders so
    /// group reads can label per-member rows.
    member_names: Vec<String>,
}

impl EventList {
    pub fn new(
        spec: EventSpec,
        task: TaskKind,
        group_id: i32,
        opts: OpenOptions,
        cpus: Vec<i32>,
        procs: Vec<ProcInfo>,
    ) -> Result<Self> {
        // Uncore events live on one device-chosen cpu and ignore tids.
        let (cpus, procs) = if spec.kind.is_uncore() {
            let cpu = spec
                .device_cpu
                .ok_or_else(|| Error::DeviceInvalid(spec.name.clone()))?;
            (vec![cpu], vec![ProcInfo::whole_system()])
        } else {
            (cpus, procs)
        };
        let mut cpu_topos = Vec::with_capacity(cpus.len());
        for &cpu in &cpus {
            cpu_topos.push(topology::cpu_topology(cpu)?);
        }
        let comms = procs
            .iter()
            .map(|p| (p.tid, p.comm.clone()))
            .collect();
        Ok(EventList {
            spec,
            task,
            group_id,
            opts,
            state: ListState::Closed,
            cpus,
            cpu_topos,
            procs,
            cells: Vec::new(),
            spe: Vec::new(),
            comms,
            timestamp: 0,
            member_names: Vec::new(),
        })
    }

    pub fn spec(&self) -> &EventSpec {
        &self.spec
    }

    pub fn set_member_names(&mut self, names: Vec<String>) {
        self.member_names = names;
    }

    pub fn member_names(&self) -> &[String] {
        &self.member_names
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        self.timestamp = ts;
    }

    /// Every open fd of this list.
    pub fn fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .cells
            .iter()
            .flat_map(|row| row.iter().map(Cell::fd))
            .collect();
        fds.extend(self.spe.iter().map(SpeCollector::fd));
        fds
    }

    fn open_cell(&self, cpu: i32, tid: i32, group_fd: Option<RawFd>, is_leader: bool) -> Result<Cell> {
        match self.task {
            TaskKind::Counting => {
                let role = match (is_leader, group_fd) {
                    (true, _) => GroupRole::Leader,
                    (false, Some(_)) => GroupRole::Member,
                    (false, None) => GroupRole::Ungrouped,
                };
                Counter::open(&self.spec, cpu, tid, role, group_fd.unwrap_or(-1), &self.opts)
                    .map(Cell::Counter)
            }
            TaskKind::Sampling => {
                Sampler::open(&self.spec, cpu, tid, group_fd, &self.opts).map(Cell::Sampler)
            }
            TaskKind::SpeSampling => unreachable!("SPE lists do not use cells"),
        }
    }

    /// The open fd for a `(cpu, tid)` pair, used to wire group members to
    /// their leader cell.
    pub fn fd_for(&self, cpu: i32, tid: i32) -> Option<RawFd> {
        let row = self.cpus.iter().position(|&c| c == cpu)?;
        let col = self.procs.iter().position(|p| p.tid == tid)?;
        self.cells.get(row)?.get(col).map(Cell::fd)
    }

    /// Open the full matrix. `group_leader` is set for member lists and
    /// `as_group_leader` marks the leader of a group; both absent means
    /// ungrouped. A failing cell aborts when its tid is the requested
    /// pid; otherwise the whole column is purged with a warning.
    pub fn init(
        &mut self,
        as_group_leader: bool,
        group_leader: Option<&EventList>,
        warnings: &mut Vec<Warning>,
    ) -> Result<()> {
        if self.task == TaskKind::SpeSampling {
            for &cpu in &self.cpus {
                self.spe.push(SpeCollector::open(&self.spec, cpu, &self.opts)?);
            }
            self.state = ListState::Disabled;
            return Ok(());
        }

        let mut kept_cols = Vec::new();
        let mut columns: Vec<Vec<Cell>> = Vec::new();
        'col: for (col, proc_info) in self.procs.iter().enumerate() {
            let mut column = Vec::with_capacity(self.cpus.len());
            for &cpu in &self.cpus {
                let group_fd = match group_leader {
                    Some(leader) => match leader.fd_for(cpu, proc_info.tid) {
                        Some(fd) => Some(fd),
                        // The leader purged this tid already.
                        None => {
                            warnings.push(Warning::ProcessVanished { tid: proc_info.tid });
                            continue 'col;
                        }
                    },
                    None => None,
                };
                match self.open_cell(cpu, proc_info.tid, group_fd, as_group_leader) {
                    Ok(cell) => column.push(cell),
                    Err(err) => {
                        if proc_info.is_main {
                            return Err(err);
                        }
                        debug!(
                            "purging tid {} from {}: {err}",
                            proc_info.tid, self.spec.name
                        );
                        warnings.push(Warning::ProcessVanished { tid: proc_info.tid });
                        continue 'col;
                    }
                }
            }
            kept_cols.push(col);
            columns.push(column);
        }

        self.procs = kept_cols.iter().map(|&c| self.procs[c].clone()).collect();
        // Transpose the per-column opens into the row-major matrix.
        self.cells = (0..self.cpus.len())
            .map(|_| Vec::with_capacity(columns.len()))
            .collect();
        for column in columns {
            for (row, cell) in column.into_iter().enumerate() {
                self.cells[row].push(cell);
            }
        }
        self.state = ListState::Disabled;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        for engine in &self.spe {
            engine.enable()?;
        }
        for row in &mut self.cells {
            for cell in row {
                cell.enable()?;
            }
        }
        self.state = ListState::Enabled;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        for engine in &self.spe {
            engine.disable()?;
        }
        for row in &self.cells {
            for cell in row {
                cell.disable()?;
            }
        }
        self.state = ListState::Disabled;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        for row in &self.cells {
            for cell in row {
                cell.reset()?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.cells.clear();
        self.spe.clear();
        self.state = ListState::Closed;
    }

    /// Adopt a freshly forked thread: one new column across every cpu
    /// row. New fds are armed to match the list's current state.
    pub fn add_new_process(&mut self, tid: i32, group_leader: Option<&EventList>) {
        if tid <= 0 || self.state == ListState::Closed || self.spec.kind.is_uncore() {
            return;
        }
        if self.procs.iter().any(|p| p.tid == tid) {
            return;
        }
        let Some(info) = process::proc_info(tid, -2) else {
            return;
        };
        let mut column = Vec::with_capacity(self.cpus.len());
        for &cpu in &self.cpus {
            let group_fd = group_leader.and_then(|leader| leader.fd_for(cpu, tid));
            if group_leader.is_some() && group_fd.is_none() {
                return;
            }
            match self.open_cell(cpu, tid, group_fd, false) {
                Ok(cell) => column.push(cell),
                Err(err) => {
                    debug!("could not adopt tid {tid} for {}: {err}", self.spec.name);
                    return;
                }
            }
        }
        if self.state == ListState::Enabled {
            for cell in &mut column {
                if let Err(err) = cell.enable() {
                    warn!("enable on adopted tid {tid} failed: {err}");
                }
            }
        }
        self.comms.insert(tid, info.comm.clone());
        self.procs.push(info);
        for (row, cell) in column.into_iter().enumerate() {
            self.cells[row].push(cell);
        }
        debug!("adopted tid {tid} into {}", self.spec.name);
    }

    /// Drop every tid whose `/proc` entry is gone, closing its fds. Not
    /// called during an active read.
    pub fn clear_exited(&mut self) {
        // Whole-system placeholders are never reaped.
        if self.procs.iter().all(|p| p.tid <= 0) {
            return;
        }
        let alive: Vec<bool> = self
            .procs
            .iter()
            .map(|p| p.tid <= 0 || process::alive(p.tid))
            .collect();
        if alive.iter().all(|&a| a) {
            return;
        }
        for row in &mut self.cells {
            let mut keep = alive.iter().copied();
            row.retain(|_| keep.next().unwrap_or(true));
        }
        let mut keep = alive.iter().copied();
        self.procs.retain(|p| {
            let keep = keep.next().unwrap_or(true);
            if !keep {
                debug!("reaped exited tid {} from {}", p.tid, self.spec.name);
            }
            keep
        });
    }

    fn stamp(&self, start: usize, data: &mut [PmuData], row: usize, col: Option<usize>) {
        for (i, record) in data.iter_mut().enumerate().skip(start) {
            record.group_id = self.group_id;
            if record.ts == 0 {
                record.ts = self.timestamp;
            }
            record.cpu_topo = Some(self.cpu_topos[row]);
            if record.evt.is_empty() {
                // Group leaders read every member; rows past the first in
                // one cell read belong to the members in order.
                let slot = i - start;
                record.evt = if slot == 0 || self.member_names.is_empty() {
                    self.spec.name.clone()
                } else {
                    self.member_names
                        .get(slot - 1)
                        .cloned()
                        .unwrap_or_else(|| self.spec.name.clone())
                };
            }
            if let Some(col) = col {
                let proc_info = &self.procs[col];
                record.pid = proc_info.pid;
                record.tid = proc_info.tid;
            }
            if record.comm.is_empty() {
                if let Some(comm) = self.comms.get(&record.tid) {
                    record.comm = comm.clone();
                } else if let Some(comm) = process::comm(record.tid) {
                    record.comm = comm;
                }
            }
        }
    }

    fn read_counters(&mut self, out: &mut Vec<PmuData>) -> Result<()> {
        let member_count = self.member_names.len();
        for row in 0..self.cells.len() {
            for col in 0..self.cells[row].len() {
                let start = out.len();
                let mut values = Vec::new();
                if let Cell::Counter(counter) = &mut self.cells[row][col] {
                    counter.read(member_count, &mut values)?;
                }
                for value in values {
                    out.push(PmuData {
                        cpu: value.cpu,
                        count: value.count,
                        count_percent: value.percent,
                        ..PmuData::default()
                    });
                }
                let end = out.len();
                self.stamp(start, &mut out[..end], row, Some(col));
            }
        }
        Ok(())
    }

    fn read_samples(&mut self, out: &mut Vec<PmuData>, side: &mut SideEvents) -> Result<()> {
        for row in 0..self.cells.len() {
            for col in 0..self.cells[row].len() {
                let start = out.len();
                {
                    let mut sink = ListSink {
                        out: &mut *out,
                        side: &mut *side,
                        comms: &mut self.comms,
                    };
                    if let Cell::Sampler(sampler) = &mut self.cells[row][col] {
                        sampler.read(&mut sink)?;
                    }
                }
                let end = out.len();
                self.stamp(start, &mut out[..end], row, None);
            }
        }
        Ok(())
    }

    fn read_spe(&mut self, out: &mut Vec<PmuData>, warnings: &mut Vec<Warning>) -> Result<()> {
        let monitored: Vec<i32> = self.procs.iter().map(|p| p.tid).collect();
        let system_wide = monitored.contains(&-1) || monitored.contains(&0);
        for row in 0..self.spe.len() {
            self.spe[row].read()?;
            if self.spe[row].take_context_lost() {
                warnings.push(Warning::ContextIdLost);
            }
            let records = self.spe[row].take_records();
            for (tid, records) in records {
                if tid <= 0 && !system_wide {
                    continue;
                }
                if !system_wide && !monitored.contains(&tid) {
                    continue;
                }
                let pid = process::tgid(tid).unwrap_or(tid);
                for record in records {
                    let start = out.len();
                    out.push(PmuData {
                        pid,
                        tid,
                        cpu: self.spe[row].cpu(),
                        ts: record.timestamp,
                        ips: vec![record.pc],
                        spe: Some(crate::data::SpeExt {
                            pa: record.pa,
                            va: record.va,
                            event: record.events,
                            lat: record.lat,
                        }),
                        ..PmuData::default()
                    });
                    let end = out.len();
                    self.stamp(start, &mut out[..end], row, None);
                }
            }
        }
        Ok(())
    }

    /// Drain the whole matrix into `out`, stamping metadata as rows are
    /// produced. Sampling data must be read while disabled.
    pub fn read(
        &mut self,
        out: &mut Vec<PmuData>,
        side: &mut SideEvents,
        warnings: &mut Vec<Warning>,
    ) -> Result<()> {
        match self.task {
            TaskKind::Counting => self.read_counters(out),
            TaskKind::Sampling => {
                let result = self.read_samples(out, side);
                self.clear_exited();
                result
            }
            TaskKind::SpeSampling => self.read_spe(out, warnings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PmuKind;

    fn spec() -> EventSpec {
        EventSpec {
            name: "cycles".into(),
            kind: PmuKind::Core,
            type_: crate::sys::PERF_TYPE_HARDWARE,
            config: 0,
            config1: 0,
            config2: 0,
            device_cpu: None,
        }
    }

    fn list() -> EventList {
        EventList::new(
            spec(),
            TaskKind::Counting,
            -1,
            OpenOptions::default(),
            vec![-1],
            vec![ProcInfo {
                pid: 100,
                tid: 101,
                comm: "worker".into(),
                is_main: true,
            }],
        )
        .unwrap()
    }

    #[test]
    fn stamp_fills_metadata() {
        let mut l = list();
        l.set_timestamp(777);
        let mut data = vec![PmuData::default()];
        data[0].tid = 101;
        l.stamp(0, &mut data, 0, Some(0));
        assert_eq!(data[0].evt, "cycles");
        assert_eq!(data[0].ts, 777);
        assert_eq!(data[0].comm, "worker");
        assert_eq!(data[0].pid, 100);
        assert_eq!(data[0].group_id, -1);
    }

    #[test]
    fn stamp_labels_group_member_rows() {
        let mut l = list();
        l.set_member_names(vec!["instructions".into(), "branches".into()]);
        let mut data = vec![PmuData::default(), PmuData::default(), PmuData::default()];
        l.stamp(0, &mut data, 0, Some(0));
        assert_eq!(data[0].evt, "cycles");
        assert_eq!(data[1].evt, "instructions");
        assert_eq!(data[2].evt, "branches");
    }

    #[test]
    fn stamp_preserves_existing_timestamps() {
        let mut l = list();
        l.set_timestamp(777);
        let mut data = vec![PmuData {
            ts: 123,
            ..PmuData::default()
        }];
        l.stamp(0, &mut data, 0, None);
        assert_eq!(data[0].ts, 123);
    }

    #[test]
    fn uncore_list_pins_to_device_cpu() {
        let mut uncore = spec();
        uncore.kind = PmuKind::Uncore;
        uncore.device_cpu = Some(5);
        let l = EventList::new(
            uncore,
            TaskKind::Counting,
            -1,
            OpenOptions::default(),
            vec![0, 1, 2],
            vec![ProcInfo::whole_system()],
        )
        .unwrap();
        assert_eq!(l.cpus, vec![5]);
        assert_eq!(l.procs.len(), 1);
        assert_eq!(l.procs[0].tid, -1);
    }

    #[test]
    fn uncore_without_cpumask_is_invalid() {
        let mut uncore = spec();
        uncore.kind = PmuKind::Uncore;
        uncore.device_cpu = None;
        let err = EventList::new(
            uncore,
            TaskKind::Counting,
            -1,
            OpenOptions::default(),
            vec![0],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DeviceInvalid(_)));
    }
}
