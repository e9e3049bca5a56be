//! Syscall latency from paired enter/exit tracepoints.
//!
//! Records from `syscalls:sys_enter_<f>` / `sys_exit_<f>` (or the generic
//! `raw_syscalls` pair) are bucketed per tid, sorted by timestamp and
//! paired front to back: each pending enter matches the first later exit.

mod format;
mod syscalls;

pub use format::{parse_format, Field, FieldValue, FormatCache};
pub use syscalls::{load_syscall_table, parse_unistd};

use std::collections::HashMap;

use crate::data::PmuData;
use crate::error::{Error, Result};
use crate::event::{self, EventKindFilter};
use crate::session::{Cd, Pmu, SessionConfig};
use crate::TaskKind;

pub const SYSCALL_ENTER_PREFIX: &str = "syscalls:sys_enter_";
pub const SYSCALL_EXIT_PREFIX: &str = "syscalls:sys_exit_";
pub const RAW_SYSCALL_ENTER: &str = "raw_syscalls:sys_enter";
pub const RAW_SYSCALL_EXIT: &str = "raw_syscalls:sys_exit";

/// One matched syscall invocation.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub func: String,
    pub pid: i32,
    pub tid: i32,
    pub cpu: i32,
    pub comm: String,
    /// Enter timestamp, nanoseconds.
    pub start_ts: u64,
    pub elapsed_ms: f64,
}

/// Syscall functions this kernel exposes enter/exit tracepoints for.
pub fn syscall_functions() -> Vec<String> {
    event::available_events(EventKindFilter::Tracepoint)
        .into_iter()
        .filter_map(|evt| evt.strip_prefix(SYSCALL_ENTER_PREFIX).map(str::to_string))
        .collect()
}

/// The event names a trace session must sample: the enter/exit pair per
/// function, or the generic raw pair when no functions are named.
pub fn trace_event_names(funcs: &[String]) -> Vec<String> {
    if funcs.is_empty() {
        return vec![RAW_SYSCALL_EXIT.to_string(), RAW_SYSCALL_ENTER.to_string()];
    }
    let mut events = Vec::with_capacity(funcs.len() * 2);
    for func in funcs {
        events.push(format!("{SYSCALL_EXIT_PREFIX}{func}"));
        events.push(format!("{SYSCALL_ENTER_PREFIX}{func}"));
    }
    events
}

/// Open the sampling session a trace analysis needs: the enter/exit pair
/// of every requested function (validated against the kernel's list), at
/// period 1 so every syscall produces a sample.
pub fn open_trace(
    pmu: &Pmu,
    funcs: &[String],
    pids: Vec<i32>,
    cpus: Vec<i32>,
) -> Result<Cd> {
    if !funcs.is_empty() {
        let known = syscall_functions();
        for func in funcs {
            if !known.contains(func) {
                return Err(Error::InvalidSyscallFun(func.clone()));
            }
        }
    }
    let config = SessionConfig {
        events: trace_event_names(funcs),
        pids,
        cpus,
        period_or_freq: 1,
        ..SessionConfig::default()
    };
    pmu.open(TaskKind::Sampling, &config)
}

fn pair_sorted(
    func: &str,
    mut enters: Vec<&PmuData>,
    mut exits: Vec<&PmuData>,
    out: &mut Vec<TraceRecord>,
) {
    if enters.is_empty() || exits.is_empty() {
        return;
    }
    enters.sort_by_key(|r| r.ts);
    exits.sort_by_key(|r| r.ts);
    let mut enter_idx = 0;
    let mut exit_idx = 0;
    while enter_idx < enters.len() && exit_idx < exits.len() {
        let enter = enters[enter_idx];
        let exit = exits[exit_idx];
        if enter.ts < exit.ts {
            out.push(TraceRecord {
                func: func.to_string(),
                pid: enter.pid,
                tid: enter.tid,
                cpu: enter.cpu,
                comm: enter.comm.clone(),
                start_ts: enter.ts,
                elapsed_ms: (exit.ts - enter.ts) as f64 / 1e6,
            });
            enter_idx += 1;
            exit_idx += 1;
        } else {
            exit_idx += 1;
        }
    }
}

fn analyze_named(data: &[PmuData], funcs: &[String]) -> Vec<TraceRecord> {
    let mut out = Vec::with_capacity(data.len() / 2);
    for func in funcs {
        let enter_evt = format!("{SYSCALL_ENTER_PREFIX}{func}");
        let exit_evt = format!("{SYSCALL_EXIT_PREFIX}{func}");
        let mut by_tid: HashMap<i32, (Vec<&PmuData>, Vec<&PmuData>)> = HashMap::new();
        for record in data {
            if record.evt == enter_evt {
                by_tid.entry(record.tid).or_default().0.push(record);
            } else if record.evt == exit_evt {
                by_tid.entry(record.tid).or_default().1.push(record);
            }
        }
        for (_tid, (enters, exits)) in by_tid {
            pair_sorted(func, enters, exits, &mut out);
        }
    }
    out
}

fn analyze_raw(
    data: &[PmuData],
    formats: &mut FormatCache,
    table: &HashMap<i64, String>,
) -> Result<Vec<TraceRecord>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut by_tid: HashMap<i32, Vec<&PmuData>> = HashMap::new();
    for record in data {
        by_tid.entry(record.tid).or_default().push(record);
    }
    for (_tid, records) in by_tid {
        // Within one tid, pair per syscall id.
        let mut by_id: HashMap<i64, (Vec<&PmuData>, Vec<&PmuData>)> = HashMap::new();
        for record in records {
            let Some(raw) = &record.raw else { continue };
            let Some(id) = formats.field(raw, "id")?.as_i64() else {
                continue;
            };
            if record.evt == RAW_SYSCALL_ENTER {
                by_id.entry(id).or_default().0.push(record);
            } else if record.evt == RAW_SYSCALL_EXIT {
                by_id.entry(id).or_default().1.push(record);
            }
        }
        for (id, (enters, exits)) in by_id {
            let Some(func) = table.get(&id) else {
                continue;
            };
            pair_sorted(func, enters, exits, &mut out);
        }
    }
    Ok(out)
}

/// Pair a buffer of tracepoint samples into durations. `funcs` empty
/// means the generic raw pair was sampled; ids are then disambiguated
/// against the syscall table.
pub fn analyze(
    data: &[PmuData],
    funcs: &[String],
    formats: &mut FormatCache,
) -> Result<Vec<TraceRecord>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let is_raw = data
        .iter()
        .any(|r| r.evt == RAW_SYSCALL_ENTER || r.evt == RAW_SYSCALL_EXIT);
    if is_raw {
        let table = syscalls::load_syscall_table()?;
        return analyze_raw(data, formats, &table);
    }
    if funcs.is_empty() {
        return Err(Error::InvalidSyscallFun("no functions requested".into()));
    }
    Ok(analyze_named(data, funcs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(evt: &str, tid: i32, ts: u64) -> PmuData {
        PmuData {
            evt: evt.to_string(),
            pid: 10,
            tid,
            cpu: 1,
            comm: "app".into(),
            ts,
            ..PmuData::default()
        }
    }

    #[test]
    fn pairs_enters_to_later_exits() {
        let data = vec![
            record("syscalls:sys_enter_write", 5, 100),
            record("syscalls:sys_exit_write", 5, 180),
            record("syscalls:sys_enter_write", 5, 200),
            record("syscalls:sys_exit_write", 5, 1_200_300),
        ];
        let out = analyze_named(&data, &["write".to_string()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].func, "write");
        assert_eq!(out[0].start_ts, 100);
        assert!((out[0].elapsed_ms - 0.00008).abs() < 1e-9);
        assert!((out[1].elapsed_ms - 1.2001).abs() < 1e-9);
    }

    #[test]
    fn stray_exit_before_any_enter_is_discarded() {
        let data = vec![
            record("syscalls:sys_exit_write", 5, 50),
            record("syscalls:sys_enter_write", 5, 100),
            record("syscalls:sys_exit_write", 5, 150),
        ];
        let out = analyze_named(&data, &["write".to_string()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_ts, 100);
    }

    #[test]
    fn tids_do_not_cross_pair() {
        let data = vec![
            record("syscalls:sys_enter_write", 5, 100),
            record("syscalls:sys_exit_write", 6, 150),
        ];
        let out = analyze_named(&data, &["write".to_string()]);
        assert!(out.is_empty());
    }

    #[test]
    fn unrequested_functions_are_ignored() {
        let data = vec![
            record("syscalls:sys_enter_read", 5, 100),
            record("syscalls:sys_exit_read", 5, 200),
        ];
        let out = analyze_named(&data, &["write".to_string()]);
        assert!(out.is_empty());
    }

    #[test]
    fn event_name_generation() {
        assert_eq!(
            trace_event_names(&["write".to_string()]),
            vec![
                "syscalls:sys_exit_write".to_string(),
                "syscalls:sys_enter_write".to_string()
            ]
        );
        assert_eq!(
            trace_event_names(&[]),
            vec![RAW_SYSCALL_EXIT.to_string(), RAW_SYSCALL_ENTER.to_string()]
        );
    }

    #[test]
    fn raw_pairing_disambiguates_by_id() {
        const ID_FORMAT: &str =
            "\tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n";
        let mut formats = FormatCache::new();
        formats.insert_parsed(RAW_SYSCALL_ENTER, ID_FORMAT);
        formats.insert_parsed(RAW_SYSCALL_EXIT, ID_FORMAT);
        let mut table = HashMap::new();
        table.insert(64i64, "write".to_string());

        let raw_payload = |id: i64| {
            let mut data = vec![0u8; 16];
            data[8..16].copy_from_slice(&id.to_ne_bytes());
            data
        };
        let mut enter = record(RAW_SYSCALL_ENTER, 5, 100);
        enter.raw = Some(crate::data::TraceData {
            event: RAW_SYSCALL_ENTER.into(),
            data: raw_payload(64),
        });
        let mut exit = record(RAW_SYSCALL_EXIT, 5, 300);
        exit.raw = Some(crate::data::TraceData {
            event: RAW_SYSCALL_EXIT.into(),
            data: raw_payload(64),
        });
        // An exit for a different syscall id must not pair.
        let mut other_exit = record(RAW_SYSCALL_EXIT, 5, 200);
        other_exit.raw = Some(crate::data::TraceData {
            event: RAW_SYSCALL_EXIT.into(),
            data: raw_payload(63),
        });

        let data = vec![enter, other_exit, exit];
        let out = analyze_raw(&data, &mut formats, &table).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].func, "write");
        assert_eq!(out[0].start_ts, 100);
        assert!((out[0].elapsed_ms - 0.0002).abs() < 1e-12);
    }
}
