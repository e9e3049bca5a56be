//! `/proc` probes: thread enumeration, tgid, comm and liveness.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Everything the collector needs to know about one monitored thread.
#[derive(Clone, Debug)]
pub struct ProcInfo {
    pub pid: i32,
    pub tid: i32,
    pub comm: String,
    /// The tid the caller actually asked for; open failures on it are fatal.
    pub is_main: bool,
}

impl ProcInfo {
    pub fn whole_system() -> Self {
        ProcInfo {
            pid: -1,
            tid: -1,
            comm: "system".into(),
            is_main: true,
        }
    }
}

pub fn alive(tid: i32) -> bool {
    tid < 0 || Path::new(&format!("/proc/{tid}")).exists()
}

/// Thread name, newline-trimmed. `-1` is the whole-system sentinel.
pub fn comm(tid: i32) -> Option<String> {
    if tid == -1 {
        return Some("system".into());
    }
    let raw = fs::read(format!("/proc/{tid}/comm")).ok()?;
    let end = raw
        .iter()
        .position(|&b| b == 0 || b == b'\n')
        .unwrap_or(raw.len());
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Thread-group id from `/proc/<tid>/status`.
pub fn tgid(tid: i32) -> Option<i32> {
    if tid == -1 {
        return Some(-1);
    }
    let status = fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn collect_tids(task_dir: &PathBuf, out: &mut Vec<i32>) {
    let Ok(entries) = fs::read_dir(task_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(tid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        out.push(tid);
        // Threads of threads: walk one level down the task tree as well.
        collect_tids(&entry.path().join("task"), out);
    }
}

/// All thread ids under `pid`, the pid itself included. `tids(0)` returns
/// `[0]` (whole-system placeholder); callers pass `-1` through untouched.
pub fn tids(pid: i32) -> Result<Vec<i32>> {
    if pid == 0 {
        return Ok(vec![0]);
    }
    if pid == -1 {
        return Ok(vec![-1]);
    }
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
    let mut out = Vec::new();
    collect_tids(&task_dir, &mut out);
    if out.is_empty() {
        return Err(Error::InvalidPid(pid));
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Probe one thread. `None` means the thread vanished between enumeration
/// and probing, which callers treat as a purge, not a failure.
pub fn proc_info(tid: i32, requested_pid: i32) -> Option<ProcInfo> {
    if tid == 0 {
        return Some(ProcInfo {
            pid: 0,
            tid: 0,
            comm: String::new(),
            is_main: true,
        });
    }
    if tid == -1 {
        return Some(ProcInfo::whole_system());
    }
    let pid = tgid(tid)?;
    let comm = comm(pid)?;
    Some(ProcInfo {
        pid,
        tid,
        comm,
        is_main: tid == requested_pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_system_sentinels() {
        assert_eq!(tids(0).unwrap(), vec![0]);
        assert_eq!(tids(-1).unwrap(), vec![-1]);
        assert_eq!(tgid(-1), Some(-1));
        assert_eq!(comm(-1).as_deref(), Some("system"));
        assert!(alive(-1));
    }

    #[test]
    fn own_process_is_enumerable() {
        let me = std::process::id() as i32;
        let tids = tids(me).unwrap();
        assert!(tids.contains(&me));
        assert_eq!(tgid(me), Some(me));
        assert!(alive(me));
        assert!(comm(me).is_some());
    }

    #[test]
    fn vanished_thread_probes_none() {
        // Tid 1 is init; we can enumerate it but a wildly out-of-range tid
        // must report as gone.
        assert!(proc_info(i32::MAX - 1, 0).is_none());
        assert!(!alive(i32::MAX - 1));
    }
}
