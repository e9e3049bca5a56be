//! Crate-wide error and warning types.
//!
//! Every fallible API returns `Result<_, Error>`. Warnings are recoverable
//! conditions; they accumulate on the session and are drained with
//! [`crate::session::Session::take_warnings`].

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("out of memory: {0}")]
    NoMem(String),

    #[error("could not open {path}: {message}")]
    OpenFile { path: String, message: String },

    #[error("not an ELF object or unreadable symbol table in {0}")]
    ElfFormat(String),

    #[error("DWARF data in {0} could not be loaded")]
    DwarfFormat(String),

    #[error("pid {0} is not recorded in the resolver")]
    PidNotRecorded(i32),

    #[error("address {0:#x} is not covered by any module of pid {1}")]
    MapAddrNotFound(u64, i32),

    #[error("no free collection descriptor")]
    NoAvailPd,

    #[error("unrecognized chip family")]
    ChipUnsupported,

    #[error("invalid cpu list: {0}")]
    InvalidCpuList(String),

    #[error("invalid pid list: {0}")]
    InvalidPidList(String),

    #[error("event list must not be empty for counting and sampling tasks")]
    InvalidEvtList,

    #[error("collection descriptor {0} is not open")]
    InvalidPd(usize),

    #[error("unknown pmu data buffer")]
    InvalidPmuData,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("SPE is not available on this machine (no arm_spe_0 device)")]
    SpeUnavailable,

    #[error("could not read cpu topology for cpu {0}")]
    FailGetCpu(i32),

    #[error("process not found: {0}")]
    FailGetProc(i32),

    #[error(
        "permission denied opening {evt}; lower /proc/sys/kernel/perf_event_paranoid or run as root"
    )]
    NoPermission { evt: String },

    #[error("PMU device is busy")]
    DeviceBusy,

    #[error("PMU device is invalid: {0}")]
    DeviceInvalid(String),

    #[error("mmap of the ring buffer failed; consider raising vm.max_map_count")]
    MmapFailed,

    #[error("could not resolve module {0}")]
    ResolveModule(String),

    #[error("the kernel does not support this event")]
    KernelNotSupported,

    #[error("invalid pid: {0}")]
    InvalidPid(i32),

    #[error("invalid task type")]
    InvalidTaskType,

    #[error("invalid time: collect interval must be at least 100 ms")]
    InvalidTime,

    #[error("target process exited")]
    ProcessGone,

    #[error("task needs {needed} file descriptors which exceeds the hard limit {hard}")]
    TooManyFds { needed: u64, hard: u64 },

    #[error("raising RLIMIT_NOFILE failed: {0}")]
    RaiseFdFailed(String),

    #[error("counter moved backwards, count overflow")]
    CountOverflow,

    #[error("SPE events may not be grouped")]
    InvalidGroupSpe,

    #[error("an event group may not consist of uncore events only")]
    InvalidGroupAllUncore,

    #[error("invalid branch sample filter")]
    InvalidBranchFilter,

    #[error("branch stack sampling is only valid for sampling tasks")]
    BranchRequiresSampling,

    #[error("sample rate {0} exceeds /proc/sys/kernel/perf_event_max_sample_rate")]
    InvalidSampleRate(u64),

    #[error("{0} does not exist or is not accessible")]
    OpenInvalidFile(String),

    #[error("invalid device metric for this chip family: {0}")]
    InvalidMetric(String),

    #[error("invalid bdf value {0}, expected the form 00:00.0")]
    InvalidBdf(String),

    #[error("no raw trace payload field named {0}")]
    InvalidField(String),

    #[error("invalid syscall function name: {0}")]
    InvalidSyscallFun(String),

    #[error("could not parse the syscall table from {0}")]
    SyscallTableUnavailable(String),

    #[error("unexpected kernel error: {0}")]
    Unknown(Errno),
}

impl Error {
    /// Stable numeric code, kept aligned with the historical C error table
    /// so callers that log codes keep their meaning across the rewrite.
    pub fn code(&self) -> u32 {
        use Error::*;
        match self {
            NoMem(_) => 1,
            DwarfFormat(_) => 101,
            ElfFormat(_) => 102,
            OpenFile { .. } => 103,
            PidNotRecorded(_) => 104,
            MapAddrNotFound(..) => 105,
            NoAvailPd => 1000,
            ChipUnsupported => 1001,
            InvalidCpuList(_) => 1003,
            InvalidPidList(_) => 1004,
            InvalidEvtList => 1005,
            InvalidPd(_) => 1006,
            InvalidPmuData => 1024,
            InvalidEvent(_) => 1007,
            SpeUnavailable => 1008,
            FailGetCpu(_) => 1009,
            FailGetProc(_) => 1010,
            NoPermission { .. } => 1011,
            DeviceBusy => 1012,
            DeviceInvalid(_) => 1013,
            MmapFailed => 1014,
            ResolveModule(_) => 1015,
            KernelNotSupported => 1016,
            InvalidMetric(_) => 1017,
            InvalidPid(_) => 1018,
            InvalidTaskType => 1019,
            InvalidTime => 1020,
            ProcessGone => 1021,
            TooManyFds { .. } => 1022,
            RaiseFdFailed(_) => 1023,
            InvalidSampleRate(_) => 1032,
            InvalidField(_) => 1033,
            CountOverflow => 1035,
            InvalidGroupSpe => 1036,
            InvalidGroupAllUncore => 1037,
            InvalidSyscallFun(_) => 1039,
            SyscallTableUnavailable(_) => 1041,
            InvalidBranchFilter => 1042,
            BranchRequiresSampling => 1043,
            InvalidBdf(_) => 1044,
            OpenInvalidFile(_) => 1045,
            Unknown(_) => 9999,
        }
    }

    /// Translate an errno from `perf_event_open` into the crate taxonomy.
    pub(crate) fn from_open_errno(errno: i32, evt: &str) -> Error {
        match Errno::from_raw(errno) {
            Errno::EACCES | Errno::EPERM => Error::NoPermission {
                evt: evt.to_string(),
            },
            Errno::ENOENT | Errno::EINVAL => Error::InvalidEvent(evt.to_string()),
            Errno::EBUSY => Error::DeviceBusy,
            Errno::ENODEV => Error::KernelNotSupported,
            Errno::ESRCH => Error::ProcessGone,
            Errno::EMFILE => Error::TooManyFds { needed: 0, hard: 0 },
            other => Error::Unknown(other),
        }
    }

    pub(crate) fn open_file(path: impl Into<String>, source: std::io::Error) -> Error {
        Error::OpenFile {
            path: path.into(),
            message: source.to_string(),
        }
    }
}

/// Recoverable conditions surfaced out-of-band, never as call failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The kernel reported dropped records for a ring buffer.
    SamplesLost { lost: u64 },
    /// An event group mixed uncore and core events and was flattened.
    GroupHasUncore,
    /// An SPE record arrived without a usable context id.
    ContextIdLost,
    /// DWARF data for a module could not be loaded; line info is skipped.
    DwarfLoadFailed { module: String },
    /// A monitored thread disappeared while fds were being opened.
    ProcessVanished { tid: i32 },
    /// A build-id note was longer than the conventional 20 bytes.
    BuildIdTooLong { module: String, len: usize },
    /// A caller-provided buffer was freed twice.
    DoubleFree,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NoAvailPd.code(), 1000);
        assert_eq!(Error::InvalidPd(3).code(), 1006);
        assert_eq!(Error::CountOverflow.code(), 1035);
        assert_eq!(Error::Unknown(Errno::EIO).code(), 9999);
    }

    #[test]
    fn open_errno_translation() {
        assert!(matches!(
            Error::from_open_errno(libc::EACCES, "cycles"),
            Error::NoPermission { .. }
        ));
        assert!(matches!(
            Error::from_open_errno(libc::EINVAL, "cycles"),
            Error::InvalidEvent(_)
        ));
        assert!(matches!(
            Error::from_open_errno(libc::EBUSY, "x"),
            Error::DeviceBusy
        ));
        assert!(matches!(
            Error::from_open_errno(libc::ESRCH, "x"),
            Error::ProcessGone
        ));
    }
}
