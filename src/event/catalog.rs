//! Event name resolution, first hit wins:
//! static chip table → kernel-published core event → raw `r<hex>` →
//! uncore named → uncore raw → tracepoint.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::format;
use super::tables;
use super::{EventSpec, PmuKind};
use crate::error::{Error, Result};
use crate::sys;
use crate::topology;

const SYS_DEVICES: &str = "/sys/devices";
const EVENT_SOURCE_DEVICES: &str = "/sys/bus/event_source/devices";
const SPE_TYPE_PATH: &str = "/sys/devices/arm_spe_0/type";

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// `event=0x11` (possibly with trailing parameters) → 0x11.
fn parse_event_payload(payload: &str) -> Option<u64> {
    for part in payload.trim().split(',') {
        if let Some((_, value)) = part.split_once('=') {
            return u64::from_str_radix(value.trim().trim_start_matches("0x"), 16)
                .ok()
                .or_else(|| parse_number(value));
        }
    }
    None
}

/// The core PMU device directory the kernel publishes events under:
/// `cpu` on x86, `armv8_pmuv3*` on ARM.
fn core_pmu_device() -> Option<PathBuf> {
    let base = Path::new(EVENT_SOURCE_DEVICES);
    let cpu = base.join("cpu");
    if cpu.join("events").is_dir() {
        return Some(cpu);
    }
    for entry in fs::read_dir(base).ok()?.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("armv8_pmuv3") {
            let path = entry.path();
            if path.join("events").is_dir() {
                return Some(path);
            }
        }
    }
    None
}

fn resolve_kernel_core_event(name: &str) -> Option<EventSpec> {
    let device = core_pmu_device()?;
    let payload = read_trimmed(device.join("events").join(name))?;
    let config = parse_event_payload(&payload)?;
    let type_ = parse_number(&read_trimmed(device.join("type"))?)? as u32;
    Some(EventSpec {
        name: name.to_string(),
        kind: PmuKind::Core,
        type_,
        config,
        config1: 0,
        config2: 0,
        device_cpu: None,
    })
}

fn resolve_raw_event(name: &str) -> Option<EventSpec> {
    let hex = name.strip_prefix('r')?;
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let config = u64::from_str_radix(hex, 16).ok()?;
    Some(EventSpec {
        name: name.to_string(),
        kind: PmuKind::Raw,
        type_: sys::PERF_TYPE_RAW,
        config,
        config1: 0,
        config2: 0,
        device_cpu: None,
    })
}

fn device_type(device: &str) -> Option<u32> {
    let payload = read_trimmed(Path::new(SYS_DEVICES).join(device).join("type"))?;
    parse_number(&payload).map(|v| v as u32)
}

fn device_cpumask(device: &str) -> Option<i32> {
    // The cpumask file is a comma-separated list; uncore devices publish a
    // single cpu, which is the one we take.
    let payload = read_trimmed(Path::new(SYS_DEVICES).join(device).join("cpumask"))?;
    topology::parse_cpu_ranges(&payload).first().copied()
}

/// `<device>/<event>/` against `/sys/devices/<device>/events/<event>`.
fn resolve_uncore_event(name: &str) -> Option<EventSpec> {
    let (device, rest) = name.split_once('/')?;
    let event = rest.strip_suffix('/').unwrap_or(rest);
    if event.is_empty() || event.contains('=') {
        return None;
    }
    let payload = read_trimmed(
        Path::new(SYS_DEVICES).join(device).join("events").join(event),
    )?;
    let config = parse_event_payload(&payload)?;
    Some(EventSpec {
        name: name.to_string(),
        kind: PmuKind::Uncore,
        type_: device_type(device)?,
        config,
        config1: 0,
        config2: 0,
        device_cpu: device_cpumask(device),
    })
}

/// `<device>/<k=v,…>/` against the device's `format/` declarations.
fn resolve_uncore_raw_event(name: &str) -> Result<Option<EventSpec>> {
    let Some((device, rest)) = name.split_once('/') else {
        return Ok(None);
    };
    let body = rest.strip_suffix('/').unwrap_or(rest);
    if body.is_empty() || !Path::new(SYS_DEVICES).join(device).is_dir() {
        return Ok(None);
    }
    let fields = format::read_device_format(device);
    if fields.is_empty() {
        return Ok(None);
    }
    let configs = format::pack_event_body(device, body, &fields)?;
    let Some(type_) = device_type(device) else {
        return Ok(None);
    };
    Ok(Some(EventSpec {
        name: name.to_string(),
        kind: PmuKind::UncoreRaw,
        type_,
        config: configs[0],
        config1: configs[1],
        config2: configs[2],
        device_cpu: device_cpumask(device),
    }))
}

fn resolve_tracepoint(name: &str) -> Option<EventSpec> {
    let (system, event) = name.split_once(':')?;
    if system.is_empty() || event.is_empty() {
        return None;
    }
    let root = topology::tracing_root()?;
    let id_path = root.join("events").join(system).join(event).join("id");
    let config = parse_number(&read_trimmed(id_path)?)?;
    Some(EventSpec {
        name: name.to_string(),
        kind: PmuKind::Tracepoint,
        type_: sys::PERF_TYPE_TRACEPOINT,
        config,
        config1: 0,
        config2: 0,
        device_cpu: None,
    })
}

/// Resolve an event name to an [`EventSpec`].
pub fn resolve(name: &str) -> Result<EventSpec> {
    if let Ok(family) = topology::chip_family() {
        if let Some(entry) = tables::lookup(family, name) {
            return Ok(EventSpec::core(name, entry.type_, entry.config));
        }
    }
    if let Some(spec) = resolve_kernel_core_event(name) {
        return Ok(spec);
    }
    if let Some(spec) = resolve_raw_event(name) {
        return Ok(spec);
    }
    if let Some(spec) = resolve_uncore_event(name) {
        return Ok(spec);
    }
    match resolve_uncore_raw_event(name) {
        Ok(Some(spec)) => return Ok(spec),
        Ok(None) => {}
        Err(err) => {
            debug!("uncore raw candidate {name} rejected: {err}");
            return Err(err);
        }
    }
    if let Some(spec) = resolve_tracepoint(name) {
        return Ok(spec);
    }
    Err(Error::InvalidEvent(name.to_string()))
}

/// Build the SPE event spec from the caller's filters; no name involved.
pub fn spe_spec(data_filter: u64, event_filter: u64, min_latency: u64) -> Result<EventSpec> {
    let type_ = read_trimmed(SPE_TYPE_PATH)
        .and_then(|s| parse_number(&s))
        .ok_or(Error::SpeUnavailable)?;
    Ok(EventSpec {
        name: "arm_spe_0".to_string(),
        kind: PmuKind::Spe,
        type_: type_ as u32,
        config: data_filter,
        config1: event_filter,
        config2: min_latency,
        device_cpu: None,
    })
}

/// Which class of events to enumerate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKindFilter {
    Core,
    Uncore,
    Tracepoint,
    All,
}

fn list_core_events(out: &mut Vec<String>) {
    if let Ok(family) = topology::chip_family() {
        out.extend(tables::family_events(family).map(|e| e.name.to_string()));
    }
    if let Some(device) = core_pmu_device() {
        if let Ok(entries) = fs::read_dir(device.join("events")) {
            for entry in entries.flatten() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    out.sort();
    out.dedup();
}

fn list_uncore_events(out: &mut Vec<String>) {
    let Ok(devices) = fs::read_dir(SYS_DEVICES) else {
        return;
    };
    for device in devices.flatten() {
        let device_name = device.file_name().to_string_lossy().into_owned();
        // Only device PMUs pinned to a cpu are uncore.
        if !device.path().join("cpumask").exists() {
            continue;
        }
        let Ok(events) = fs::read_dir(device.path().join("events")) else {
            continue;
        };
        for event in events.flatten() {
            let event_name = event.file_name().to_string_lossy().into_owned();
            out.push(format!("{device_name}/{event_name}/"));
        }
    }
    out.sort();
}

fn list_tracepoints(out: &mut Vec<String>) {
    let Some(root) = topology::tracing_root() else {
        return;
    };
    let Ok(systems) = fs::read_dir(root.join("events")) else {
        return;
    };
    for system in systems.flatten() {
        if !system.path().is_dir() {
            continue;
        }
        let system_name = system.file_name().to_string_lossy().into_owned();
        let Ok(events) = fs::read_dir(system.path()) else {
            continue;
        };
        for event in events.flatten() {
            if event.path().join("format").exists() {
                let event_name = event.file_name().to_string_lossy().into_owned();
                out.push(format!("{system_name}:{event_name}"));
            }
        }
    }
    out.sort();
}

/// Enumerate the event names available on this machine.
pub fn available_events(filter: EventKindFilter) -> Vec<String> {
    let mut out = Vec::new();
    match filter {
        EventKindFilter::Core => list_core_events(&mut out),
        EventKindFilter::Uncore => list_uncore_events(&mut out),
        EventKindFilter::Tracepoint => list_tracepoints(&mut out),
        EventKindFilter::All => {
            list_core_events(&mut out);
            list_uncore_events(&mut out);
            list_tracepoints(&mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_grammar() {
        let spec = resolve_raw_event("r11").unwrap();
        assert_eq!(spec.type_, sys::PERF_TYPE_RAW);
        assert_eq!(spec.config, 0x11);
        let spec = resolve_raw_event("r60ea").unwrap();
        assert_eq!(spec.config, 0x60ea);
        assert!(resolve_raw_event("r").is_none());
        assert!(resolve_raw_event("rzz").is_none());
        assert!(resolve_raw_event("cycles").is_none());
    }

    #[test]
    fn event_payload_parsing() {
        assert_eq!(parse_event_payload("event=0x11"), Some(0x11));
        assert_eq!(parse_event_payload("event=0x84\n"), Some(0x84));
        assert_eq!(parse_event_payload("config=0x0"), Some(0));
        assert_eq!(parse_event_payload("nothing"), None);
    }

    #[test]
    fn unknown_name_is_invalid_event() {
        let err = resolve("surely-not-an-event-name").unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[test]
    fn tracepoint_requires_colon_form() {
        assert!(resolve_tracepoint("cycles").is_none());
        assert!(resolve_tracepoint(":x").is_none());
        assert!(resolve_tracepoint("x:").is_none());
    }
}
