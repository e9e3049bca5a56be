//! Device metrics: expand a metric request into uncore events across the
//! matching hardware instances, and reduce the resulting counters back to
//! per-core, per-numa and per-bdf figures.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::data::PmuData;
use crate::error::{Error, Result};
use crate::session::{Cd, Pmu, SessionConfig};
use crate::topology::{self, ChipFamily};
use crate::TaskKind;

const SYS_DEVICES: &str = "/sys/devices";
const SYS_BUS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
const SYS_IOMMU_DEVICES: &str = "/sys/class/iommu";
const DEVICE_PREFIXES: &[&str] = &["hisi", "smmuv3", "hns3", "armv8"];

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceMetric {
    DdrReadBw,
    DdrWriteBw,
    L3Traffic,
    L3Miss,
    L3Ref,
    L3Lat,
    Pa2RingBw,
    Ring2PaBw,
    PcieRxMrdBw,
    PcieRxMwrBw,
    PcieTxMrdBw,
    PcieTxMwrBw,
    SmmuTran,
}

impl DeviceMetric {
    pub fn needs_bdf(self) -> bool {
        matches!(
            self,
            DeviceMetric::PcieRxMrdBw
                | DeviceMetric::PcieRxMwrBw
                | DeviceMetric::PcieTxMrdBw
                | DeviceMetric::PcieTxMwrBw
                | DeviceMetric::SmmuTran
        )
    }
}

/// One requested metric, with the PCIe endpoint for bdf-scoped metrics.
#[derive(Clone, Debug)]
pub struct MetricRequest {
    pub metric: DeviceMetric,
    pub bdf: Option<String>,
}

/// How a reduced figure is keyed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MetricScope {
    Core(i32),
    Numa(i32),
    Bdf(String),
}

#[derive(Clone, Debug)]
pub struct DeviceData {
    pub metric: DeviceMetric,
    pub count: u64,
    pub scope: MetricScope,
}

struct MetricConfig {
    device_prefix: &'static str,
    sub_device: &'static str,
    configs: &'static [&'static str],
    extra_config: &'static str,
    bdf_param: &'static str,
    /// Which underscore-separated token groups instances (0 = whole name).
    split_pos: usize,
}

fn metric_config(family: ChipFamily, metric: DeviceMetric) -> Option<MetricConfig> {
    use DeviceMetric::*;
    let config = match (family, metric) {
        (ChipFamily::HipA, DdrReadBw) => MetricConfig {
            device_prefix: "hisi_sccl",
            sub_device: "ddrc",
            configs: &["0x1"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (ChipFamily::HipA, DdrWriteBw) => MetricConfig {
            device_prefix: "hisi_sccl",
            sub_device: "ddrc",
            configs: &["0x0"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (_, DdrReadBw) => MetricConfig {
            device_prefix: "hisi_sccl",
            sub_device: "ddrc",
            configs: &["0x84"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (_, DdrWriteBw) => MetricConfig {
            device_prefix: "hisi_sccl",
            sub_device: "ddrc",
            configs: &["0x83"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (_, L3Traffic) | (_, L3Ref) => MetricConfig {
            device_prefix: "armv8_pmu",
            sub_device: "",
            configs: &["0x0032"],
            extra_config: "",
            bdf_param: "",
            split_pos: 0,
        },
        (_, L3Miss) => MetricConfig {
            device_prefix: "armv8_pmu",
            sub_device: "",
            configs: &["0x0033"],
            extra_config: "",
            bdf_param: "",
            split_pos: 0,
        },
        (ChipFamily::HipB, L3Lat) => MetricConfig {
            device_prefix: "hisi_sccl",
            sub_device: "l3c",
            configs: &["0x80"],
            extra_config: "",
            bdf_param: "",
            split_pos: 0,
        },
        (ChipFamily::HipB, Pa2RingBw) => MetricConfig {
            device_prefix: "hisi_sicl",
            sub_device: "_pa",
            configs: &["0x60", "0x61", "0x62", "0x63"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (ChipFamily::HipB, Ring2PaBw) => MetricConfig {
            device_prefix: "hisi_sicl",
            sub_device: "_pa",
            configs: &["0x40", "0x41", "0x42", "0x43"],
            extra_config: "",
            bdf_param: "",
            split_pos: 1,
        },
        (ChipFamily::HipB, PcieRxMrdBw) => MetricConfig {
            device_prefix: "hisi_pcie",
            sub_device: "core",
            configs: &["0x0804", "0x10804"],
            extra_config: "",
            bdf_param: "bdf=",
            split_pos: 1,
        },
        (ChipFamily::HipB, PcieRxMwrBw) => MetricConfig {
            device_prefix: "hisi_pcie",
            sub_device: "core",
            configs: &["0x0104", "0x10104"],
            extra_config: "",
            bdf_param: "bdf=",
            split_pos: 1,
        },
        (ChipFamily::HipB, PcieTxMrdBw) => MetricConfig {
            device_prefix: "hisi_pcie",
            sub_device: "core",
            configs: &["0x0405", "0x10405"],
            extra_config: "",
            bdf_param: "bdf=",
            split_pos: 1,
        },
        (ChipFamily::HipB, PcieTxMwrBw) => MetricConfig {
            device_prefix: "hisi_pcie",
            sub_device: "core",
            configs: &["0x0105", "0x10105"],
            extra_config: "",
            bdf_param: "bdf=",
            split_pos: 1,
        },
        (_, SmmuTran) => MetricConfig {
            device_prefix: "smmuv3_pmcg",
            sub_device: "",
            configs: &["0x1"],
            extra_config: "filter_enable=1",
            bdf_param: "filter_stream_id=",
            split_pos: 2,
        },
        _ => return None,
    };
    Some(config)
}

/// `bus:device.function` → the packed 16-bit bdf value.
pub fn parse_bdf(bdf: &str) -> Result<u16> {
    let invalid = || Error::InvalidBdf(bdf.to_string());
    let (bus, rest) = bdf.split_once(':').ok_or_else(invalid)?;
    let (device, function) = rest.split_once('.').ok_or_else(invalid)?;
    let bus = u16::from_str_radix(bus, 16).map_err(|_| invalid())?;
    let device = u16::from_str_radix(device, 16).map_err(|_| invalid())?;
    let function = u16::from_str_radix(function, 16).map_err(|_| invalid())?;
    if bus > 0xff || device > 0x1f || function > 0x7 {
        return Err(invalid());
    }
    Ok((bus << 8) | (device << 3) | function)
}

/// `smmu3.0x<base>` → the pmcg instance key: `(base + 0x20000) >> 12`,
/// upper-case hex.
pub fn smmu_pmu_key(device_name: &str) -> Result<String> {
    const PMU_OFFSET: u64 = 0x20000;
    let hex = device_name
        .split("0x")
        .nth(1)
        .ok_or_else(|| Error::DeviceInvalid(device_name.to_string()))?;
    let base = u64::from_str_radix(hex, 16)
        .map_err(|_| Error::DeviceInvalid(device_name.to_string()))?;
    Ok(format!("{:X}", (base + PMU_OFFSET) >> 12))
}

fn list_dir(path: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

fn uncore_devices() -> Vec<String> {
    list_dir(SYS_DEVICES)
        .into_iter()
        .filter(|name| DEVICE_PREFIXES.iter().any(|p| name.starts_with(p)))
        .collect()
}

/// Group matching device instances by their split token.
fn classify_devices(
    devices: &[String],
    config: &MetricConfig,
) -> HashMap<String, Vec<String>> {
    let mut classified: HashMap<String, Vec<String>> = HashMap::new();
    for device in devices {
        if !device.contains(config.device_prefix) || !device.contains(config.sub_device) {
            continue;
        }
        if config.split_pos == 0 {
            classified.entry(device.clone()).or_default().push(device.clone());
            continue;
        }
        let parts: Vec<&str> = device.split('_').collect();
        if parts.len() > config.split_pos {
            classified
                .entry(parts[config.split_pos].to_string())
                .or_default()
                .push(device.clone());
        }
    }
    classified
}

fn pcie_device_for_bdf(bdf: u16) -> Result<String> {
    for device in list_dir(SYS_DEVICES) {
        if !device.contains("pcie") {
            continue;
        }
        let base = Path::new(SYS_DEVICES).join(&device);
        let read_hex = |file: &str| -> Option<u16> {
            let text = fs::read_to_string(base.join(file)).ok()?;
            u16::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
        };
        let (Some(bus), Some(min), Some(max)) =
            (read_hex("bus"), read_hex("bdf_min"), read_hex("bdf_max"))
        else {
            continue;
        };
        if bus == 0 {
            continue;
        }
        if bdf >= min && bdf <= max {
            return Ok(device);
        }
    }
    Err(Error::DeviceInvalid(format!("no pcie pmu manages bdf {bdf:#x}")))
}

fn smmu_device_for_bdf(
    classified: &HashMap<String, Vec<String>>,
    bdf: &str,
) -> Result<String> {
    for iommu in list_dir(SYS_IOMMU_DEVICES) {
        let devices_dir = format!("{SYS_IOMMU_DEVICES}/{iommu}/devices");
        for endpoint in list_dir(&devices_dir) {
            let Some(endpoint_bdf) = endpoint.strip_prefix("0000:") else {
                continue;
            };
            if endpoint_bdf != bdf {
                continue;
            }
            let key = smmu_pmu_key(&iommu)?;
            return classified
                .get(&key)
                .and_then(|devices| devices.first().cloned())
                .ok_or_else(|| Error::DeviceInvalid(format!("no pmcg for smmu {iommu}")));
        }
    }
    Err(Error::DeviceInvalid(format!("bdf {bdf} is behind no smmu")))
}

fn validate_bdf_exists(bdf: &str) -> Result<()> {
    let entries = list_dir(SYS_BUS_PCI_DEVICES);
    if entries.iter().any(|e| e.strip_prefix("0000:") == Some(bdf)) {
        return Ok(());
    }
    Err(Error::InvalidBdf(bdf.to_string()))
}

fn event_strings_for(
    request: &MetricRequest,
    config: &MetricConfig,
    devices: &[String],
) -> Result<Vec<String>> {
    let classified = classify_devices(devices, config);
    let mut events = Vec::new();
    match &request.bdf {
        Some(bdf) => {
            validate_bdf_exists(bdf)?;
            let device = if config.bdf_param == "bdf=" {
                pcie_device_for_bdf(parse_bdf(bdf)?)?
            } else {
                smmu_device_for_bdf(&classified, bdf)?
            };
            let bdf_value = parse_bdf(bdf)?;
            for cfg in config.configs {
                let mut event = format!("{device}/config={cfg}");
                if !config.extra_config.is_empty() {
                    event.push(',');
                    event.push_str(config.extra_config);
                }
                event.push_str(&format!(",{}{:#x}", config.bdf_param, bdf_value));
                event.push('/');
                events.push(event);
            }
        }
        None => {
            for instances in classified.values() {
                for cfg in config.configs {
                    for device in instances {
                        events.push(format!("{device}/config={cfg}/"));
                    }
                }
            }
        }
    }
    if events.is_empty() {
        return Err(Error::DeviceInvalid(format!(
            "no {}*{}* devices present",
            config.device_prefix, config.sub_device
        )));
    }
    Ok(events)
}

fn check_requests(family: ChipFamily, requests: &[MetricRequest]) -> Result<()> {
    for request in requests {
        if metric_config(family, request.metric).is_none() {
            return Err(Error::InvalidMetric(format!("{:?}", request.metric)));
        }
        if request.metric.needs_bdf() && request.bdf.is_none() {
            return Err(Error::InvalidBdf("missing bdf".into()));
        }
    }
    Ok(())
}

/// Open a counting session covering every event the requested metrics
/// need.
pub fn device_open(pmu: &Pmu, requests: &[MetricRequest]) -> Result<Cd> {
    let family = topology::chip_family()?;
    check_requests(family, requests)?;
    let devices = uncore_devices();
    let mut events = Vec::new();
    for request in requests {
        let config = metric_config(family, request.metric).expect("checked above");
        events.extend(event_strings_for(request, &config, &devices)?);
    }
    debug!("device metrics expand to {} events", events.len());
    let config = SessionConfig {
        events,
        ..SessionConfig::default()
    };
    pmu.open(TaskKind::Counting, &config)
}

fn extract_param<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    for token in body.trim_end_matches('/').split(',') {
        if let Some((k, v)) = token.split_once('=') {
            if k.trim() == key {
                return Some(v.trim());
            }
        }
    }
    None
}

fn scale(metric: DeviceMetric, raw: u64) -> u64 {
    match metric {
        // A DDR count covers one 32-byte beat, an L3 count one cache line.
        DeviceMetric::DdrReadBw | DeviceMetric::DdrWriteBw => 32 * raw,
        DeviceMetric::L3Traffic => 64 * raw,
        _ => raw,
    }
}

struct FilteredRow {
    count: u64,
    core: i32,
    numa: i32,
    config: String,
}

fn filter_rows(
    data: &[PmuData],
    request: &MetricRequest,
    config: &MetricConfig,
) -> Result<Vec<FilteredRow>> {
    let expected_bdf = request
        .bdf
        .as_deref()
        .map(parse_bdf)
        .transpose()?
        .map(|v| format!("{v:#x}"));
    let mut rows = Vec::new();
    for record in data {
        let Some((device, body)) = record.evt.split_once('/') else {
            continue;
        };
        if !device.contains(config.device_prefix) || !device.contains(config.sub_device) {
            continue;
        }
        let Some(cfg) = extract_param(body, "config") else {
            continue;
        };
        if !config.configs.contains(&cfg) {
            continue;
        }
        if let Some(expected) = &expected_bdf {
            let bdf = extract_param(body, "bdf")
                .or_else(|| extract_param(body, "filter_stream_id"));
            if bdf != Some(expected.as_str()) {
                continue;
            }
        }
        rows.push(FilteredRow {
            count: scale(request.metric, record.count),
            core: record.cpu,
            numa: record.cpu_topo.map(|t| t.numa_id).unwrap_or(-1),
            config: cfg.to_string(),
        });
    }
    Ok(rows)
}

fn reduce(
    request: &MetricRequest,
    config: &MetricConfig,
    rows: Vec<FilteredRow>,
    out: &mut Vec<DeviceData>,
) {
    use DeviceMetric::*;
    match request.metric {
        L3Traffic | L3Miss | L3Ref => {
            for row in rows {
                out.push(DeviceData {
                    metric: request.metric,
                    count: row.count,
                    scope: MetricScope::Core(row.core),
                });
            }
        }
        DdrReadBw | DdrWriteBw | L3Lat => {
            let mut by_numa: Vec<(i32, u64)> = Vec::new();
            for row in rows {
                match by_numa.iter_mut().find(|(numa, _)| *numa == row.numa) {
                    Some((_, count)) => *count += row.count,
                    None => by_numa.push((row.numa, row.count)),
                }
            }
            by_numa.sort_by_key(|&(numa, _)| numa);
            for (numa, count) in by_numa {
                out.push(DeviceData {
                    metric: request.metric,
                    count,
                    scope: MetricScope::Numa(numa),
                });
            }
        }
        PcieRxMrdBw | PcieRxMwrBw | PcieTxMrdBw | PcieTxMwrBw => {
            // Pair the packet-length and latency counters of one bdf.
            let len_cfg = config.configs[0];
            let lat_cfg = config.configs[1];
            let len: u64 = rows.iter().filter(|r| r.config == len_cfg).map(|r| r.count).sum();
            let lat: u64 = rows.iter().filter(|r| r.config == lat_cfg).map(|r| r.count).sum();
            if lat > 0 {
                out.push(DeviceData {
                    metric: request.metric,
                    count: 4 * len / lat,
                    scope: MetricScope::Bdf(request.bdf.clone().unwrap_or_default()),
                });
            }
        }
        SmmuTran => {
            let total: u64 = rows.iter().map(|r| r.count).sum();
            out.push(DeviceData {
                metric: request.metric,
                count: total,
                scope: MetricScope::Bdf(request.bdf.clone().unwrap_or_default()),
            });
        }
        Pa2RingBw | Ring2PaBw => {
            // Copy-through; callers sum the ring ports they care about.
            for row in rows {
                out.push(DeviceData {
                    metric: request.metric,
                    count: row.count,
                    scope: MetricScope::Core(row.core),
                });
            }
        }
    }
}

/// Reduce counting rows produced by a [`device_open`] session into the
/// requested metrics.
pub fn get_dev_metric(data: &[PmuData], requests: &[MetricRequest]) -> Result<Vec<DeviceData>> {
    let family = topology::chip_family()?;
    check_requests(family, requests)?;
    let mut out = Vec::new();
    for request in requests {
        let config = metric_config(family, request.metric).expect("checked above");
        let rows = filter_rows(data, request, &config)?;
        reduce(request, &config, rows, &mut out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuTopology;

    fn ddr_row(evt: &str, numa: i32, count: u64) -> PmuData {
        PmuData {
            evt: evt.to_string(),
            count,
            cpu: 0,
            cpu_topo: Some(CpuTopology {
                core_id: 0,
                numa_id: numa,
                socket_id: 0,
            }),
            ..PmuData::default()
        }
    }

    fn hip_a_requests() -> Vec<MetricRequest> {
        vec![MetricRequest {
            metric: DeviceMetric::DdrReadBw,
            bdf: None,
        }]
    }

    fn reduce_for(family: ChipFamily, data: &[PmuData], requests: &[MetricRequest]) -> Vec<DeviceData> {
        let mut out = Vec::new();
        for request in requests {
            let config = metric_config(family, request.metric).unwrap();
            let rows = filter_rows(data, request, &config).unwrap();
            reduce(request, &config, rows, &mut out);
        }
        out
    }

    #[test]
    fn ddr_read_bw_sums_per_numa_times_32() {
        let data = vec![
            ddr_row("hisi_sccl1_ddrc0/config=0x1/", 0, 100),
            ddr_row("hisi_sccl1_ddrc1/config=0x1/", 0, 100),
            ddr_row("hisi_sccl3_ddrc0/config=0x1/", 1, 200),
            ddr_row("hisi_sccl3_ddrc1/config=0x1/", 1, 200),
        ];
        let out = reduce_for(ChipFamily::HipA, &data, &hip_a_requests());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].scope, MetricScope::Numa(0));
        assert_eq!(out[0].count, 6400);
        assert_eq!(out[1].scope, MetricScope::Numa(1));
        assert_eq!(out[1].count, 12800);
    }

    #[test]
    fn rows_of_other_configs_are_ignored() {
        let data = vec![
            ddr_row("hisi_sccl1_ddrc0/config=0x1/", 0, 100),
            ddr_row("hisi_sccl1_ddrc0/config=0x0/", 0, 999),
            ddr_row("cycles", 0, 999),
        ];
        let out = reduce_for(ChipFamily::HipA, &data, &hip_a_requests());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].count, 3200);
    }

    #[test]
    fn l3_traffic_is_per_core_times_64() {
        let data = vec![PmuData {
            evt: "armv8_pmuv3_0/config=0x0032/".to_string(),
            count: 10,
            cpu: 7,
            ..PmuData::default()
        }];
        let requests = vec![MetricRequest {
            metric: DeviceMetric::L3Traffic,
            bdf: None,
        }];
        let out = reduce_for(ChipFamily::HipB, &data, &requests);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].count, 640);
        assert_eq!(out[0].scope, MetricScope::Core(7));
    }

    #[test]
    fn pcie_bw_pairs_length_and_latency() {
        let mk = |cfg: &str, count: u64| PmuData {
            evt: format!("hisi_pcie0_core0/config={cfg},bdf=0x3804/"),
            count,
            ..PmuData::default()
        };
        let data = vec![mk("0x0804", 4000), mk("0x10804", 100)];
        let requests = vec![MetricRequest {
            metric: DeviceMetric::PcieRxMrdBw,
            bdf: Some("38:00.4".into()),
        }];
        let out = reduce_for(ChipFamily::HipB, &data, &requests);
        assert_eq!(out.len(), 1);
        // 4 * 4000 / 100
        assert_eq!(out[0].count, 160);
        assert_eq!(out[0].scope, MetricScope::Bdf("38:00.4".into()));
    }

    #[test]
    fn smmu_transactions_sum_per_bdf() {
        let mk = |count: u64| PmuData {
            evt: "smmuv3_pmcg_100020/config=0x1,filter_enable=1,filter_stream_id=0x3804/"
                .to_string(),
            count,
            ..PmuData::default()
        };
        let data = vec![mk(5), mk(6)];
        let requests = vec![MetricRequest {
            metric: DeviceMetric::SmmuTran,
            bdf: Some("38:00.4".into()),
        }];
        let out = reduce_for(ChipFamily::HipA, &data, &requests);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].count, 11);
    }

    #[test]
    fn bdf_parsing() {
        assert_eq!(parse_bdf("38:00.4").unwrap(), 0x3804);
        assert_eq!(parse_bdf("00:00.0").unwrap(), 0);
        assert_eq!(parse_bdf("ff:1f.7").unwrap(), 0xffff);
        assert!(parse_bdf("garbage").is_err());
        assert!(parse_bdf("38:00").is_err());
        assert!(parse_bdf("100:00.0").is_err());
    }

    #[test]
    fn smmu_key_matches_pmcg_naming() {
        assert_eq!(smmu_pmu_key("smmu3.0x0000000100100000").unwrap(), "100120");
        assert!(smmu_pmu_key("smmu-without-addr").is_err());
    }

    #[test]
    fn classify_splits_by_token() {
        let devices = vec![
            "hisi_sccl1_ddrc0".to_string(),
            "hisi_sccl1_ddrc1".to_string(),
            "hisi_sccl3_ddrc0".to_string(),
            "hisi_pcie0_core0".to_string(),
        ];
        let config = metric_config(ChipFamily::HipA, DeviceMetric::DdrReadBw).unwrap();
        let classified = classify_devices(&devices, &config);
        assert_eq!(classified.len(), 2);
        assert_eq!(classified["sccl1"].len(), 2);
        assert_eq!(classified["sccl3"].len(), 1);
    }

    #[test]
    fn pcie_without_bdf_is_rejected() {
        let requests = vec![MetricRequest {
            metric: DeviceMetric::PcieRxMrdBw,
            bdf: None,
        }];
        assert!(matches!(
            check_requests(ChipFamily::HipB, &requests),
            Err(Error::InvalidBdf(_))
        ));
    }

    #[test]
    fn hip_a_has_no_pcie_metrics() {
        let requests = vec![MetricRequest {
            metric: DeviceMetric::PcieRxMrdBw,
            bdf: Some("38:00.4".into()),
        }];
        assert!(matches!(
            check_requests(ChipFamily::HipA, &requests),
            Err(Error::InvalidMetric(_))
        ));
    }
}
