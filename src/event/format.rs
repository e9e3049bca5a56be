//! Uncore device `format/` parsing: the kernel describes each accepted
//! event parameter as a bit field of one of the three config words.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// One `format/<param>` declaration, e.g. `config1:0-31` or `config:33`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConfigBitField {
    /// 0, 1 or 2 for config, config1, config2.
    pub word: u8,
    pub lo: u32,
    pub hi: u32,
}

impl ConfigBitField {
    pub fn max_value(&self) -> u64 {
        let width = self.hi - self.lo + 1;
        if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        }
    }
}

/// Parse one format-file payload.
pub fn parse_format_bitfield(line: &str) -> Option<ConfigBitField> {
    let (word, bits) = line.trim().split_once(':')?;
    let word = match word {
        "config" => 0,
        "config1" => 1,
        "config2" => 2,
        _ => return None,
    };
    let (lo, hi) = match bits.split_once('-') {
        Some((lo, hi)) => (lo.trim().parse().ok()?, hi.trim().parse().ok()?),
        None => {
            let bit = bits.trim().parse().ok()?;
            (bit, bit)
        }
    };
    if hi < lo || hi > 63 {
        return None;
    }
    Some(ConfigBitField { word, lo, hi })
}

/// All parameters a device accepts, keyed by parameter name. The kernel's
/// `event` parameter is aliased as `config` so `config=0x..` strings work.
pub fn read_device_format(device: &str) -> HashMap<String, ConfigBitField> {
    let mut fields = HashMap::new();
    let dir = Path::new("/sys/devices").join(device).join("format");
    let Ok(entries) = fs::read_dir(dir) else {
        return fields;
    };
    for entry in entries.flatten() {
        let Ok(payload) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let Some(field) = parse_format_bitfield(payload.lines().next().unwrap_or("")) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "event" {
            fields.insert("config".to_string(), field);
        }
        fields.insert(name, field);
    }
    fields
}

/// The `k=v` payload of `/sys/devices/<device>/events/<event>`, used to
/// expand a bare parameter token like `transaction`.
pub fn read_named_event(device: &str, event: &str) -> Option<(String, String)> {
    let path = Path::new("/sys/devices").join(device).join("events").join(event);
    let payload = fs::read_to_string(path).ok()?;
    let mut last = None;
    for part in payload.trim().split(',') {
        if let Some((k, v)) = part.split_once('=') {
            let k = if k == "config" { "event" } else { k };
            last = Some((k.to_string(), v.trim().to_string()));
        }
    }
    last
}

fn parse_config_value(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Pack a `k=v,k=v,…` event body into the three config words, validating
/// each value against the device-declared bit widths.
pub fn pack_event_body(
    device: &str,
    body: &str,
    fields: &HashMap<String, ConfigBitField>,
) -> Result<[u64; 3]> {
    let mut configs = [0u64; 3];
    for token in body.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => {
                // A bare named event like `transaction`; its k=v form comes
                // from the device's events directory.
                read_named_event(device, token)
                    .ok_or_else(|| Error::InvalidEvent(format!("{device}/{token}/")))?
            }
        };
        let field = fields
            .get(key.as_str())
            .or_else(|| if key == "event" { fields.get("config") } else { None })
            .ok_or_else(|| {
                Error::InvalidEvent(format!("{device}: unknown format parameter {key}"))
            })?;
        let value = parse_config_value(&value)
            .ok_or_else(|| Error::InvalidEvent(format!("{device}: bad value for {key}")))?;
        if value > field.max_value() {
            return Err(Error::InvalidEvent(format!(
                "{device}: value {value:#x} does not fit {key} ({} bits)",
                field.hi - field.lo + 1
            )));
        }
        configs[field.word as usize] |= value << field.lo;
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> HashMap<String, ConfigBitField> {
        let mut m = HashMap::new();
        m.insert("config".into(), parse_format_bitfield("config:0-31").unwrap());
        m.insert("event".into(), parse_format_bitfield("config:0-31").unwrap());
        m.insert(
            "filter_enable".into(),
            parse_format_bitfield("config1:0").unwrap(),
        );
        m.insert(
            "filter_stream_id".into(),
            parse_format_bitfield("config1:1-32").unwrap(),
        );
        m
    }

    #[test]
    fn bitfield_grammar() {
        assert_eq!(
            parse_format_bitfield("config1:0-31"),
            Some(ConfigBitField { word: 1, lo: 0, hi: 31 })
        );
        assert_eq!(
            parse_format_bitfield("config2:33"),
            Some(ConfigBitField { word: 2, lo: 33, hi: 33 })
        );
        assert_eq!(parse_format_bitfield("bogus:1"), None);
        assert_eq!(parse_format_bitfield("config:5-3"), None);
    }

    #[test]
    fn packs_multiple_words() {
        let configs =
            pack_event_body("smmuv3_pmcg_100020", "config=0x1,filter_enable=1,filter_stream_id=0x7d", &fields())
                .unwrap();
        assert_eq!(configs[0], 0x1);
        assert_eq!(configs[1], 1 | (0x7d << 1));
        assert_eq!(configs[2], 0);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = pack_event_body("dev", "filter_enable=2", &fields()).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[test]
    fn rejects_unknown_parameter() {
        let err = pack_event_body("dev", "nope=1", &fields()).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[test]
    fn single_bit_max() {
        let f = parse_format_bitfield("config:16").unwrap();
        assert_eq!(f.max_value(), 1);
    }
}
