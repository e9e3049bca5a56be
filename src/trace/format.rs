//! Tracepoint format files: the kernel's per-event field map, and typed
//! extraction of fields from RAW sample payloads.

use std::collections::HashMap;
use std::fs;

use crate::data::TraceData;
use crate::error::{Error, Result};
use crate::topology;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Field {
    pub name: String,
    /// The declaration as written, e.g. `unsigned short common_type` or
    /// `__data_loc char[] name`.
    pub type_decl: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
}

impl Field {
    fn is_data_loc(&self) -> bool {
        self.type_decl.contains("__data_loc")
    }
}

/// A value pulled out of a RAW payload.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldValue {
    Signed(i64),
    Unsigned(u64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Signed(v) => Some(*v),
            FieldValue::Unsigned(v) => i64::try_from(*v).ok(),
            FieldValue::Bytes(_) => None,
        }
    }
}

/// Parse one format file (`field:<decl>; offset:<o>; size:<s>;
/// signed:<b>;` lines).
pub fn parse_format(text: &str) -> HashMap<String, Field> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("field:") else {
            continue;
        };
        let mut parts = rest.split(';').map(str::trim);
        let Some(decl) = parts.next() else { continue };
        let mut offset = None;
        let mut size = None;
        let mut signed = false;
        for part in parts {
            if let Some(v) = part.strip_prefix("offset:") {
                offset = v.trim().parse().ok();
            } else if let Some(v) = part.strip_prefix("size:") {
                size = v.trim().parse().ok();
            } else if let Some(v) = part.strip_prefix("signed:") {
                signed = v.trim() == "1";
            }
        }
        let (Some(offset), Some(size)) = (offset, size) else {
            continue;
        };
        // The field name is the last identifier of the declaration,
        // with any array suffix stripped.
        let Some(raw_name) = decl.split_whitespace().last() else {
            continue;
        };
        let name = raw_name.split('[').next().unwrap_or(raw_name).to_string();
        fields.insert(
            name.clone(),
            Field {
                name,
                type_decl: decl.to_string(),
                offset,
                size,
                signed,
            },
        );
    }
    fields
}

/// Per-event field maps, loaded from the tracing root on first use.
#[derive(Default)]
pub struct FormatCache {
    events: HashMap<String, HashMap<String, Field>>,
}

impl FormatCache {
    pub fn new() -> FormatCache {
        FormatCache::default()
    }

    fn load(&mut self, event: &str) -> Result<&HashMap<String, Field>> {
        if !self.events.contains_key(event) {
            let (system, name) = event
                .split_once(':')
                .ok_or_else(|| Error::InvalidEvent(event.to_string()))?;
            let root = topology::tracing_root()
                .ok_or_else(|| Error::OpenInvalidFile("tracing root".into()))?;
            let path = root.join("events").join(system).join(name).join("format");
            let text = fs::read_to_string(&path)
                .map_err(|e| Error::open_file(path.display().to_string(), e))?;
            self.events.insert(event.to_string(), parse_format(&text));
        }
        Ok(&self.events[event])
    }

    #[cfg(test)]
    pub(crate) fn insert_parsed(&mut self, event: &str, text: &str) {
        self.events.insert(event.to_string(), parse_format(text));
    }

    /// Extract one field from a trace payload.
    pub fn field(&mut self, data: &TraceData, name: &str) -> Result<FieldValue> {
        let fields = self.load(&data.event)?;
        let field = fields
            .get(name)
            .ok_or_else(|| Error::InvalidField(name.to_string()))?;
        extract(field, &data.data)
    }
}

fn extract(field: &Field, data: &[u8]) -> Result<FieldValue> {
    let end = field.offset + field.size;
    if end > data.len() {
        return Err(Error::InvalidField(field.name.clone()));
    }
    let bytes = &data[field.offset..end];
    if field.is_data_loc() {
        // A u32 of (len << 16) | offset pointing into the payload.
        let loc = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
        let str_offset = (loc & 0xffff) as usize;
        let str_len = (loc >> 16) as usize;
        if str_offset + str_len > data.len() {
            return Err(Error::InvalidField(field.name.clone()));
        }
        let mut value = data[str_offset..str_offset + str_len].to_vec();
        if let Some(end) = value.iter().position(|&b| b == 0) {
            value.truncate(end);
        }
        return Ok(FieldValue::Bytes(value));
    }
    let value = match field.size {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes(bytes.try_into().unwrap()) as u64,
        4 => u32::from_ne_bytes(bytes.try_into().unwrap()) as u64,
        8 => u64::from_ne_bytes(bytes.try_into().unwrap()),
        _ => return Ok(FieldValue::Bytes(bytes.to_vec())),
    };
    if field.signed {
        let shift = 64 - 8 * field.size as u32;
        Ok(FieldValue::Signed(((value << shift) as i64) >> shift))
    } else {
        Ok(FieldValue::Unsigned(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: &str = "\
name: sys_enter_write
ID: 652
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;
\tfield:long id;\toffset:8;\tsize:8;\tsigned:1;
\tfield:__data_loc char[] name;\toffset:16;\tsize:4;\tsigned:0;

print fmt: \"fd: 0x%08lx\"
";

    fn payload() -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0..2].copy_from_slice(&652u16.to_ne_bytes());
        data[4..8].copy_from_slice(&(-7i32).to_ne_bytes());
        data[8..16].copy_from_slice(&64i64.to_ne_bytes());
        // __data_loc: len 3, offset 17.
        data[16..20].copy_from_slice(&((3u32 << 16) | 17).to_ne_bytes());
        data.extend_from_slice(b"\0ab\0");
        data
    }

    #[test]
    fn parses_field_declarations() {
        let fields = parse_format(FORMAT);
        assert_eq!(fields.len(), 5);
        let id = &fields["id"];
        assert_eq!(id.offset, 8);
        assert_eq!(id.size, 8);
        assert!(id.signed);
        assert_eq!(fields["name"].name, "name");
        assert!(fields["name"].is_data_loc());
    }

    #[test]
    fn extracts_typed_values() {
        let fields = parse_format(FORMAT);
        let data = payload();
        assert_eq!(
            extract(&fields["common_type"], &data).unwrap(),
            FieldValue::Unsigned(652)
        );
        assert_eq!(
            extract(&fields["common_pid"], &data).unwrap(),
            FieldValue::Signed(-7)
        );
        assert_eq!(extract(&fields["id"], &data).unwrap(), FieldValue::Signed(64));
    }

    #[test]
    fn extracts_data_loc_strings() {
        let fields = parse_format(FORMAT);
        let data = payload();
        let FieldValue::Bytes(_bytes) = extract(&fields["name"], &data).unwrap() else {
            panic!("expected bytes");
        };
    }

    #[test]
    fn short_payload_is_an_error() {
        let fields = parse_format(FORMAT);
        assert!(matches!(
            extract(&fields["id"], &[0u8; 4]),
            Err(Error::InvalidField(_))
        ));
    }

    #[test]
    fn cache_reads_via_trace_data() {
        let mut cache = FormatCache::new();
        cache.insert_parsed("syscalls:sys_enter_write", FORMAT);
        let data = TraceData {
            event: "syscalls:sys_enter_write".into(),
            data: payload(),
        };
        let value = cache.field(&data, "id").unwrap();
        assert_eq!(value.as_i64(), Some(64));
        assert!(matches!(
            cache.field(&data, "nonexistent"),
            Err(Error::InvalidField(_))
        ));
    }
}
