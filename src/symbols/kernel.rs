//! Kernel symbol index from `/proc/kallsyms`.

use std::fs;

use crate::error::{Error, Result};

/// Userspace addresses never reach this range on the supported targets.
pub const KERNEL_START_ADDR: u64 = 0xffff_0000_0000_0000;

#[derive(Clone, Debug)]
pub struct KernelSym {
    pub addr: u64,
    pub name: String,
}

/// Parse kallsyms text (`<hex addr> <mode> <name>[\t[module]]` per line)
/// into an address-sorted vector.
pub fn parse_kallsyms(data: &[u8]) -> Vec<KernelSym> {
    let mut syms = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let line_end = memchr::memchr(b'\n', rest).unwrap_or(rest.len());
        let line = &rest[..line_end];
        rest = &rest[(line_end + 1).min(rest.len())..];

        let mut fields = line.split(|&b| b == b' ' || b == b'\t').filter(|f| !f.is_empty());
        let (Some(addr), Some(_mode), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(addr) = u64::from_str_radix(&String::from_utf8_lossy(addr), 16) else {
            continue;
        };
        syms.push(KernelSym {
            addr,
            name: String::from_utf8_lossy(name).into_owned(),
        });
    }
    syms.sort_by_key(|s| s.addr);
    syms
}

pub fn read_kallsyms() -> Result<Vec<KernelSym>> {
    let data = fs::read("/proc/kallsyms").map_err(|e| Error::open_file("/proc/kallsyms", e))?;
    Ok(parse_kallsyms(&data))
}

/// Floor lookup: the symbol covering `addr`, if any symbol starts at or
/// below it.
pub fn lookup<'a>(syms: &'a [KernelSym], addr: u64) -> Option<&'a KernelSym> {
    let idx = syms.partition_point(|s| s.addr <= addr);
    if idx == 0 {
        return None;
    }
    Some(&syms[idx - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KALLSYMS: &[u8] = b"\
ffff8000081e0000 T _text
ffff8000081f0000 t bcm2835_handle_irq
ffff8000081f0000 T _stext
ffff8000081f0060 t bcm2836_arm_irqchip_handle_irq
ffff8000081f00e0 t dw_apb_ictl_handle_irq
ffff800001411010 t choose_data_offset\t[raid10]
";

    #[test]
    fn parses_and_sorts() {
        let syms = parse_kallsyms(KALLSYMS);
        assert_eq!(syms.len(), 6);
        // Module symbols below _text sort first.
        assert_eq!(syms[0].name, "choose_data_offset");
        assert_eq!(syms[1].name, "_text");
    }

    #[test]
    fn floor_lookup() {
        let syms = parse_kallsyms(KALLSYMS);
        let sym = lookup(&syms, 0xffff8000081f0070).unwrap();
        assert_eq!(sym.name, "bcm2836_arm_irqchip_handle_irq");
        let sym = lookup(&syms, 0xffff8000081e0004).unwrap();
        assert_eq!(sym.name, "_text");
        assert!(lookup(&syms, 0x1000).is_none());
    }

    #[test]
    fn tolerates_malformed_lines() {
        let syms = parse_kallsyms(b"garbage\nffff800000000000 T ok\n\n");
        assert_eq!(syms.len(), 1);
        assert_eq!(syms[0].name, "ok");
    }
}
