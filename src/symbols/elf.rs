//! ELF function-symbol tables, indexed by start address.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use object::elf::NT_GNU_BUILD_ID;
use object::read::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable};
use object::{ObjectKind, SymbolKind};

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct FuncSym {
    pub addr: u64,
    pub size: u64,
    pub mangled: String,
}

/// Every `STT_FUNC` from `.symtab` and `.dynsym`, sorted by address.
#[derive(Debug)]
pub struct ElfSymbols {
    /// ET_EXEC objects carry absolute addresses; anything else (PIE,
    /// shared objects) is queried relative to the map base.
    pub is_exec: bool,
    syms: Vec<FuncSym>,
}

fn collect_funcs(table: object::read::SymbolTable<'_, '_>, out: &mut Vec<FuncSym>) {
    for sym in table.symbols() {
        if sym.kind() != SymbolKind::Text {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        out.push(FuncSym {
            addr: sym.address(),
            size: sym.size(),
            mangled: name.to_string(),
        });
    }
}

impl ElfSymbols {
    pub fn load(path: &Path) -> Result<ElfSymbols> {
        let file = File::open(path)
            .map_err(|e| Error::open_file(path.display().to_string(), e))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::open_file(path.display().to_string(), e))?;
        let object = object::File::parse(&mmap[..])
            .map_err(|_| Error::ElfFormat(path.display().to_string()))?;

        let is_exec = object.kind() == ObjectKind::Executable;

        let mut syms = Vec::new();
        if let Some(table) = object.symbol_table() {
            collect_funcs(table, &mut syms);
        }
        if let Some(table) = object.dynamic_symbol_table() {
            collect_funcs(table, &mut syms);
        }
        syms.sort_by_key(|s| s.addr);
        syms.dedup_by_key(|s| s.addr);
        Ok(ElfSymbols { is_exec, syms })
    }

    /// The function covering `addr`: the closest preceding symbol, a hit
    /// only if `addr` falls within its recorded size.
    pub fn find(&self, addr: u64) -> Option<&FuncSym> {
        let idx = self.syms.partition_point(|s| s.addr <= addr);
        if idx == 0 {
            return None;
        }
        let sym = &self.syms[idx - 1];
        if addr > sym.addr + sym.size {
            return None;
        }
        Some(sym)
    }

    #[cfg(test)]
    pub(crate) fn from_raw(is_exec: bool, mut syms: Vec<FuncSym>) -> Self {
        syms.sort_by_key(|s| s.addr);
        ElfSymbols { is_exec, syms }
    }
}

/// Demangle a symbol name, Rust first, then C++. `None` when the name is
/// not mangled.
pub fn demangle(mangled: &str) -> Option<String> {
    if let Ok(demangled) = rustc_demangle::try_demangle(mangled) {
        return Some(format!("{demangled:#}"));
    }
    cpp_demangle::Symbol::new(mangled)
        .ok()
        .and_then(|sym| sym.demangle(&cpp_demangle::DemangleOptions::default()).ok())
}

/// Extract the GNU build-id from a note section payload: a sequence of
/// `(namesz, descsz, type)` headers with 4-byte aligned name and desc.
pub fn build_id_from_note(data: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 0usize;
    while pos + 12 <= data.len() {
        let namesz = u32::from_ne_bytes(data[pos..pos + 4].try_into().ok()?) as usize;
        let descsz = u32::from_ne_bytes(data[pos + 4..pos + 8].try_into().ok()?) as usize;
        let kind = u32::from_ne_bytes(data[pos + 8..pos + 12].try_into().ok()?);
        pos += 12;
        let name_end = pos + namesz;
        let desc_start = (name_end + 3) & !3;
        let desc_end = desc_start + descsz;
        if desc_end > data.len() {
            return None;
        }
        let name = &data[pos..name_end];
        if kind == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(data[desc_start..desc_end].to_vec());
        }
        pos = (desc_end + 3) & !3;
    }
    None
}

/// Read the build-id of a module, trying the conventional section names
/// in order.
pub fn read_build_id(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)
        .map_err(|e| Error::open_file(path.display().to_string(), e))?;
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| Error::open_file(path.display().to_string(), e))?;
    let object = object::File::parse(&mmap[..])
        .map_err(|_| Error::ElfFormat(path.display().to_string()))?;
    for section_name in [".note.gnu.build-id", ".notes", ".note"] {
        let Some(section) = object.section_by_name(section_name) else {
            continue;
        };
        let Ok(data) = section.data() else { continue };
        if let Some(build_id) = build_id_from_note(data) {
            return Ok(build_id);
        }
    }
    Err(Error::ElfFormat(path.display().to_string()))
}
