//! Symbol and stack resolution: kernel index, per-pid module maps, ELF
//! symbol tables, DWARF line info and the deduplicated call-stack forest.
//!
//! All state is owned by the session's [`Resolver`]; there is no
//! process-wide symbol cache. Frames and symbols live in arenas and are
//! referenced by 32-bit ids; the whole graph is freed by dropping the
//! resolver.

mod dwarf;
mod elf;
mod kernel;
mod maps;

pub use elf::demangle;
pub use kernel::KERNEL_START_ADDR;
pub use maps::ModuleSegment;

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::error::{Result, Warning};

pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";
pub const KERNEL_MODULE: &str = "[kernel]";

/// How much symbol information to attach to samples.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SymbolMode {
    /// No resolution; records carry raw ips only.
    #[default]
    None,
    /// Function names from ELF symbol tables.
    Elf,
    /// ELF plus source file and line from DWARF.
    ElfDwarf,
}

pub type SymbolId = u32;
pub type FrameId = u32;

#[derive(Clone, Debug)]
pub struct Symbol {
    /// The raw instruction pointer the symbol was resolved for.
    pub addr: u64,
    /// Module-relative start and end of the covering function, zero when
    /// unresolved.
    pub code_start: u64,
    pub code_end: u64,
    pub offset: u64,
    pub name: String,
    pub mangled: String,
    pub module: String,
    pub file: String,
    pub line: u32,
}

impl Symbol {
    fn unknown(addr: u64) -> Symbol {
        Symbol {
            addr,
            code_start: 0,
            code_end: 0,
            offset: 0,
            name: UNKNOWN_SYMBOL.into(),
            mangled: UNKNOWN_SYMBOL.into(),
            module: UNKNOWN_SYMBOL.into(),
            file: UNKNOWN_SYMBOL.into(),
            line: 0,
        }
    }
}

/// One stack frame; `next` points from callee toward caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame {
    pub symbol: SymbolId,
    pub next: Option<FrameId>,
}

pub struct Resolver {
    mode: SymbolMode,
    kernel: Vec<kernel::KernelSym>,
    module_maps: FxHashMap<i32, Vec<ModuleSegment>>,
    elf: FxHashMap<String, Option<Arc<elf::ElfSymbols>>>,
    dwarf: dwarf::DwarfCache,
    symbols: Vec<Symbol>,
    symbol_cache: FxHashMap<(i32, u64), SymbolId>,
    frames: Vec<Frame>,
    stack_cache: FxHashMap<i32, FxHashMap<String, FrameId>>,
    warnings: Vec<Warning>,
}

impl Resolver {
    pub fn new(mode: SymbolMode) -> Resolver {
        Resolver {
            mode,
            kernel: Vec::new(),
            module_maps: FxHashMap::default(),
            elf: FxHashMap::default(),
            dwarf: dwarf::DwarfCache::default(),
            symbols: Vec::new(),
            symbol_cache: FxHashMap::default(),
            frames: Vec::new(),
            stack_cache: FxHashMap::default(),
            warnings: Vec::new(),
        }
    }

    pub fn mode(&self) -> SymbolMode {
        self.mode
    }

    /// Build the kernel symbol index once per resolver.
    pub fn record_kernel(&mut self) -> Result<()> {
        if self.mode == SymbolMode::None || !self.kernel.is_empty() {
            return Ok(());
        }
        self.kernel = kernel::read_kallsyms()?;
        debug!("kernel index: {} symbols", self.kernel.len());
        Ok(())
    }

    /// Record the module map of a pid once; later calls are no-ops.
    pub fn record_module(&mut self, pid: i32) -> Result<()> {
        if self.mode == SymbolMode::None || pid <= 0 || self.module_maps.contains_key(&pid) {
            return Ok(());
        }
        let segments = maps::read_pid_maps(pid)?;
        debug!("pid {pid}: {} executable segments", segments.len());
        self.module_maps.insert(pid, segments);
        Ok(())
    }

    /// Refresh a pid's map, registering only segments that appeared since
    /// the last scan.
    pub fn update_module(&mut self, pid: i32) -> Result<()> {
        if self.mode == SymbolMode::None || pid <= 0 {
            return Ok(());
        }
        let Some(old) = self.module_maps.get(&pid) else {
            return self.record_module(pid);
        };
        let new = maps::read_pid_maps(pid)?;
        if new.len() <= old.len() {
            return Ok(());
        }
        let fresh = maps::diff_segments(old, &new);
        let segments = self.module_maps.get_mut(&pid).expect("checked above");
        segments.extend(fresh);
        segments.sort_by_key(|s| s.start);
        Ok(())
    }

    /// Register one segment pushed by an MMAP record; cheaper than a full
    /// rescan on every sample.
    pub fn register_segment(&mut self, pid: i32, path: &str, start: u64) {
        if self.mode == SymbolMode::None || pid <= 0 || !path.starts_with('/') {
            return;
        }
        let segments = self.module_maps.entry(pid).or_default();
        if segments.iter().any(|s| s.start == start) {
            return;
        }
        segments.push(ModuleSegment {
            start,
            end: u64::MAX,
            path: path.to_string(),
        });
        segments.sort_by_key(|s| s.start);
    }

    pub fn purge_pid(&mut self, pid: i32) {
        self.module_maps.remove(&pid);
        self.stack_cache.remove(&pid);
        self.symbol_cache.retain(|&(p, _), _| p != pid);
    }

    fn elf_for(&mut self, path: &str) -> Option<Arc<elf::ElfSymbols>> {
        if let Some(cached) = self.elf.get(path) {
            return cached.clone();
        }
        let loaded = match elf::ElfSymbols::load(Path::new(path)) {
            Ok(syms) => Some(Arc::new(syms)),
            Err(err) => {
                debug!("no ELF symbols for {path}: {err}");
                None
            }
        };
        self.elf.insert(path.to_string(), loaded.clone());
        loaded
    }

    fn resolve_kernel(&mut self, ip: u64) -> Symbol {
        match kernel::lookup(&self.kernel, ip) {
            Some(sym) => Symbol {
                addr: ip,
                code_start: sym.addr,
                code_end: 0,
                offset: ip - sym.addr,
                name: sym.name.clone(),
                mangled: sym.name.clone(),
                module: KERNEL_MODULE.into(),
                file: KERNEL_MODULE.into(),
                line: 0,
            },
            None => {
                let mut unknown = Symbol::unknown(ip);
                unknown.module = KERNEL_MODULE.into();
                unknown.file = KERNEL_MODULE.into();
                unknown
            }
        }
    }

    fn resolve_user(&mut self, pid: i32, ip: u64) -> Symbol {
        let Some(segment) = self
            .module_maps
            .get(&pid)
            .and_then(|segments| maps::segment_for(segments, ip))
            .cloned()
        else {
            return Symbol::unknown(ip);
        };

        let mut symbol = Symbol::unknown(ip);
        symbol.module = segment.path.clone();

        let Some(elf) = self.elf_for(&segment.path) else {
            return symbol;
        };
        // PIE and shared objects are mapped at an arbitrary base; their
        // tables are keyed by module-relative addresses.
        let lookup_addr = if elf.is_exec { ip } else { ip - segment.start };
        if let Some(func) = elf.find(lookup_addr) {
            symbol.code_start = func.addr;
            symbol.code_end = func.addr + func.size;
            symbol.offset = lookup_addr - func.addr;
            symbol.mangled = func.mangled.clone();
            symbol.name = elf::demangle(&func.mangled).unwrap_or_else(|| func.mangled.clone());
        }

        if self.mode == SymbolMode::ElfDwarf {
            let module = self.dwarf.module(&segment.path);
            match module.find_line(lookup_addr) {
                Ok(Some(line)) => {
                    symbol.file = line.file;
                    symbol.line = line.line;
                }
                Ok(None) => {}
                Err(_) => self.warnings.push(Warning::DwarfLoadFailed {
                    module: segment.path.clone(),
                }),
            }
        }
        symbol
    }

    /// Resolve one instruction pointer, caching per `(pid, ip)`.
    pub fn map_addr(&mut self, pid: i32, ip: u64) -> SymbolId {
        if let Some(&id) = self.symbol_cache.get(&(pid, ip)) {
            return id;
        }
        let symbol = if ip >= KERNEL_START_ADDR {
            self.resolve_kernel(ip)
        } else {
            self.resolve_user(pid, ip)
        };
        let id = self.symbols.len() as SymbolId;
        self.symbols.push(symbol);
        self.symbol_cache.insert((pid, ip), id);
        id
    }

    /// Deduplicate a raw ip chain into the shared frame forest. Two calls
    /// with the same chain return the same head frame id.
    pub fn stack_to_frame(&mut self, pid: i32, ips: &[u64]) -> Option<FrameId> {
        if ips.is_empty() {
            return None;
        }
        let mut key = String::with_capacity(ips.len() * 12);
        for ip in ips {
            let _ = write!(key, "{ip}");
        }
        if let Some(&head) = self.stack_cache.get(&pid).and_then(|m| m.get(&key)) {
            return Some(head);
        }
        // Build caller-first so callee frames can link outward.
        let mut next: Option<FrameId> = None;
        for &ip in ips.iter().rev() {
            let symbol = self.map_addr(pid, ip);
            let id = self.frames.len() as FrameId;
            self.frames.push(Frame { symbol, next });
            next = Some(id);
        }
        let head = next.expect("non-empty chain produces a head");
        self.stack_cache.entry(pid).or_default().insert(key, head);
        Some(head)
    }

    /// Make sure a pid's modules are known, then resolve its stack.
    pub fn hydrate(&mut self, pid: i32, ips: &[u64]) -> Option<FrameId> {
        if self.mode == SymbolMode::None {
            return None;
        }
        let _ = self.record_module(pid);
        self.stack_to_frame(pid, ips)
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id as usize]
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id as usize]
    }

    /// The symbols of one stack, top of stack first.
    pub fn stack_symbols(&self, head: FrameId) -> Vec<&Symbol> {
        let mut out = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let frame = self.frame(id);
            out.push(self.symbol(frame.symbol));
            cursor = frame.next;
        }
        out
    }

    /// Read a module's GNU build-id. Values longer than the conventional
    /// 20 bytes are returned with a warning.
    pub fn build_id(&mut self, module: &str) -> Result<Vec<u8>> {
        let id = elf::read_build_id(Path::new(module))?;
        if id.len() > 20 {
            self.warnings.push(Warning::BuildIdTooLong {
                module: module.to_string(),
                len: id.len(),
            });
        }
        Ok(id)
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    #[cfg(test)]
    pub(crate) fn install_test_state(
        &mut self,
        pid: i32,
        segments: Vec<ModuleSegment>,
        kernel: Vec<(u64, &str)>,
    ) {
        self.module_maps.insert(pid, segments);
        self.kernel = kernel
            .into_iter()
            .map(|(addr, name)| kernel::KernelSym {
                addr,
                name: name.to_string(),
            })
            .collect();
        self.kernel.sort_by_key(|s| s.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        let mut r = Resolver::new(SymbolMode::Elf);
        r.install_test_state(
            42,
            vec![ModuleSegment {
                start: 0x10000,
                end: 0x20000,
                path: "/no/such/module.so".into(),
            }],
            vec![
                (0xffff_8000_0000_0000, "_text"),
                (0xffff_8000_0000_1000, "vfs_read"),
            ],
        );
        r
    }

    #[test]
    fn identical_chains_share_one_head() {
        let mut r = resolver();
        let ips = [0x10100u64, 0x10200, 0x10300];
        let a = r.stack_to_frame(42, &ips).unwrap();
        let b = r.stack_to_frame(42, &ips).unwrap();
        assert_eq!(a, b);
        // A different chain gets a different head.
        let c = r.stack_to_frame(42, &ips[..2]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn frames_link_callee_to_caller() {
        let mut r = resolver();
        let ips = [0x10100u64, 0x10200, 0x10300];
        let head = r.stack_to_frame(42, &ips).unwrap();
        let stack = r.stack_symbols(head);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0].addr, 0x10100);
        assert_eq!(stack[2].addr, 0x10300);
    }

    #[test]
    fn kernel_addresses_use_the_kernel_index() {
        let mut r = resolver();
        let id = r.map_addr(42, 0xffff_8000_0000_1040);
        let sym = r.symbol(id);
        assert_eq!(sym.name, "vfs_read");
        assert_eq!(sym.offset, 0x40);
        assert_eq!(sym.module, KERNEL_MODULE);
        assert_eq!(sym.file, KERNEL_MODULE);
    }

    #[test]
    fn unmapped_address_resolves_unknown() {
        let mut r = resolver();
        let id = r.map_addr(42, 0x1234);
        let sym = r.symbol(id);
        assert_eq!(sym.name, UNKNOWN_SYMBOL);
        assert_eq!(sym.addr, 0x1234);
    }

    #[test]
    fn mapped_module_without_elf_keeps_module_name() {
        let mut r = resolver();
        let id = r.map_addr(42, 0x10500);
        let sym = r.symbol(id);
        assert_eq!(sym.module, "/no/such/module.so");
        assert_eq!(sym.name, UNKNOWN_SYMBOL);
    }

    #[test]
    fn map_addr_caches_per_pid_and_ip() {
        let mut r = resolver();
        let a = r.map_addr(42, 0x10500);
        let b = r.map_addr(42, 0x10500);
        assert_eq!(a, b);
        let c = r.map_addr(43, 0x10500);
        assert_ne!(a, c);
    }

    #[test]
    fn register_segment_is_idempotent_per_start() {
        let mut r = Resolver::new(SymbolMode::Elf);
        r.register_segment(7, "/lib/a.so", 0x1000);
        r.register_segment(7, "/lib/a.so", 0x1000);
        r.register_segment(7, "[vdso]", 0x9000);
        assert_eq!(r.module_maps.get(&7).unwrap().len(), 1);
    }

    #[test]
    fn none_mode_resolves_nothing() {
        let mut r = Resolver::new(SymbolMode::None);
        assert!(r.hydrate(42, &[0x1000]).is_none());
    }
}
