//! DWARF line lookup, one lazily built context per module.
//!
//! Context construction parses the object and the debug section headers;
//! compilation units are only examined when a lookup walks into their
//! address ranges, so a module that is never hit stays cheap.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// `(file, line)` for a module-relative address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
}

enum LoadState {
    Unloaded,
    Loaded(addr2line::Loader),
    Failed,
}

/// One module's line table, built on first use under its own lock.
pub struct ModuleLines {
    path: String,
    state: Mutex<LoadState>,
}

impl ModuleLines {
    fn new(path: &str) -> Self {
        ModuleLines {
            path: path.to_string(),
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    /// Look up the line for `addr`. The first call loads the module; a
    /// load failure is remembered and surfaces as an error exactly once.
    pub fn find_line(&self, addr: u64) -> Result<Option<LineInfo>> {
        let mut state = self.state.lock();
        if let LoadState::Unloaded = *state {
            match addr2line::Loader::new(Path::new(&self.path)) {
                Ok(loader) => *state = LoadState::Loaded(loader),
                Err(_) => {
                    *state = LoadState::Failed;
                    return Err(Error::DwarfFormat(self.path.clone()));
                }
            }
        }
        let LoadState::Loaded(loader) = &*state else {
            return Ok(None);
        };
        let Ok(Some(location)) = loader.find_location(addr) else {
            return Ok(None);
        };
        Ok(location.file.map(|file| LineInfo {
            file: file.to_string(),
            line: location.line.unwrap_or(0),
        }))
    }
}

/// The per-module cache. Modules are registered when the module map sees
/// them and loaded when the first address asks for a line.
#[derive(Default)]
pub struct DwarfCache {
    modules: Mutex<HashMap<String, Arc<ModuleLines>>>,
}

impl DwarfCache {
    pub fn module(&self, path: &str) -> Arc<ModuleLines> {
        let mut modules = self.modules.lock();
        modules
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(ModuleLines::new(path)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_fails_once_then_goes_quiet() {
        let cache = DwarfCache::default();
        let module = cache.module("/no/such/module.so");
        assert!(matches!(
            module.find_line(0x1000),
            Err(Error::DwarfFormat(_))
        ));
        // Subsequent lookups miss without re-reporting.
        assert!(matches!(module.find_line(0x1000), Ok(None)));
    }

    #[test]
    fn cache_hands_out_shared_modules() {
        let cache = DwarfCache::default();
        let a = cache.module("/lib/x.so");
        let b = cache.module("/lib/x.so");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn own_test_binary_has_line_info() {
        // The test executable is built with debug info; its own code must
        // resolve to some file somewhere.
        let exe = std::env::current_exe().unwrap();
        let cache = DwarfCache::default();
        let module = cache.module(exe.to_str().unwrap());
        // Any address may miss, but loading must succeed (no DwarfFormat).
        assert!(module.find_line(0x1000).is_ok());
    }
}
