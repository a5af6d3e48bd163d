//! Address normalization against the loaded-module map.
//!
//! Absolute addresses of global state are meaningless in another process:
//! layout randomization moves every module. A [`ModuleMap`] snapshots where
//! modules are loaded so addresses can be carried as module-relative
//! descriptors and resolved again on the other side.
//!
//! The map is an explicit value rather than ambient state, so tests can
//! build synthetic layouts with [`ModuleMap::from_modules`] and exercise
//! resolution failures without spawning processes.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Reserved module name for the main executable image.
///
/// The executable's path differs between installs; descriptors that point
/// into it stay resolvable by using this fixed name instead.
pub const MODULE_SELF: &str = "self";

/// Module-relative form of an address, the relocatable representation
/// stored inside a context image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrDescriptor {
    /// Offset from the module's load base.
    pub offset: u64,
    /// Name of the module the address belongs to.
    pub module: String,
}

/// One loaded module's address span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    name: String,
    base: usize,
    end: usize,
}

impl Module {
    /// Describe a module by name and address span.
    pub fn new(name: impl Into<String>, base: usize, end: usize) -> Module {
        Module {
            name: name.into(),
            base,
            end,
        }
    }

    /// The module's name (basename, or [`MODULE_SELF`] for the executable).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowest mapped address of the module.
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the highest mapped address of the module.
    pub fn end(&self) -> usize {
        self.end
    }
}

/// Snapshot of the modules loaded in a process.
#[derive(Clone, Debug)]
pub struct ModuleMap {
    modules: Vec<Module>,
}

impl ModuleMap {
    /// Snapshot this process's module layout from `/proc/self/maps`.
    pub fn current() -> Result<ModuleMap> {
        let maps = std::fs::read_to_string("/proc/self/maps")?;
        let exe = std::fs::read_link("/proc/self/exe")?;
        let map = Self::parse(&maps, &exe);
        tracing::debug!("module map snapshot: {} modules", map.modules.len());
        Ok(map)
    }

    /// Build a synthetic map, for simulating another process's layout.
    pub fn from_modules(modules: Vec<Module>) -> ModuleMap {
        ModuleMap { modules }
    }

    /// The modules in this snapshot, in address order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Convert an absolute address to its module-relative descriptor.
    pub fn normalize(&self, address: usize) -> Result<AddrDescriptor> {
        for module in &self.modules {
            if address >= module.base && address < module.end {
                return Ok(AddrDescriptor {
                    offset: (address - module.base) as u64,
                    module: module.name.clone(),
                });
            }
        }
        Err(Error::AddressNotResolvable { address })
    }

    /// Convert a descriptor back to an absolute address in this layout.
    pub fn denormalize(&self, descriptor: &AddrDescriptor) -> Result<usize> {
        self.resolve(&descriptor.module, descriptor.offset)
    }

    /// Resolve a module name and offset to an absolute address.
    pub fn resolve(&self, module: &str, offset: u64) -> Result<usize> {
        let found = self
            .modules
            .iter()
            .find(|m| m.name == module)
            .ok_or_else(|| Error::ModuleNotLoaded {
                module: module.to_string(),
            })?;
        let address = found.base.saturating_add(offset as usize);
        if address >= found.end {
            return Err(Error::AddressNotResolvable { address });
        }
        Ok(address)
    }

    /// Parse the text of a maps file.
    ///
    /// File-backed mappings are grouped by path into one span per module.
    /// Anonymous mappings that directly abut a module's mappings extend its
    /// span; zero-initialized globals land in exactly such a mapping.
    /// Named pseudo-mappings (`[heap]`, `[stack]`, ...) break the chain.
    fn parse(maps: &str, exe: &Path) -> ModuleMap {
        let mut modules: Vec<Module> = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();
        // Module index and end address of the previous line, while the
        // lines form one contiguous run.
        let mut tail: Option<(usize, usize)> = None;

        for line in maps.lines() {
            let Some(range) = line.split_whitespace().next() else {
                continue;
            };
            let Some((start, end)) = parse_range(range) else {
                continue;
            };

            if let Some(slash) = line.find('/') {
                let path = line[slash..].trim_end();
                let path = path.strip_suffix(" (deleted)").unwrap_or(path);
                if is_pseudo_file(path) {
                    tail = None;
                    continue;
                }
                let index = match by_path.get(path) {
                    Some(&i) => {
                        let module = &mut modules[i];
                        module.base = module.base.min(start);
                        module.end = module.end.max(end);
                        i
                    }
                    None => {
                        modules.push(Module {
                            name: module_name(path, exe),
                            base: start,
                            end,
                        });
                        by_path.insert(path.to_string(), modules.len() - 1);
                        modules.len() - 1
                    }
                };
                tail = Some((index, end));
            } else if line.split_whitespace().nth(5).is_some() {
                // Named pseudo-mapping.
                tail = None;
            } else if let Some((index, previous_end)) = tail {
                if start == previous_end {
                    modules[index].end = modules[index].end.max(end);
                    tail = Some((index, end));
                } else {
                    tail = None;
                }
            }
        }

        ModuleMap { modules }
    }
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    Some((start, end))
}

/// File-backed mappings that are not loadable modules.
fn is_pseudo_file(path: &str) -> bool {
    path.starts_with("/memfd:") || path.starts_with("/dev/") || path.starts_with("/SYSV")
}

fn module_name(path: &str, exe: &Path) -> String {
    if Path::new(path) == exe {
        return MODULE_SELF.to_string();
    }
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
