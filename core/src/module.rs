use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::bytecode::{CodeId, RawCode};
use crate::tree::{CodeTree, ReverseIndex, build_tree};

/// Everything known about a loaded module's code, built once when the module
/// is loaded and read-only afterwards.
#[derive(Debug)]
pub struct ModuleProfile {
    bytecode: Arc<CodeTree>,
    rc_map: ReverseIndex,
    module_fun: Arc<RawCode>,
}

impl ModuleProfile {
    /// Decode `module_fun` and every function nested in it.
    pub fn parse(module_fun: Arc<RawCode>) -> Self {
        let (tree, rc_map) = build_tree(&module_fun);
        Self {
            bytecode: Arc::new(tree),
            rc_map,
            module_fun,
        }
    }

    #[inline]
    pub fn bytecode(&self) -> &Arc<CodeTree> {
        &self.bytecode
    }

    #[inline]
    pub fn reverse_index(&self) -> &ReverseIndex {
        &self.rc_map
    }

    #[inline]
    pub fn module_fun(&self) -> &Arc<RawCode> {
        &self.module_fun
    }

    #[inline]
    pub fn path_of(&self, id: CodeId) -> Option<&Arc<str>> {
        self.rc_map.get(id)
    }
}

/// A module's global namespace, reduced to what introspection needs.
#[derive(Debug)]
pub struct Namespace {
    name: Arc<str>,
    profile: RwLock<Option<Arc<ModuleProfile>>>,
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            profile: RwLock::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn profile(&self) -> Option<Arc<ModuleProfile>> {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Attach (or replace) the module's profile.
    pub fn attach(&self, profile: Arc<ModuleProfile>) {
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = Some(profile);
    }

    /// Tree path of `id`, if this namespace has a profile that knows it.
    pub fn path_of(&self, id: CodeId) -> Option<Arc<str>> {
        let guard = self.profile.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref()?.path_of(id).cloned()
    }
}

/// Loaded modules by name.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: FxHashMap<Arc<str>, Arc<Namespace>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace for `name`, created empty on first use.
    pub fn namespace(&mut self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.modules.get(name) {
            return ns.clone();
        }
        let ns = Arc::new(Namespace::new(name));
        self.modules.insert(ns.name().clone(), ns.clone());
        ns
    }

    /// Build the profile for `module_fun` and attach it to module `name`.
    pub fn load_module(&mut self, name: &str, module_fun: Arc<RawCode>) -> Arc<Namespace> {
        let ns = self.namespace(name);
        let profile = ModuleProfile::parse(module_fun);
        debug!(
            target: "bctrace::module",
            module = name,
            functions = profile.bytecode().len(),
            "module.profile_attached"
        );
        ns.attach(Arc::new(profile));
        ns
    }

    pub fn get(&self, name: &str) -> Result<Arc<Namespace>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Module '{}' not found", name))
    }

    /// Instruction tree of module `name`.
    pub fn bytecode(&self, name: &str) -> Result<Arc<CodeTree>> {
        let ns = self.get(name)?;
        let profile = ns
            .profile()
            .ok_or_else(|| anyhow!("Module '{}' has no bytecode profile", name))?;
        Ok(profile.bytecode().clone())
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
