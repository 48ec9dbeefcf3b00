//! Interned identifiers ("qstrs").
//!
//! Bytecode refers to names through 16-bit ids. The pool is append-only: ids
//! handed out stay valid for the pool's lifetime, so readers on the tick path
//! only ever take the read lock.

use std::sync::{Arc, RwLock};

use anyhow::{Result, ensure};
use rustc_hash::FxHashMap;

pub type Qstr = u16;

/// Placeholder returned when bytecode references an id the pool never issued.
pub const UNKNOWN_QSTR: &str = "<unknown>";

#[derive(Debug, Default)]
struct PoolInner {
    names: Vec<Arc<str>>,
    by_name: FxHashMap<Arc<str>, Qstr>,
}

#[derive(Debug, Default)]
pub struct QstrPool {
    inner: RwLock<PoolInner>,
}

impl QstrPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool pre-seeded with `names`, ids assigned in order starting at 0.
    pub fn with_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool = Self::new();
        for name in names {
            pool.intern(name.as_ref())?;
        }
        Ok(pool)
    }

    pub fn intern(&self, name: &str) -> Result<Qstr> {
        if let Some(id) = self.lookup(name) {
            return Ok(id);
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = inner.by_name.get(name) {
            return Ok(*id);
        }
        ensure!(inner.names.len() < Qstr::MAX as usize, "qstr pool exhausted");
        let id = inner.names.len() as Qstr;
        let name: Arc<str> = Arc::from(name);
        inner.names.push(name.clone());
        inner.by_name.insert(name, id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<Qstr> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_name.get(name).copied()
    }

    pub fn get(&self, id: Qstr) -> Option<Arc<str>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.names.get(id as usize).cloned()
    }

    /// Like [`QstrPool::get`] but never fails; unknown ids map to [`UNKNOWN_QSTR`].
    pub fn resolve(&self, id: Qstr) -> Arc<str> {
        self.get(id).unwrap_or_else(|| Arc::from(UNKNOWN_QSTR))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all names in id order.
    pub fn names(&self) -> Vec<Arc<str>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).names.clone()
    }
}
