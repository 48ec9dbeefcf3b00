use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::config::BytecodeFormat;
use crate::obj::Obj;
use crate::qstr::{Qstr, QstrPool};

use super::prelude::Prelude;

/// Stable handle of a compiled function, assigned once when it is loaded.
///
/// Used wherever the runtime would otherwise key on the bytecode's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CodeId(u32);

static NEXT_CODE_ID: AtomicU32 = AtomicU32::new(1);

impl CodeId {
    pub fn next() -> Self {
        CodeId(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One constant-table slot.
#[derive(Debug, Clone)]
pub enum ConstEntry {
    /// Argument names occupy the first slots of the table.
    Qstr(Qstr),
    Obj(Obj),
    Code(Arc<RawCode>),
}

/// A compiled function as handed over by the compiler: prelude + bytecode in
/// one buffer, plus the constant table the bytecode indexes into.
#[derive(Debug)]
pub struct RawCode {
    id: CodeId,
    bytecode: Box<[u8]>,
    consts: Box<[ConstEntry]>,
    qstrs: Arc<QstrPool>,
    format: BytecodeFormat,
}

impl RawCode {
    pub fn new(bytecode: Vec<u8>, consts: Vec<ConstEntry>, qstrs: Arc<QstrPool>, format: BytecodeFormat) -> Self {
        Self {
            id: CodeId::next(),
            bytecode: bytecode.into_boxed_slice(),
            consts: consts.into_boxed_slice(),
            qstrs,
            format,
        }
    }

    #[inline]
    pub fn id(&self) -> CodeId {
        self.id
    }

    /// The whole buffer, prelude included. Its length is the declared byte
    /// length of the function.
    #[inline]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[inline]
    pub fn consts(&self) -> &[ConstEntry] {
        &self.consts
    }

    #[inline]
    pub fn qstrs(&self) -> &Arc<QstrPool> {
        &self.qstrs
    }

    #[inline]
    pub fn format(&self) -> BytecodeFormat {
        self.format
    }

    #[inline]
    pub fn prelude(&self) -> Option<Prelude> {
        Prelude::extract(&self.bytecode, self.format)
    }

    pub fn const_code(&self, idx: usize) -> Option<&Arc<RawCode>> {
        match self.consts.get(idx)? {
            ConstEntry::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Nested functions referenced from this function's constant table.
    pub fn children(&self) -> impl Iterator<Item = &Arc<RawCode>> {
        self.consts.iter().filter_map(|entry| match entry {
            ConstEntry::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn block_name(&self) -> Option<Arc<str>> {
        self.prelude().map(|p| self.qstrs.resolve(p.block_name))
    }
}
