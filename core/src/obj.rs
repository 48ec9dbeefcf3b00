use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::CodeId;

/// Small value model shared by decoded instructions, trace callbacks and the
/// module container.
///
/// Only covers what introspection hands out, not the runtime's object model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Obj {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Obj]>),
    /// Handle of a compiled function (never a raw address).
    Code(CodeId),
    Exception(Arc<ExceptionInfo>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionInfo {
    pub kind: Arc<str>,
    pub message: Arc<str>,
}

impl Obj {
    pub fn str<S: Into<Arc<str>>>(s: S) -> Self {
        Obj::Str(s.into())
    }

    pub fn tuple<I: IntoIterator<Item = Obj>>(items: I) -> Self {
        Obj::Tuple(items.into_iter().collect::<Vec<_>>().into())
    }

    pub fn exception<K, M>(kind: K, message: M) -> Self
    where
        K: Into<Arc<str>>,
        M: Into<Arc<str>>,
    {
        Obj::Exception(Arc::new(ExceptionInfo {
            kind: kind.into(),
            message: message.into(),
        }))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Obj::None)
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Obj::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Obj::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Python truthiness: empty and zero values are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Obj::None => false,
            Obj::Bool(b) => *b,
            Obj::Int(v) => *v != 0,
            Obj::Float(v) => *v != 0.0,
            Obj::Str(s) => !s.is_empty(),
            Obj::Bytes(b) => !b.is_empty(),
            Obj::Tuple(items) => !items.is_empty(),
            Obj::Code(_) | Obj::Exception(_) => true,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Obj]> {
        match self {
            Obj::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl Default for Obj {
    fn default() -> Self {
        Obj::None
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::None => write!(f, "None"),
            Obj::Bool(true) => write!(f, "True"),
            Obj::Bool(false) => write!(f, "False"),
            Obj::Int(v) => write!(f, "{}", v),
            Obj::Float(v) => write!(f, "{:?}", v),
            Obj::Str(s) => write!(f, "'{}'", s),
            Obj::Bytes(b) => {
                write!(f, "b'")?;
                for byte in b.iter() {
                    write!(f, "\\x{:02x}", byte)?;
                }
                write!(f, "'")
            }
            Obj::Tuple(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Obj::Code(id) => write!(f, "<code {}>", id),
            Obj::Exception(exc) => write!(f, "{}('{}')", exc.kind, exc.message),
        }
    }
}
