use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::bytecode::CodeId;

/// Identity of the code a frame is executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Code {
    pub id: CodeId,
    pub filename: Arc<str>,
    pub name: Arc<str>,
    /// Path in the module's code tree; `None` when the module has no profile.
    pub codepath: Option<Arc<str>>,
}

/// Snapshot of one call's position, rebuilt on every tick.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub code: Code,
    pub lineno: u32,
    /// Offset of the next instruction, relative to the bytecode start.
    pub instr_offset: usize,
    pub module_name: Arc<str>,
    pub back: Option<Arc<Frame>>,
}

impl Frame {
    /// This frame followed by its callers, innermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(self), |f| f.back.as_deref())
    }

    pub fn depth(&self) -> usize {
        self.chain().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEvent {
    Line,
    Call,
    Return,
    Exception,
}

impl TraceEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            TraceEvent::Line => "line",
            TraceEvent::Call => "call",
            TraceEvent::Return => "return",
            TraceEvent::Exception => "exception",
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
