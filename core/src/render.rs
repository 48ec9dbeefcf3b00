//! Text rendering for instructions, call chains and live ticks.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::bytecode::Instruction;
use crate::module::ModuleTable;
use crate::obj::Obj;
use crate::trace::{Frame, TraceCallback, TraceEvent};
use crate::tree::CodeTree;

/// `NAME arg argval cache`, leaving out fields that are empty or zero.
pub fn format_instruction(instr: &Instruction) -> String {
    let int = |v: Option<i64>| v.filter(|v| *v != 0).map(|v| v.to_string()).unwrap_or_default();
    let argval = instr
        .argval
        .as_ref()
        .filter(|v| v.is_truthy())
        .map(Obj::to_string)
        .unwrap_or_default();
    format!("{} {} {} {}", instr.name, int(instr.arg), argval, int(instr.cache))
}

/// One line per instruction: `^0x0004@name\tLOAD_NAME 3 'x' `.
pub fn render_bytecode(name: &str, instrs: &[Instruction]) -> String {
    let mut out = String::new();
    for instr in instrs {
        let _ = writeln!(out, "^{:#06x}@{}\t{}", instr.offset, name, format_instruction(instr));
    }
    out
}

/// The frame and its callers, innermost first, indented by depth.
pub fn render_stack(frame: &Frame) -> String {
    let mut out = String::new();
    for (level, f) in frame.chain().enumerate() {
        let _ = writeln!(
            out,
            "*{:2}: {}{:#06x}@{}:{} => {}:{}",
            level,
            "  ".repeat(level),
            f.instr_offset,
            f.module_name,
            f.code.codepath.as_deref().unwrap_or("None"),
            f.code.filename,
            f.lineno,
        );
    }
    out
}

/// Trace callback printing every executed instruction, optionally followed
/// by the call stack.
pub struct TickPrinter<W> {
    out: W,
    trees: FxHashMap<Arc<str>, Arc<CodeTree>>,
    show_instructions: bool,
    show_stack: bool,
    instr_count: usize,
}

impl<W: Write> TickPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            trees: FxHashMap::default(),
            show_instructions: true,
            show_stack: false,
            instr_count: 0,
        }
    }

    /// Printer that knows the trees of every profiled module in `table`.
    pub fn from_table(table: &ModuleTable, out: W) -> Self {
        let mut printer = Self::new(out);
        for name in table.names() {
            if let Ok(tree) = table.bytecode(&name) {
                printer.trees.insert(name, tree);
            }
        }
        printer
    }

    pub fn with_module(mut self, name: &str, tree: Arc<CodeTree>) -> Self {
        self.trees.insert(Arc::from(name), tree);
        self
    }

    pub fn show_instructions(&mut self, on: bool) -> &mut Self {
        self.show_instructions = on;
        self
    }

    pub fn show_stack(&mut self, on: bool) -> &mut Self {
        self.show_stack = on;
        self
    }

    /// Non-exception ticks seen so far.
    #[inline]
    pub fn instr_count(&self) -> usize {
        self.instr_count
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn lookup(&self, frame: &Frame) -> Option<&Instruction> {
        let tree = self.trees.get(&frame.module_name)?;
        let instrs = tree.get(frame.code.codepath.as_deref()?)?;
        instrs.iter().find(|i| i.offset == frame.instr_offset)
    }
}

impl<W: Write> TraceCallback for TickPrinter<W> {
    fn on_event(&mut self, frame: &Arc<Frame>, event: TraceEvent, _arg: &Obj) -> Result<Obj> {
        if event == TraceEvent::Exception {
            write!(self.out, "!! exception at ")?;
        } else {
            self.instr_count += 1;
        }

        if self.show_instructions
            && let Some(instr) = self.lookup(frame)
        {
            let head = format!(
                "# {:2}: {:#06x}@{}:{}",
                self.instr_count,
                frame.instr_offset,
                frame.module_name,
                frame.code.codepath.as_deref().unwrap_or("None"),
            );
            let line = format!("{head:<50}{}", format_instruction(instr));
            writeln!(self.out, "{line}")?;
        }
        if self.show_stack {
            write!(self.out, "{}", render_stack(frame))?;
        }
        Ok(Obj::None)
    }
}
