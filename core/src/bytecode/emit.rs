//! Minimal assembler for compiled functions.
//!
//! The real compiler lives outside this crate; this emitter produces the same
//! layout (prelude, line table, cell table, instructions) so that modules can
//! be built for tests, benches and the CLI demo.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};

use crate::config::BytecodeFormat;
use crate::obj::Obj;
use crate::qstr::{Qstr, QstrPool};

use super::line_table::{self, FIRST_LINE};
use super::opcode::{self, Operand};
use super::prelude::LOCALS_TERMINATOR;
use super::raw_code::{ConstEntry, RawCode};
use super::varint::{uint_len, write_sint, write_u16, write_uint};

pub const MODULE_BLOCK_NAME: &str = "<module>";

/// Shared state for all functions of one module: the qstr pool, the source
/// file name and the encoding format.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    qstrs: Arc<QstrPool>,
    source_file: Qstr,
    format: BytecodeFormat,
}

impl ModuleBuilder {
    pub fn new(source_file: &str, format: BytecodeFormat) -> Result<Self> {
        Self::with_pool(Arc::new(QstrPool::new()), source_file, format)
    }

    pub fn with_pool(qstrs: Arc<QstrPool>, source_file: &str, format: BytecodeFormat) -> Result<Self> {
        let source_file = qstrs.intern(source_file)?;
        Ok(Self {
            qstrs,
            source_file,
            format,
        })
    }

    #[inline]
    pub fn qstrs(&self) -> &Arc<QstrPool> {
        &self.qstrs
    }

    #[inline]
    pub fn format(&self) -> BytecodeFormat {
        self.format
    }

    pub fn function(&self, block_name: &str) -> Result<FunctionEmitter> {
        let block_name = self.qstrs.intern(block_name)?;
        Ok(FunctionEmitter {
            qstrs: self.qstrs.clone(),
            format: self.format,
            block_name,
            source_file: self.source_file,
            n_state: 4,
            n_exc_stack: 0,
            scope_flags: 0,
            n_pos_args: 0,
            n_kwonly_args: 0,
            n_def_pos_args: 0,
            cells: Vec::new(),
            code: Vec::new(),
            consts: Vec::new(),
            lines: Vec::new(),
            last_offset: 0,
            last_line: FIRST_LINE,
        })
    }

    pub fn module_function(&self) -> Result<FunctionEmitter> {
        self.function(MODULE_BLOCK_NAME)
    }
}

#[derive(Debug)]
pub struct FunctionEmitter {
    qstrs: Arc<QstrPool>,
    format: BytecodeFormat,
    block_name: Qstr,
    source_file: Qstr,
    n_state: u64,
    n_exc_stack: u64,
    scope_flags: u8,
    n_pos_args: u8,
    n_kwonly_args: u8,
    n_def_pos_args: u8,
    cells: Vec<u8>,
    code: Vec<u8>,
    consts: Vec<ConstEntry>,
    lines: Vec<u8>,
    last_offset: usize,
    last_line: u32,
}

impl FunctionEmitter {
    pub fn state(&mut self, n_state: u64, n_exc_stack: u64) -> &mut Self {
        self.n_state = n_state;
        self.n_exc_stack = n_exc_stack;
        self
    }

    pub fn scope_flags(&mut self, flags: u8) -> &mut Self {
        self.scope_flags = flags;
        self
    }

    /// Declare a positional argument. Argument names must be declared before
    /// any other constant is added since they occupy the first table slots.
    pub fn pos_arg(&mut self, name: &str) -> Result<&mut Self> {
        let n = self.n_pos_args.checked_add(1).context("too many positional arguments")?;
        self.push_arg_name(name)?;
        self.n_pos_args = n;
        Ok(self)
    }

    pub fn kwonly_arg(&mut self, name: &str) -> Result<&mut Self> {
        let n = self.n_kwonly_args.checked_add(1).context("too many keyword-only arguments")?;
        self.push_arg_name(name)?;
        self.n_kwonly_args = n;
        Ok(self)
    }

    pub fn defaults(&mut self, n_def_pos_args: u8) -> &mut Self {
        self.n_def_pos_args = n_def_pos_args;
        self
    }

    fn push_arg_name(&mut self, name: &str) -> Result<()> {
        ensure!(
            self.consts.iter().all(|c| matches!(c, ConstEntry::Qstr(_))),
            "argument names must precede other constants"
        );
        let q = self.qstrs.intern(name)?;
        self.consts.push(ConstEntry::Qstr(q));
        Ok(())
    }

    /// Mark a local slot as a closure cell.
    pub fn cell(&mut self, local: u8) -> Result<&mut Self> {
        ensure!(local != LOCALS_TERMINATOR, "cell index collides with the table terminator");
        self.cells.push(local);
        Ok(self)
    }

    /// Current offset relative to the start of the bytecode.
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Attribute instructions emitted from here on to `line`.
    ///
    /// Lines only move forward; a mark at or before the current line is ignored.
    pub fn line(&mut self, line: u32) -> &mut Self {
        if line <= self.last_line {
            return self;
        }
        let offset = self.offset();
        line_table::encode_delta(
            &mut self.lines,
            offset - self.last_offset,
            (line - self.last_line) as usize,
        );
        self.last_offset = offset;
        self.last_line = line;
        self
    }

    /// Emit an opcode without operands.
    pub fn op(&mut self, byte: u8) -> &mut Self {
        debug_assert_eq!(opcode::explicit(byte).map(|d| d.operand), Some(Operand::None));
        self.code.push(byte);
        self
    }

    pub fn op_uint(&mut self, byte: u8, value: u64) -> &mut Self {
        self.code.push(byte);
        write_uint(&mut self.code, value);
        self
    }

    pub fn op_qstr(&mut self, byte: u8, name: &str) -> Result<&mut Self> {
        let def = opcode::explicit(byte);
        ensure!(
            matches!(def.map(|d| d.operand), Some(Operand::Qstr | Operand::QstrCached)),
            "opcode {:#04x} does not take a name",
            byte
        );
        let q = self.qstrs.intern(name)?;
        self.code.push(byte);
        write_u16(&mut self.code, q);
        if def.map(|d| d.operand) == Some(Operand::QstrCached) && self.format.map_lookup_cache {
            self.code.push(0);
        }
        Ok(self)
    }

    /// Emit a jump. `label` is the decoded value (signed labels are biased here).
    pub fn op_label(&mut self, byte: u8, label: i64) -> Result<&mut Self> {
        let operand = opcode::explicit(byte).map(|d| d.operand);
        let raw = match operand {
            Some(Operand::SLabel | Operand::UnwindJump) => label.checked_add(opcode::SLABEL_BIAS),
            Some(Operand::ULabel) => Some(label),
            _ => anyhow::bail!("opcode {:#04x} is not a jump", byte),
        };
        let raw = raw
            .filter(|raw| (0..=u16::MAX as i64).contains(raw))
            .with_context(|| format!("jump label {} out of range", label))?;
        self.code.push(byte);
        write_u16(&mut self.code, raw as u16);
        Ok(self)
    }

    pub fn unwind_jump(&mut self, label: i64, depth: u8) -> Result<&mut Self> {
        self.op_label(opcode::UNWIND_JUMP, label)?;
        self.code.push(depth);
        Ok(self)
    }

    /// Load a small integer, using the condensed form when it fits.
    pub fn small_int(&mut self, value: i64) -> &mut Self {
        let fam = &opcode::FAMILIES[0];
        let condensed = value
            .checked_add(fam.zero)
            .filter(|byte| (fam.start as i64..=fam.end as i64).contains(byte));
        if let Some(byte) = condensed {
            self.code.push(byte as u8);
        } else {
            self.code.push(opcode::LOAD_CONST_SMALL_INT);
            write_sint(&mut self.code, value);
        }
        self
    }

    pub fn load_const_obj(&mut self, obj: Obj) -> &mut Self {
        let idx = self.consts.len();
        self.consts.push(ConstEntry::Obj(obj));
        self.op_uint(opcode::LOAD_CONST_OBJ, idx as u64)
    }

    pub fn load_fast(&mut self, local: u64) -> &mut Self {
        self.condensed_or(opcode::LOAD_FAST_MULTI, 16, opcode::LOAD_FAST_N, local)
    }

    pub fn store_fast(&mut self, local: u64) -> &mut Self {
        self.condensed_or(opcode::STORE_FAST_MULTI, 16, opcode::STORE_FAST_N, local)
    }

    pub fn unary_op(&mut self, op: u8) -> Result<&mut Self> {
        self.family_op(opcode::UNARY_OP_MULTI, op)
    }

    pub fn binary_op(&mut self, op: u8) -> Result<&mut Self> {
        self.family_op(opcode::BINARY_OP_MULTI, op)
    }

    fn family_op(&mut self, base: u8, op: u8) -> Result<&mut Self> {
        let byte = base.checked_add(op);
        let fam = opcode::family(base);
        ensure!(
            matches!((byte, fam), (Some(b), Some(f)) if f.contains(b)),
            "operator {} out of range for family at {:#04x}",
            op,
            base
        );
        self.code.push(base + op);
        Ok(self)
    }

    fn condensed_or(&mut self, multi: u8, span: u64, long: u8, value: u64) -> &mut Self {
        if value < span {
            self.code.push(multi + value as u8);
            self
        } else {
            self.op_uint(long, value)
        }
    }

    pub fn make_function(&mut self, child: Arc<RawCode>, defargs: bool) -> &mut Self {
        let idx = self.consts.len();
        self.consts.push(ConstEntry::Code(child));
        let byte = if defargs {
            opcode::MAKE_FUNCTION_DEFARGS
        } else {
            opcode::MAKE_FUNCTION
        };
        self.op_uint(byte, idx as u64)
    }

    pub fn make_closure(&mut self, child: Arc<RawCode>, n_closed_over: u8, defargs: bool) -> &mut Self {
        let idx = self.consts.len();
        self.consts.push(ConstEntry::Code(child));
        let byte = if defargs {
            opcode::MAKE_CLOSURE_DEFARGS
        } else {
            opcode::MAKE_CLOSURE
        };
        self.op_uint(byte, idx as u64);
        self.code.push(n_closed_over);
        self
    }

    pub fn call_function(&mut self, n_pos: u8, n_kw: u8) -> &mut Self {
        self.op_uint(opcode::CALL_FUNCTION, u64::from(n_pos) | (u64::from(n_kw) << 8))
    }

    pub fn call_method(&mut self, n_pos: u8, n_kw: u8) -> &mut Self {
        self.op_uint(opcode::CALL_METHOD, u64::from(n_pos) | (u64::from(n_kw) << 8))
    }

    pub fn raise_varargs(&mut self, n: u8) -> &mut Self {
        self.code.push(opcode::RAISE_VARARGS);
        self.code.push(n);
        self
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.op(opcode::RETURN_VALUE)
    }

    /// Append bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Arc<RawCode> {
        let mut info = Vec::with_capacity(self.lines.len() + 8);
        if self.format.persistent_code {
            write_u16(&mut info, self.block_name);
            write_u16(&mut info, self.source_file);
        } else {
            write_uint(&mut info, u64::from(self.block_name));
            write_uint(&mut info, u64::from(self.source_file));
        }
        info.extend_from_slice(&self.lines);
        info.push(0);

        // The size counts its own varint, whose width depends on the size.
        let mut code_info_size = info.len() + 1;
        loop {
            let total = info.len() + uint_len(code_info_size as u64);
            if total == code_info_size {
                break;
            }
            code_info_size = total;
        }

        let mut out = Vec::with_capacity(16 + info.len() + self.cells.len() + self.code.len());
        write_uint(&mut out, self.n_state);
        write_uint(&mut out, self.n_exc_stack);
        out.push(self.scope_flags);
        out.push(self.n_pos_args);
        out.push(self.n_kwonly_args);
        out.push(self.n_def_pos_args);
        write_uint(&mut out, code_info_size as u64);
        out.extend_from_slice(&info);
        out.extend_from_slice(&self.cells);
        out.push(LOCALS_TERMINATOR);
        out.extend_from_slice(&self.code);

        Arc::new(RawCode::new(out, self.consts, self.qstrs, self.format))
    }
}
