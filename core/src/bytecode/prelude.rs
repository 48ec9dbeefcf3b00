use crate::config::BytecodeFormat;
use crate::qstr::Qstr;

use super::varint::{read_byte, read_u16, read_uint};

/// Byte that closes the closure-cell (locals) table.
pub const LOCALS_TERMINATOR: u8 = 0xff;

/// View over a function's self-describing header.
///
/// Positions are byte indices into the function's buffer. Nothing here is
/// stored anywhere; it is cheap enough to recompute on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prelude {
    pub n_state: u64,
    pub n_exc_stack: u64,
    pub scope_flags: u8,
    pub n_pos_args: u8,
    pub n_kwonly_args: u8,
    pub n_def_pos_args: u8,
    pub code_info: usize,
    pub code_info_size: usize,
    pub block_name: Qstr,
    pub source_file: Qstr,
    pub line_info: usize,
    pub locals: usize,
    pub bytecode: usize,
}

impl Prelude {
    /// Parse the header at the start of `buf`.
    ///
    /// Each field is only locatable once the previous one has been sized, so
    /// this is a single forward pass. `None` means the buffer ended early.
    pub fn extract(buf: &[u8], format: BytecodeFormat) -> Option<Self> {
        let mut pos = 0usize;
        let n_state = read_uint(buf, &mut pos)?;
        let n_exc_stack = read_uint(buf, &mut pos)?;
        let scope_flags = read_byte(buf, &mut pos)?;
        let n_pos_args = read_byte(buf, &mut pos)?;
        let n_kwonly_args = read_byte(buf, &mut pos)?;
        let n_def_pos_args = read_byte(buf, &mut pos)?;

        let code_info = pos;
        let code_info_size = read_uint(buf, &mut pos)? as usize;

        let (block_name, source_file) = if format.persistent_code {
            (read_u16(buf, &mut pos)?, read_u16(buf, &mut pos)?)
        } else {
            (read_uint(buf, &mut pos)? as Qstr, read_uint(buf, &mut pos)? as Qstr)
        };
        let line_info = pos;

        let locals = code_info.checked_add(code_info_size)?;
        let terminator = buf.get(locals..)?.iter().position(|&b| b == LOCALS_TERMINATOR)?;
        let bytecode = locals + terminator + 1;

        Some(Self {
            n_state,
            n_exc_stack,
            scope_flags,
            n_pos_args,
            n_kwonly_args,
            n_def_pos_args,
            code_info,
            code_info_size,
            block_name,
            source_file,
            line_info,
            locals,
            bytecode,
        })
    }

    /// The delta-encoded line table (up to the end of the code-info block).
    #[inline]
    pub fn line_table<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let end = self.locals.min(buf.len());
        buf.get(self.line_info..end).unwrap_or(&[])
    }

    /// Closure-cell local indices, without the terminator.
    #[inline]
    pub fn cell_locals<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.locals..self.bytecode.saturating_sub(1)).unwrap_or(&[])
    }

    /// Offset of `pos` relative to the start of the bytecode proper.
    #[inline]
    pub fn offset_of(&self, pos: usize) -> usize {
        pos.saturating_sub(self.bytecode)
    }
}
