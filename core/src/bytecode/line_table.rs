//! Bytecode offset → source line.
//!
//! Entries come in two widths, selected by the high bit of the first byte:
//!
//! ```text
//! 0b0LLBBBBB            byte delta 0..=31, line delta 0..=3
//! 0b1LLLBBBB LLLLLLLL   byte delta 0..=15, line delta 0..=2047
//! ```
//!
//! A zero byte ends the table.

pub const FIRST_LINE: u32 = 1;

pub const SHORT_MAX_BYTES: usize = 0x1f;
pub const SHORT_MAX_LINES: usize = 0x3;
pub const LONG_MAX_BYTES: usize = 0xf;
pub const LONG_MAX_LINES: usize = 0x7ff;

/// One decoded table entry and its encoded width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub byte_delta: usize,
    pub line_delta: usize,
    pub width: usize,
}

#[inline]
fn entry_at(table: &[u8], pos: usize) -> Option<LineEntry> {
    let c = *table.get(pos)?;
    if c == 0 {
        return None;
    }
    if c & 0x80 == 0 {
        Some(LineEntry {
            byte_delta: (c & 0x1f) as usize,
            line_delta: (c >> 5) as usize,
            width: 1,
        })
    } else {
        let lo = *table.get(pos + 1)?;
        Some(LineEntry {
            byte_delta: (c & 0x0f) as usize,
            line_delta: (((c as usize) << 4) & 0x700) | lo as usize,
            width: 2,
        })
    }
}

/// Iterate the entries of a line table in order.
pub fn entries(table: &[u8]) -> impl Iterator<Item = LineEntry> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        let entry = entry_at(table, pos)?;
        pos += entry.width;
        Some(entry)
    })
}

/// Source line for `offset` bytes into the function's bytecode.
pub fn line_for_offset(table: &[u8], offset: usize) -> u32 {
    let mut remaining = offset;
    let mut line = FIRST_LINE as usize;
    for entry in entries(table) {
        if remaining < entry.byte_delta {
            break;
        }
        remaining -= entry.byte_delta;
        line += entry.line_delta;
    }
    line as u32
}

/// Append the entries needed to advance by `bytes` and `lines`.
///
/// Large deltas are split across several entries. Byte advances are emitted
/// before any line advance so offsets inside the gap keep the old line. A
/// zero/zero step emits nothing since that byte would read as the terminator.
pub fn encode_delta(out: &mut Vec<u8>, mut bytes: usize, mut lines: usize) {
    while bytes > 0 || lines > 0 {
        if bytes <= SHORT_MAX_BYTES && lines <= SHORT_MAX_LINES {
            out.push(((lines as u8) << 5) | bytes as u8);
            return;
        }
        if bytes > LONG_MAX_BYTES {
            let b = bytes.min(SHORT_MAX_BYTES);
            out.push(b as u8);
            bytes -= b;
            continue;
        }
        let l = lines.min(LONG_MAX_LINES);
        out.push(0x80 | (((l >> 8) as u8) << 4) | bytes as u8);
        out.push((l & 0xff) as u8);
        bytes = 0;
        lines -= l;
    }
}
