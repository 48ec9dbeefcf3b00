//! Integer encodings used by preludes and instruction operands.
//!
//! Readers advance `pos` past what they consumed and return `None` when the
//! buffer ends mid-value. Writers are used by the emitter.

use super::opcode::SLABEL_BIAS;

/// Unsigned varint: 7-bit groups, most significant first, high bit = more.
#[inline]
pub fn read_uint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value: u64 = 0;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
}

/// Signed varint as used by `LOAD_CONST_SMALL_INT`.
#[inline]
pub fn read_sint(buf: &[u8], pos: &mut usize) -> Option<i64> {
    let first = *buf.get(*pos)?;
    let mut value: i64 = if first & 0x40 != 0 { -1 } else { 0 };
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value = value.wrapping_shl(7) | i64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
}

#[inline]
pub fn read_u16(buf: &[u8], pos: &mut usize) -> Option<u16> {
    let lo = *buf.get(*pos)?;
    let hi = *buf.get(*pos + 1)?;
    *pos += 2;
    Some(u16::from(lo) | (u16::from(hi) << 8))
}

#[inline]
pub fn read_byte(buf: &[u8], pos: &mut usize) -> Option<u8> {
    let byte = *buf.get(*pos)?;
    *pos += 1;
    Some(byte)
}

#[inline]
pub fn read_ulabel(buf: &[u8], pos: &mut usize) -> Option<i64> {
    read_u16(buf, pos).map(i64::from)
}

#[inline]
pub fn read_slabel(buf: &[u8], pos: &mut usize) -> Option<i64> {
    read_u16(buf, pos).map(|raw| i64::from(raw) - SLABEL_BIAS)
}

/// Skip one varint without decoding it.
#[inline]
pub fn skip_uint(buf: &[u8], pos: &mut usize) -> Option<()> {
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if byte & 0x80 == 0 {
            return Some(());
        }
    }
}

pub fn write_uint(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.push(groups[n] | 0x80);
    }
    out.push(groups[0]);
}

pub fn uint_len(value: u64) -> usize {
    let mut buf = Vec::with_capacity(10);
    write_uint(&mut buf, value);
    buf.len()
}

pub fn write_sint(out: &mut Vec<u8>, value: i64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rest = value;
    loop {
        groups[n] = (rest & 0x7f) as u8;
        n += 1;
        rest >>= 7;
        // Stop once the remaining bits are pure sign and the top group's 0x40
        // bit already reproduces that sign on decode.
        let sign_ok = (groups[n - 1] & 0x40 != 0) == (value < 0);
        if (rest == 0 || rest == -1) && sign_ok {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.push(groups[n] | 0x80);
    }
    out.push(groups[0]);
}

pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}
