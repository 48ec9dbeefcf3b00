//! Single-instruction decoder.
//!
//! Bytecode is assumed to be validated by the compiler, so the decoder never
//! reports malformed input as an error: an unknown opcode byte (or an operand
//! running off the end of the buffer) yields `None` and the caller stops.

use serde::ser::{Serialize, SerializeTuple, Serializer};

use crate::obj::Obj;

use super::opcode::{self, Operand, Slot};
use super::raw_code::{ConstEntry, RawCode};
use super::varint::{read_byte, read_sint, read_slabel, read_u16, read_uint, read_ulabel, skip_uint};

/// What one instruction decodes to, before it is placed at an offset/line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOp {
    pub opcode: u8,
    pub name: &'static str,
    pub arg: Option<i64>,
    pub argval: Option<Obj>,
    pub cache: Option<i64>,
    /// Bytes consumed, opcode byte included.
    pub len: usize,
}

/// Immutable instruction record as exposed in a code tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub line: u32,
    pub name: &'static str,
    pub arg: Option<i64>,
    pub argval: Option<Obj>,
    pub cache: Option<i64>,
    pub raw: Box<[u8]>,
}

impl Instruction {
    pub fn new(op: DecodedOp, offset: usize, line: u32, raw: &[u8]) -> Self {
        Self {
            offset,
            line,
            name: op.name,
            arg: op.arg,
            argval: op.argval,
            cache: op.cache,
            raw: raw.into(),
        }
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.raw.first().copied().unwrap_or(0)
    }
}

/// Serialized as the 7-element record existing tooling expects:
/// `(offset, line, name, arg, argval, cache, raw)`.
impl Serialize for Instruction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(7)?;
        tup.serialize_element(&self.offset)?;
        tup.serialize_element(&self.line)?;
        tup.serialize_element(self.name)?;
        tup.serialize_element(&self.arg)?;
        tup.serialize_element(&self.argval)?;
        tup.serialize_element(&self.cache)?;
        tup.serialize_element(&*self.raw)?;
        tup.end()
    }
}

/// Decode the instruction starting at `pos` in `code`'s buffer.
///
/// Returns the decoded op and the position of the next instruction.
pub fn decode_at(code: &RawCode, pos: usize) -> Option<(DecodedOp, usize)> {
    let buf = code.bytecode();
    let byte = *buf.get(pos)?;
    let mut ip = pos + 1;

    let (name, operand) = match opcode::slot(byte) {
        Slot::Unknown => return None,
        Slot::Condensed(idx) => {
            let fam = &opcode::FAMILIES[idx as usize];
            let op = DecodedOp {
                opcode: byte,
                name: fam.name,
                arg: Some(fam.immediate(byte)),
                argval: None,
                cache: None,
                len: 1,
            };
            return Some((op, ip));
        }
        Slot::Explicit(idx) => {
            let def = &opcode::OPCODES[idx as usize];
            (def.name, def.operand)
        }
    };

    let mut arg = None;
    let mut argval = None;
    let mut cache = None;

    match operand {
        Operand::None => {}
        Operand::Uint => arg = Some(read_uint(buf, &mut ip)? as i64),
        Operand::SmallInt => arg = Some(read_sint(buf, &mut ip)?),
        Operand::Qstr | Operand::QstrCached => {
            let qst = read_u16(buf, &mut ip)?;
            arg = Some(i64::from(qst));
            argval = Some(Obj::Str(code.qstrs().resolve(qst)));
            if operand == Operand::QstrCached && code.format().map_lookup_cache {
                cache = Some(i64::from(read_byte(buf, &mut ip)?));
            }
        }
        Operand::Obj => {
            let idx = read_uint(buf, &mut ip)?;
            arg = Some(idx as i64);
            argval = Some(const_value(code, idx as usize));
        }
        Operand::Code | Operand::Closure => {
            let idx = read_uint(buf, &mut ip)?;
            arg = Some(idx as i64);
            argval = Some(const_value(code, idx as usize));
            if operand == Operand::Closure {
                cache = Some(i64::from(read_byte(buf, &mut ip)?));
            }
        }
        Operand::SLabel => arg = Some(read_slabel(buf, &mut ip)?),
        Operand::ULabel => arg = Some(read_ulabel(buf, &mut ip)?),
        Operand::UnwindJump => {
            arg = Some(read_slabel(buf, &mut ip)?);
            cache = Some(i64::from(read_byte(buf, &mut ip)?));
        }
        Operand::CallArgs => {
            let packed = read_uint(buf, &mut ip)?;
            arg = Some((packed & 0xff) as i64);
            cache = Some(((packed >> 8) & 0xff) as i64);
        }
        Operand::Byte => arg = Some(i64::from(read_byte(buf, &mut ip)?)),
    }

    let op = DecodedOp {
        opcode: byte,
        name,
        arg,
        argval,
        cache,
        len: ip - pos,
    };
    Some((op, ip))
}

fn const_value(code: &RawCode, idx: usize) -> Obj {
    match code.consts().get(idx) {
        Some(ConstEntry::Obj(obj)) => obj.clone(),
        Some(ConstEntry::Code(child)) => Obj::Code(child.id()),
        Some(ConstEntry::Qstr(q)) => Obj::Str(code.qstrs().resolve(*q)),
        None => Obj::None,
    }
}

/// Size in bytes of the instruction at `pos`, computed from the operand
/// layout alone by skipping bytes. Kept independent of [`decode_at`] so the
/// two can be checked against each other.
pub fn opcode_size(buf: &[u8], pos: usize, map_lookup_cache: bool) -> Option<usize> {
    let byte = *buf.get(pos)?;
    let operand = match opcode::slot(byte) {
        Slot::Unknown => return None,
        Slot::Condensed(_) => return Some(1),
        Slot::Explicit(idx) => opcode::OPCODES[idx as usize].operand,
    };
    let mut ip = pos + 1;
    match operand {
        Operand::None => {}
        Operand::Uint | Operand::SmallInt | Operand::Obj | Operand::Code | Operand::CallArgs => {
            skip_uint(buf, &mut ip)?
        }
        Operand::Closure => {
            skip_uint(buf, &mut ip)?;
            ip += 1;
        }
        Operand::Qstr | Operand::SLabel | Operand::ULabel => ip += 2,
        Operand::QstrCached => ip += if map_lookup_cache { 3 } else { 2 },
        Operand::UnwindJump => ip += 3,
        Operand::Byte => ip += 1,
    }
    (ip <= buf.len()).then_some(ip - pos)
}
