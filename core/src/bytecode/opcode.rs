//! Opcode metadata.
//!
//! Every opcode is described by data: explicit opcodes by an [`OpcodeDef`],
//! condensed opcodes (immediate folded into the opcode byte) by a [`Family`].
//! The 256-entry dispatch table is derived from both lists at compile time,
//! and the derivation refuses to build if two entries claim the same byte or
//! the families leave a hole in the condensed region.

pub const LOAD_CONST_FALSE: u8 = 0x10;
pub const LOAD_CONST_NONE: u8 = 0x11;
pub const LOAD_CONST_TRUE: u8 = 0x12;
pub const LOAD_CONST_SMALL_INT: u8 = 0x14;
pub const LOAD_CONST_STRING: u8 = 0x16;
pub const LOAD_CONST_OBJ: u8 = 0x17;
pub const LOAD_NULL: u8 = 0x18;

pub const LOAD_FAST_N: u8 = 0x19;
pub const LOAD_DEREF: u8 = 0x1a;
pub const LOAD_NAME: u8 = 0x1b;
pub const LOAD_GLOBAL: u8 = 0x1c;
pub const LOAD_ATTR: u8 = 0x1d;
pub const LOAD_METHOD: u8 = 0x1e;
pub const LOAD_SUPER_METHOD: u8 = 0x1f;
pub const LOAD_BUILD_CLASS: u8 = 0x20;
pub const LOAD_SUBSCR: u8 = 0x21;

pub const STORE_FAST_N: u8 = 0x22;
pub const STORE_DEREF: u8 = 0x23;
pub const STORE_NAME: u8 = 0x24;
pub const STORE_GLOBAL: u8 = 0x25;
pub const STORE_ATTR: u8 = 0x26;
pub const STORE_SUBSCR: u8 = 0x27;

pub const DELETE_FAST: u8 = 0x28;
pub const DELETE_DEREF: u8 = 0x29;
pub const DELETE_NAME: u8 = 0x2a;
pub const DELETE_GLOBAL: u8 = 0x2b;

pub const DUP_TOP: u8 = 0x30;
pub const DUP_TOP_TWO: u8 = 0x31;
pub const POP_TOP: u8 = 0x32;
pub const ROT_TWO: u8 = 0x33;
pub const ROT_THREE: u8 = 0x34;

pub const JUMP: u8 = 0x35;
pub const POP_JUMP_IF_TRUE: u8 = 0x36;
pub const POP_JUMP_IF_FALSE: u8 = 0x37;
pub const JUMP_IF_TRUE_OR_POP: u8 = 0x38;
pub const JUMP_IF_FALSE_OR_POP: u8 = 0x39;
pub const SETUP_WITH: u8 = 0x3d;
pub const WITH_CLEANUP: u8 = 0x3e;
pub const SETUP_EXCEPT: u8 = 0x3f;
pub const SETUP_FINALLY: u8 = 0x40;
pub const END_FINALLY: u8 = 0x41;
pub const GET_ITER: u8 = 0x42;
pub const FOR_ITER: u8 = 0x43;
pub const POP_BLOCK: u8 = 0x44;
pub const POP_EXCEPT: u8 = 0x45;
pub const UNWIND_JUMP: u8 = 0x46;
pub const GET_ITER_STACK: u8 = 0x47;

pub const BUILD_TUPLE: u8 = 0x50;
pub const BUILD_LIST: u8 = 0x51;
pub const BUILD_MAP: u8 = 0x53;
pub const STORE_MAP: u8 = 0x54;
pub const BUILD_SET: u8 = 0x56;
pub const STORE_COMP: u8 = 0x57;
pub const BUILD_SLICE: u8 = 0x58;
pub const UNPACK_SEQUENCE: u8 = 0x59;
pub const UNPACK_EX: u8 = 0x5a;

pub const RETURN_VALUE: u8 = 0x5b;
pub const RAISE_VARARGS: u8 = 0x5c;
pub const YIELD_VALUE: u8 = 0x5d;
pub const YIELD_FROM: u8 = 0x5e;

pub const MAKE_FUNCTION: u8 = 0x60;
pub const MAKE_FUNCTION_DEFARGS: u8 = 0x61;
pub const MAKE_CLOSURE: u8 = 0x62;
pub const MAKE_CLOSURE_DEFARGS: u8 = 0x63;
pub const CALL_FUNCTION: u8 = 0x64;
pub const CALL_FUNCTION_VAR_KW: u8 = 0x65;
pub const CALL_METHOD: u8 = 0x66;
pub const CALL_METHOD_VAR_KW: u8 = 0x67;

pub const IMPORT_NAME: u8 = 0x68;
pub const IMPORT_FROM: u8 = 0x69;
pub const IMPORT_STAR: u8 = 0x6a;

pub const LOAD_CONST_SMALL_INT_MULTI: u8 = 0x70;
pub const LOAD_FAST_MULTI: u8 = 0xb0;
pub const STORE_FAST_MULTI: u8 = 0xc0;
pub const UNARY_OP_MULTI: u8 = 0xd0;
pub const BINARY_OP_MULTI: u8 = 0xd7;

/// First byte of the condensed region; every byte from here to `0xff` belongs
/// to exactly one [`Family`].
pub const CONDENSED_START: u8 = LOAD_CONST_SMALL_INT_MULTI;

/// Signed jump labels are stored with this bias added.
pub const SLABEL_BIAS: i64 = 0x8000;

/// Operand layout following the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Unsigned varint.
    Uint,
    /// Signed varint (sign seeded from bit 0x40 of the first byte).
    SmallInt,
    /// 2-byte little-endian qstr.
    Qstr,
    /// Qstr followed by an inline-cache byte when the format enables it.
    QstrCached,
    /// Varint constant-table index resolving to an object.
    Obj,
    /// Varint constant-table index resolving to nested code.
    Code,
    /// Nested code followed by a closed-over count byte.
    Closure,
    /// 16-bit signed label.
    SLabel,
    /// 16-bit unsigned label.
    ULabel,
    /// Signed label followed by an unwind-depth byte.
    UnwindJump,
    /// Varint packing positional (low byte) and keyword (next byte) counts.
    CallArgs,
    /// One raw byte.
    Byte,
}

/// Coarse classification used by the tree builder and the tick hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Plain,
    MakeFunction,
    Call,
    Return,
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeDef {
    pub byte: u8,
    pub name: &'static str,
    pub operand: Operand,
    pub group: Group,
}

/// Contiguous opcode range whose immediate is `byte - zero`.
#[derive(Debug, Clone, Copy)]
pub struct Family {
    pub name: &'static str,
    pub start: u8,
    /// Inclusive.
    pub end: u8,
    pub zero: i64,
}

impl Family {
    #[inline]
    pub const fn contains(&self, byte: u8) -> bool {
        byte >= self.start && byte <= self.end
    }

    #[inline]
    pub const fn immediate(&self, byte: u8) -> i64 {
        byte as i64 - self.zero
    }
}

const fn def(byte: u8, name: &'static str, operand: Operand) -> OpcodeDef {
    OpcodeDef {
        byte,
        name,
        operand,
        group: Group::Plain,
    }
}

const fn grouped(byte: u8, name: &'static str, operand: Operand, group: Group) -> OpcodeDef {
    OpcodeDef {
        byte,
        name,
        operand,
        group,
    }
}

pub const OPCODES: &[OpcodeDef] = &[
    def(LOAD_CONST_FALSE, "LOAD_CONST_FALSE", Operand::None),
    def(LOAD_CONST_NONE, "LOAD_CONST_NONE", Operand::None),
    def(LOAD_CONST_TRUE, "LOAD_CONST_TRUE", Operand::None),
    def(LOAD_CONST_SMALL_INT, "LOAD_CONST_SMALL_INT", Operand::SmallInt),
    def(LOAD_CONST_STRING, "LOAD_CONST_STRING", Operand::Qstr),
    def(LOAD_CONST_OBJ, "LOAD_CONST_OBJ", Operand::Obj),
    def(LOAD_NULL, "LOAD_NULL", Operand::None),
    def(LOAD_FAST_N, "LOAD_FAST_N", Operand::Uint),
    def(LOAD_DEREF, "LOAD_DEREF", Operand::Uint),
    def(LOAD_NAME, "LOAD_NAME", Operand::QstrCached),
    def(LOAD_GLOBAL, "LOAD_GLOBAL", Operand::QstrCached),
    def(LOAD_ATTR, "LOAD_ATTR", Operand::QstrCached),
    def(LOAD_METHOD, "LOAD_METHOD", Operand::Qstr),
    def(LOAD_SUPER_METHOD, "LOAD_SUPER_METHOD", Operand::Qstr),
    def(LOAD_BUILD_CLASS, "LOAD_BUILD_CLASS", Operand::None),
    def(LOAD_SUBSCR, "LOAD_SUBSCR", Operand::None),
    def(STORE_FAST_N, "STORE_FAST_N", Operand::Uint),
    def(STORE_DEREF, "STORE_DEREF", Operand::Uint),
    def(STORE_NAME, "STORE_NAME", Operand::Qstr),
    def(STORE_GLOBAL, "STORE_GLOBAL", Operand::Qstr),
    def(STORE_ATTR, "STORE_ATTR", Operand::QstrCached),
    def(STORE_SUBSCR, "STORE_SUBSCR", Operand::None),
    def(DELETE_FAST, "DELETE_FAST", Operand::Uint),
    def(DELETE_DEREF, "DELETE_DEREF", Operand::Uint),
    def(DELETE_NAME, "DELETE_NAME", Operand::Qstr),
    def(DELETE_GLOBAL, "DELETE_GLOBAL", Operand::Qstr),
    def(DUP_TOP, "DUP_TOP", Operand::None),
    def(DUP_TOP_TWO, "DUP_TOP_TWO", Operand::None),
    def(POP_TOP, "POP_TOP", Operand::None),
    def(ROT_TWO, "ROT_TWO", Operand::None),
    def(ROT_THREE, "ROT_THREE", Operand::None),
    def(JUMP, "JUMP", Operand::SLabel),
    def(POP_JUMP_IF_TRUE, "POP_JUMP_IF_TRUE", Operand::SLabel),
    def(POP_JUMP_IF_FALSE, "POP_JUMP_IF_FALSE", Operand::SLabel),
    def(JUMP_IF_TRUE_OR_POP, "JUMP_IF_TRUE_OR_POP", Operand::SLabel),
    def(JUMP_IF_FALSE_OR_POP, "JUMP_IF_FALSE_OR_POP", Operand::SLabel),
    def(SETUP_WITH, "SETUP_WITH", Operand::ULabel),
    def(WITH_CLEANUP, "WITH_CLEANUP", Operand::None),
    def(SETUP_EXCEPT, "SETUP_EXCEPT", Operand::ULabel),
    def(SETUP_FINALLY, "SETUP_FINALLY", Operand::ULabel),
    def(END_FINALLY, "END_FINALLY", Operand::None),
    def(GET_ITER, "GET_ITER", Operand::None),
    def(FOR_ITER, "FOR_ITER", Operand::ULabel),
    def(POP_BLOCK, "POP_BLOCK", Operand::None),
    def(POP_EXCEPT, "POP_EXCEPT", Operand::None),
    def(UNWIND_JUMP, "UNWIND_JUMP", Operand::UnwindJump),
    def(GET_ITER_STACK, "GET_ITER_STACK", Operand::None),
    def(BUILD_TUPLE, "BUILD_TUPLE", Operand::Uint),
    def(BUILD_LIST, "BUILD_LIST", Operand::Uint),
    def(BUILD_MAP, "BUILD_MAP", Operand::Uint),
    def(STORE_MAP, "STORE_MAP", Operand::None),
    def(BUILD_SET, "BUILD_SET", Operand::Uint),
    def(STORE_COMP, "STORE_COMP", Operand::Uint),
    def(BUILD_SLICE, "BUILD_SLICE", Operand::Uint),
    def(UNPACK_SEQUENCE, "UNPACK_SEQUENCE", Operand::Uint),
    def(UNPACK_EX, "UNPACK_EX", Operand::Uint),
    grouped(RETURN_VALUE, "RETURN_VALUE", Operand::None, Group::Return),
    def(RAISE_VARARGS, "RAISE_VARARGS", Operand::Byte),
    def(YIELD_VALUE, "YIELD_VALUE", Operand::None),
    def(YIELD_FROM, "YIELD_FROM", Operand::None),
    grouped(MAKE_FUNCTION, "MAKE_FUNCTION", Operand::Code, Group::MakeFunction),
    grouped(MAKE_FUNCTION_DEFARGS, "MAKE_FUNCTION_DEFARGS", Operand::Code, Group::MakeFunction),
    grouped(MAKE_CLOSURE, "MAKE_CLOSURE", Operand::Closure, Group::MakeFunction),
    grouped(MAKE_CLOSURE_DEFARGS, "MAKE_CLOSURE_DEFARGS", Operand::Closure, Group::MakeFunction),
    grouped(CALL_FUNCTION, "CALL_FUNCTION", Operand::CallArgs, Group::Call),
    grouped(CALL_FUNCTION_VAR_KW, "CALL_FUNCTION_VAR_KW", Operand::CallArgs, Group::Call),
    grouped(CALL_METHOD, "CALL_METHOD", Operand::CallArgs, Group::Call),
    grouped(CALL_METHOD_VAR_KW, "CALL_METHOD_VAR_KW", Operand::CallArgs, Group::Call),
    def(IMPORT_NAME, "IMPORT_NAME", Operand::Qstr),
    def(IMPORT_FROM, "IMPORT_FROM", Operand::Qstr),
    def(IMPORT_STAR, "IMPORT_STAR", Operand::None),
];

pub const FAMILIES: &[Family] = &[
    Family {
        name: "LOAD_CONST_SMALL_INT",
        start: LOAD_CONST_SMALL_INT_MULTI,
        end: LOAD_FAST_MULTI - 1,
        zero: LOAD_CONST_SMALL_INT_MULTI as i64 + 16,
    },
    Family {
        name: "LOAD_FAST",
        start: LOAD_FAST_MULTI,
        end: STORE_FAST_MULTI - 1,
        zero: LOAD_FAST_MULTI as i64,
    },
    Family {
        name: "STORE_FAST",
        start: STORE_FAST_MULTI,
        end: UNARY_OP_MULTI - 1,
        zero: STORE_FAST_MULTI as i64,
    },
    Family {
        name: "UNARY_OP",
        start: UNARY_OP_MULTI,
        end: BINARY_OP_MULTI - 1,
        zero: UNARY_OP_MULTI as i64,
    },
    Family {
        name: "BINARY_OP",
        start: BINARY_OP_MULTI,
        end: 0xff,
        zero: BINARY_OP_MULTI as i64,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Unknown,
    /// Index into [`OPCODES`].
    Explicit(u8),
    /// Index into [`FAMILIES`].
    Condensed(u8),
}

const fn build_slots() -> [Slot; 256] {
    let mut slots = [Slot::Unknown; 256];

    let mut i = 0;
    while i < OPCODES.len() {
        let byte = OPCODES[i].byte as usize;
        if !matches!(slots[byte], Slot::Unknown) {
            panic!("opcode byte assigned twice");
        }
        if OPCODES[i].byte >= CONDENSED_START {
            panic!("explicit opcode inside the condensed region");
        }
        slots[byte] = Slot::Explicit(i as u8);
        i += 1;
    }

    let mut f = 0;
    while f < FAMILIES.len() {
        let fam = FAMILIES[f];
        let mut byte = fam.start as usize;
        while byte <= fam.end as usize {
            if !matches!(slots[byte], Slot::Unknown) {
                panic!("condensed families overlap");
            }
            slots[byte] = Slot::Condensed(f as u8);
            byte += 1;
        }
        f += 1;
    }

    let mut byte = CONDENSED_START as usize;
    while byte < 256 {
        if !matches!(slots[byte], Slot::Condensed(_)) {
            panic!("condensed region has a gap");
        }
        byte += 1;
    }

    slots
}

static SLOTS: [Slot; 256] = build_slots();

#[inline]
pub fn slot(byte: u8) -> Slot {
    SLOTS[byte as usize]
}

#[inline]
pub fn explicit(byte: u8) -> Option<&'static OpcodeDef> {
    match slot(byte) {
        Slot::Explicit(idx) => Some(&OPCODES[idx as usize]),
        _ => None,
    }
}

#[inline]
pub fn family(byte: u8) -> Option<&'static Family> {
    match slot(byte) {
        Slot::Condensed(idx) => Some(&FAMILIES[idx as usize]),
        _ => None,
    }
}

#[inline]
pub fn group(byte: u8) -> Group {
    explicit(byte).map_or(Group::Plain, |def| def.group)
}

/// Mnemonic for `byte`, if it is a known opcode.
pub fn name(byte: u8) -> Option<&'static str> {
    match slot(byte) {
        Slot::Explicit(idx) => Some(OPCODES[idx as usize].name),
        Slot::Condensed(idx) => Some(FAMILIES[idx as usize].name),
        Slot::Unknown => None,
    }
}

/// Explicit opcode byte for a mnemonic (condensed families are not returned).
pub fn by_name(name: &str) -> Option<u8> {
    OPCODES.iter().find(|def| def.name == name).map(|def| def.byte)
}
