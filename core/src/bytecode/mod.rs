//! Bytecode reading: opcode metadata, the single-instruction decoder, the
//! function prelude and the line table.

mod decode;
mod emit;
pub mod line_table;
pub mod opcode;
mod prelude;
mod raw_code;
pub mod varint;

pub use decode::*;
pub use emit::*;
pub use prelude::*;
pub use raw_code::*;
