//! A small compiled program used by the CLI `demo` command and the benches.

use std::sync::Arc;

use anyhow::{Result, ensure};

use crate::bytecode::opcode::{
    BUILD_LIST, FOR_ITER, GET_ITER, JUMP, LOAD_CONST_NONE, LOAD_CONST_STRING, LOAD_GLOBAL, LOAD_NAME,
    POP_JUMP_IF_FALSE, POP_TOP, STORE_COMP, STORE_NAME, YIELD_VALUE,
};
use crate::bytecode::{FunctionEmitter, ModuleBuilder, RawCode};
use crate::config::BytecodeFormat;

pub const DEMO_FILE: &str = "demo.py";

/// Source the demo module is compiled from.
pub const DEMO_SOURCE: &str = r#"def factorial(n):
    if n == 0:
        return 1
    else:
        return n * factorial(n - 1)

def factorials_up_to(x):
    a = 1
    for i in range(1, x + 1):
        a *= i
        yield a

print("squares", [x ** 2 for x in range(10)])
print("cubes", [x ** 3 for x in range(10)])
print("factorial =>", factorial(4))
"#;

const BINOP_EQUAL: u8 = 2;
const BINOP_INPLACE_MULTIPLY: u8 = 16;
const BINOP_ADD: u8 = 27;
const BINOP_SUBTRACT: u8 = 28;
const BINOP_MULTIPLY: u8 = 29;
const BINOP_POWER: u8 = 34;

const SCOPE_GENERATOR: u8 = 0x01;

/// Width of a jump instruction: opcode plus 16-bit label.
const JUMP_LEN: usize = 3;

/// Compile [`DEMO_SOURCE`] and return its module function.
pub fn demo_module(format: BytecodeFormat) -> Result<Arc<RawCode>> {
    let mb = ModuleBuilder::new(DEMO_FILE, format)?;
    let factorial = factorial(&mb)?;
    let gen_fn = factorials_up_to(&mb)?;
    let squares = listcomp(&mb, 13, 2)?;
    let cubes = listcomp(&mb, 14, 3)?;

    let mut f = mb.module_function()?;
    f.make_function(factorial, false);
    f.op_qstr(STORE_NAME, "factorial")?;
    f.line(7).make_function(gen_fn, false);
    f.op_qstr(STORE_NAME, "factorials_up_to")?;

    for (line, label, comp) in [(13, "squares", squares), (14, "cubes", cubes)] {
        f.line(line);
        f.op_qstr(LOAD_NAME, "print")?;
        f.op_qstr(LOAD_CONST_STRING, label)?;
        f.make_function(comp, false);
        f.op_qstr(LOAD_NAME, "range")?;
        f.small_int(10).call_function(1, 0).op(GET_ITER).call_function(1, 0);
        f.call_function(2, 0).op(POP_TOP);
    }

    f.line(15);
    f.op_qstr(LOAD_NAME, "print")?;
    f.op_qstr(LOAD_CONST_STRING, "factorial =>")?;
    f.op_qstr(LOAD_NAME, "factorial")?;
    f.small_int(4).call_function(1, 0).call_function(2, 0).op(POP_TOP);
    f.op(LOAD_CONST_NONE).return_value();
    Ok(f.finish())
}

fn factorial(mb: &ModuleBuilder) -> Result<Arc<RawCode>> {
    let mut f = mb.function("factorial")?;
    f.pos_arg("n")?.state(5, 0);
    f.line(2).load_fast(0).small_int(0).binary_op(BINOP_EQUAL)?;
    // Skips `return 1` (two single-byte instructions).
    f.op_label(POP_JUMP_IF_FALSE, 2)?;
    f.line(3).small_int(1).return_value();
    f.line(5).load_fast(0);
    f.op_qstr(LOAD_GLOBAL, "factorial")?;
    f.load_fast(0).small_int(1).binary_op(BINOP_SUBTRACT)?;
    f.call_function(1, 0).binary_op(BINOP_MULTIPLY)?;
    f.return_value();
    Ok(f.finish())
}

fn factorials_up_to(mb: &ModuleBuilder) -> Result<Arc<RawCode>> {
    let mut f = mb.function("factorials_up_to")?;
    f.pos_arg("x")?.state(7, 0).scope_flags(SCOPE_GENERATOR);
    f.line(8).small_int(1).store_fast(1);
    f.line(9);
    f.op_qstr(LOAD_GLOBAL, "range")?;
    f.small_int(1).load_fast(0).small_int(1).binary_op(BINOP_ADD)?;
    f.call_function(2, 0).op(GET_ITER);
    for_loop(&mut f, 8, |f| {
        f.store_fast(2);
        f.line(10).load_fast(1).load_fast(2).binary_op(BINOP_INPLACE_MULTIPLY)?;
        f.store_fast(1);
        f.line(11).load_fast(1).op(YIELD_VALUE).op(POP_TOP);
        Ok(())
    })?;
    f.op(LOAD_CONST_NONE).return_value();
    Ok(f.finish())
}

fn listcomp(mb: &ModuleBuilder, line: u32, power: i64) -> Result<Arc<RawCode>> {
    let mut f = mb.function("<listcomp>")?;
    f.pos_arg(".0")?.state(6, 0);
    f.line(line).op_uint(BUILD_LIST, 0).load_fast(0);
    for_loop(&mut f, 6, |f| {
        f.store_fast(1).load_fast(1).small_int(power).binary_op(BINOP_POWER)?;
        f.op_uint(STORE_COMP, 20);
        Ok(())
    })?;
    f.return_value();
    Ok(f.finish())
}

/// `FOR_ITER` over `body`, closed by a jump back. `body_len` is the byte size
/// `body` emits; the exit label needs it before the body exists.
fn for_loop<F>(f: &mut FunctionEmitter, body_len: usize, body: F) -> Result<()>
where
    F: FnOnce(&mut FunctionEmitter) -> Result<()>,
{
    let top = f.offset();
    f.op_label(FOR_ITER, (body_len + JUMP_LEN) as i64)?;
    body(f)?;
    ensure!(
        f.offset() == top + JUMP_LEN + body_len,
        "loop body is {} bytes, expected {}",
        f.offset() - top - JUMP_LEN,
        body_len
    );
    let back = top as i64 - (f.offset() + JUMP_LEN) as i64;
    f.op_label(JUMP, back)?;
    Ok(())
}
