use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tracing::trace;

use crate::bytecode::opcode::{self, Group};
use crate::bytecode::{RawCode, line_table};
use crate::module::Namespace;
use crate::obj::Obj;

use super::frame::{Code, Frame, TraceEvent};

/// Receiver of trace events.
///
/// Whatever the callback returns is handed back to the VM unchanged, errors
/// included.
pub trait TraceCallback {
    fn on_event(&mut self, frame: &Arc<Frame>, event: TraceEvent, arg: &Obj) -> Result<Obj>;
}

impl<F> TraceCallback for F
where
    F: FnMut(&Arc<Frame>, TraceEvent, &Obj) -> Result<Obj>,
{
    #[inline]
    fn on_event(&mut self, frame: &Arc<Frame>, event: TraceEvent, arg: &Obj) -> Result<Obj> {
        self(frame, event, arg)
    }
}

/// One active call: the function, the module it runs in and its position.
#[derive(Debug, Clone)]
pub struct CodeState {
    fun: Arc<RawCode>,
    globals: Arc<Namespace>,
    /// Absolute position in `fun`'s buffer of the next instruction.
    ip: usize,
    /// Frame built by the most recent tick of this call.
    frame: Option<Arc<Frame>>,
}

impl CodeState {
    /// State positioned at the first instruction of `fun`.
    pub fn new(fun: Arc<RawCode>, globals: Arc<Namespace>) -> Self {
        let ip = fun.prelude().map_or(0, |p| p.bytecode);
        Self {
            fun,
            globals,
            ip,
            frame: None,
        }
    }

    #[inline]
    pub fn fun(&self) -> &Arc<RawCode> {
        &self.fun
    }

    #[inline]
    pub fn globals(&self) -> &Arc<Namespace> {
        &self.globals
    }

    #[inline]
    pub fn ip(&self) -> usize {
        self.ip
    }

    #[inline]
    pub fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }
}

/// Clears the hook's busy flag when dropped, including on early return.
#[must_use]
pub struct TickGuard {
    flag: Rc<Cell<bool>>,
}

impl TickGuard {
    fn enter(flag: &Rc<Cell<bool>>) -> Result<Self> {
        ensure!(!flag.replace(true), "trace hook re-entered while its callback is running");
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Per-thread tracing state: the registered callback, the busy flag, the
/// call stack and the exception currently in flight.
#[derive(Default)]
pub struct ThreadState {
    stack: Vec<CodeState>,
    callback: Option<Box<dyn TraceCallback>>,
    executing: Rc<Cell<bool>>,
    cur_exception: Option<Obj>,
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("stack", &self.stack)
            .field("callback", &self.callback.is_some())
            .field("executing", &self.executing.get())
            .field("cur_exception", &self.cur_exception)
            .finish()
    }
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settrace<C: TraceCallback + 'static>(&mut self, callback: C) {
        self.callback = Some(Box::new(callback));
    }

    pub fn clear_trace(&mut self) -> Option<Box<dyn TraceCallback>> {
        self.callback.take()
    }

    #[inline]
    pub fn has_trace(&self) -> bool {
        self.callback.is_some()
    }

    /// Whether the VM should call [`ThreadState::instr_tick`] now.
    #[inline]
    pub fn should_tick(&self) -> bool {
        self.callback.is_some() && !self.executing.get()
    }

    #[inline]
    pub fn is_executing(&self) -> bool {
        self.executing.get()
    }

    /// Mark the hook busy for the lifetime of the returned guard. Ticks
    /// attempted meanwhile fail without reaching the callback.
    pub fn tick_guard(&self) -> Result<TickGuard> {
        TickGuard::enter(&self.executing)
    }

    pub fn push_call(&mut self, fun: Arc<RawCode>, globals: Arc<Namespace>) {
        self.stack.push(CodeState::new(fun, globals));
    }

    pub fn pop_call(&mut self) -> Option<CodeState> {
        self.stack.pop()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn current(&self) -> Option<&CodeState> {
        self.stack.last()
    }

    /// Move the innermost call to absolute buffer position `ip`.
    pub fn set_ip(&mut self, ip: usize) -> Result<()> {
        let state = self.stack.last_mut().context("no active call")?;
        state.ip = ip;
        Ok(())
    }

    /// Move the innermost call to `offset` bytes past its bytecode start.
    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        let state = self.stack.last_mut().context("no active call")?;
        let prelude = state.fun.prelude().context("truncated prelude")?;
        state.ip = prelude.bytecode.checked_add(offset).context("offset out of range")?;
        Ok(())
    }

    pub fn raise(&mut self, exc: Obj) {
        self.cur_exception = Some(exc);
    }

    pub fn clear_exception(&mut self) -> Option<Obj> {
        self.cur_exception.take()
    }

    #[inline]
    pub fn exception(&self) -> Option<&Obj> {
        self.cur_exception.as_ref()
    }

    /// Run the hook for the instruction the innermost call is about to
    /// execute. `is_exception` is set when the VM enters exception handling.
    ///
    /// Returns `None` without building a frame when no callback is
    /// registered.
    pub fn instr_tick(&mut self, is_exception: bool) -> Result<Obj> {
        ensure!(!self.executing.get(), "trace hook re-entered while its callback is running");
        if self.callback.is_none() {
            return Ok(Obj::None);
        }
        let frame = Arc::new(self.make_frame()?);
        let (event, arg) = self.classify(is_exception)?;
        if let Some(state) = self.stack.last_mut() {
            state.frame = Some(frame.clone());
        }

        trace!(
            target: "bctrace::tick",
            event = event.as_str(),
            module = %frame.module_name,
            path = ?frame.code.codepath,
            offset = frame.instr_offset,
            line = frame.lineno,
            "tick"
        );

        let _guard = TickGuard::enter(&self.executing)?;
        match self.callback.as_mut() {
            Some(cb) => cb.on_event(&frame, event, &arg),
            None => Ok(Obj::None),
        }
    }

    fn make_frame(&self) -> Result<Frame> {
        let state = self.stack.last().context("instruction tick with no active call")?;
        let fun = &state.fun;
        let prelude = fun
            .prelude()
            .with_context(|| format!("code {} has a truncated prelude", fun.id()))?;
        let buf = fun.bytecode();
        let qstrs = fun.qstrs();
        let instr_offset = prelude.offset_of(state.ip);

        let back = self
            .stack
            .len()
            .checked_sub(2)
            .and_then(|idx| self.stack[idx].frame.clone());

        Ok(Frame {
            code: Code {
                id: fun.id(),
                filename: qstrs.resolve(prelude.source_file),
                name: qstrs.resolve(prelude.block_name),
                codepath: state.globals.path_of(fun.id()),
            },
            lineno: line_table::line_for_offset(prelude.line_table(buf), instr_offset),
            instr_offset,
            module_name: state.globals.name().clone(),
            back,
        })
    }

    fn classify(&self, is_exception: bool) -> Result<(TraceEvent, Obj)> {
        if is_exception && let Some(exc) = &self.cur_exception {
            let arg = Obj::tuple([Obj::Bool(false), exc.clone(), Obj::Bool(false)]);
            return Ok((TraceEvent::Exception, arg));
        }
        let state = self.stack.last().context("instruction tick with no active call")?;
        let event = match state.fun.bytecode().get(state.ip).map(|&b| opcode::group(b)) {
            Some(Group::Return) => TraceEvent::Return,
            Some(Group::Call) => TraceEvent::Call,
            _ => TraceEvent::Line,
        };
        Ok((event, Obj::None))
    }
}
