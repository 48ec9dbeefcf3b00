use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::bytecode::{ModuleBuilder, RawCode, opcode};
use crate::config::BytecodeFormat;
use crate::module::{ModuleTable, Namespace};
use crate::obj::Obj;
use crate::trace::*;

#[derive(Debug, Clone)]
struct Seen {
    frame: Arc<Frame>,
    event: TraceEvent,
    arg: Obj,
}

type Log = Rc<RefCell<Vec<Seen>>>;

fn recorder(log: &Log) -> impl TraceCallback + 'static {
    let log = log.clone();
    move |frame: &Arc<Frame>, event: TraceEvent, arg: &Obj| -> Result<Obj> {
        log.borrow_mut().push(Seen {
            frame: frame.clone(),
            event,
            arg: arg.clone(),
        });
        Ok(Obj::None)
    }
}

/// ```text
/// 0  MAKE_FUNCTION inner
/// 2  STORE_NAME inner
/// 5  LOAD_NAME inner        (line 2)
/// 8  CALL_FUNCTION 0
/// 10 RETURN_VALUE
/// ```
fn program() -> (Arc<RawCode>, Arc<RawCode>) {
    let mb = ModuleBuilder::new("prog.py", BytecodeFormat::default()).unwrap();
    let inner = {
        let mut f = mb.function("inner").unwrap();
        f.small_int(5).return_value();
        f.finish()
    };
    let mut f = mb.module_function().unwrap();
    f.make_function(inner.clone(), false);
    f.op_qstr(opcode::STORE_NAME, "inner").unwrap();
    f.line(2);
    f.op_qstr(opcode::LOAD_NAME, "inner").unwrap();
    f.call_function(0, 0).return_value();
    (f.finish(), inner)
}

fn loaded() -> (ThreadState, Arc<Namespace>, Arc<RawCode>, Arc<RawCode>) {
    let (module_fun, inner) = program();
    let mut table = ModuleTable::new();
    let ns = table.load_module("__main__", module_fun.clone());
    let mut ts = ThreadState::new();
    ts.push_call(module_fun.clone(), ns.clone());
    (ts, ns, module_fun, inner)
}

#[test]
fn return_scenario() {
    let mb = ModuleBuilder::new("prog.py", BytecodeFormat::default()).unwrap();
    let mut f = mb.module_function().unwrap();
    f.small_int(5).return_value();
    let fun = f.finish();
    let mut table = ModuleTable::new();
    let ns = table.load_module("__main__", fun.clone());

    let log = Log::default();
    let mut ts = ThreadState::new();
    ts.settrace(recorder(&log));
    ts.push_call(fun, ns);

    ts.instr_tick(false).unwrap();
    ts.set_offset(1).unwrap();
    ts.instr_tick(false).unwrap();

    let seen = log.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].event, TraceEvent::Line);
    assert_eq!(seen[1].event, TraceEvent::Return);
    assert_eq!(seen[1].arg, Obj::None);
    let frame = &seen[1].frame;
    assert_eq!(frame.instr_offset, 1);
    assert_eq!(frame.lineno, 1);
    assert_eq!(&*frame.module_name, "__main__");
    assert_eq!(frame.code.codepath.as_deref(), Some("<module>"));
    assert_eq!(&*frame.code.filename, "prog.py");
    assert_eq!(&*frame.code.name, "<module>");
    assert!(frame.back.is_none());
}

#[test]
fn classifies_calls_and_lines() {
    let (mut ts, _, _, _) = loaded();
    let log = Log::default();
    ts.settrace(recorder(&log));

    for offset in [0, 2, 5, 8, 10] {
        ts.set_offset(offset).unwrap();
        ts.instr_tick(false).unwrap();
    }
    let seen = log.borrow();
    let events: Vec<_> = seen.iter().map(|s| s.event).collect();
    assert_eq!(
        events,
        vec![
            TraceEvent::Line,
            TraceEvent::Line,
            TraceEvent::Line,
            TraceEvent::Call,
            TraceEvent::Return
        ]
    );
    let lines: Vec<_> = seen.iter().map(|s| s.frame.lineno).collect();
    assert_eq!(lines, vec![1, 1, 2, 2, 2]);
}

#[test]
fn exception_wins_and_carries_the_exception() {
    let (mut ts, _, _, _) = loaded();
    let log = Log::default();
    ts.settrace(recorder(&log));
    ts.set_offset(10).unwrap();

    // No exception in flight: classified as usual.
    ts.instr_tick(true).unwrap();

    let exc = Obj::exception("ValueError", "boom");
    ts.raise(exc.clone());
    ts.instr_tick(false).unwrap();
    ts.instr_tick(true).unwrap();

    let seen = log.borrow();
    assert_eq!(seen[0].event, TraceEvent::Return);
    assert_eq!(seen[1].event, TraceEvent::Return);
    assert_eq!(seen[2].event, TraceEvent::Exception);
    assert_eq!(seen[2].arg, Obj::tuple([Obj::Bool(false), exc.clone(), Obj::Bool(false)]));
    assert_eq!(seen[2].arg.as_tuple().map(|t| &t[1]), Some(&exc));

    assert_eq!(ts.clear_exception(), Some(exc));
    assert!(ts.exception().is_none());
}

#[test]
fn callee_frame_links_to_caller() {
    let (mut ts, ns, _, inner) = loaded();
    let log = Log::default();
    ts.settrace(recorder(&log));

    ts.set_offset(8).unwrap();
    ts.instr_tick(false).unwrap();
    ts.push_call(inner.clone(), ns.clone());
    ts.instr_tick(false).unwrap();
    ts.set_offset(1).unwrap();
    ts.instr_tick(false).unwrap();
    ts.pop_call();
    ts.set_offset(10).unwrap();
    ts.instr_tick(false).unwrap();

    let seen = log.borrow();
    let callee = &seen[1].frame;
    assert_eq!(callee.code.codepath.as_deref(), Some("<module>/inner"));
    assert_eq!(callee.code.id, inner.id());
    let caller = callee.back.as_ref().expect("caller frame");
    assert_eq!(caller.instr_offset, 8);
    assert!(Arc::ptr_eq(caller, &seen[0].frame));
    assert_eq!(callee.depth(), 2);
    assert_eq!(seen[2].event, TraceEvent::Return);
    assert_eq!(seen[2].frame.depth(), 2);

    let back_in_module = &seen[3].frame;
    assert!(back_in_module.back.is_none());
    assert_eq!(back_in_module.chain().count(), 1);
}

#[test]
fn caller_without_a_tick_has_no_frame() {
    let (mut ts, ns, _, inner) = loaded();
    let log = Log::default();
    ts.push_call(inner, ns);
    ts.settrace(recorder(&log));
    ts.instr_tick(false).unwrap();
    assert!(log.borrow()[0].frame.back.is_none());
}

#[test]
fn reentrant_tick_is_rejected() {
    let (mut ts, _, _, _) = loaded();
    let log = Log::default();
    ts.settrace(recorder(&log));

    let guard = ts.tick_guard().unwrap();
    assert!(!ts.should_tick());
    assert!(ts.tick_guard().is_err());
    let err = ts.instr_tick(false).unwrap_err();
    assert!(err.to_string().contains("re-entered"));
    assert!(log.borrow().is_empty());

    drop(guard);
    assert!(ts.should_tick());
    ts.instr_tick(false).unwrap();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn callback_error_propagates_and_clears_the_guard() {
    let (mut ts, _, _, _) = loaded();
    let calls = Rc::new(RefCell::new(0));
    let counter = calls.clone();
    ts.settrace(move |_: &Arc<Frame>, _: TraceEvent, _: &Obj| -> Result<Obj> {
        *counter.borrow_mut() += 1;
        bail!("callback failed")
    });

    let err = ts.instr_tick(false).unwrap_err();
    assert_eq!(err.to_string(), "callback failed");
    assert!(!ts.is_executing());
    assert!(ts.instr_tick(false).is_err());
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn callback_result_is_returned() {
    let (mut ts, _, _, _) = loaded();
    ts.settrace(|_: &Arc<Frame>, event: TraceEvent, _: &Obj| -> Result<Obj> { Ok(Obj::str(event.as_str())) });
    assert_eq!(ts.instr_tick(false).unwrap(), Obj::str("line"));
}

#[test]
fn module_without_profile_has_no_codepath() {
    let (module_fun, _) = program();
    let ns = Arc::new(Namespace::new("bare"));
    let log = Log::default();
    let mut ts = ThreadState::new();
    ts.settrace(recorder(&log));
    ts.push_call(module_fun, ns);
    ts.instr_tick(false).unwrap();

    let frame = log.borrow()[0].frame.clone();
    assert_eq!(frame.code.codepath, None);
    assert_eq!(&*frame.module_name, "bare");
    assert_eq!(&*frame.code.name, "<module>");
}

#[test]
fn without_callback_nothing_happens() {
    let (mut ts, _, _, _) = loaded();
    assert!(!ts.should_tick());
    assert_eq!(ts.instr_tick(false).unwrap(), Obj::None);
    assert!(ts.current().unwrap().frame().is_none());

    let log = Log::default();
    ts.settrace(recorder(&log));
    assert!(ts.has_trace());
    ts.instr_tick(false).unwrap();
    assert!(ts.current().unwrap().frame().is_some());
    assert!(ts.clear_trace().is_some());
    assert!(!ts.should_tick());
}

#[test]
fn tick_needs_an_active_call() {
    let mut ts = ThreadState::new();
    let log = Log::default();
    ts.settrace(recorder(&log));
    assert!(ts.instr_tick(false).is_err());
    assert!(ts.set_offset(0).is_err());
    assert!(!ts.is_executing());
}

#[test]
fn huge_offset_is_rejected() {
    let (mut ts, _, _, _) = loaded();
    let ip = ts.current().unwrap().ip();
    let err = ts.set_offset(usize::MAX).unwrap_err();
    assert!(err.to_string().contains("offset out of range"));
    assert_eq!(ts.current().unwrap().ip(), ip);
}

#[test]
fn event_names() {
    let names: Vec<_> = [TraceEvent::Line, TraceEvent::Call, TraceEvent::Return, TraceEvent::Exception]
        .into_iter()
        .map(|e| e.to_string())
        .collect();
    assert_eq!(names, vec!["line", "call", "return", "exception"]);
    assert_eq!(serde_json::to_value(TraceEvent::Return).unwrap(), serde_json::json!("return"));
}
