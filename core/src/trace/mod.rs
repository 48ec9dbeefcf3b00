//! Per-instruction tracing hook.
//!
//! The VM keeps a [`ThreadState`] per thread, pushes a [`CodeState`] for every
//! call and calls [`ThreadState::instr_tick`] before each instruction. The
//! hook rebuilds a [`Frame`] for the current position, classifies the event
//! and hands both to the registered [`TraceCallback`].

mod frame;
mod state;

pub use frame::*;
pub use state::*;

#[cfg(test)]
mod tick_test;
