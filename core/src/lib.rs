//! Bytecode introspection and per-instruction tracing.

pub mod bytecode;
pub mod config;
pub mod container;
pub mod demo;
pub mod module;
pub mod obj;
pub mod qstr;
pub mod render;
pub mod trace;
pub mod tree;

#[cfg(test)]
mod tree_test;
