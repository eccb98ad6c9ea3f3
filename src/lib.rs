//! A bytecode compiler and stack-based virtual machine for a small
//! dynamically-typed scripting language: C-like syntax, first-class
//! functions with closures, classes with single inheritance, and arrays.
//!
//! The pipeline is deliberately short. [`compiler::compile`] turns source
//! text straight into a [`value::Function`] holding bytecode (no syntax
//! tree), and [`vm::ExecutionEngine`] runs it. The engine keeps its global
//! table across runs, so embedding a REPL is just calling
//! [`vm::ExecutionEngine::interpret`] in a loop.

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod lexer;
pub mod value;
pub mod vm;

pub use compiler::compile;
pub use vm::{ExecutionEngine, ExecutionResult};
