//! Runtime error type. Mirrors `ember_compiler::CompileError`'s shape: a
//! small enum with a hand-written `Display`, no `thiserror`/`anyhow` — the
//! VM already knows exactly which failure occurred, so there's nothing a
//! derive macro would save beyond boilerplate.

use std::fmt;

#[derive(Debug, Clone)]
pub enum RuntimeError {
    UndefinedVariable(String),
    NotCallable,
    ArityMismatch { expected: usize, got: usize },
    TypeMismatch(String),
    CallDepthExceeded,
    Builtin(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::UndefinedVariable(name) => write!(f, "Undefined variable '{name}'."),
            RuntimeError::NotCallable => write!(f, "Can only call functions and builtins."),
            RuntimeError::ArityMismatch { expected, got } => {
                write!(f, "Expected {expected} arguments but got {got}.")
            }
            RuntimeError::TypeMismatch(detail) => write!(f, "{detail}"),
            RuntimeError::CallDepthExceeded => {
                write!(f, "Call depth exceeded (max {}).", ember_core::MAX_CALLS)
            }
            RuntimeError::Builtin(detail) => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Compilation and execution share one error channel so the CLI can map
/// either straight to an exit code without matching on two separate types
/// at every call site.
#[derive(Debug)]
pub enum VmError {
    Compile(ember_compiler::CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Compile(e) => write!(f, "{e}"),
            VmError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for VmError {}
