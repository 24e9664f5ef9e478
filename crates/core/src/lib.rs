//! Ember Core: the value model, heap object model, bytecode chunk format
//! and intern/hash table shared by `ember-compiler` and `ember-vm`.
//!
//! # Modules
//!
//! - `value`: the tagged `Value` union the language talks about.
//! - `heap`: heap-allocated object storage (strings, functions, closures,
//!   upvalues) and the arena the mark-sweep collector sweeps.
//! - `chunk`: packed bytecode, constants, and run-length line info.
//! - `table`: the open-addressed hash table used for both string interning
//!   and the VM's global variable table.

pub mod chunk;
pub mod heap;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode, MAX_CONSTANTS};
pub use heap::{Heap, Obj, ObjClosure, ObjFunction, ObjRef, ObjString, ObjUpvalue, UpvalueDesc, UpvalueLocation};
pub use table::{intern, Table};
pub use value::{Builtin, Value};

/// Maximum call-frame depth.
pub const MAX_CALLS: usize = 64;
/// Maximum locals (including the reserved callee slot) per function.
pub const MAX_LOCALS: usize = 256;
/// Fixed value-stack capacity: `MAX_CALLS * MAX_LOCALS`.
pub const STACK_MAX: usize = MAX_CALLS * MAX_LOCALS;
