//! blockjit: a just-in-time compiler for cooperative block-based scripts.
//!
//! Block translators describe a unit through [`builder::CodeBuilder`];
//! `build()` narrows types, lowers the unit to native code with Cranelift and
//! returns a [`jit::ExecutableCode`]. A scheduler then drives one
//! [`jit::ExecutionContext`] per running instance, calling `run()` once per
//! tick until it reports finished.

pub mod builder;
pub mod ir;
pub mod jit;
pub mod script;
pub mod target;
pub mod value;

pub use builder::CodeBuilder;
pub use ir::{BlockPrototype, CodeType, CompilerLocalVariable, CompilerValue, StaticType};
pub use jit::{CompilerContext, ExecutableCode, ExecutionContext, FunctionRegistry, JitOptions, OptLevel, Promise};
pub use target::{ListId, Target, VariableId};
pub use value::Value;
