//! Native code generation through Cranelift.
//!
//! A [`CompilerContext`] owns one JIT module per target. Each built unit is
//! lowered into it as a resumable state machine and handed back as an
//! [`ExecutableCode`]; running instances keep their state in an
//! [`ExecutionContext`].

mod context;
mod executable;
mod frame;
mod lower;
mod runtime;


pub use context::{CompilerContext, FunctionRegistry, JitOptions, OptLevel};
pub use executable::{ExecutableCode, ExecutionContext, Promise};

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
    #[error("code generation failed: {0}")]
    Codegen(#[from] cranelift_codegen::CodegenError),
    #[error("invalid JIT setting: {0}")]
    Settings(#[from] cranelift_codegen::settings::SetError),
    #[error("host ISA unavailable: {0}")]
    Isa(String),
    #[error("unknown host function `{0}`")]
    UnknownFunction(String),
    #[error("compiler context is not functional")]
    Broken,
}
