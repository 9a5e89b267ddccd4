//! Compiler context: one Cranelift JIT module shared by every unit compiled
//! for a target, plus the data generated code points into (string constants,
//! frame layouts).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Module, default_libcall_names};
use tracing::{debug, error, info};

use super::JitError;
use super::frame::FrameLayout;
use super::lower::{self, LoweredUnit};
use super::runtime::RuntimeFn;
use crate::ir::Unit;
use crate::value::{StringPtr, Value, ValueData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
}

impl OptLevel {
    fn setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JitOptions {
    pub opt_level: OptLevel,
    /// Run the Cranelift IR verifier on every function.
    pub verify: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions { opt_level: OptLevel::Speed, verify: cfg!(debug_assertions) }
    }
}

/// Host functions callable from compiled code, by symbol name.
#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    functions: Vec<(String, *const u8)>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `address` must be an `extern "C"` function following the host ABI.
    pub fn register(&mut self, name: impl Into<String>, address: *const u8) -> &mut Self {
        self.functions.push((name.into(), address));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.iter().any(|(n, _)| n == name)
    }
}

/// Constants referenced by generated code as immediates.
#[derive(Default)]
pub(crate) struct ConstPool {
    strings: Vec<Box<StringPtr>>,
    string_index: HashMap<String, usize>,
    values: Vec<Box<ValueData>>,
}

impl ConstPool {
    pub fn string(&mut self, s: &str) -> *const StringPtr {
        if let Some(&i) = self.string_index.get(s) {
            return &*self.strings[i];
        }
        let boxed = Box::new(StringPtr::new(s));
        let ptr: *const StringPtr = &*boxed;
        self.string_index.insert(s.to_string(), self.strings.len());
        self.strings.push(boxed);
        ptr
    }

    pub fn value(&mut self, v: &Value) -> *const ValueData {
        let boxed = Box::new(ValueData::from(v));
        let ptr: *const ValueData = &*boxed;
        self.values.push(boxed);
        ptr
    }
}

/// Mutable backend state, borrowed by the lowering pass.
pub(crate) struct JitState {
    pub module: JITModule,
    pub constants: ConstPool,
    pub layouts: Vec<Box<FrameLayout>>,
    pub host_functions: HashSet<String>,
    /// Procedure symbols referenced by calls.
    pub declared: HashSet<String>,
    pub defined: HashSet<String>,
    pub next_unit: u32,
    /// Definitions added since the last finalization.
    pub dirty: bool,
}

pub struct CompilerContext {
    state: RefCell<Option<JitState>>,
    broken: Cell<bool>,
}

impl CompilerContext {
    pub fn new(registry: &FunctionRegistry, options: &JitOptions) -> Rc<Self> {
        let state = match create_module(registry, options) {
            Ok(module) => {
                debug!(opt_level = options.opt_level.setting(), verify = options.verify, "JIT session created");
                Some(JitState {
                    module,
                    constants: ConstPool::default(),
                    layouts: Vec::new(),
                    host_functions: registry.functions.iter().map(|(n, _)| n.clone()).collect(),
                    declared: HashSet::new(),
                    defined: HashSet::new(),
                    next_unit: 0,
                    dirty: false,
                })
            }
            Err(e) => {
                error!(error = %e, "failed to create JIT session");
                None
            }
        };
        let broken = state.is_none();
        Rc::new(CompilerContext { state: RefCell::new(state), broken: Cell::new(broken) })
    }

    pub fn is_functional(&self) -> bool {
        !self.broken.get()
    }

    /// Finalizes every pending definition. A failure (including a procedure
    /// that was called but never defined) breaks the context for good.
    pub fn init_jit(&self) {
        if self.broken.get() {
            return;
        }
        let mut state = self.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        if !state.dirty {
            return;
        }
        if let Some(missing) = state.declared.difference(&state.defined).next() {
            error!(procedure = %missing, "procedure is called but never defined");
            self.broken.set(true);
            return;
        }
        if let Err(e) = state.module.finalize_definitions() {
            error!(error = %e, "failed to finalize JIT module");
            self.broken.set(true);
            return;
        }
        state.dirty = false;
        info!(units = state.next_unit, "JIT module finalized");
    }

    pub(crate) fn compile(&self, unit: &Unit) -> Result<LoweredUnit, JitError> {
        if self.broken.get() {
            return Err(JitError::Broken);
        }
        let mut state = self.state.borrow_mut();
        let state = state.as_mut().ok_or(JitError::Broken)?;
        match lower::lower_unit(state, unit) {
            Ok(lowered) => {
                state.dirty = true;
                Ok(lowered)
            }
            Err(e) => {
                error!(error = %e, "failed to compile unit");
                self.broken.set(true);
                Err(e)
            }
        }
    }

    /// Address of a finalized function, finalizing lazily.
    pub(crate) fn resolve(&self, id: FuncId) -> Option<*const u8> {
        self.init_jit();
        if self.broken.get() {
            return None;
        }
        let state = self.state.borrow();
        state.as_ref().map(|s| s.module.get_finalized_function(id))
    }
}

impl Drop for CompilerContext {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            // SAFETY: executables and execution contexts hold an Rc to this
            // context, so no compiled code can run after this point.
            unsafe { state.module.free_memory() };
        }
    }
}

fn create_module(registry: &FunctionRegistry, options: &JitOptions) -> Result<JITModule, JitError> {
    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", options.opt_level.setting())?;
    flag_builder.set("enable_verifier", if options.verify { "true" } else { "false" })?;
    flag_builder.set("use_colocated_libcalls", "false")?;
    flag_builder.set("is_pic", "false")?;
    let isa_builder = cranelift_native::builder().map_err(|msg| JitError::Isa(msg.to_string()))?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder))?;

    let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
    for f in RuntimeFn::ALL {
        builder.symbol(f.name(), f.address());
    }
    for (name, address) in &registry.functions {
        builder.symbol(name.clone(), *address);
    }
    Ok(JITModule::new(builder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_constants_are_interned() {
        let mut pool = ConstPool::default();
        let a = pool.string("hello");
        let b = pool.string("hello");
        let c = pool.string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(unsafe { (*a).to_rust_string() }, "hello");
    }

    #[test]
    fn fresh_context_is_functional() {
        let ctx = CompilerContext::new(&FunctionRegistry::new(), &JitOptions::default());
        assert!(ctx.is_functional());
        ctx.init_jit();
        assert!(ctx.is_functional());
    }
}
