//! Compiled artifacts and per-instance run state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace};

use super::context::CompilerContext;
use super::frame::FrameLayout;
use super::lower::LoweredUnit;
use crate::ir::{CodeType, Unit};
use crate::target::{List, Target};
use crate::value::{Value, ValueData};

type ScriptEntry =
    unsafe extern "C" fn(*mut ExecutionContext, *mut Target, *mut *mut ValueData, *mut *mut List) -> *mut u8;
type ReporterEntry =
    unsafe extern "C" fn(*mut ExecutionContext, *mut Target, *mut *mut ValueData, *mut *mut List, *mut ValueData);
type PredicateEntry =
    unsafe extern "C" fn(*mut ExecutionContext, *mut Target, *mut *mut ValueData, *mut *mut List) -> u8;
type ResumeEntry = unsafe extern "C" fn(*mut u8) -> u8;

/// Completion flag polled once per `run()`.
#[derive(Debug, Default)]
pub struct Promise {
    resolved: Cell<bool>,
}

impl Promise {
    pub fn new() -> Rc<Self> {
        Rc::new(Promise::default())
    }

    pub fn resolve(&self) {
        self.resolved.set(true);
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }
}

/// State of one running instance of a compiled unit.
pub struct ExecutionContext {
    target: Rc<RefCell<Target>>,
    handle: *mut u8,
    finished: bool,
    promise: Option<Rc<Promise>>,
    // Frames point at layouts owned by the compiler context.
    _context: Rc<CompilerContext>,
}

impl ExecutionContext {
    /// Reborrows the context handed to a host function.
    ///
    /// # Safety
    /// `ptr` must be the context pointer compiled code passed in, used only
    /// for the duration of that call.
    pub unsafe fn from_raw<'a>(ptr: *mut ExecutionContext) -> &'a mut ExecutionContext {
        unsafe { &mut *ptr }
    }

    pub fn target(&self) -> &Rc<RefCell<Target>> {
        &self.target
    }

    pub fn promise(&self) -> Option<&Rc<Promise>> {
        self.promise.as_ref()
    }

    /// Blocks the instance until `promise` resolves. In non-warp code the
    /// calling unit suspends right after the call that set it.
    pub fn set_promise(&mut self, promise: Rc<Promise>) {
        self.promise = Some(promise);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn has_pending_promise(&self) -> bool {
        self.promise.as_ref().is_some_and(|p| !p.is_resolved())
    }

    fn release_frame(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: a non-null handle is a live frame owned by this context.
            unsafe { FrameLayout::free(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release_frame();
    }
}

/// Entry points of one compiled unit. Several execution contexts may share it.
pub struct ExecutableCode {
    context: Rc<CompilerContext>,
    code_type: CodeType,
    unit: Option<LoweredUnit>,
}

impl ExecutableCode {
    pub(crate) fn compile(context: Rc<CompilerContext>, unit: &Unit) -> Self {
        let lowered = context.compile(unit).ok();
        if lowered.is_none() {
            debug!("unit is not functional");
        }
        ExecutableCode { context, code_type: unit.code_type, unit: lowered }
    }

    pub fn code_type(&self) -> CodeType {
        self.code_type
    }

    pub fn is_functional(&self) -> bool {
        self.entries().is_some()
    }

    fn entries(&self) -> Option<(*const u8, *const u8)> {
        let unit = self.unit.as_ref()?;
        Some((self.context.resolve(unit.main)?, self.context.resolve(unit.resume)?))
    }

    pub fn create_execution_context(&self, target: Rc<RefCell<Target>>) -> ExecutionContext {
        ExecutionContext {
            target,
            handle: std::ptr::null_mut(),
            finished: false,
            promise: None,
            _context: Rc::clone(&self.context),
        }
    }

    /// Advances the instance to its next suspension point or to completion.
    pub fn run(&self, ctx: &mut ExecutionContext) {
        if ctx.finished {
            return;
        }
        if let Some(promise) = &ctx.promise {
            if !promise.is_resolved() {
                return;
            }
            ctx.promise = None;
        }
        let Some((main, resume)) = self.entries() else {
            ctx.release_frame();
            ctx.finished = true;
            return;
        };

        let target_ptr = ctx.target.as_ptr();
        // SAFETY: single-threaded; compiled code is the only user of the
        // target while it runs.
        let (variables, lists) = unsafe { (*target_ptr).storage() };
        let ctx_ptr: *mut ExecutionContext = ctx;

        if ctx.handle.is_null() {
            trace!("starting unit");
            // SAFETY: `main` was compiled with the script entry signature.
            let handle = unsafe {
                let main: ScriptEntry = std::mem::transmute(main);
                main(ctx_ptr, target_ptr, variables, lists)
            };
            if handle.is_null() {
                ctx.finished = true;
            } else {
                ctx.handle = handle;
            }
        } else {
            trace!("resuming unit");
            let done = unsafe {
                FrameLayout::refresh(ctx.handle, ctx_ptr, target_ptr, variables, lists);
                let resume: ResumeEntry = std::mem::transmute(resume);
                resume(ctx.handle) != 0
            };
            if done {
                // The resume entry frees a finished frame itself.
                ctx.handle = std::ptr::null_mut();
                ctx.finished = true;
            }
        }
    }

    /// Abandons the instance; later `run()` calls do nothing.
    pub fn kill(&self, ctx: &mut ExecutionContext) {
        ctx.release_frame();
        ctx.promise = None;
        ctx.finished = true;
    }

    /// Rewinds the instance so the next `run()` starts from the top.
    pub fn reset(&self, ctx: &mut ExecutionContext) {
        ctx.release_frame();
        ctx.promise = None;
        ctx.finished = false;
    }

    pub fn is_finished(&self, ctx: &ExecutionContext) -> bool {
        ctx.finished
    }

    pub fn run_reporter(&self, ctx: &mut ExecutionContext) -> Value {
        debug_assert_eq!(self.code_type, CodeType::Reporter);
        let mut out = ValueData::default();
        if let Some((main, _)) = self.entries() {
            let target_ptr = ctx.target.as_ptr();
            let (variables, lists) = unsafe { (*target_ptr).storage() };
            let ctx_ptr: *mut ExecutionContext = ctx;
            unsafe {
                let main: ReporterEntry = std::mem::transmute(main);
                main(ctx_ptr, target_ptr, variables, lists, &mut out);
            }
        }
        out.to_value()
    }

    pub fn run_predicate(&self, ctx: &mut ExecutionContext) -> bool {
        debug_assert_eq!(self.code_type, CodeType::HatPredicate);
        let Some((main, _)) = self.entries() else {
            return false;
        };
        let target_ptr = ctx.target.as_ptr();
        let (variables, lists) = unsafe { (*target_ptr).storage() };
        let ctx_ptr: *mut ExecutionContext = ctx;
        unsafe {
            let main: PredicateEntry = std::mem::transmute(main);
            main(ctx_ptr, target_ptr, variables, lists) != 0
        }
    }
}
