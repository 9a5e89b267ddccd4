//! Lowering of one unit's instruction list to Cranelift IR.
//!
//! Each unit becomes a state machine `step(frame) -> i8` plus two thin entry
//! points. `step` starts with a dispatch on the frame's state tag: tag 0 runs
//! from the top, tag `k` jumps to the k-th resume block. A suspension stores
//! its tag and returns 0; reaching the end (or a stop) returns 1.
//!
//! Values live in Cranelift variables unless they must survive a suspension,
//! in which case they get a frame slot. Strings and boxed values always live
//! in frame slots so the frame owns every heap object generated code makes.

use std::collections::{HashMap, HashSet};

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::types::{F64, I8, I32, I64};
use cranelift_codegen::ir::{AbiParam, Block, FuncRef, Function, InstBuilder, MemFlags, Signature, Type, Value};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};
use tracing::debug;

use super::JitError;
use super::context::{ConstPool, JitState};
use super::frame::{self, FrameLayout};
use super::runtime::{Abi, ItemKind, ListOp, RuntimeFn};
use crate::ir::analyzer::scope_end;
use crate::ir::{BlockPrototype, CodeType, CompilerConstant, CompilerValue, Instruction, Opcode, StaticType, Unit};
use crate::target::{ListId, VariableId};
use crate::value::{StringPtr, ValueData, compare};

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoweredUnit {
    pub main: FuncId,
    pub resume: FuncId,
}

pub(crate) fn lower_unit(state: &mut JitState, unit: &Unit) -> Result<LoweredUnit, JitError> {
    let id = state.next_unit;
    state.next_unit += 1;
    let ptr = state.module.target_config().pointer_type();

    let mut step_sig = state.module.make_signature();
    step_sig.params.push(AbiParam::new(ptr));
    step_sig.returns.push(AbiParam::new(I8));
    let step = state.module.declare_function(&format!("step.{id}"), Linkage::Local, &step_sig)?;

    let mut ctx = state.module.make_context();
    ctx.func.signature = step_sig;
    let mut fbc = FunctionBuilderContext::new();
    let layout = {
        let b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let mut lowering = StepLowering::new(
            b,
            &mut state.module,
            &mut state.constants,
            &mut state.declared,
            &state.host_functions,
            unit,
            ptr,
        );
        lowering.lower()?;
        lowering.finish()
    };
    state.module.define_function(step, &mut ctx)?;
    state.module.clear_context(&mut ctx);

    let slots = layout.size();
    let layout = Box::new(layout);
    let layout_ptr: *const FrameLayout = &*layout;
    state.layouts.push(layout);

    let (main_name, resume_name) = match &unit.prototype {
        Some(proto) => (proto.main_symbol(), proto.resume_symbol()),
        None => (format!("f.{id}"), format!("resume.{id}")),
    };
    let main = define_main(&mut state.module, unit, &main_name, step, layout_ptr, ptr)?;
    let resume = define_resume(&mut state.module, &resume_name, step, ptr)?;
    if unit.prototype.is_some() {
        state.defined.insert(main_name.clone());
        state.defined.insert(resume_name);
    }
    debug!(unit = id, symbol = %main_name, frame_bytes = slots, instructions = unit.code.len(), "lowered unit");
    Ok(LoweredUnit { main, resume })
}

// ── Signatures and imports ───────────────────────────────────────────

fn abi_param(abi: Abi, ptr: Type) -> AbiParam {
    match abi {
        Abi::F64 => AbiParam::new(F64),
        Abi::I8 => AbiParam::new(I8).uext(),
        Abi::I32 => AbiParam::new(I32),
        Abi::I64 => AbiParam::new(I64),
        Abi::Ptr => AbiParam::new(ptr),
    }
}

fn helper_signature(module: &JITModule, f: RuntimeFn, ptr: Type) -> Signature {
    let mut sig = module.make_signature();
    sig.params.extend(f.params().iter().map(|&a| abi_param(a, ptr)));
    sig.returns.extend(f.returns().iter().map(|&a| abi_param(a, ptr)));
    sig
}

fn import_helper(module: &mut JITModule, func: &mut Function, f: RuntimeFn, ptr: Type) -> Result<FuncRef, JitError> {
    let sig = helper_signature(module, f, ptr);
    let id = module.declare_function(f.name(), Linkage::Import, &sig)?;
    Ok(module.declare_func_in_func(id, func))
}

fn procedure_signatures(module: &JITModule, ptr: Type) -> (Signature, Signature) {
    let mut main = module.make_signature();
    main.params.extend(std::iter::repeat_n(AbiParam::new(ptr), 5));
    main.returns.push(AbiParam::new(ptr));
    let mut resume = module.make_signature();
    resume.params.push(AbiParam::new(ptr));
    resume.returns.push(AbiParam::new(I8));
    (main, resume)
}

fn clif_type(ty: StaticType, ptr: Type) -> Type {
    match ty {
        StaticType::Number => F64,
        StaticType::Bool => I8,
        _ => ptr,
    }
}

// ── Entry points ─────────────────────────────────────────────────────

fn define_main(
    module: &mut JITModule,
    unit: &Unit,
    name: &str,
    step: FuncId,
    layout: *const FrameLayout,
    ptr: Type,
) -> Result<FuncId, JitError> {
    let sig = match &unit.prototype {
        Some(_) => procedure_signatures(module, ptr).0,
        None => {
            let mut sig = module.make_signature();
            sig.params.extend(std::iter::repeat_n(AbiParam::new(ptr), 4));
            match unit.code_type {
                CodeType::Script => sig.returns.push(AbiParam::new(ptr)),
                CodeType::Reporter => sig.params.push(AbiParam::new(ptr)),
                CodeType::HatPredicate => sig.returns.push(AbiParam::new(I8)),
            }
            sig
        }
    };
    let id = module.declare_function(name, Linkage::Export, &sig)?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let alloc = import_helper(module, b.func, RuntimeFn::FrameAlloc, ptr)?;
        let free = import_helper(module, b.func, RuntimeFn::FrameFree, ptr)?;
        let assign = import_helper(module, b.func, RuntimeFn::ValueAssign, ptr)?;
        let to_bool = import_helper(module, b.func, RuntimeFn::ValueToBool, ptr)?;
        let step = module.declare_func_in_func(step, b.func);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let params = b.block_params(entry).to_vec();
        let flags = MemFlags::trusted();

        let layout = b.ins().iconst(ptr, layout as i64);
        let call = b.ins().call(alloc, &[layout]);
        let frame = b.inst_results(call)[0];
        for (param, offset) in params.iter().zip([
            frame::CTX_OFFSET,
            frame::TARGET_OFFSET,
            frame::VARIABLES_OFFSET,
            frame::LISTS_OFFSET,
        ]) {
            b.ins().store(flags, *param, frame, offset);
        }
        if let Some(proto) = &unit.prototype {
            for i in 0..proto.argument_ids.len() {
                let step_bytes = (i as u32 * ValueData::SIZE) as i64;
                let src = b.ins().iadd_imm(params[4], step_bytes);
                let dst = b.ins().iadd_imm(frame, frame::HEADER_SIZE as i64 + step_bytes);
                b.ins().call(assign, &[dst, src]);
            }
        }
        let call = b.ins().call(step, &[frame]);
        let done = b.inst_results(call)[0];

        match (unit.prototype.is_some(), unit.code_type) {
            (true, _) | (false, CodeType::Script) => {
                let finished = b.create_block();
                let suspended = b.create_block();
                b.ins().brif(done, finished, &[], suspended, &[]);
                b.switch_to_block(finished);
                b.ins().call(free, &[frame]);
                let null = b.ins().iconst(ptr, 0);
                b.ins().return_(&[null]);
                b.switch_to_block(suspended);
                b.ins().return_(&[frame]);
            }
            (false, CodeType::Reporter) => {
                let ret = b.ins().iadd_imm(frame, frame::RET_OFFSET as i64);
                b.ins().call(assign, &[params[4], ret]);
                b.ins().call(free, &[frame]);
                b.ins().return_(&[]);
            }
            (false, CodeType::HatPredicate) => {
                let ret = b.ins().iadd_imm(frame, frame::RET_OFFSET as i64);
                let call = b.ins().call(to_bool, &[ret]);
                let result = b.inst_results(call)[0];
                b.ins().call(free, &[frame]);
                b.ins().return_(&[result]);
            }
        }
        b.seal_all_blocks();
        b.finalize();
    }
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(id)
}

fn define_resume(module: &mut JITModule, name: &str, step: FuncId, ptr: Type) -> Result<FuncId, JitError> {
    let (_, sig) = procedure_signatures(module, ptr);
    let id = module.declare_function(name, Linkage::Export, &sig)?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut fbc = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let free = import_helper(module, b.func, RuntimeFn::FrameFree, ptr)?;
        let step = module.declare_func_in_func(step, b.func);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let handle = b.block_params(entry)[0];
        let call = b.ins().call(step, &[handle]);
        let done = b.inst_results(call)[0];
        let finished = b.create_block();
        let suspended = b.create_block();
        b.ins().brif(done, finished, &[], suspended, &[]);
        b.switch_to_block(finished);
        b.ins().call(free, &[handle]);
        let one = b.ins().iconst(I8, 1);
        b.ins().return_(&[one]);
        b.switch_to_block(suspended);
        let zero = b.ins().iconst(I8, 0);
        b.ins().return_(&[zero]);
        b.seal_all_blocks();
        b.finalize();
    }
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(id)
}

// ── Suspension analysis ──────────────────────────────────────────────

fn is_suspension(unit: &Unit, ins: &Instruction) -> bool {
    !unit.warp
        && match ins.opcode {
            Opcode::Yield | Opcode::FunctionCallWithCtx => true,
            Opcode::CallProcedure => ins.procedure.as_ref().is_some_and(|p| !p.warp),
            _ => false,
        }
}

/// Marks values that are live across a suspension point: used after a
/// suspension that follows their definition, or used inside a suspending
/// loop they were defined before.
fn crossing_values(unit: &Unit) -> Vec<bool> {
    let code = &unit.code;
    let mut crossing = vec![false; unit.values.len()];
    let suspends: Vec<usize> =
        code.iter().enumerate().filter(|(_, ins)| is_suspension(unit, ins)).map(|(i, _)| i).collect();
    if suspends.is_empty() {
        return crossing;
    }

    let mut defined_at = vec![None; unit.values.len()];
    for (i, ins) in code.iter().enumerate() {
        if let Some(r) = ins.result {
            defined_at[r.index()] = Some(i);
        }
    }
    let loops: Vec<(usize, usize)> = code
        .iter()
        .enumerate()
        .filter(|(_, ins)| {
            matches!(ins.opcode, Opcode::BeginLoopCondition | Opcode::BeginRepeatLoop)
                || ins.opcode.is_conditional_loop()
        })
        .filter_map(|(i, _)| scope_end(code, i).map(|end| (i, end)))
        .filter(|&(start, end)| suspends.iter().any(|&s| start < s && s < end))
        .collect();

    for (u, ins) in code.iter().enumerate() {
        for &(_, v) in &ins.args {
            let Some(d) = defined_at[v.index()] else {
                continue;
            };
            let across = suspends.iter().any(|&s| d <= s && s < u)
                || loops.iter().any(|&(start, end)| d < start && start < u && u <= end);
            if across {
                crossing[v.index()] = true;
            }
        }
    }
    crossing
}

// ── Step function ────────────────────────────────────────────────────

/// Where a value lives.
#[derive(Debug, Clone, Copy)]
enum Reg {
    Var(Variable),
    /// Frame slot holding an f64, u8 or pointer.
    Scalar(i32),
    /// Frame slot owning a `*mut StringPtr`.
    Str(i32),
    /// Frame slot holding a `ValueData`.
    Boxed(i32),
}

enum Scope {
    If { else_block: Block, end: Option<Block> },
    Condition { header: Block },
    Loop { header: Block, exit: Block, counter: Option<i32> },
}

#[derive(Clone, Copy)]
enum Compare {
    Eq,
    Gt,
    Lt,
}

impl Compare {
    fn of(op: Opcode) -> Self {
        match op {
            Opcode::CmpGt => Compare::Gt,
            Opcode::CmpLt => Compare::Lt,
            _ => Compare::Eq,
        }
    }

    fn flipped(self) -> Self {
        match self {
            Compare::Eq => Compare::Eq,
            Compare::Gt => Compare::Lt,
            Compare::Lt => Compare::Gt,
        }
    }

    fn holds(self, o: std::cmp::Ordering) -> bool {
        match self {
            Compare::Eq => o.is_eq(),
            Compare::Gt => o.is_gt(),
            Compare::Lt => o.is_lt(),
        }
    }

    fn float_cc(self) -> FloatCC {
        match self {
            Compare::Eq => FloatCC::Equal,
            Compare::Gt => FloatCC::GreaterThan,
            Compare::Lt => FloatCC::LessThan,
        }
    }

    fn signed_cc(self) -> IntCC {
        match self {
            Compare::Eq => IntCC::Equal,
            Compare::Gt => IntCC::SignedGreaterThan,
            Compare::Lt => IntCC::SignedLessThan,
        }
    }

    fn unsigned_cc(self) -> IntCC {
        match self {
            Compare::Eq => IntCC::Equal,
            Compare::Gt => IntCC::UnsignedGreaterThan,
            Compare::Lt => IntCC::UnsignedLessThan,
        }
    }
}

struct StepLowering<'a> {
    b: FunctionBuilder<'a>,
    module: &'a mut JITModule,
    constants: &'a mut ConstPool,
    declared: &'a mut HashSet<String>,
    host_functions: &'a HashSet<String>,
    unit: &'a Unit,
    ptr: Type,
    layout: FrameLayout,

    frame: Value,
    ctx: Value,
    target: Value,
    variables: Value,
    lists: Value,
    state: Value,
    dispatch: Block,
    start: Block,

    crossing: Vec<bool>,
    regs: Vec<Option<Reg>>,
    locals: Vec<Reg>,
    helpers: HashMap<RuntimeFn, FuncRef>,
    imports: HashMap<String, FuncRef>,
    pending: Vec<(VariableId, CompilerValue)>,
    scopes: Vec<Scope>,
    resume_points: Vec<Block>,
    next_var: u32,
}

impl<'a> StepLowering<'a> {
    fn new(
        mut b: FunctionBuilder<'a>,
        module: &'a mut JITModule,
        constants: &'a mut ConstPool,
        declared: &'a mut HashSet<String>,
        host_functions: &'a HashSet<String>,
        unit: &'a Unit,
        ptr: Type,
    ) -> Self {
        let flags = MemFlags::trusted();
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let frame = b.block_params(entry)[0];
        let state = b.ins().load(I64, flags, frame, frame::STATE_OFFSET);
        let ctx = b.ins().load(ptr, flags, frame, frame::CTX_OFFSET);
        let target = b.ins().load(ptr, flags, frame, frame::TARGET_OFFSET);
        let variables = b.ins().load(ptr, flags, frame, frame::VARIABLES_OFFSET);
        let lists = b.ins().load(ptr, flags, frame, frame::LISTS_OFFSET);
        let dispatch = b.create_block();
        let start = b.create_block();
        b.ins().jump(dispatch, &[]);
        b.switch_to_block(start);

        let mut layout = FrameLayout::new();
        if let Some(proto) = &unit.prototype {
            layout.values(proto.argument_ids.len());
        }
        let locals = unit
            .locals
            .iter()
            .map(|ty| match ty {
                StaticType::String => Reg::Str(layout.string()),
                StaticType::Unknown | StaticType::Void => Reg::Boxed(layout.value()),
                _ => Reg::Scalar(layout.scalar()),
            })
            .collect();

        StepLowering {
            b,
            module,
            constants,
            declared,
            host_functions,
            unit,
            ptr,
            layout,
            frame,
            ctx,
            target,
            variables,
            lists,
            state,
            dispatch,
            start,
            crossing: crossing_values(unit),
            regs: vec![None; unit.values.len()],
            locals,
            helpers: HashMap::new(),
            imports: HashMap::new(),
            pending: Vec::new(),
            scopes: Vec::new(),
            resume_points: Vec::new(),
            next_var: 0,
        }
    }

    fn finish(self) -> FrameLayout {
        let StepLowering { mut b, layout, .. } = self;
        b.seal_all_blocks();
        b.finalize();
        layout
    }

    fn lower(&mut self) -> Result<(), JitError> {
        let unit = self.unit;
        for ins in &unit.code {
            self.instruction(ins)?;
        }
        self.flush()?;
        self.finish_unit();
        self.fill_dispatch();
        Ok(())
    }

    fn fill_dispatch(&mut self) {
        self.b.switch_to_block(self.dispatch);
        let points = std::mem::take(&mut self.resume_points);
        for (k, block) in points.into_iter().enumerate() {
            let hit = self.b.ins().icmp_imm(IntCC::Equal, self.state, k as i64 + 1);
            let next = self.b.create_block();
            self.b.ins().brif(hit, block, &[], next, &[]);
            self.b.switch_to_block(next);
        }
        self.b.ins().jump(self.start, &[]);
    }

    // ── Frame and register plumbing ──

    fn flags() -> MemFlags {
        MemFlags::trusted()
    }

    fn new_var(&mut self, ty: Type) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        self.b.declare_var(var, ty);
        var
    }

    fn slot_addr(&mut self, offset: i32) -> Value {
        self.b.ins().iadd_imm(self.frame, offset as i64)
    }

    fn reg(&mut self, v: CompilerValue) -> Option<Reg> {
        if self.unit.value(v).constant().is_some() {
            return None;
        }
        if let Some(reg) = self.regs[v.index()] {
            return Some(reg);
        }
        let ty = self.unit.ty(v);
        let reg = match ty {
            StaticType::Void => return None,
            StaticType::String => Reg::Str(self.layout.string()),
            StaticType::Unknown => Reg::Boxed(self.layout.value()),
            _ if self.crossing[v.index()] => Reg::Scalar(self.layout.scalar()),
            _ => Reg::Var(self.new_var(clif_type(ty, self.ptr))),
        };
        self.regs[v.index()] = Some(reg);
        Some(reg)
    }

    fn constant_as(&mut self, c: &CompilerConstant, ty: StaticType) -> Value {
        match ty {
            StaticType::Number => self.b.ins().f64const(c.to_number()),
            StaticType::Bool => self.b.ins().iconst(I8, c.value.to_bool() as i64),
            StaticType::String => {
                let s = self.constants.string(&c.value.to_string());
                self.b.ins().iconst(self.ptr, s as i64)
            }
            StaticType::Unknown => {
                let v = self.constants.value(&c.value);
                self.b.ins().iconst(self.ptr, v as i64)
            }
            StaticType::Pointer | StaticType::Void => self.b.ins().iconst(self.ptr, 0),
        }
    }

    fn zero(&mut self, ty: StaticType) -> Value {
        match ty {
            StaticType::Number => self.b.ins().f64const(0.0),
            StaticType::Bool => self.b.ins().iconst(I8, 0),
            StaticType::String => {
                let s = self.constants.string("");
                self.b.ins().iconst(self.ptr, s as i64)
            }
            StaticType::Unknown => {
                let v = self.constants.value(&crate::value::Value::Number(0.0));
                self.b.ins().iconst(self.ptr, v as i64)
            }
            StaticType::Pointer | StaticType::Void => self.b.ins().iconst(self.ptr, 0),
        }
    }

    /// The value in its own static type's native form.
    fn read(&mut self, v: CompilerValue) -> Value {
        let unit = self.unit;
        let ty = unit.ty(v);
        if let Some(c) = unit.value(v).constant() {
            return self.constant_as(c, ty);
        }
        match self.reg(v) {
            None => self.zero(ty),
            Some(Reg::Var(var)) => self.b.use_var(var),
            Some(Reg::Scalar(offset)) => self.b.ins().load(clif_type(ty, self.ptr), Self::flags(), self.frame, offset),
            Some(Reg::Str(offset)) => self.b.ins().load(self.ptr, Self::flags(), self.frame, offset),
            Some(Reg::Boxed(offset)) => self.slot_addr(offset),
        }
    }

    /// Stores a scalar result.
    fn define(&mut self, r: CompilerValue, x: Value) {
        match self.reg(r) {
            Some(Reg::Var(var)) => self.b.def_var(var, x),
            Some(Reg::Scalar(offset)) => {
                self.b.ins().store(Self::flags(), x, self.frame, offset);
            }
            other => debug_assert!(other.is_none(), "scalar result stored into an owning slot"),
        }
    }

    fn define_result(&mut self, ins: &Instruction, x: Value) {
        if let Some(r) = ins.result {
            self.define(r, x);
        }
    }

    /// Address of the owning slot a string or boxed result is assigned into.
    fn dest(&mut self, r: CompilerValue) -> Value {
        match self.reg(r) {
            Some(Reg::Str(offset)) | Some(Reg::Boxed(offset)) => self.slot_addr(offset),
            _ => {
                debug_assert!(false, "owning result without an owning slot");
                let offset = self.layout.value();
                self.slot_addr(offset)
            }
        }
    }

    fn temp_string(&mut self) -> Value {
        let offset = self.layout.string();
        self.slot_addr(offset)
    }

    fn temp_value(&mut self) -> Value {
        let offset = self.layout.value();
        self.slot_addr(offset)
    }

    fn helper(&mut self, f: RuntimeFn) -> Result<FuncRef, JitError> {
        if let Some(&r) = self.helpers.get(&f) {
            return Ok(r);
        }
        let r = import_helper(self.module, self.b.func, f, self.ptr)?;
        self.helpers.insert(f, r);
        Ok(r)
    }

    fn call(&mut self, f: RuntimeFn, args: &[Value]) -> Result<Value, JitError> {
        let r = self.helper(f)?;
        let inst = self.b.ins().call(r, args);
        match self.b.inst_results(inst).first() {
            Some(&v) => Ok(v),
            None => Ok(self.b.ins().iconst(I8, 0)),
        }
    }

    fn call_void(&mut self, f: RuntimeFn, args: &[Value]) -> Result<(), JitError> {
        let r = self.helper(f)?;
        self.b.ins().call(r, args);
        Ok(())
    }

    /// The value converted to `to`'s native form. Conversions that allocate
    /// write into a fresh temporary slot.
    fn coerce(&mut self, v: CompilerValue, to: StaticType) -> Result<Value, JitError> {
        use StaticType as T;
        let unit = self.unit;
        if let Some(c) = unit.value(v).constant() {
            return Ok(self.constant_as(c, to));
        }
        let from = unit.ty(v);
        if from == to || to == T::Void {
            return Ok(self.read(v));
        }
        if from == T::Void || from == T::Pointer {
            return Ok(self.zero(to));
        }
        let x = self.read(v);
        Ok(match (from, to) {
            (T::Number, T::Bool) => {
                let zero = self.b.ins().f64const(0.0);
                self.b.ins().fcmp(FloatCC::OrderedNotEqual, x, zero)
            }
            (T::Bool, T::Number) => self.bool_to_number(x),
            (T::Number, T::String) => {
                let dst = self.temp_string();
                self.call(RuntimeFn::StringFromDouble, &[dst, x])?
            }
            (T::Bool, T::String) => {
                let dst = self.temp_string();
                self.call(RuntimeFn::StringFromBool, &[dst, x])?
            }
            (T::String, T::Number) => self.call(RuntimeFn::StringToDouble, &[x])?,
            (T::String, T::Bool) => self.call(RuntimeFn::StringToBool, &[x])?,
            (T::Unknown, T::Number) => self.call(RuntimeFn::ValueToDouble, &[x])?,
            (T::Unknown, T::Bool) => self.call(RuntimeFn::ValueToBool, &[x])?,
            (T::Unknown, T::String) => {
                let dst = self.temp_string();
                self.call(RuntimeFn::ValueToString, &[dst, x])?
            }
            (_, T::Unknown) => {
                let dst = self.temp_value();
                let setter = match from {
                    T::Number => RuntimeFn::ValueSetDouble,
                    T::Bool => RuntimeFn::ValueSetBool,
                    _ => RuntimeFn::ValueSetString,
                };
                self.call_void(setter, &[dst, x])?;
                dst
            }
            _ => self.zero(to),
        })
    }

    fn bool_to_number(&mut self, x: Value) -> Value {
        let one = self.b.ins().f64const(1.0);
        let zero = self.b.ins().f64const(0.0);
        self.b.ins().select(x, one, zero)
    }

    /// Copies `src` into `r`'s register, converting to `r`'s type.
    fn assign(&mut self, r: CompilerValue, src: CompilerValue) -> Result<(), JitError> {
        let ty = self.unit.ty(r);
        match ty {
            StaticType::String => {
                let s = self.coerce(src, ty)?;
                let dst = self.dest(r);
                self.call(RuntimeFn::StringCopy, &[dst, s])?;
            }
            StaticType::Unknown => {
                let s = self.coerce(src, ty)?;
                let dst = self.dest(r);
                self.call_void(RuntimeFn::ValueAssign, &[dst, s])?;
            }
            StaticType::Void => {}
            _ => {
                let x = self.coerce(src, ty)?;
                self.define(r, x);
            }
        }
        Ok(())
    }

    fn index_arg(&mut self, v: CompilerValue) -> Result<Value, JitError> {
        let n = self.coerce(v, StaticType::Number)?;
        Ok(self.b.ins().fcvt_to_sint_sat(I64, n))
    }

    fn item_arg(&mut self, v: CompilerValue) -> Result<(ItemKind, Value), JitError> {
        let (kind, ty) = match self.unit.ty(v) {
            StaticType::Number => (ItemKind::Double, StaticType::Number),
            StaticType::Bool => (ItemKind::Bool, StaticType::Bool),
            StaticType::String => (ItemKind::String, StaticType::String),
            _ => (ItemKind::Value, StaticType::Unknown),
        };
        Ok((kind, self.coerce(v, ty)?))
    }

    fn variable_ptr(&mut self, var: VariableId) -> Value {
        let offset = var.0 as i32 * self.ptr.bytes() as i32;
        self.b.ins().load(self.ptr, Self::flags(), self.variables, offset)
    }

    fn list_ptr(&mut self, list: Option<ListId>) -> Value {
        let offset = list.map_or(0, |l| l.0) as i32 * self.ptr.bytes() as i32;
        self.b.ins().load(self.ptr, Self::flags(), self.lists, offset)
    }

    // ── Variables ──

    /// Materializes elided variable writes. Runs before anything that may
    /// observe variable storage and at every control-flow boundary.
    fn flush(&mut self) -> Result<(), JitError> {
        for (var, v) in std::mem::take(&mut self.pending) {
            self.store_variable(var, v)?;
        }
        Ok(())
    }

    fn store_variable(&mut self, var: VariableId, v: CompilerValue) -> Result<(), JitError> {
        let unit = self.unit;
        let p = self.variable_ptr(var);
        let setter = match unit.ty(v) {
            _ if unit.value(v).constant().is_some() => None,
            StaticType::Number => Some(RuntimeFn::ValueSetDouble),
            StaticType::Bool => Some(RuntimeFn::ValueSetBool),
            StaticType::String => Some(RuntimeFn::ValueSetString),
            _ => None,
        };
        match setter {
            Some(f) => {
                let x = self.read(v);
                self.call_void(f, &[p, x])
            }
            None => {
                let src = self.coerce(v, StaticType::Unknown)?;
                self.call_void(RuntimeFn::ValueAssign, &[p, src])
            }
        }
    }

    fn read_variable(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let (Some(var), Some(r)) = (ins.work_variable, ins.result) else {
            return Ok(());
        };
        if let Some(&(_, v)) = self.pending.iter().find(|(w, _)| *w == var) {
            return self.assign(r, v);
        }
        let p = self.variable_ptr(var);
        match self.unit.ty(r) {
            StaticType::Number => {
                let x = self.b.ins().load(F64, Self::flags(), p, ValueData::PAYLOAD_OFFSET);
                self.define(r, x);
            }
            StaticType::Bool => {
                let x = self.b.ins().load(I8, Self::flags(), p, ValueData::PAYLOAD_OFFSET);
                self.define(r, x);
            }
            StaticType::String => {
                let dst = self.dest(r);
                self.call(RuntimeFn::ValueToString, &[dst, p])?;
            }
            StaticType::Unknown => {
                let dst = self.dest(r);
                self.call_void(RuntimeFn::ValueAssign, &[dst, p])?;
            }
            StaticType::Pointer | StaticType::Void => {}
        }
        Ok(())
    }

    fn write_local(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let (Some(local), Some(&(_, v))) = (ins.work_local, ins.args.first()) else {
            return Ok(());
        };
        match self.locals[local.id as usize] {
            Reg::Str(offset) => {
                let s = self.coerce(v, StaticType::String)?;
                let dst = self.slot_addr(offset);
                self.call(RuntimeFn::StringCopy, &[dst, s])?;
            }
            Reg::Boxed(offset) => {
                let s = self.coerce(v, StaticType::Unknown)?;
                let dst = self.slot_addr(offset);
                self.call_void(RuntimeFn::ValueAssign, &[dst, s])?;
            }
            Reg::Scalar(offset) => {
                let x = self.coerce(v, local.ty)?;
                self.b.ins().store(Self::flags(), x, self.frame, offset);
            }
            Reg::Var(var) => {
                let x = self.coerce(v, local.ty)?;
                self.b.def_var(var, x);
            }
        }
        Ok(())
    }

    fn read_local(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let (Some(local), Some(r)) = (ins.work_local, ins.result) else {
            return Ok(());
        };
        match self.locals[local.id as usize] {
            Reg::Str(offset) => {
                let s = self.b.ins().load(self.ptr, Self::flags(), self.frame, offset);
                let dst = self.dest(r);
                self.call(RuntimeFn::StringCopy, &[dst, s])?;
            }
            Reg::Boxed(offset) => {
                let src = self.slot_addr(offset);
                let dst = self.dest(r);
                self.call_void(RuntimeFn::ValueAssign, &[dst, src])?;
            }
            Reg::Scalar(offset) => {
                let x = self.b.ins().load(clif_type(local.ty, self.ptr), Self::flags(), self.frame, offset);
                self.define(r, x);
            }
            Reg::Var(var) => {
                let x = self.b.use_var(var);
                self.define(r, x);
            }
        }
        Ok(())
    }

    // ── Suspension ──

    fn store_state(&mut self, k: i64) {
        let tag = self.b.ins().iconst(I64, k);
        self.b.ins().store(Self::flags(), tag, self.frame, frame::STATE_OFFSET);
    }

    fn add_resume_point(&mut self, block: Block) -> i64 {
        self.resume_points.push(block);
        self.resume_points.len() as i64
    }

    /// Returns "not finished" and continues lowering in the resume block.
    fn suspend_here(&mut self) {
        let resume = self.b.create_block();
        let k = self.add_resume_point(resume);
        self.store_state(k);
        let zero = self.b.ins().iconst(I8, 0);
        self.b.ins().return_(&[zero]);
        self.b.switch_to_block(resume);
    }

    /// Returns "finished"; anything lowered afterwards is unreachable.
    fn finish_unit(&mut self) {
        let one = self.b.ins().iconst(I8, 1);
        self.b.ins().return_(&[one]);
        let dead = self.b.create_block();
        self.b.switch_to_block(dead);
    }

    // ── Instructions ──

    fn instruction(&mut self, ins: &Instruction) -> Result<(), JitError> {
        use Opcode::*;
        let arg = |i: usize| ins.args[i].1;
        match ins.opcode {
            FunctionCall | FunctionCallWithCtx | TargetFunctionCall => self.host_call(ins)?,

            Add | Sub | Mul | Div => {
                let a = self.coerce(arg(0), StaticType::Number)?;
                let b = self.coerce(arg(1), StaticType::Number)?;
                let x = match ins.opcode {
                    Add => self.b.ins().fadd(a, b),
                    Sub => self.b.ins().fsub(a, b),
                    Mul => self.b.ins().fmul(a, b),
                    _ => self.b.ins().fdiv(a, b),
                };
                self.define_result(ins, x);
            }
            Mod | Random | RandomInt => {
                let a = self.coerce(arg(0), StaticType::Number)?;
                let b = self.coerce(arg(1), StaticType::Number)?;
                let x = match ins.opcode {
                    Mod => self.call(RuntimeFn::Mod, &[a, b])?,
                    _ => {
                        let integral = self.b.ins().iconst(I8, (ins.opcode == RandomInt) as i64);
                        self.call(RuntimeFn::Random, &[a, b, integral])?
                    }
                };
                self.define_result(ins, x);
            }
            Round | Abs | Floor | Ceil | Sqrt => {
                let a = self.coerce(arg(0), StaticType::Number)?;
                let x = match ins.opcode {
                    Round => {
                        let half = self.b.ins().f64const(0.5);
                        let shifted = self.b.ins().fadd(a, half);
                        self.b.ins().floor(shifted)
                    }
                    Abs => self.b.ins().fabs(a),
                    Floor => self.b.ins().floor(a),
                    Ceil => self.b.ins().ceil(a),
                    _ => self.b.ins().sqrt(a),
                };
                self.define_result(ins, x);
            }
            Sin | Cos | Tan | Asin | Acos | Atan | Ln | Log10 | Exp | Exp10 => {
                let a = self.coerce(arg(0), StaticType::Number)?;
                let f = match ins.opcode {
                    Sin => RuntimeFn::Sin,
                    Cos => RuntimeFn::Cos,
                    Tan => RuntimeFn::Tan,
                    Asin => RuntimeFn::Asin,
                    Acos => RuntimeFn::Acos,
                    Atan => RuntimeFn::Atan,
                    Ln => RuntimeFn::Ln,
                    Log10 => RuntimeFn::Log10,
                    Exp => RuntimeFn::Exp,
                    _ => RuntimeFn::Exp10,
                };
                let x = self.call(f, &[a])?;
                self.define_result(ins, x);
            }

            CmpEq | CmpGt | CmpLt => {
                let x = self.compare(Compare::of(ins.opcode), arg(0), arg(1))?;
                self.define_result(ins, x);
            }
            StrCmpEqCs | StrCmpEqCi => {
                let a = self.coerce(arg(0), StaticType::String)?;
                let b = self.coerce(arg(1), StaticType::String)?;
                let cs = self.b.ins().iconst(I8, (ins.opcode == StrCmpEqCs) as i64);
                let x = self.call(RuntimeFn::StringEquals, &[a, b, cs])?;
                self.define_result(ins, x);
            }
            And | Or => {
                let a = self.coerce(arg(0), StaticType::Bool)?;
                let b = self.coerce(arg(1), StaticType::Bool)?;
                let x = if ins.opcode == And { self.b.ins().band(a, b) } else { self.b.ins().bor(a, b) };
                self.define_result(ins, x);
            }
            Not => {
                let a = self.coerce(arg(0), StaticType::Bool)?;
                let x = self.b.ins().bxor_imm(a, 1);
                self.define_result(ins, x);
            }

            Select => self.select(ins)?,
            StringConcat => {
                let a = self.coerce(arg(0), StaticType::String)?;
                let b = self.coerce(arg(1), StaticType::String)?;
                if let Some(r) = ins.result {
                    let dst = self.dest(r);
                    self.call(RuntimeFn::StringConcat, &[dst, a, b])?;
                }
            }
            StringChar => {
                let s = self.coerce(arg(0), StaticType::String)?;
                let i = self.index_arg(arg(1))?;
                if let Some(r) = ins.result {
                    let dst = self.dest(r);
                    self.call(RuntimeFn::StringChar, &[dst, s, i])?;
                }
            }
            StringLength => {
                let x = self.string_length(arg(0))?;
                self.define_result(ins, x);
            }

            WriteLocalVariable => self.write_local(ins)?,
            ReadLocalVariable => self.read_local(ins)?,
            WriteVariable => {
                if let (Some(var), Some(&(_, v))) = (ins.work_variable, ins.args.first()) {
                    self.pending.retain(|(w, _)| *w != var);
                    self.pending.push((var, v));
                }
            }
            ReadVariable => self.read_variable(ins)?,

            ClearList => {
                let l = self.list_ptr(ins.work_list);
                self.call_void(RuntimeFn::ListClear, &[l])?;
            }
            RemoveListItem => {
                let i = self.index_arg(arg(0))?;
                let l = self.list_ptr(ins.work_list);
                self.call_void(RuntimeFn::ListRemove, &[l, i])?;
            }
            AppendToList => {
                let (kind, x) = self.item_arg(arg(0))?;
                let l = self.list_ptr(ins.work_list);
                self.call_void(ListOp::Append.helper(kind), &[l, x])?;
            }
            InsertToList | ListReplace => {
                let i = self.index_arg(arg(0))?;
                let (kind, x) = self.item_arg(arg(1))?;
                let l = self.list_ptr(ins.work_list);
                let op = if ins.opcode == InsertToList { ListOp::Insert } else { ListOp::Replace };
                self.call_void(op.helper(kind), &[l, i, x])?;
            }
            GetListContents => {
                let l = self.list_ptr(ins.work_list);
                if let Some(r) = ins.result {
                    let dst = self.dest(r);
                    self.call(RuntimeFn::ListContents, &[dst, l])?;
                }
            }
            GetListItem => self.list_item(ins)?,
            GetListSize => {
                let l = self.list_ptr(ins.work_list);
                let x = self.call(RuntimeFn::ListSize, &[l])?;
                self.define_result(ins, x);
            }
            GetListItemIndex | ListContainsItem => {
                let (kind, x) = self.item_arg(arg(0))?;
                let l = self.list_ptr(ins.work_list);
                let op = if ins.opcode == GetListItemIndex { ListOp::IndexOf } else { ListOp::Contains };
                let found = self.call(op.helper(kind), &[l, x])?;
                self.define_result(ins, found);
            }

            BeginIf => {
                let c = self.coerce(arg(0), StaticType::Bool)?;
                self.flush()?;
                let then_block = self.b.create_block();
                let else_block = self.b.create_block();
                self.b.ins().brif(c, then_block, &[], else_block, &[]);
                self.b.switch_to_block(then_block);
                self.scopes.push(Scope::If { else_block, end: None });
            }
            BeginElse => {
                self.flush()?;
                if let Some(Scope::If { else_block, .. }) = self.scopes.pop() {
                    let end = self.b.create_block();
                    self.b.ins().jump(end, &[]);
                    self.b.switch_to_block(else_block);
                    self.scopes.push(Scope::If { else_block, end: Some(end) });
                }
            }
            EndIf => {
                self.flush()?;
                if let Some(Scope::If { else_block, end }) = self.scopes.pop() {
                    let join = end.unwrap_or(else_block);
                    self.b.ins().jump(join, &[]);
                    self.b.switch_to_block(join);
                }
            }
            BeginRepeatLoop => self.begin_repeat(arg(0))?,
            BeginLoopCondition => {
                self.flush()?;
                let header = self.b.create_block();
                self.b.ins().jump(header, &[]);
                self.b.switch_to_block(header);
                self.scopes.push(Scope::Condition { header });
            }
            BeginWhileLoop | BeginRepeatUntilLoop => {
                let c = self.coerce(arg(0), StaticType::Bool)?;
                self.flush()?;
                let header = match self.scopes.last() {
                    Some(&Scope::Condition { header }) => {
                        self.scopes.pop();
                        header
                    }
                    _ => {
                        let header = self.b.create_block();
                        self.b.ins().jump(header, &[]);
                        self.b.switch_to_block(header);
                        header
                    }
                };
                let body = self.b.create_block();
                let exit = self.b.create_block();
                if ins.opcode == BeginWhileLoop {
                    self.b.ins().brif(c, body, &[], exit, &[]);
                } else {
                    self.b.ins().brif(c, exit, &[], body, &[]);
                }
                self.b.switch_to_block(body);
                self.scopes.push(Scope::Loop { header, exit, counter: None });
            }
            EndLoop => {
                self.flush()?;
                if let Some(Scope::Loop { header, exit, counter }) = self.scopes.pop() {
                    if let Some(offset) = counter {
                        let i = self.b.ins().load(F64, Self::flags(), self.frame, offset);
                        let one = self.b.ins().f64const(1.0);
                        let next = self.b.ins().fadd(i, one);
                        self.b.ins().store(Self::flags(), next, self.frame, offset);
                    }
                    self.b.ins().jump(header, &[]);
                    self.b.switch_to_block(exit);
                }
            }
            LoopIndex => {
                let counter = self.scopes.iter().rev().find_map(|s| match s {
                    Scope::Loop { counter: Some(offset), .. } => Some(*offset),
                    _ => None,
                });
                let x = match counter {
                    Some(offset) => self.b.ins().load(F64, Self::flags(), self.frame, offset),
                    None => self.b.ins().f64const(0.0),
                };
                self.define_result(ins, x);
            }

            Yield => {
                if !self.unit.warp {
                    self.flush()?;
                    self.suspend_here();
                }
            }
            Stop => {
                self.flush()?;
                self.finish_unit();
            }
            ReturnValue => {
                let ret = self.slot_addr(frame::RET_OFFSET);
                if self.unit.code_type == CodeType::HatPredicate {
                    let b = self.coerce(arg(0), StaticType::Bool)?;
                    self.call_void(RuntimeFn::ValueSetBool, &[ret, b])?;
                } else {
                    let v = self.coerce(arg(0), StaticType::Unknown)?;
                    self.call_void(RuntimeFn::ValueAssign, &[ret, v])?;
                }
                self.flush()?;
                self.finish_unit();
            }
            CallProcedure => self.call_procedure(ins)?,
            ProcedureArg => {
                if let (Some(index), Some(r)) = (ins.argument_index, ins.result) {
                    let offset = frame::HEADER_SIZE as i32 + (index as u32 * ValueData::SIZE) as i32;
                    let src = self.slot_addr(offset);
                    let dst = self.dest(r);
                    self.call_void(RuntimeFn::ValueAssign, &[dst, src])?;
                }
            }
        }
        Ok(())
    }

    fn host_call(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let name = ins.function_name.as_deref().unwrap_or_default();
        let mut params = Vec::new();
        let mut args = Vec::new();
        match ins.opcode {
            Opcode::FunctionCallWithCtx => args.push(self.ctx),
            Opcode::TargetFunctionCall => args.extend([self.ctx, self.target, self.variables, self.lists]),
            _ => {}
        }
        params.extend(args.iter().map(|_| AbiParam::new(self.ptr)));
        for &(ty, v) in &ins.args {
            args.push(self.coerce(v, ty)?);
            params.push(match ty {
                StaticType::Number => abi_param(Abi::F64, self.ptr),
                StaticType::Bool => abi_param(Abi::I8, self.ptr),
                _ => abi_param(Abi::Ptr, self.ptr),
            });
        }
        let ret = ins.return_type;
        let mut returns = Vec::new();
        match ret {
            StaticType::Number => returns.push(abi_param(Abi::F64, self.ptr)),
            StaticType::Bool => returns.push(abi_param(Abi::I8, self.ptr)),
            StaticType::String | StaticType::Pointer => returns.push(abi_param(Abi::Ptr, self.ptr)),
            StaticType::Unknown => {
                if let Some(r) = ins.result {
                    args.push(self.dest(r));
                    params.push(abi_param(Abi::Ptr, self.ptr));
                }
            }
            StaticType::Void => {}
        }
        self.flush()?;

        let f = self.import(name, params, returns)?;
        let inst = self.b.ins().call(f, &args);
        let result = self.b.inst_results(inst).first().copied();
        if let (Some(r), Some(x)) = (ins.result, result) {
            if ret == StaticType::String {
                let dst = self.dest(r);
                self.call(RuntimeFn::StringAdopt, &[dst, x])?;
            } else {
                self.define(r, x);
            }
        }

        if ins.opcode == Opcode::FunctionCallWithCtx && !self.unit.warp {
            let pending = self.call(RuntimeFn::PromisePending, &[self.ctx])?;
            let wait = self.b.create_block();
            let cont = self.b.create_block();
            self.b.ins().brif(pending, wait, &[], cont, &[]);
            self.b.switch_to_block(wait);
            self.suspend_here();
            self.b.ins().jump(cont, &[]);
            self.b.switch_to_block(cont);
        }
        Ok(())
    }

    fn import(&mut self, name: &str, params: Vec<AbiParam>, returns: Vec<AbiParam>) -> Result<FuncRef, JitError> {
        if let Some(&f) = self.imports.get(name) {
            return Ok(f);
        }
        if !self.host_functions.contains(name) {
            return Err(JitError::UnknownFunction(name.to_string()));
        }
        let mut sig = self.module.make_signature();
        sig.params = params;
        sig.returns = returns;
        let id = self.module.declare_function(name, Linkage::Import, &sig)?;
        let f = self.module.declare_func_in_func(id, self.b.func);
        self.imports.insert(name.to_string(), f);
        Ok(f)
    }

    fn compare(&mut self, op: Compare, a: CompilerValue, b: CompilerValue) -> Result<Value, JitError> {
        use StaticType as T;
        let unit = self.unit;
        if let (Some(x), Some(y)) = (unit.value(a).constant(), unit.value(b).constant()) {
            let ord = compare(&ValueData::from(&x.value), &ValueData::from(&y.value));
            return Ok(self.b.ins().iconst(I8, op.holds(ord) as i64));
        }
        // Numeric text constants compare exactly like the number they spell.
        let numeric = |v: CompilerValue| match unit.value(v).constant() {
            Some(c) if c.numeric.is_some() => T::Number,
            _ => unit.ty(v),
        };
        let ord = match (numeric(a), numeric(b)) {
            (T::Number, T::Number) => {
                let x = self.coerce(a, T::Number)?;
                let y = self.coerce(b, T::Number)?;
                return self.number_compare(op, x, y);
            }
            (T::Bool, T::Bool) => {
                let x = self.read(a);
                let y = self.read(b);
                return Ok(self.b.ins().icmp(op.unsigned_cc(), x, y));
            }
            (T::String, T::String) => {
                let x = self.read(a);
                let y = self.read(b);
                self.call(RuntimeFn::StringCompare, &[x, y])?
            }
            (T::Number, T::String) => {
                let n = self.coerce(a, T::Number)?;
                let s = self.read(b);
                self.call(RuntimeFn::CompareDoubleString, &[n, s])?
            }
            (T::String, T::Number) => {
                let n = self.coerce(b, T::Number)?;
                let s = self.read(a);
                let ord = self.call(RuntimeFn::CompareDoubleString, &[n, s])?;
                return Ok(self.b.ins().icmp_imm(op.flipped().signed_cc(), ord, 0));
            }
            _ => {
                let x = self.coerce(a, T::Unknown)?;
                let y = self.coerce(b, T::Unknown)?;
                self.call(RuntimeFn::ValueCompare, &[x, y])?
            }
        };
        Ok(self.b.ins().icmp_imm(op.signed_cc(), ord, 0))
    }

    /// Native comparison with a helper path for NaN, which compares as text.
    fn number_compare(&mut self, op: Compare, x: Value, y: Value) -> Result<Value, JitError> {
        let result = self.new_var(I8);
        let fast = self.b.create_block();
        let slow = self.b.create_block();
        let done = self.b.create_block();
        let unordered = self.b.ins().fcmp(FloatCC::Unordered, x, y);
        self.b.ins().brif(unordered, slow, &[], fast, &[]);

        self.b.switch_to_block(fast);
        let r = self.b.ins().fcmp(op.float_cc(), x, y);
        self.b.def_var(result, r);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(slow);
        let ord = self.call(RuntimeFn::CompareDoubles, &[x, y])?;
        let r = self.b.ins().icmp_imm(op.signed_cc(), ord, 0);
        self.b.def_var(result, r);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(done);
        Ok(self.b.use_var(result))
    }

    fn select(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let Some(r) = ins.result else {
            return Ok(());
        };
        let c = self.coerce(ins.args[0].1, StaticType::Bool)?;
        let ty = self.unit.ty(r);
        if ty == StaticType::Void {
            return Ok(());
        }
        let a = self.coerce(ins.args[1].1, ty)?;
        let b = self.coerce(ins.args[2].1, ty)?;
        let x = self.b.ins().select(c, a, b);
        match ty {
            StaticType::String => {
                let dst = self.dest(r);
                self.call(RuntimeFn::StringCopy, &[dst, x])?;
            }
            StaticType::Unknown => {
                let dst = self.dest(r);
                self.call_void(RuntimeFn::ValueAssign, &[dst, x])?;
            }
            _ => self.define(r, x),
        }
        Ok(())
    }

    fn string_length(&mut self, v: CompilerValue) -> Result<Value, JitError> {
        if let Some(c) = self.unit.value(v).constant() {
            let len = c.value.to_string().encode_utf16().count();
            return Ok(self.b.ins().f64const(len as f64));
        }
        let s = self.coerce(v, StaticType::String)?;
        let length = self.new_var(F64);
        let zero = self.b.ins().f64const(0.0);
        self.b.def_var(length, zero);
        let load = self.b.create_block();
        let done = self.b.create_block();
        self.b.ins().brif(s, load, &[], done, &[]);
        self.b.switch_to_block(load);
        let size = self.b.ins().load(self.ptr, Self::flags(), s, StringPtr::SIZE_OFFSET);
        let n = self.b.ins().fcvt_from_uint(F64, size);
        self.b.def_var(length, n);
        self.b.ins().jump(done, &[]);
        self.b.switch_to_block(done);
        Ok(self.b.use_var(length))
    }

    fn list_item(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let Some(r) = ins.result else {
            return Ok(());
        };
        let i = self.index_arg(ins.args[0].1)?;
        let l = self.list_ptr(ins.work_list);
        match self.unit.ty(r) {
            StaticType::Number => {
                let x = self.call(RuntimeFn::ListGetDouble, &[l, i])?;
                self.define(r, x);
            }
            StaticType::Bool => {
                let x = self.call(RuntimeFn::ListGetBool, &[l, i])?;
                self.define(r, x);
            }
            StaticType::String => {
                let dst = self.dest(r);
                self.call(RuntimeFn::ListGetString, &[dst, l, i])?;
            }
            _ => {
                let dst = self.dest(r);
                self.call_void(RuntimeFn::ListGetValue, &[dst, l, i])?;
            }
        }
        Ok(())
    }

    /// Round half away from zero; NaN stays NaN (zero iterations) and
    /// infinity stays infinite (unbounded).
    fn round_count(&mut self, n: Value) -> Value {
        let whole = self.b.ins().trunc(n);
        let frac = self.b.ins().fsub(n, whole);
        let frac = self.b.ins().fabs(frac);
        let half = self.b.ins().f64const(0.5);
        let up = self.b.ins().fcmp(FloatCC::GreaterThanOrEqual, frac, half);
        let one = self.b.ins().f64const(1.0);
        let step = self.b.ins().fcopysign(one, n);
        let bumped = self.b.ins().fadd(whole, step);
        self.b.ins().select(up, bumped, whole)
    }

    fn begin_repeat(&mut self, count: CompilerValue) -> Result<(), JitError> {
        let n = self.coerce(count, StaticType::Number)?;
        self.flush()?;
        let n = self.round_count(n);
        let count_slot = self.layout.scalar();
        let index_slot = self.layout.scalar();
        self.b.ins().store(Self::flags(), n, self.frame, count_slot);
        let zero = self.b.ins().f64const(0.0);
        self.b.ins().store(Self::flags(), zero, self.frame, index_slot);

        let header = self.b.create_block();
        let body = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(header, &[]);
        self.b.switch_to_block(header);
        let i = self.b.ins().load(F64, Self::flags(), self.frame, index_slot);
        let n = self.b.ins().load(F64, Self::flags(), self.frame, count_slot);
        let more = self.b.ins().fcmp(FloatCC::LessThan, i, n);
        self.b.ins().brif(more, body, &[], exit, &[]);
        self.b.switch_to_block(body);
        self.scopes.push(Scope::Loop { header, exit, counter: Some(index_slot) });
        Ok(())
    }

    fn procedure_refs(&mut self, proto: &BlockPrototype) -> Result<(FuncRef, FuncRef), JitError> {
        let (main_sig, resume_sig) = procedure_signatures(self.module, self.ptr);
        let main_name = proto.main_symbol();
        let resume_name = proto.resume_symbol();
        let main = self.module.declare_function(&main_name, Linkage::Export, &main_sig)?;
        let resume = self.module.declare_function(&resume_name, Linkage::Export, &resume_sig)?;
        self.declared.insert(main_name);
        self.declared.insert(resume_name);
        Ok((self.module.declare_func_in_func(main, self.b.func), self.module.declare_func_in_func(resume, self.b.func)))
    }

    /// Calls a procedure's main entry. A returned handle is the callee's
    /// suspended frame: non-warp callers suspend between resumes, warp
    /// callers resume it in place until it finishes.
    fn call_procedure(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let Some(proto) = ins.procedure.clone() else {
            return Ok(());
        };
        let count = proto.argument_ids.len();
        let args = if count > 0 {
            let base = self.layout.values(count);
            for (i, &(_, v)) in ins.args.iter().enumerate().take(count) {
                let src = self.coerce(v, StaticType::Unknown)?;
                let dst = self.slot_addr(base + (i as u32 * ValueData::SIZE) as i32);
                self.call_void(RuntimeFn::ValueAssign, &[dst, src])?;
            }
            self.slot_addr(base)
        } else {
            self.b.ins().iconst(self.ptr, 0)
        };
        self.flush()?;

        let (main, resume) = self.procedure_refs(&proto)?;
        let call = self.b.ins().call(main, &[self.ctx, self.target, self.variables, self.lists, args]);
        let handle = self.b.inst_results(call)[0];
        let handle_slot = self.layout.handle();

        let suspended = self.b.create_block();
        let poll = self.b.create_block();
        let finished = self.b.create_block();
        let done = self.b.create_block();
        self.b.ins().brif(handle, suspended, &[], done, &[]);

        self.b.switch_to_block(suspended);
        self.b.ins().store(Self::flags(), handle, self.frame, handle_slot);
        let again = if self.unit.warp || proto.warp {
            self.b.ins().jump(poll, &[]);
            poll
        } else {
            let pause = self.b.create_block();
            self.b.ins().jump(pause, &[]);
            self.b.switch_to_block(pause);
            let k = self.add_resume_point(poll);
            self.store_state(k);
            let zero = self.b.ins().iconst(I8, 0);
            self.b.ins().return_(&[zero]);
            pause
        };

        self.b.switch_to_block(poll);
        let callee = self.b.ins().load(self.ptr, Self::flags(), self.frame, handle_slot);
        let call = self.b.ins().call(resume, &[callee]);
        let callee_done = self.b.inst_results(call)[0];
        self.b.ins().brif(callee_done, finished, &[], again, &[]);

        self.b.switch_to_block(finished);
        let null = self.b.ins().iconst(self.ptr, 0);
        self.b.ins().store(Self::flags(), null, self.frame, handle_slot);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(done);
        Ok(())
    }
}
