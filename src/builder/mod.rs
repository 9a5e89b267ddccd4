//! Code builder: the API block translators use to describe one compiled unit.
//!
//! Calls append instructions to a flat list and hand back [`CompilerValue`]
//! handles. Nothing is checked against runtime data here; [`CodeBuilder::build`]
//! narrows types, lowers the unit and returns the executable.

mod resolve;

use std::rc::Rc;

use tracing::debug;

use crate::ir::{
    BlockPrototype, CodeType, CompilerConstant, CompilerLocalVariable, CompilerValue, Instruction, Opcode,
    StaticType, Unit, ValueInfo, ValueSource,
};
use crate::jit::{CompilerContext, ExecutableCode};
use crate::target::{ListId, VariableId};
use crate::value::Value;

pub struct CodeBuilder {
    ctx: Rc<CompilerContext>,
    code_type: CodeType,
    prototype: Option<Rc<BlockPrototype>>,
    warp: bool,
    code: Vec<Instruction>,
    values: Vec<ValueInfo>,
    locals: Vec<StaticType>,
    /// Open scope markers, for nesting checks.
    scopes: Vec<Opcode>,
}

impl CodeBuilder {
    /// Starts a unit. Procedures (`prototype` set) are scripts whose main
    /// entry takes the argument values.
    pub fn new(ctx: Rc<CompilerContext>, code_type: CodeType, prototype: Option<BlockPrototype>) -> Self {
        let prototype = prototype.map(Rc::new);
        debug_assert!(prototype.is_none() || code_type == CodeType::Script, "procedures are script units");
        let warp = code_type != CodeType::Script || prototype.as_ref().is_some_and(|p| p.warp);
        CodeBuilder {
            ctx,
            code_type,
            prototype,
            warp,
            code: Vec::new(),
            values: Vec::new(),
            locals: Vec::new(),
            scopes: Vec::new(),
        }
    }

    /// Runs the unit without suspending. Reporters, predicates and warp
    /// procedures are always warp. Turning warp on drops the yields already
    /// emitted; turning it off does not add loop yields retroactively.
    pub fn set_warp(&mut self, warp: bool) {
        self.warp = warp || self.code_type != CodeType::Script || self.prototype.as_ref().is_some_and(|p| p.warp);
        if self.warp {
            self.code.retain(|ins| ins.opcode != Opcode::Yield);
        }
    }

    pub fn is_warp(&self) -> bool {
        self.warp
    }

    fn register(&mut self, ty: StaticType) -> CompilerValue {
        let v = CompilerValue(self.values.len() as u32);
        self.values.push(ValueInfo::register(ty));
        v
    }

    fn emit(&mut self, ins: Instruction) {
        self.code.push(ins);
    }

    fn emit_value(&mut self, ins: Instruction, ty: StaticType) -> CompilerValue {
        let r = self.register(ty);
        self.code.push(ins.with_result(r));
        r
    }

    fn op(&mut self, opcode: Opcode, args: &[(StaticType, CompilerValue)], ty: StaticType) -> CompilerValue {
        self.emit_value(Instruction::new(opcode).with_args(args.to_vec()), ty)
    }

    fn number_op(&mut self, opcode: Opcode, args: &[CompilerValue]) -> CompilerValue {
        let args: Vec<_> = args.iter().map(|&v| (StaticType::Number, v)).collect();
        self.op(opcode, &args, StaticType::Number)
    }

    // ── Values and calls ──

    /// Registers a compile-time constant. Text that spells a number exactly
    /// is also usable as that number.
    pub fn add_const_value(&mut self, value: impl Into<Value>) -> CompilerValue {
        let value = value.into();
        let ty = StaticType::of_value(&value);
        let v = CompilerValue(self.values.len() as u32);
        self.values.push(ValueInfo { ty, source: ValueSource::Constant(CompilerConstant::new(value)) });
        v
    }

    fn call(
        &mut self,
        opcode: Opcode,
        name: &str,
        return_type: StaticType,
        arg_types: &[StaticType],
        args: &[CompilerValue],
    ) -> Option<CompilerValue> {
        debug_assert_eq!(arg_types.len(), args.len(), "argument count mismatch calling {name}");
        let mut ins = Instruction::new(opcode).with_args(arg_types.iter().copied().zip(args.iter().copied()).collect());
        ins.function_name = Some(name.to_string());
        ins.return_type = return_type;
        if return_type == StaticType::Void {
            self.emit(ins);
            None
        } else {
            Some(self.emit_value(ins, return_type))
        }
    }

    /// Calls a registered host function with explicit arguments only.
    pub fn add_function_call(
        &mut self,
        name: &str,
        return_type: StaticType,
        arg_types: &[StaticType],
        args: &[CompilerValue],
    ) -> Option<CompilerValue> {
        self.call(Opcode::FunctionCall, name, return_type, arg_types, args)
    }

    /// Like [`add_function_call`](Self::add_function_call) with the running
    /// execution context as the first argument. In non-warp code a promise
    /// left pending by the call suspends the unit until it resolves.
    pub fn add_function_call_with_ctx(
        &mut self,
        name: &str,
        return_type: StaticType,
        arg_types: &[StaticType],
        args: &[CompilerValue],
    ) -> Option<CompilerValue> {
        self.call(Opcode::FunctionCallWithCtx, name, return_type, arg_types, args)
    }

    /// Passes the context, target and the target's variable and list storage
    /// ahead of the explicit arguments.
    pub fn add_target_function_call(
        &mut self,
        name: &str,
        return_type: StaticType,
        arg_types: &[StaticType],
        args: &[CompilerValue],
    ) -> Option<CompilerValue> {
        self.call(Opcode::TargetFunctionCall, name, return_type, arg_types, args)
    }

    /// 0-based iteration of the innermost `repeat` loop.
    pub fn add_loop_index(&mut self) -> CompilerValue {
        self.op(Opcode::LoopIndex, &[], StaticType::Number)
    }

    /// Value of a formal parameter of the procedure being built. Unknown
    /// names read as an empty string.
    pub fn add_procedure_argument(&mut self, name: &str) -> CompilerValue {
        let index = self.prototype.as_ref().and_then(|p| p.argument_names.iter().position(|n| n == name));
        match index {
            Some(index) => {
                let mut ins = Instruction::new(Opcode::ProcedureArg);
                ins.argument_index = Some(index);
                self.emit_value(ins, StaticType::Unknown)
            }
            None => self.add_const_value(""),
        }
    }

    // ── Operators ──

    pub fn create_add(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Add, &[a, b])
    }

    pub fn create_sub(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Sub, &[a, b])
    }

    pub fn create_mul(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Mul, &[a, b])
    }

    pub fn create_div(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Div, &[a, b])
    }

    /// Floored modulo.
    pub fn create_mod(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Mod, &[a, b])
    }

    pub fn create_round(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Round, &[a])
    }

    pub fn create_abs(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Abs, &[a])
    }

    pub fn create_floor(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Floor, &[a])
    }

    pub fn create_ceil(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Ceil, &[a])
    }

    pub fn create_sqrt(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Sqrt, &[a])
    }

    /// Trigonometry works in degrees.
    pub fn create_sin(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Sin, &[a])
    }

    pub fn create_cos(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Cos, &[a])
    }

    pub fn create_tan(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Tan, &[a])
    }

    pub fn create_asin(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Asin, &[a])
    }

    pub fn create_acos(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Acos, &[a])
    }

    pub fn create_atan(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Atan, &[a])
    }

    pub fn create_ln(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Ln, &[a])
    }

    pub fn create_log10(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Log10, &[a])
    }

    pub fn create_exp(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Exp, &[a])
    }

    pub fn create_exp10(&mut self, a: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Exp10, &[a])
    }

    /// Uniform in `[from, to]`; integral when both bounds are integers.
    pub fn create_random(&mut self, from: CompilerValue, to: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::Random, &[from, to])
    }

    /// Integer in `[from, to]` regardless of the bounds' form.
    pub fn create_random_int(&mut self, from: CompilerValue, to: CompilerValue) -> CompilerValue {
        self.number_op(Opcode::RandomInt, &[from, to])
    }

    fn comparison(&mut self, opcode: Opcode, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.op(opcode, &[(StaticType::Unknown, a), (StaticType::Unknown, b)], StaticType::Bool)
    }

    /// Loose equality.
    pub fn create_cmp_eq(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.comparison(Opcode::CmpEq, a, b)
    }

    pub fn create_cmp_gt(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.comparison(Opcode::CmpGt, a, b)
    }

    pub fn create_cmp_lt(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.comparison(Opcode::CmpLt, a, b)
    }

    /// Plain text equality, no numeric interpretation.
    pub fn create_str_cmp_eq(&mut self, a: CompilerValue, b: CompilerValue, case_sensitive: bool) -> CompilerValue {
        let opcode = if case_sensitive { Opcode::StrCmpEqCs } else { Opcode::StrCmpEqCi };
        self.op(opcode, &[(StaticType::String, a), (StaticType::String, b)], StaticType::Bool)
    }

    pub fn create_and(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.op(Opcode::And, &[(StaticType::Bool, a), (StaticType::Bool, b)], StaticType::Bool)
    }

    pub fn create_or(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.op(Opcode::Or, &[(StaticType::Bool, a), (StaticType::Bool, b)], StaticType::Bool)
    }

    pub fn create_not(&mut self, a: CompilerValue) -> CompilerValue {
        self.op(Opcode::Not, &[(StaticType::Bool, a)], StaticType::Bool)
    }

    /// `cond ? a : b`, both sides converted to `ty`.
    pub fn create_select(
        &mut self,
        cond: CompilerValue,
        a: CompilerValue,
        b: CompilerValue,
        ty: StaticType,
    ) -> CompilerValue {
        self.op(Opcode::Select, &[(StaticType::Bool, cond), (ty, a), (ty, b)], ty)
    }

    pub fn create_string_concat(&mut self, a: CompilerValue, b: CompilerValue) -> CompilerValue {
        self.op(Opcode::StringConcat, &[(StaticType::String, a), (StaticType::String, b)], StaticType::String)
    }

    /// 0-based UTF-16 unit; empty when out of range.
    pub fn add_string_char(&mut self, s: CompilerValue, index: CompilerValue) -> CompilerValue {
        self.op(Opcode::StringChar, &[(StaticType::String, s), (StaticType::Number, index)], StaticType::String)
    }

    pub fn add_string_length(&mut self, s: CompilerValue) -> CompilerValue {
        self.op(Opcode::StringLength, &[(StaticType::String, s)], StaticType::Number)
    }

    // ── Locals ──

    pub fn create_local_variable(&mut self, ty: StaticType) -> CompilerLocalVariable {
        let local = CompilerLocalVariable { id: self.locals.len() as u32, ty };
        self.locals.push(ty);
        local
    }

    pub fn create_local_variable_write(&mut self, local: CompilerLocalVariable, value: CompilerValue) {
        let mut ins = Instruction::new(Opcode::WriteLocalVariable).with_args(vec![(local.ty, value)]);
        ins.work_local = Some(local);
        self.emit(ins);
    }

    pub fn add_local_variable_value(&mut self, local: CompilerLocalVariable) -> CompilerValue {
        let mut ins = Instruction::new(Opcode::ReadLocalVariable);
        ins.work_local = Some(local);
        self.emit_value(ins, local.ty)
    }

    // ── Variables ──

    /// Writes may be kept out of storage until something could observe it.
    pub fn create_variable_write(&mut self, var: VariableId, value: CompilerValue) {
        self.emit(Instruction::new(Opcode::WriteVariable).with_args(vec![(StaticType::Unknown, value)]).with_variable(var));
    }

    pub fn add_variable_value(&mut self, var: VariableId) -> CompilerValue {
        self.emit_value(Instruction::new(Opcode::ReadVariable).with_variable(var), StaticType::Unknown)
    }

    // ── Lists (0-based indices) ──

    fn list_op(&mut self, opcode: Opcode, list: ListId, args: Vec<(StaticType, CompilerValue)>) -> Instruction {
        Instruction::new(opcode).with_args(args).with_list(list)
    }

    pub fn create_list_clear(&mut self, list: ListId) {
        let ins = self.list_op(Opcode::ClearList, list, Vec::new());
        self.emit(ins);
    }

    /// No-op when `index` is out of range.
    pub fn create_list_remove(&mut self, list: ListId, index: CompilerValue) {
        let ins = self.list_op(Opcode::RemoveListItem, list, vec![(StaticType::Number, index)]);
        self.emit(ins);
    }

    pub fn create_list_append(&mut self, list: ListId, item: CompilerValue) {
        let ins = self.list_op(Opcode::AppendToList, list, vec![(StaticType::Unknown, item)]);
        self.emit(ins);
    }

    /// Appends when `index` equals the size; no-op when out of range.
    pub fn create_list_insert(&mut self, list: ListId, index: CompilerValue, item: CompilerValue) {
        let ins =
            self.list_op(Opcode::InsertToList, list, vec![(StaticType::Number, index), (StaticType::Unknown, item)]);
        self.emit(ins);
    }

    /// No-op when `index` is out of range.
    pub fn create_list_replace(&mut self, list: ListId, index: CompilerValue, item: CompilerValue) {
        let ins =
            self.list_op(Opcode::ListReplace, list, vec![(StaticType::Number, index), (StaticType::Unknown, item)]);
        self.emit(ins);
    }

    /// Items joined with spaces, or without a separator when every item is
    /// a single character.
    pub fn add_list_contents(&mut self, list: ListId) -> CompilerValue {
        let ins = self.list_op(Opcode::GetListContents, list, Vec::new());
        self.emit_value(ins, StaticType::String)
    }

    /// The item, or the zero value of its type when out of range.
    pub fn add_list_item(&mut self, list: ListId, index: CompilerValue) -> CompilerValue {
        let ins = self.list_op(Opcode::GetListItem, list, vec![(StaticType::Number, index)]);
        self.emit_value(ins, StaticType::Unknown)
    }

    /// 0-based position of the first loosely equal item, or -1.
    pub fn add_list_item_index(&mut self, list: ListId, item: CompilerValue) -> CompilerValue {
        let ins = self.list_op(Opcode::GetListItemIndex, list, vec![(StaticType::Unknown, item)]);
        self.emit_value(ins, StaticType::Number)
    }

    pub fn add_list_contains(&mut self, list: ListId, item: CompilerValue) -> CompilerValue {
        let ins = self.list_op(Opcode::ListContainsItem, list, vec![(StaticType::Unknown, item)]);
        self.emit_value(ins, StaticType::Bool)
    }

    pub fn add_list_size(&mut self, list: ListId) -> CompilerValue {
        let ins = self.list_op(Opcode::GetListSize, list, Vec::new());
        self.emit_value(ins, StaticType::Number)
    }

    // ── Control flow ──

    pub fn begin_if_statement(&mut self, cond: CompilerValue) {
        self.scopes.push(Opcode::BeginIf);
        self.emit(Instruction::new(Opcode::BeginIf).with_args(vec![(StaticType::Bool, cond)]));
    }

    pub fn begin_else_branch(&mut self) {
        debug_assert_eq!(self.scopes.last(), Some(&Opcode::BeginIf), "else outside of an if");
        self.emit(Instruction::new(Opcode::BeginElse));
    }

    pub fn end_if(&mut self) {
        let open = self.scopes.pop();
        debug_assert_eq!(open, Some(Opcode::BeginIf), "end_if without an open if");
        self.emit(Instruction::new(Opcode::EndIf));
    }

    /// Runs the body `count` times, rounded half away from zero.
    pub fn begin_repeat_loop(&mut self, count: CompilerValue) {
        self.scopes.push(Opcode::BeginRepeatLoop);
        self.emit(Instruction::new(Opcode::BeginRepeatLoop).with_args(vec![(StaticType::Number, count)]));
    }

    /// Marks where a while/until condition starts; the condition is
    /// re-evaluated from here on every iteration.
    pub fn begin_loop_condition(&mut self) {
        self.scopes.push(Opcode::BeginLoopCondition);
        self.emit(Instruction::new(Opcode::BeginLoopCondition));
    }

    fn begin_conditional_loop(&mut self, opcode: Opcode, cond: CompilerValue) {
        debug_assert_eq!(self.scopes.last(), Some(&Opcode::BeginLoopCondition), "loop condition not marked");
        if self.scopes.last() == Some(&Opcode::BeginLoopCondition) {
            self.scopes.pop();
        }
        self.scopes.push(opcode);
        self.emit(Instruction::new(opcode).with_args(vec![(StaticType::Bool, cond)]));
    }

    pub fn begin_while_loop(&mut self, cond: CompilerValue) {
        self.begin_conditional_loop(Opcode::BeginWhileLoop, cond);
    }

    pub fn begin_repeat_until_loop(&mut self, cond: CompilerValue) {
        self.begin_conditional_loop(Opcode::BeginRepeatUntilLoop, cond);
    }

    /// Closes the innermost loop. Non-warp loops yield once per iteration.
    pub fn end_loop(&mut self) {
        let open = self.scopes.pop();
        debug_assert!(
            matches!(open, Some(Opcode::BeginRepeatLoop | Opcode::BeginWhileLoop | Opcode::BeginRepeatUntilLoop)),
            "end_loop without an open loop"
        );
        if !self.warp {
            self.emit(Instruction::new(Opcode::Yield));
        }
        self.emit(Instruction::new(Opcode::EndLoop));
    }

    pub fn yield_(&mut self) {
        debug_assert!(!self.warp, "yield in warp code");
        self.emit(Instruction::new(Opcode::Yield));
    }

    /// Ends the unit; nothing after it runs.
    pub fn create_stop(&mut self) {
        self.emit(Instruction::new(Opcode::Stop));
    }

    /// Result of a reporter or predicate; ends the unit.
    pub fn add_return_value(&mut self, value: CompilerValue) {
        debug_assert!(self.code_type != CodeType::Script, "scripts do not return values");
        self.emit(Instruction::new(Opcode::ReturnValue).with_args(vec![(StaticType::Unknown, value)]));
    }

    /// Calls a procedure, built before or after this unit in the same
    /// compiler context.
    pub fn create_procedure_call(&mut self, prototype: &BlockPrototype, args: &[CompilerValue]) {
        let prototype = Rc::new(prototype.clone());
        debug_assert_eq!(prototype.argument_ids.len(), args.len(), "argument count mismatch calling a procedure");
        let mut ins = Instruction::new(Opcode::CallProcedure)
            .with_args(args.iter().map(|&v| (StaticType::Unknown, v)).collect());
        ins.procedure = Some(prototype);
        self.emit(ins);
    }

    /// Narrows types, lowers the unit into the compiler context and wraps the
    /// entry points. Backend failures yield a non-functional executable.
    pub fn build(self) -> ExecutableCode {
        debug_assert!(self.scopes.is_empty(), "unbalanced scopes: {:?}", self.scopes);
        let mut values = self.values;
        resolve::resolve_types(&self.code, &mut values);
        let unit = Unit {
            code_type: self.code_type,
            warp: self.warp,
            prototype: self.prototype,
            code: self.code,
            values,
            locals: self.locals,
        };
        debug!(
            code_type = ?unit.code_type,
            warp = unit.warp,
            instructions = unit.code.len(),
            values = unit.values.len(),
            "building unit"
        );
        ExecutableCode::compile(self.ctx, &unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::{FunctionRegistry, JitOptions};

    fn context() -> Rc<CompilerContext> {
        CompilerContext::new(&FunctionRegistry::new(), &JitOptions::default())
    }

    fn script(warp: bool) -> CodeBuilder {
        let mut b = CodeBuilder::new(context(), CodeType::Script, None);
        b.set_warp(warp);
        b
    }

    #[test]
    fn numeric_text_constants_carry_their_number() {
        let mut b = script(true);
        let v = b.add_const_value(" 3.14 ");
        let w = b.add_const_value("3.14");
        assert_eq!(b.values[v.index()].ty, StaticType::String);
        assert_eq!(b.values[v.index()].constant().and_then(|c| c.numeric), None);
        assert_eq!(b.values[w.index()].constant().and_then(|c| c.numeric), Some(3.14));
    }

    #[test]
    fn non_warp_loops_yield_each_iteration() {
        let mut b = script(false);
        let n = b.add_const_value(3.0);
        b.begin_repeat_loop(n);
        b.end_loop();
        let ops: Vec<_> = b.code.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::BeginRepeatLoop, Opcode::Yield, Opcode::EndLoop]);

        let mut w = script(true);
        w.begin_repeat_loop(n);
        w.end_loop();
        assert!(!w.code.iter().any(|i| i.opcode == Opcode::Yield));
    }

    #[test]
    fn late_warp_drops_loop_yields() {
        let mut b = script(false);
        let var = VariableId(0);
        let five = b.add_const_value(5.0);
        b.create_variable_write(var, five);
        let n = b.add_const_value(3.0);
        b.begin_repeat_loop(n);
        let inside = b.add_variable_value(var);
        b.end_loop();
        b.set_warp(true);

        let ops: Vec<_> = b.code.iter().map(|i| i.opcode).collect();
        assert!(!ops.contains(&Opcode::Yield));
        assert_eq!(ops.last(), Some(&Opcode::EndLoop));
        resolve::resolve_types(&b.code, &mut b.values);
        assert_eq!(b.values[inside.index()].ty, StaticType::Number);
    }

    #[test]
    fn reporters_and_warp_procedures_are_warp() {
        let reporter = CodeBuilder::new(context(), CodeType::Reporter, None);
        assert!(reporter.is_warp());
        let proc = CodeBuilder::new(context(), CodeType::Script, Some(BlockPrototype::new("p", &[], true)));
        assert!(proc.is_warp());
        let mut plain = script(false);
        assert!(!plain.is_warp());
        plain.set_warp(true);
        assert!(plain.is_warp());
    }

    #[test]
    fn void_calls_have_no_result() {
        let mut b = script(true);
        let x = b.add_const_value(1.0);
        assert!(b.add_function_call("f", StaticType::Void, &[StaticType::Number], &[x]).is_none());
        assert!(b.add_function_call("g", StaticType::Number, &[], &[]).is_some());
        assert_eq!(b.code[0].function_name.as_deref(), Some("f"));
        assert_eq!(b.code[0].args, vec![(StaticType::Number, x)]);
    }

    #[test]
    fn procedure_arguments_resolve_by_name() {
        let proto = BlockPrototype::new("greet %s %n", &["who", "times"], false);
        let mut b = CodeBuilder::new(context(), CodeType::Script, Some(proto));
        let times = b.add_procedure_argument("times");
        assert_eq!(b.code.last().and_then(|i| i.argument_index), Some(1));
        assert_eq!(b.code.last().and_then(|i| i.result), Some(times));
        let missing = b.add_procedure_argument("nobody");
        let constant = b.values[missing.index()].constant().map(|c| c.value.clone());
        assert_eq!(constant, Some(Value::from("")));
    }
}
