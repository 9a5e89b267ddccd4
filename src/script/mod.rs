//! JSON script front end.
//!
//! A script file declares a sprite's variables and lists, any custom
//! procedures, and one top-level script. Loading walks the statement tree
//! and drives a [`CodeBuilder`] per unit, so every program goes through the
//! same builder API a block translator would use.
//!
//! ```json
//! {
//!   "variables": { "n": 0 },
//!   "lists": { "log": [] },
//!   "procedures": [
//!     { "name": "bump %s", "args": ["by"], "warp": true,
//!       "body": [{ "op": "change", "var": "n", "by": { "op": "arg", "name": "by" } }] }
//!   ],
//!   "script": [
//!     { "op": "repeat", "times": 3, "body": [{ "op": "call", "name": "bump %s", "args": [2] }] },
//!     { "op": "say", "value": { "op": "var", "name": "n" } }
//!   ]
//! }
//! ```
//!
//! List indices are 0-based.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::builder::CodeBuilder;
use crate::ir::{BlockPrototype, CodeType, CompilerValue, StaticType};
use crate::jit::{CompilerContext, ExecutableCode, ExecutionContext, FunctionRegistry};
use crate::target::{ListId, Target, VariableId};
use crate::value::{Value, ValueData};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid script: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("unknown list `{0}`")]
    UnknownList(String),
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),
    #[error("procedure `{0}` is defined twice")]
    DuplicateProcedure(String),
    #[error("procedure `{name}` takes {expected} arguments, got {got}")]
    ArgumentCount { name: String, expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Value {
        match lit {
            Literal::Number(n) => Value::Number(*n),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Text(s) => Value::from(s.as_str()),
        }
    }
}

/// A bare JSON literal or an `{"op": ...}` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    Literal(Literal),
    Op(Box<Op>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathFunc {
    Abs,
    Floor,
    Ceiling,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Ln,
    Log,
    Exp,
    Exp10,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Const { value: Literal },
    Var { name: String },
    Arg { name: String },
    Add { a: Expr, b: Expr },
    Sub { a: Expr, b: Expr },
    Mul { a: Expr, b: Expr },
    Div { a: Expr, b: Expr },
    Mod { a: Expr, b: Expr },
    Round { value: Expr },
    Math { func: MathFunc, value: Expr },
    Random { from: Expr, to: Expr },
    Eq { a: Expr, b: Expr },
    Gt { a: Expr, b: Expr },
    Lt { a: Expr, b: Expr },
    And { a: Expr, b: Expr },
    Or { a: Expr, b: Expr },
    Not { value: Expr },
    Join { a: Expr, b: Expr },
    Letter { index: Expr, value: Expr },
    Length { value: Expr },
    Item { list: String, index: Expr },
    IndexOf { list: String, item: Expr },
    Contains { list: String, item: Expr },
    Size { list: String },
    Contents { list: String },
    LoopIndex,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stmt {
    Set { var: String, value: Expr },
    Change { var: String, by: Expr },
    Say { value: Expr },
    If {
        cond: Expr,
        #[serde(default)]
        then: Vec<Stmt>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Stmt>,
    },
    Repeat { times: Expr, body: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    Until { cond: Expr, body: Vec<Stmt> },
    Append { list: String, item: Expr },
    Insert { list: String, index: Expr, item: Expr },
    Replace { list: String, index: Expr, item: Expr },
    Delete { list: String, index: Expr },
    Clear { list: String },
    Yield,
    Stop,
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcedureDef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub warp: bool,
    pub body: Vec<Stmt>,
}

impl ProcedureDef {
    fn prototype(&self) -> BlockPrototype {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        BlockPrototype::new(self.name.as_str(), &args, self.warp)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptFile {
    #[serde(default)]
    pub variables: BTreeMap<String, Literal>,
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<Literal>>,
    #[serde(default)]
    pub procedures: Vec<ProcedureDef>,
    pub script: Vec<Stmt>,
}

impl ScriptFile {
    pub fn parse(json: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let json = std::fs::read_to_string(path)
            .map_err(|source| ScriptError::Io { path: path.display().to_string(), source })?;
        Self::parse(&json)
    }

    /// Builds the procedures and the top-level script into `ctx`. `warp`
    /// runs the top-level script without suspending.
    pub fn compile(&self, ctx: &Rc<CompilerContext>, warp: bool) -> Result<Program, ScriptError> {
        let mut target = Target::new("sprite");
        for (name, value) in &self.variables {
            target.add_variable(name.as_str(), Value::from(value));
        }
        for (name, items) in &self.lists {
            target.add_list(name.as_str(), items.iter().map(Value::from).collect());
        }

        let mut prototypes = HashMap::new();
        for def in &self.procedures {
            if prototypes.insert(def.name.as_str(), def.prototype()).is_some() {
                return Err(ScriptError::DuplicateProcedure(def.name.clone()));
            }
        }
        let scope = Scope { target: &target, prototypes: &prototypes };

        let mut procedures = Vec::with_capacity(self.procedures.len());
        for def in &self.procedures {
            let mut b = CodeBuilder::new(Rc::clone(ctx), CodeType::Script, Some(def.prototype()));
            scope.block(&mut b, &def.body)?;
            debug!(procedure = %def.name, warp = def.warp, "procedure built");
            procedures.push(b.build());
        }

        let mut b = CodeBuilder::new(Rc::clone(ctx), CodeType::Script, None);
        b.set_warp(warp);
        scope.block(&mut b, &self.script)?;
        let script = b.build();
        info!(procedures = procedures.len(), functional = script.is_functional(), "script compiled");

        Ok(Program { target: Rc::new(RefCell::new(target)), script, _procedures: procedures })
    }
}

/// Name resolution while walking one unit.
struct Scope<'a> {
    target: &'a Target,
    prototypes: &'a HashMap<&'a str, BlockPrototype>,
}

impl Scope<'_> {
    fn variable(&self, name: &str) -> Result<VariableId, ScriptError> {
        self.target.find_variable(name).ok_or_else(|| ScriptError::UnknownVariable(name.to_string()))
    }

    fn list(&self, name: &str) -> Result<ListId, ScriptError> {
        self.target.find_list(name).ok_or_else(|| ScriptError::UnknownList(name.to_string()))
    }

    fn block(&self, b: &mut CodeBuilder, stmts: &[Stmt]) -> Result<(), ScriptError> {
        stmts.iter().try_for_each(|s| self.stmt(b, s))
    }

    fn stmt(&self, b: &mut CodeBuilder, stmt: &Stmt) -> Result<(), ScriptError> {
        match stmt {
            Stmt::Set { var, value } => {
                let var = self.variable(var)?;
                let v = self.expr(b, value)?;
                b.create_variable_write(var, v);
            }
            Stmt::Change { var, by } => {
                let var = self.variable(var)?;
                let by = self.expr(b, by)?;
                let current = b.add_variable_value(var);
                let next = b.create_add(current, by);
                b.create_variable_write(var, next);
            }
            Stmt::Say { value } => {
                let v = self.expr(b, value)?;
                b.add_function_call("say", StaticType::Void, &[StaticType::Unknown], &[v]);
            }
            Stmt::If { cond, then, otherwise } => {
                let cond = self.expr(b, cond)?;
                b.begin_if_statement(cond);
                self.block(b, then)?;
                if !otherwise.is_empty() {
                    b.begin_else_branch();
                    self.block(b, otherwise)?;
                }
                b.end_if();
            }
            Stmt::Repeat { times, body } => {
                let times = self.expr(b, times)?;
                b.begin_repeat_loop(times);
                self.block(b, body)?;
                b.end_loop();
            }
            Stmt::While { cond, body } => {
                b.begin_loop_condition();
                let cond = self.expr(b, cond)?;
                b.begin_while_loop(cond);
                self.block(b, body)?;
                b.end_loop();
            }
            Stmt::Until { cond, body } => {
                b.begin_loop_condition();
                let cond = self.expr(b, cond)?;
                b.begin_repeat_until_loop(cond);
                self.block(b, body)?;
                b.end_loop();
            }
            Stmt::Append { list, item } => {
                let list = self.list(list)?;
                let item = self.expr(b, item)?;
                b.create_list_append(list, item);
            }
            Stmt::Insert { list, index, item } => {
                let list = self.list(list)?;
                let index = self.expr(b, index)?;
                let item = self.expr(b, item)?;
                b.create_list_insert(list, index, item);
            }
            Stmt::Replace { list, index, item } => {
                let list = self.list(list)?;
                let index = self.expr(b, index)?;
                let item = self.expr(b, item)?;
                b.create_list_replace(list, index, item);
            }
            Stmt::Delete { list, index } => {
                let list = self.list(list)?;
                let index = self.expr(b, index)?;
                b.create_list_remove(list, index);
            }
            Stmt::Clear { list } => b.create_list_clear(self.list(list)?),
            // Warp code never suspends.
            Stmt::Yield if b.is_warp() => {}
            Stmt::Yield => b.yield_(),
            Stmt::Stop => b.create_stop(),
            Stmt::Call { name, args } => {
                let prototype =
                    self.prototypes.get(name.as_str()).ok_or_else(|| ScriptError::UnknownProcedure(name.clone()))?;
                if prototype.argument_ids.len() != args.len() {
                    return Err(ScriptError::ArgumentCount {
                        name: name.clone(),
                        expected: prototype.argument_ids.len(),
                        got: args.len(),
                    });
                }
                let args = args.iter().map(|a| self.expr(b, a)).collect::<Result<Vec<_>, _>>()?;
                b.create_procedure_call(prototype, &args);
            }
        }
        Ok(())
    }

    fn expr(&self, b: &mut CodeBuilder, expr: &Expr) -> Result<CompilerValue, ScriptError> {
        let op = match expr {
            Expr::Literal(lit) => return Ok(b.add_const_value(Value::from(lit))),
            Expr::Op(op) => &**op,
        };
        Ok(match op {
            Op::Const { value } => b.add_const_value(Value::from(value)),
            Op::Var { name } => b.add_variable_value(self.variable(name)?),
            Op::Arg { name } => b.add_procedure_argument(name),
            Op::Add { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_add)?,
            Op::Sub { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_sub)?,
            Op::Mul { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_mul)?,
            Op::Div { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_div)?,
            Op::Mod { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_mod)?,
            Op::Eq { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_cmp_eq)?,
            Op::Gt { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_cmp_gt)?,
            Op::Lt { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_cmp_lt)?,
            Op::And { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_and)?,
            Op::Or { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_or)?,
            Op::Join { a, b: rhs } => self.binary(b, a, rhs, CodeBuilder::create_string_concat)?,
            Op::Random { from, to } => self.binary(b, from, to, CodeBuilder::create_random)?,
            Op::Round { value } => {
                let v = self.expr(b, value)?;
                b.create_round(v)
            }
            Op::Not { value } => {
                let v = self.expr(b, value)?;
                b.create_not(v)
            }
            Op::Length { value } => {
                let v = self.expr(b, value)?;
                b.add_string_length(v)
            }
            Op::Letter { index, value } => {
                let s = self.expr(b, value)?;
                let index = self.expr(b, index)?;
                b.add_string_char(s, index)
            }
            Op::Math { func, value } => {
                let v = self.expr(b, value)?;
                match func {
                    MathFunc::Abs => b.create_abs(v),
                    MathFunc::Floor => b.create_floor(v),
                    MathFunc::Ceiling => b.create_ceil(v),
                    MathFunc::Sqrt => b.create_sqrt(v),
                    MathFunc::Sin => b.create_sin(v),
                    MathFunc::Cos => b.create_cos(v),
                    MathFunc::Tan => b.create_tan(v),
                    MathFunc::Asin => b.create_asin(v),
                    MathFunc::Acos => b.create_acos(v),
                    MathFunc::Atan => b.create_atan(v),
                    MathFunc::Ln => b.create_ln(v),
                    MathFunc::Log => b.create_log10(v),
                    MathFunc::Exp => b.create_exp(v),
                    MathFunc::Exp10 => b.create_exp10(v),
                }
            }
            Op::Item { list, index } => {
                let list = self.list(list)?;
                let index = self.expr(b, index)?;
                b.add_list_item(list, index)
            }
            Op::IndexOf { list, item } => {
                let list = self.list(list)?;
                let item = self.expr(b, item)?;
                b.add_list_item_index(list, item)
            }
            Op::Contains { list, item } => {
                let list = self.list(list)?;
                let item = self.expr(b, item)?;
                b.add_list_contains(list, item)
            }
            Op::Size { list } => b.add_list_size(self.list(list)?),
            Op::Contents { list } => b.add_list_contents(self.list(list)?),
            Op::LoopIndex => b.add_loop_index(),
        })
    }

    fn binary(
        &self,
        b: &mut CodeBuilder,
        lhs: &Expr,
        rhs: &Expr,
        create: fn(&mut CodeBuilder, CompilerValue, CompilerValue) -> CompilerValue,
    ) -> Result<CompilerValue, ScriptError> {
        let lhs = self.expr(b, lhs)?;
        let rhs = self.expr(b, rhs)?;
        Ok(create(b, lhs, rhs))
    }
}

/// A compiled script file and the sprite it runs on.
pub struct Program {
    pub target: Rc<RefCell<Target>>,
    pub script: ExecutableCode,
    // Keeps the procedures' executables alive with the script.
    _procedures: Vec<ExecutableCode>,
}

impl Program {
    pub fn is_functional(&self) -> bool {
        self.script.is_functional()
    }

    pub fn start(&self) -> ExecutionContext {
        self.script.create_execution_context(Rc::clone(&self.target))
    }

    /// Calls `run()` once per tick until the script finishes. Returns the
    /// tick count, or `None` if `max_ticks` ran out first.
    pub fn run_ticks(&self, exec: &mut ExecutionContext, max_ticks: Option<u64>) -> Option<u64> {
        let mut ticks = 0;
        while !exec.is_finished() {
            if max_ticks.is_some_and(|max| ticks >= max) {
                return None;
            }
            self.script.run(exec);
            ticks += 1;
        }
        Some(ticks)
    }
}

extern "C" fn say(value: *const ValueData) {
    // SAFETY: compiled code passes a live value for the call's duration.
    println!("{}", unsafe { (*value).to_rust_string() });
}

/// Host functions scripts can call.
pub fn host_functions() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("say", say as *const u8);
    registry
}
