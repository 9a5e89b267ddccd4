//! Register-based intermediate form produced by the code builder.
//!
//! The instruction graph is a flat list. Scoping constructs are paired
//! `Begin*`/`End*` markers that nest like balanced parentheses, so the scope
//! tree can be recovered with a depth counter. Instructions refer to values
//! only through their operand lists.

pub mod analyzer;

use std::rc::Rc;

use crate::target::{ListId, VariableId};
use crate::value::{Value, is_canonical_number};

pub use analyzer::TypeAnalyzer;

// ── Static types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticType {
    Unknown,
    Void,
    Number,
    Bool,
    String,
    Pointer,
}

impl StaticType {
    /// Meet of two facts about the same location. `Void` is the identity,
    /// disagreement falls back to `Unknown`.
    pub fn merge(self, other: StaticType) -> StaticType {
        match (self, other) {
            (a, b) if a == b => a,
            (StaticType::Void, t) | (t, StaticType::Void) => t,
            _ => StaticType::Unknown,
        }
    }

    pub fn of_value(value: &Value) -> StaticType {
        match value {
            Value::Number(_) => StaticType::Number,
            Value::Bool(_) => StaticType::Bool,
            Value::String(_) => StaticType::String,
        }
    }
}

impl std::fmt::Display for StaticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StaticType::Unknown => "unknown",
            StaticType::Void => "void",
            StaticType::Number => "number",
            StaticType::Bool => "bool",
            StaticType::String => "string",
            StaticType::Pointer => "pointer",
        };
        f.write_str(name)
    }
}

// ── Values ───────────────────────────────────────────────────────────

/// Handle to a value produced while building one compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompilerValue(pub(crate) u32);

impl CompilerValue {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compile-time-known value. Text that round-trips through a number also
/// carries that number, so numeric consumers never parse it at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConstant {
    pub value: Value,
    pub numeric: Option<f64>,
}

impl CompilerConstant {
    pub fn new(value: Value) -> Self {
        let numeric = match &value {
            Value::String(s) => is_canonical_number(s),
            _ => None,
        };
        CompilerConstant { value, numeric }
    }

    pub fn to_number(&self) -> f64 {
        self.numeric.unwrap_or_else(|| self.value.to_number())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueSource {
    Register,
    Constant(CompilerConstant),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub ty: StaticType,
    pub source: ValueSource,
}

impl ValueInfo {
    pub fn register(ty: StaticType) -> Self {
        ValueInfo { ty, source: ValueSource::Register }
    }

    pub fn constant(&self) -> Option<&CompilerConstant> {
        match &self.source {
            ValueSource::Constant(c) => Some(c),
            ValueSource::Register => None,
        }
    }
}

/// Unit-private slot, distinct from script-visible variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompilerLocalVariable {
    pub(crate) id: u32,
    pub ty: StaticType,
}

// ── Procedures ───────────────────────────────────────────────────────

/// Public signature of a user-defined procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPrototype {
    pub proc_code: String,
    pub argument_ids: Vec<String>,
    pub argument_names: Vec<String>,
    /// Atomic call semantics: the procedure never suspends.
    pub warp: bool,
}

impl BlockPrototype {
    pub fn new(proc_code: impl Into<String>, argument_names: &[&str], warp: bool) -> Self {
        BlockPrototype {
            proc_code: proc_code.into(),
            argument_ids: argument_names.iter().enumerate().map(|(i, _)| format!("arg{i}")).collect(),
            argument_names: argument_names.iter().map(|s| s.to_string()).collect(),
            warp,
        }
    }

    pub(crate) fn main_symbol(&self) -> String {
        format!("proc:{}", self.proc_code)
    }

    pub(crate) fn resume_symbol(&self) -> String {
        format!("proc:{}:resume", self.proc_code)
    }
}

/// What a compiled unit returns from its main entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeType {
    #[default]
    Script,
    Reporter,
    HatPredicate,
}

// ── Instructions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    FunctionCall,
    FunctionCallWithCtx,
    TargetFunctionCall,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Round,
    Abs,
    Floor,
    Ceil,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Ln,
    Log10,
    Exp,
    Exp10,
    Random,
    RandomInt,

    CmpEq,
    CmpGt,
    CmpLt,
    StrCmpEqCs,
    StrCmpEqCi,
    And,
    Or,
    Not,

    Select,
    StringConcat,
    StringChar,
    StringLength,

    WriteLocalVariable,
    ReadLocalVariable,
    WriteVariable,
    ReadVariable,

    ClearList,
    RemoveListItem,
    AppendToList,
    InsertToList,
    ListReplace,
    GetListContents,
    GetListItem,
    GetListSize,
    GetListItemIndex,
    ListContainsItem,

    BeginIf,
    BeginElse,
    EndIf,
    BeginRepeatLoop,
    LoopIndex,
    BeginLoopCondition,
    BeginWhileLoop,
    BeginRepeatUntilLoop,
    EndLoop,

    Yield,
    Stop,
    ReturnValue,
    CallProcedure,
    ProcedureArg,
}

impl Opcode {
    /// Opens a scope closed by `EndIf`/`EndLoop`. `BeginLoopCondition` is
    /// not an opener: the loop it belongs to opens right after the condition.
    pub fn opens_scope(self) -> bool {
        matches!(
            self,
            Opcode::BeginIf | Opcode::BeginRepeatLoop | Opcode::BeginWhileLoop | Opcode::BeginRepeatUntilLoop
        )
    }

    pub fn closes_scope(self) -> bool {
        matches!(self, Opcode::EndIf | Opcode::EndLoop)
    }

    pub fn is_conditional_loop(self) -> bool {
        matches!(self, Opcode::BeginWhileLoop | Opcode::BeginRepeatUntilLoop)
    }

    /// Points where the host may observe or mutate variable and list storage.
    pub fn is_barrier(self) -> bool {
        matches!(
            self,
            Opcode::Yield | Opcode::TargetFunctionCall | Opcode::FunctionCallWithCtx | Opcode::CallProcedure
        )
    }

    pub fn writes_list(self) -> bool {
        matches!(self, Opcode::AppendToList | Opcode::InsertToList | Opcode::ListReplace)
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub args: Vec<(StaticType, CompilerValue)>,
    pub result: Option<CompilerValue>,
    pub work_variable: Option<VariableId>,
    pub work_list: Option<ListId>,
    pub work_local: Option<CompilerLocalVariable>,
    pub function_name: Option<String>,
    pub return_type: StaticType,
    pub procedure: Option<Rc<BlockPrototype>>,
    pub argument_index: Option<usize>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            args: Vec::new(),
            result: None,
            work_variable: None,
            work_list: None,
            work_local: None,
            function_name: None,
            return_type: StaticType::Void,
            procedure: None,
            argument_index: None,
        }
    }

    pub fn with_args(mut self, args: Vec<(StaticType, CompilerValue)>) -> Self {
        self.args = args;
        self
    }

    pub fn with_result(mut self, result: CompilerValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_variable(mut self, var: VariableId) -> Self {
        self.work_variable = Some(var);
        self
    }

    pub fn with_list(mut self, list: ListId) -> Self {
        self.work_list = Some(list);
        self
    }

    /// The value an instruction stores into its variable or list, if any.
    pub fn written_value(&self) -> Option<CompilerValue> {
        match self.opcode {
            Opcode::WriteVariable | Opcode::AppendToList => self.args.first().map(|a| a.1),
            Opcode::InsertToList | Opcode::ListReplace => self.args.get(1).map(|a| a.1),
            _ => None,
        }
    }
}

/// Everything the backend needs to compile one unit.
#[derive(Debug)]
pub(crate) struct Unit {
    pub code_type: CodeType,
    pub warp: bool,
    pub prototype: Option<Rc<BlockPrototype>>,
    pub code: Vec<Instruction>,
    pub values: Vec<ValueInfo>,
    pub locals: Vec<StaticType>,
}

impl Unit {
    pub fn value(&self, v: CompilerValue) -> &ValueInfo {
        &self.values[v.index()]
    }

    pub fn ty(&self, v: CompilerValue) -> StaticType {
        self.values[v.index()].ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_lattice() {
        use StaticType::*;
        assert_eq!(Number.merge(Number), Number);
        assert_eq!(Number.merge(String), Unknown);
        assert_eq!(Void.merge(Bool), Bool);
        assert_eq!(String.merge(Void), String);
        assert_eq!(Unknown.merge(Number), Unknown);
        assert_eq!(Void.merge(Void), Void);
    }

    #[test]
    fn numeric_string_constants() {
        assert_eq!(CompilerConstant::new(Value::from("3.14")).numeric, Some(3.14));
        assert_eq!(CompilerConstant::new(Value::from("abc")).numeric, None);
        assert_eq!(CompilerConstant::new(Value::from("abc")).to_number(), 0.0);
        assert_eq!(CompilerConstant::new(Value::from(true)).to_number(), 1.0);
    }

    #[test]
    fn prototype_symbols() {
        let proto = BlockPrototype::new("move %s steps", &["steps"], true);
        assert_eq!(proto.main_symbol(), "proc:move %s steps");
        assert_eq!(proto.resume_symbol(), "proc:move %s steps:resume");
        assert_eq!(proto.argument_ids, vec!["arg0".to_string()]);
    }
}
