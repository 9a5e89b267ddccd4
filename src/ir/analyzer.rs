//! Flow analysis of container element types across a single scope.
//!
//! Given a variable or list, a `Begin*` marker and the type known on entry,
//! [`TypeAnalyzer`] computes the type provably held after the matching `End*`.
//! Loops are summarized in one pass: the body is treated as a straight scope
//! that may run zero times.

use std::ops::Range;

use super::{Instruction, Opcode, StaticType, ValueInfo};
use crate::target::{ListId, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Variable(VariableId),
    List(ListId),
}

enum Effect {
    Write(StaticType),
    Clear,
}

enum Shape {
    If { then: Range<usize>, otherwise: Option<Range<usize>> },
    Loop { condition: Option<Range<usize>>, body: Range<usize> },
}

pub struct TypeAnalyzer<'a> {
    values: &'a [ValueInfo],
}

impl<'a> TypeAnalyzer<'a> {
    pub fn new(values: &'a [ValueInfo]) -> Self {
        TypeAnalyzer { values }
    }

    pub fn variable_type_after_branch(
        &self,
        var: Option<VariableId>,
        code: &[Instruction],
        begin: Option<usize>,
        previous: StaticType,
    ) -> StaticType {
        match (var, begin) {
            (Some(var), Some(begin)) => self.type_after_scope(Container::Variable(var), code, begin, previous, false),
            _ => previous,
        }
    }

    pub fn list_type_after_branch(
        &self,
        list: Option<ListId>,
        code: &[Instruction],
        begin: Option<usize>,
        previous: StaticType,
        is_empty: bool,
    ) -> StaticType {
        match (list, begin) {
            (Some(list), Some(begin)) => self.type_after_scope(Container::List(list), code, begin, previous, is_empty),
            _ => previous,
        }
    }

    /// True when anything between `begin` and its end may change the list.
    pub fn list_touched_in_scope(&self, list: ListId, code: &[Instruction], begin: usize) -> bool {
        match scope_end(code, begin) {
            Some(end) => self.touches(Container::List(list), &code[begin + 1..end]),
            None => false,
        }
    }

    fn type_after_scope(
        &self,
        c: Container,
        code: &[Instruction],
        begin: usize,
        entering: StaticType,
        empty: bool,
    ) -> StaticType {
        let Some(shape) = shape_of(code, begin) else {
            return entering;
        };
        match shape {
            Shape::If { then, otherwise } => {
                let (t, _) = self.straight(c, code, then, entering, empty);
                match otherwise {
                    Some(range) => {
                        let (e, _) = self.straight(c, code, range, entering, empty);
                        t.merge(e)
                    }
                    None => entering.merge(t),
                }
            }
            Shape::Loop { condition, body } => {
                let (mut t, mut e) = (entering, empty);
                if let Some(range) = condition {
                    (t, e) = self.straight(c, code, range, t, e);
                }
                let (t, _) = self.straight(c, code, body, t, e);
                entering.merge(t)
            }
        }
    }

    /// Runs the write rules over `range`, summarizing nested scopes.
    fn straight(
        &self,
        c: Container,
        code: &[Instruction],
        range: Range<usize>,
        mut cur: StaticType,
        mut empty: bool,
    ) -> (StaticType, bool) {
        let mut i = range.start;
        while i < range.end {
            let ins = &code[i];
            if ins.opcode.opens_scope() || ins.opcode == Opcode::BeginLoopCondition {
                let Some(end) = scope_end(code, i) else {
                    break;
                };
                let touched = self.touches(c, &code[i + 1..end]);
                cur = self.type_after_scope(c, code, i, cur, empty);
                empty &= !touched;
                i = end + 1;
                continue;
            }
            match self.effect(c, ins) {
                Some(Effect::Write(w)) => {
                    cur = if empty { w } else { cur.merge(w) };
                    empty = false;
                }
                Some(Effect::Clear) => {
                    cur = StaticType::Void;
                    empty = true;
                }
                None => {}
            }
            i += 1;
        }
        (cur, empty)
    }

    fn effect(&self, c: Container, ins: &Instruction) -> Option<Effect> {
        if ins.opcode.is_barrier() {
            return Some(Effect::Write(StaticType::Unknown));
        }
        match c {
            Container::Variable(var) if ins.opcode == Opcode::WriteVariable && ins.work_variable == Some(var) => {
                ins.written_value().map(|v| Effect::Write(self.values[v.index()].ty))
            }
            Container::List(list) if ins.work_list == Some(list) => {
                if ins.opcode == Opcode::ClearList {
                    Some(Effect::Clear)
                } else if ins.opcode.writes_list() {
                    ins.written_value().map(|v| Effect::Write(self.values[v.index()].ty))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn touches(&self, c: Container, code: &[Instruction]) -> bool {
        code.iter().any(|ins| self.effect(c, ins).is_some())
    }
}

/// Index of the `End*` closing the scope opened at `begin`. For a loop
/// condition marker this is the end of the loop the condition belongs to.
pub fn scope_end(code: &[Instruction], begin: usize) -> Option<usize> {
    let open = match code.get(begin)?.opcode {
        Opcode::BeginLoopCondition => condition_opener(code, begin)?,
        op if op.opens_scope() => begin,
        _ => return None,
    };
    matching_end(code, open)
}

fn matching_end(code: &[Instruction], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ins) in code.iter().enumerate().skip(open) {
        if ins.opcode.opens_scope() {
            depth += 1;
        } else if ins.opcode.closes_scope() {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// The `BeginWhileLoop`/`BeginRepeatUntilLoop` a condition marker leads to.
fn condition_opener(code: &[Instruction], marker: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ins) in code.iter().enumerate().skip(marker + 1) {
        if depth == 0 && ins.opcode.is_conditional_loop() {
            return Some(i);
        }
        if ins.opcode.opens_scope() {
            depth += 1;
        } else if ins.opcode.closes_scope() {
            depth = depth.checked_sub(1)?;
        }
    }
    None
}

fn shape_of(code: &[Instruction], begin: usize) -> Option<Shape> {
    match code.get(begin)?.opcode {
        Opcode::BeginIf => {
            let end = matching_end(code, begin)?;
            let mut depth = 0usize;
            let mut else_at = None;
            for (i, ins) in code.iter().enumerate().take(end).skip(begin + 1) {
                if ins.opcode.opens_scope() {
                    depth += 1;
                } else if ins.opcode.closes_scope() {
                    depth -= 1;
                } else if ins.opcode == Opcode::BeginElse && depth == 0 {
                    else_at = Some(i);
                    break;
                }
            }
            Some(match else_at {
                Some(e) => Shape::If { then: begin + 1..e, otherwise: Some(e + 1..end) },
                None => Shape::If { then: begin + 1..end, otherwise: None },
            })
        }
        Opcode::BeginRepeatLoop | Opcode::BeginWhileLoop | Opcode::BeginRepeatUntilLoop => {
            let end = matching_end(code, begin)?;
            Some(Shape::Loop { condition: None, body: begin + 1..end })
        }
        Opcode::BeginLoopCondition => {
            let open = condition_opener(code, begin)?;
            let end = matching_end(code, open)?;
            Some(Shape::Loop { condition: Some(begin + 1..open), body: open + 1..end })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CompilerConstant, CompilerValue, ValueSource};
    use crate::value::Value;

    const VAR: VariableId = VariableId(0);
    const OTHER: VariableId = VariableId(1);
    const LIST: ListId = ListId(0);

    /// Small fixture: constants of each type plus a hand-assembled code list.
    struct Fixture {
        values: Vec<ValueInfo>,
        code: Vec<Instruction>,
    }

    impl Fixture {
        fn new() -> Self {
            let values = [Value::from(1.0), Value::from("text"), Value::from(true)]
                .into_iter()
                .map(|v| ValueInfo {
                    ty: StaticType::of_value(&v),
                    source: ValueSource::Constant(CompilerConstant::new(v)),
                })
                .chain(std::iter::once(ValueInfo::register(StaticType::Unknown)))
                .collect();
            Fixture { values, code: Vec::new() }
        }

        fn value(ty: StaticType) -> CompilerValue {
            CompilerValue(match ty {
                StaticType::Number => 0,
                StaticType::String => 1,
                StaticType::Bool => 2,
                _ => 3,
            })
        }

        fn op(&mut self, opcode: Opcode) -> usize {
            self.code.push(Instruction::new(opcode));
            self.code.len() - 1
        }

        fn write(&mut self, var: VariableId, ty: StaticType) {
            let v = Self::value(ty);
            self.code.push(Instruction::new(Opcode::WriteVariable).with_args(vec![(ty, v)]).with_variable(var));
        }

        fn append(&mut self, ty: StaticType) {
            let v = Self::value(ty);
            self.code.push(Instruction::new(Opcode::AppendToList).with_args(vec![(ty, v)]).with_list(LIST));
        }

        fn var_after(&self, begin: usize, previous: StaticType) -> StaticType {
            TypeAnalyzer::new(&self.values).variable_type_after_branch(Some(VAR), &self.code, Some(begin), previous)
        }

        fn list_after(&self, begin: usize, previous: StaticType, empty: bool) -> StaticType {
            TypeAnalyzer::new(&self.values).list_type_after_branch(Some(LIST), &self.code, Some(begin), previous, empty)
        }
    }

    #[test]
    fn null_inputs_return_entering_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndIf);
        let analyzer = TypeAnalyzer::new(&f.values);
        assert_eq!(analyzer.variable_type_after_branch(None, &f.code, Some(begin), StaticType::Number), StaticType::Number);
        assert_eq!(analyzer.variable_type_after_branch(Some(VAR), &f.code, None, StaticType::Bool), StaticType::Bool);
        assert_eq!(analyzer.list_type_after_branch(None, &f.code, Some(begin), StaticType::Void, true), StaticType::Void);
    }

    #[test]
    fn scope_without_writes_keeps_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.write(OTHER, StaticType::String);
        f.op(Opcode::EndLoop);
        for ty in [StaticType::Number, StaticType::Unknown, StaticType::String] {
            assert_eq!(f.var_after(begin, ty), ty);
            assert_eq!(f.list_after(begin, ty, false), ty);
            assert_eq!(f.list_after(begin, ty, true), ty);
        }
    }

    #[test]
    fn same_type_write_keeps_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::Number);
        f.op(Opcode::EndIf);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Number);
    }

    #[test]
    fn if_without_else_merges_with_entering_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndIf);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Unknown);
        assert_eq!(f.var_after(begin, StaticType::String), StaticType::String);
    }

    #[test]
    fn if_else_merges_both_branches() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::String);
        f.op(Opcode::BeginElse);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndIf);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::String);

        let mut g = Fixture::new();
        let begin = g.op(Opcode::BeginIf);
        g.write(VAR, StaticType::String);
        g.op(Opcode::BeginElse);
        g.write(VAR, StaticType::Bool);
        g.op(Opcode::EndIf);
        assert_eq!(g.var_after(begin, StaticType::String), StaticType::Unknown);
    }

    #[test]
    fn unknown_entering_type_is_absorbing() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::Number);
        f.op(Opcode::BeginElse);
        f.write(VAR, StaticType::Number);
        f.op(Opcode::EndIf);
        assert_eq!(f.var_after(begin, StaticType::Unknown), StaticType::Unknown);
        assert_eq!(f.list_after(begin, StaticType::Unknown, false), StaticType::Unknown);
    }

    #[test]
    fn loops_merge_with_entering_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndLoop);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Unknown);
        assert_eq!(f.var_after(begin, StaticType::String), StaticType::String);
    }

    #[test]
    fn conditional_loops_include_the_condition_region() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginLoopCondition);
        f.write(VAR, StaticType::Bool);
        f.op(Opcode::BeginWhileLoop);
        f.write(VAR, StaticType::Bool);
        f.op(Opcode::EndLoop);
        assert_eq!(f.var_after(begin, StaticType::Bool), StaticType::Bool);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Unknown);
        assert_eq!(scope_end(&f.code, begin), Some(4));
    }

    #[test]
    fn nested_conditional_change_taints_loop() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndIf);
        f.write(VAR, StaticType::Number);
        f.op(Opcode::EndLoop);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Unknown);
    }

    #[test]
    fn empty_list_takes_type_of_first_write() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.append(StaticType::Number);
        f.append(StaticType::Number);
        f.op(Opcode::BeginElse);
        f.append(StaticType::Number);
        f.op(Opcode::EndIf);
        assert_eq!(f.list_after(begin, StaticType::Unknown, true), StaticType::Number);
        assert_eq!(f.list_after(begin, StaticType::String, false), StaticType::Unknown);
    }

    #[test]
    fn empty_list_with_mixed_writes_is_unknown() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.append(StaticType::Number);
        f.append(StaticType::String);
        f.op(Opcode::EndLoop);
        assert_eq!(f.list_after(begin, StaticType::Void, true), StaticType::Unknown);
    }

    #[test]
    fn clear_resets_list_to_empty() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.code.push(Instruction::new(Opcode::ClearList).with_list(LIST));
        f.append(StaticType::String);
        f.op(Opcode::EndLoop);
        assert_eq!(f.list_after(begin, StaticType::Number, false), StaticType::Unknown);
        assert_eq!(f.list_after(begin, StaticType::String, false), StaticType::String);
    }

    #[test]
    fn barriers_count_as_unknown_writes() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginRepeatLoop);
        f.op(Opcode::Yield);
        f.op(Opcode::EndLoop);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Unknown);
        assert_eq!(f.list_after(begin, StaticType::Void, true), StaticType::Unknown);
    }

    #[test]
    fn analysis_is_idempotent() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::Number);
        f.op(Opcode::BeginElse);
        f.write(VAR, StaticType::String);
        f.op(Opcode::EndIf);
        let first = f.var_after(begin, StaticType::Number);
        assert_eq!(f.var_after(begin, StaticType::Number), first);
    }

    #[test]
    fn unbalanced_scope_returns_entering_type() {
        let mut f = Fixture::new();
        let begin = f.op(Opcode::BeginIf);
        f.write(VAR, StaticType::String);
        assert_eq!(f.var_after(begin, StaticType::Number), StaticType::Number);
    }
}
