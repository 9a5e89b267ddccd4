//! Forward type resolution over a finished instruction list.
//!
//! Tracks what is provably stored in each variable and list while walking
//! the code in order, and assigns read results their narrowed type. At scope
//! joins and loop headers the tracked state is replaced by the analyzer's
//! summary of the scope, so a loop body sees types that hold on every
//! iteration.

use std::collections::HashMap;

use crate::ir::analyzer::scope_end;
use crate::ir::{Instruction, Opcode, StaticType, TypeAnalyzer, ValueInfo};
use crate::target::{ListId, VariableId};

/// Missing entries are `Unknown` (and lists non-empty).
#[derive(Debug, Clone, Default)]
struct TypeState {
    variables: HashMap<VariableId, StaticType>,
    lists: HashMap<ListId, (StaticType, bool)>,
}

impl TypeState {
    fn variable(&self, var: VariableId) -> StaticType {
        self.variables.get(&var).copied().unwrap_or(StaticType::Unknown)
    }

    fn list(&self, list: ListId) -> (StaticType, bool) {
        self.lists.get(&list).copied().unwrap_or((StaticType::Unknown, false))
    }

    fn forget(&mut self) {
        self.variables.clear();
        self.lists.clear();
    }
}

struct Frame {
    begin: usize,
    entering: TypeState,
}

/// State after the scope opened at `begin`, given the state on entry.
fn after_scope(analyzer: &TypeAnalyzer, code: &[Instruction], begin: usize, entering: &TypeState) -> TypeState {
    let variables = entering
        .variables
        .iter()
        .map(|(&var, &ty)| (var, analyzer.variable_type_after_branch(Some(var), code, Some(begin), ty)))
        .filter(|&(_, ty)| ty != StaticType::Unknown)
        .collect();
    let lists = entering
        .lists
        .iter()
        .map(|(&list, &(ty, empty))| {
            let ty = analyzer.list_type_after_branch(Some(list), code, Some(begin), ty, empty);
            (list, (ty, empty && !analyzer.list_touched_in_scope(list, code, begin)))
        })
        .filter(|&(_, (ty, empty))| ty != StaticType::Unknown || empty)
        .collect();
    TypeState { variables, lists }
}

pub(crate) fn resolve_types(code: &[Instruction], values: &mut [ValueInfo]) {
    let mut state = TypeState::default();
    let mut frames: Vec<Frame> = Vec::new();

    for (i, ins) in code.iter().enumerate() {
        match ins.opcode {
            Opcode::BeginIf => frames.push(Frame { begin: i, entering: state.clone() }),
            Opcode::BeginElse => {
                if let Some(frame) = frames.last() {
                    state = frame.entering.clone();
                }
            }
            Opcode::BeginLoopCondition | Opcode::BeginRepeatLoop => {
                let header = after_scope(&TypeAnalyzer::new(values), code, i, &state);
                frames.push(Frame { begin: i, entering: std::mem::replace(&mut state, header) });
            }
            Opcode::BeginWhileLoop | Opcode::BeginRepeatUntilLoop => {
                // Already entered at the condition marker.
                let marked = frames.last().is_some_and(|f| {
                    code[f.begin].opcode == Opcode::BeginLoopCondition && scope_end(code, f.begin) == scope_end(code, i)
                });
                if !marked {
                    let header = after_scope(&TypeAnalyzer::new(values), code, i, &state);
                    frames.push(Frame { begin: i, entering: std::mem::replace(&mut state, header) });
                }
            }
            Opcode::EndIf | Opcode::EndLoop => {
                if let Some(frame) = frames.pop() {
                    state = after_scope(&TypeAnalyzer::new(values), code, frame.begin, &frame.entering);
                }
            }
            Opcode::ReadVariable => {
                if let (Some(var), Some(r)) = (ins.work_variable, ins.result) {
                    values[r.index()].ty = match state.variable(var) {
                        StaticType::Void => StaticType::Unknown,
                        ty => ty,
                    };
                }
            }
            Opcode::GetListItem => {
                if let (Some(list), Some(r)) = (ins.work_list, ins.result) {
                    values[r.index()].ty = match state.list(list).0 {
                        StaticType::Void => StaticType::Unknown,
                        ty => ty,
                    };
                }
            }
            Opcode::WriteVariable => {
                if let (Some(var), Some(v)) = (ins.work_variable, ins.written_value()) {
                    state.variables.insert(var, values[v.index()].ty);
                }
            }
            Opcode::AppendToList | Opcode::InsertToList | Opcode::ListReplace => {
                if let (Some(list), Some(v)) = (ins.work_list, ins.written_value()) {
                    let written = values[v.index()].ty;
                    let (ty, empty) = state.list(list);
                    state.lists.insert(list, (if empty { written } else { ty.merge(written) }, false));
                }
            }
            Opcode::ClearList => {
                if let Some(list) = ins.work_list {
                    state.lists.insert(list, (StaticType::Void, true));
                }
            }
            op if op.is_barrier() => state.forget(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CodeBuilder;
    use crate::ir::CodeType;
    use crate::jit::{CompilerContext, FunctionRegistry, JitOptions};

    const VAR: VariableId = VariableId(0);
    const LIST: ListId = ListId(0);

    fn builder() -> CodeBuilder {
        let ctx = CompilerContext::new(&FunctionRegistry::new(), &JitOptions::default());
        let mut b = CodeBuilder::new(ctx, CodeType::Script, None);
        b.set_warp(true);
        b
    }

    fn resolved(b: &mut CodeBuilder) {
        resolve_types(&b.code, &mut b.values);
    }

    #[test]
    fn reads_see_the_last_straight_line_write() {
        let mut b = builder();
        let unknown = b.add_variable_value(VAR);
        let five = b.add_const_value(5.0);
        b.create_variable_write(VAR, five);
        let number = b.add_variable_value(VAR);
        let text = b.add_const_value("hello");
        b.create_variable_write(VAR, text);
        let string = b.add_variable_value(VAR);
        resolved(&mut b);
        assert_eq!(b.values[unknown.index()].ty, StaticType::Unknown);
        assert_eq!(b.values[number.index()].ty, StaticType::Number);
        assert_eq!(b.values[string.index()].ty, StaticType::String);
    }

    #[test]
    fn branches_merge_at_end_if() {
        let mut b = builder();
        let five = b.add_const_value(5.0);
        b.create_variable_write(VAR, five);
        let cond = b.add_const_value(true);
        b.begin_if_statement(cond);
        let inside = b.add_variable_value(VAR);
        let text = b.add_const_value("x");
        b.create_variable_write(VAR, text);
        b.begin_else_branch();
        let in_else = b.add_variable_value(VAR);
        b.end_if();
        let after = b.add_variable_value(VAR);
        resolved(&mut b);
        assert_eq!(b.values[inside.index()].ty, StaticType::Number);
        assert_eq!(b.values[in_else.index()].ty, StaticType::Number);
        assert_eq!(b.values[after.index()].ty, StaticType::Unknown);
    }

    #[test]
    fn loop_body_sees_types_from_later_iterations() {
        let mut b = builder();
        let five = b.add_const_value(5.0);
        b.create_variable_write(VAR, five);
        let count = b.add_const_value(3.0);
        b.begin_repeat_loop(count);
        let first = b.add_variable_value(VAR);
        let six = b.add_const_value(6.0);
        b.create_variable_write(VAR, six);
        b.end_loop();
        b.begin_repeat_loop(count);
        let second = b.add_variable_value(VAR);
        let text = b.add_const_value("x");
        b.create_variable_write(VAR, text);
        b.end_loop();
        resolved(&mut b);
        assert_eq!(b.values[first.index()].ty, StaticType::Number);
        assert_eq!(b.values[second.index()].ty, StaticType::Unknown);
    }

    #[test]
    fn cleared_list_takes_the_appended_type() {
        let mut b = builder();
        b.create_list_clear(LIST);
        let index = b.add_const_value(0.0);
        let empty_read = b.add_list_item(LIST, index);
        let five = b.add_const_value(5.0);
        b.create_list_append(LIST, five);
        let number_read = b.add_list_item(LIST, index);
        let text = b.add_const_value("x");
        b.create_list_append(LIST, text);
        let mixed_read = b.add_list_item(LIST, index);
        resolved(&mut b);
        assert_eq!(b.values[empty_read.index()].ty, StaticType::Unknown);
        assert_eq!(b.values[number_read.index()].ty, StaticType::Number);
        assert_eq!(b.values[mixed_read.index()].ty, StaticType::Unknown);
    }

    #[test]
    fn calls_forget_everything() {
        let mut b = builder();
        let five = b.add_const_value(5.0);
        b.create_variable_write(VAR, five);
        b.add_target_function_call("touch", StaticType::Void, &[], &[]);
        let after = b.add_variable_value(VAR);
        resolved(&mut b);
        assert_eq!(b.values[after.index()].ty, StaticType::Unknown);
    }

    #[test]
    fn while_condition_reads_use_the_header_state() {
        let mut b = builder();
        let five = b.add_const_value(5.0);
        b.create_variable_write(VAR, five);
        b.begin_loop_condition();
        let in_condition = b.add_variable_value(VAR);
        let limit = b.add_const_value(10.0);
        let cond = b.create_cmp_lt(in_condition, limit);
        b.begin_while_loop(cond);
        let one = b.add_const_value(1.0);
        let next = b.create_add(in_condition, one);
        b.create_variable_write(VAR, next);
        b.end_loop();
        let after = b.add_variable_value(VAR);
        resolved(&mut b);
        assert_eq!(b.values[in_condition.index()].ty, StaticType::Number);
        assert_eq!(b.values[after.index()].ty, StaticType::Number);
    }
}
