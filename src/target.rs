//! Host object model: the narrow addressing contract compiled code relies on.
//!
//! A [`Target`] owns a dense array of variable slots and a dense array of
//! lists. Compiled code addresses both by index ([`VariableId`], [`ListId`]),
//! resolved once at build time, and receives raw pointer arrays into the
//! target's storage when it runs.

use crate::value::{Value, ValueData, compare};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(pub u32);

pub struct Variable {
    pub name: String,
    value: Box<ValueData>,
}

#[derive(Debug, Default, Clone)]
pub struct List {
    pub name: String,
    items: Vec<ValueData>,
}

impl List {
    pub fn new(name: impl Into<String>) -> Self {
        List { name: name.into(), items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: i64) -> Option<&ValueData> {
        usize::try_from(index).ok().and_then(|i| self.items.get(i))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn push(&mut self, value: ValueData) {
        self.items.push(value);
    }

    /// Out-of-range indices are a no-op.
    pub fn remove(&mut self, index: i64) {
        if let Ok(i) = usize::try_from(index) {
            if i < self.items.len() {
                self.items.remove(i);
            }
        }
    }

    /// `index == len` appends; anything else out of range is a no-op.
    pub fn insert(&mut self, index: i64, value: ValueData) {
        if let Ok(i) = usize::try_from(index) {
            if i <= self.items.len() {
                self.items.insert(i, value);
            }
        }
    }

    /// Out-of-range indices are a no-op.
    pub fn replace(&mut self, index: i64, value: ValueData) {
        if let Ok(i) = usize::try_from(index) {
            if let Some(slot) = self.items.get_mut(i) {
                *slot = value;
            }
        }
    }

    /// Loose-equality search; `-1` when absent.
    pub fn index_of(&self, value: &ValueData) -> i64 {
        self.items
            .iter()
            .position(|item| compare(item, value).is_eq())
            .map_or(-1, |i| i as i64)
    }

    /// Items joined with nothing when every item is a single character,
    /// otherwise with single spaces.
    pub fn contents(&self) -> String {
        let parts: Vec<String> = self.items.iter().map(ValueData::to_rust_string).collect();
        let all_chars = parts.iter().all(|p| p.encode_utf16().count() == 1);
        parts.join(if all_chars && !parts.is_empty() { "" } else { " " })
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.items.iter().map(ValueData::to_value).collect()
    }
}

#[derive(Default)]
pub struct Target {
    pub name: String,
    variables: Vec<Variable>,
    lists: Vec<Box<List>>,
    variable_ptrs: Vec<*mut ValueData>,
    list_ptrs: Vec<*mut List>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Target { name: name.into(), ..Default::default() }
    }

    pub fn add_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) -> VariableId {
        let id = VariableId(self.variables.len() as u32);
        let mut slot = Box::new(ValueData::from(value.into()));
        self.variable_ptrs.push(&mut *slot as *mut ValueData);
        self.variables.push(Variable { name: name.into(), value: slot });
        id
    }

    pub fn add_list(&mut self, name: impl Into<String>, items: Vec<Value>) -> ListId {
        let id = ListId(self.lists.len() as u32);
        let mut list = Box::new(List { name: name.into(), items: items.iter().map(ValueData::from).collect() });
        self.list_ptrs.push(&mut *list as *mut List);
        self.lists.push(list);
        id
    }

    pub fn find_variable(&self, name: &str) -> Option<VariableId> {
        self.variables.iter().position(|v| v.name == name).map(|i| VariableId(i as u32))
    }

    pub fn find_list(&self, name: &str) -> Option<ListId> {
        self.lists.iter().position(|l| l.name == name).map(|i| ListId(i as u32))
    }

    pub fn variable(&self, id: VariableId) -> Value {
        self.variables[id.0 as usize].value.to_value()
    }

    pub fn set_variable(&mut self, id: VariableId, value: impl Into<Value>) {
        *self.variables[id.0 as usize].value = ValueData::from(value.into());
    }

    pub fn list(&self, id: ListId) -> &List {
        &self.lists[id.0 as usize]
    }

    pub fn list_mut(&mut self, id: ListId) -> &mut List {
        &mut self.lists[id.0 as usize]
    }

    /// Dense pointer arrays handed to compiled code. Slots are boxed, so the
    /// pointers stay valid until a variable or list is added.
    pub(crate) fn storage(&mut self) -> (*mut *mut ValueData, *mut *mut List) {
        (self.variable_ptrs.as_mut_ptr(), self.list_ptrs.as_mut_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(items: &[f64]) -> List {
        let mut list = List::new("l");
        for &n in items {
            list.push(ValueData::number(n));
        }
        list
    }

    #[test]
    fn remove_ignores_out_of_range() {
        let mut list = list_of(&[1.0, 2.0, 3.0]);
        list.remove(1);
        assert_eq!(list.to_values(), vec![Value::Number(1.0), Value::Number(3.0)]);
        list.remove(-1);
        list.remove(2);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn insert_at_size_appends() {
        let mut list = list_of(&[1.0]);
        list.insert(1, ValueData::number(2.0));
        list.insert(3, ValueData::number(9.0));
        list.insert(-1, ValueData::number(9.0));
        list.insert(0, ValueData::number(0.0));
        assert_eq!(list.to_values(), vec![Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn index_of_is_loose() {
        let mut list = List::new("words");
        for w in ["Lorem", "ipsum", "dolor", "sit"] {
            list.push(ValueData::from(Value::from(w)));
        }
        assert_eq!(list.index_of(&ValueData::from(Value::from("doLor"))), 2);
        assert_eq!(list.index_of(&ValueData::from(Value::from("amet"))), -1);
    }

    #[test]
    fn contents_joins_single_characters_tightly() {
        let mut chars = List::new("c");
        for c in ["a", "b", "c"] {
            chars.push(ValueData::from(Value::from(c)));
        }
        assert_eq!(chars.contents(), "abc");
        assert_eq!(list_of(&[1.0, 22.0]).contents(), "1 22");
        assert_eq!(List::new("e").contents(), "");
    }

    #[test]
    fn storage_pointers_track_slots() {
        let mut target = Target::new("Sprite1");
        let x = target.add_variable("x", 1.0);
        let (vars, _) = target.storage();
        unsafe { **vars = ValueData::from(Value::from("changed")) };
        assert_eq!(target.variable(x), Value::from("changed"));
        assert_eq!(target.find_variable("x"), Some(x));
    }
}
