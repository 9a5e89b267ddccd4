//! `extern "C"` helpers called from generated code.
//!
//! Every helper is registered as a JIT symbol under its own name. Pointer
//! arguments come from frame slots, the constant pool or host storage and
//! are valid for the duration of the call. A `dst` argument is a frame slot
//! the helper assigns into, freeing whatever the slot held before.

use std::ffi::c_void;

use super::executable::ExecutionContext;
use super::frame::FrameLayout;
use crate::target::List;
use crate::value::{
    StringPtr, ValueData, compare, compare_parts, format_number, modulo, random_between, string_to_bool,
    string_to_number, text_compare_number,
};

/// Native shape of a helper parameter or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abi {
    F64,
    I8,
    I32,
    I64,
    Ptr,
}

macro_rules! runtime_functions {
    ($($variant:ident => $func:ident ($($param:ident),*) $(-> $ret:ident)?;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub(crate) enum RuntimeFn {
            $($variant),*
        }

        impl RuntimeFn {
            pub(crate) const ALL: &'static [RuntimeFn] = &[$(RuntimeFn::$variant),*];

            pub(crate) fn name(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => stringify!($func)),*
                }
            }

            pub(crate) fn address(self) -> *const u8 {
                match self {
                    $(RuntimeFn::$variant => $func as *const u8),*
                }
            }

            pub(crate) fn params(self) -> &'static [Abi] {
                match self {
                    $(RuntimeFn::$variant => &[$(Abi::$param),*]),*
                }
            }

            pub(crate) fn returns(self) -> &'static [Abi] {
                match self {
                    $(RuntimeFn::$variant => &[$(Abi::$ret)?]),*
                }
            }
        }
    };
}

runtime_functions! {
    FrameAlloc => rt_frame_alloc(Ptr) -> Ptr;
    FrameFree => rt_frame_free(Ptr);

    StringCopy => rt_string_copy(Ptr, Ptr) -> Ptr;
    StringAdopt => rt_string_adopt(Ptr, Ptr) -> Ptr;
    StringFromDouble => rt_string_from_double(Ptr, F64) -> Ptr;
    StringFromBool => rt_string_from_bool(Ptr, I8) -> Ptr;
    StringToDouble => rt_string_to_double(Ptr) -> F64;
    StringToBool => rt_string_to_bool(Ptr) -> I8;
    StringConcat => rt_string_concat(Ptr, Ptr, Ptr) -> Ptr;
    StringChar => rt_string_char(Ptr, Ptr, I64) -> Ptr;
    StringCompare => rt_string_compare(Ptr, Ptr) -> I32;
    StringEquals => rt_string_equals(Ptr, Ptr, I8) -> I8;
    CompareDoubles => rt_compare_doubles(F64, F64) -> I32;
    CompareDoubleString => rt_compare_double_string(F64, Ptr) -> I32;

    ValueSetDouble => rt_value_set_double(Ptr, F64);
    ValueSetBool => rt_value_set_bool(Ptr, I8);
    ValueSetString => rt_value_set_string(Ptr, Ptr);
    ValueAssign => rt_value_assign(Ptr, Ptr);
    ValueToDouble => rt_value_to_double(Ptr) -> F64;
    ValueToBool => rt_value_to_bool(Ptr) -> I8;
    ValueToString => rt_value_to_string(Ptr, Ptr) -> Ptr;
    ValueCompare => rt_value_compare(Ptr, Ptr) -> I32;

    Mod => rt_math_mod(F64, F64) -> F64;
    Random => rt_math_random(F64, F64, I8) -> F64;
    Sin => rt_math_sin(F64) -> F64;
    Cos => rt_math_cos(F64) -> F64;
    Tan => rt_math_tan(F64) -> F64;
    Asin => rt_math_asin(F64) -> F64;
    Acos => rt_math_acos(F64) -> F64;
    Atan => rt_math_atan(F64) -> F64;
    Ln => rt_math_ln(F64) -> F64;
    Log10 => rt_math_log10(F64) -> F64;
    Exp => rt_math_exp(F64) -> F64;
    Exp10 => rt_math_exp10(F64) -> F64;

    ListClear => rt_list_clear(Ptr);
    ListRemove => rt_list_remove(Ptr, I64);
    ListSize => rt_list_size(Ptr) -> F64;
    ListContents => rt_list_contents(Ptr, Ptr) -> Ptr;
    ListGetDouble => rt_list_get_double(Ptr, I64) -> F64;
    ListGetBool => rt_list_get_bool(Ptr, I64) -> I8;
    ListGetString => rt_list_get_string(Ptr, Ptr, I64) -> Ptr;
    ListGetValue => rt_list_get_value(Ptr, Ptr, I64);
    ListAppendDouble => rt_list_append_double(Ptr, F64);
    ListAppendBool => rt_list_append_bool(Ptr, I8);
    ListAppendString => rt_list_append_string(Ptr, Ptr);
    ListAppendValue => rt_list_append_value(Ptr, Ptr);
    ListInsertDouble => rt_list_insert_double(Ptr, I64, F64);
    ListInsertBool => rt_list_insert_bool(Ptr, I64, I8);
    ListInsertString => rt_list_insert_string(Ptr, I64, Ptr);
    ListInsertValue => rt_list_insert_value(Ptr, I64, Ptr);
    ListReplaceDouble => rt_list_replace_double(Ptr, I64, F64);
    ListReplaceBool => rt_list_replace_bool(Ptr, I64, I8);
    ListReplaceString => rt_list_replace_string(Ptr, I64, Ptr);
    ListReplaceValue => rt_list_replace_value(Ptr, I64, Ptr);
    ListIndexOfDouble => rt_list_index_of_double(Ptr, F64) -> F64;
    ListIndexOfBool => rt_list_index_of_bool(Ptr, I8) -> F64;
    ListIndexOfString => rt_list_index_of_string(Ptr, Ptr) -> F64;
    ListIndexOfValue => rt_list_index_of_value(Ptr, Ptr) -> F64;
    ListContainsDouble => rt_list_contains_double(Ptr, F64) -> I8;
    ListContainsBool => rt_list_contains_bool(Ptr, I8) -> I8;
    ListContainsString => rt_list_contains_string(Ptr, Ptr) -> I8;
    ListContainsValue => rt_list_contains_value(Ptr, Ptr) -> I8;

    PromisePending => rt_promise_pending(Ptr) -> I8;
}

/// How a list operation receives its item operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemKind {
    Double,
    Bool,
    String,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListOp {
    Append,
    Insert,
    Replace,
    IndexOf,
    Contains,
}

impl ListOp {
    pub(crate) fn helper(self, kind: ItemKind) -> RuntimeFn {
        use ItemKind as K;
        use RuntimeFn as F;
        match (self, kind) {
            (ListOp::Append, K::Double) => F::ListAppendDouble,
            (ListOp::Append, K::Bool) => F::ListAppendBool,
            (ListOp::Append, K::String) => F::ListAppendString,
            (ListOp::Append, K::Value) => F::ListAppendValue,
            (ListOp::Insert, K::Double) => F::ListInsertDouble,
            (ListOp::Insert, K::Bool) => F::ListInsertBool,
            (ListOp::Insert, K::String) => F::ListInsertString,
            (ListOp::Insert, K::Value) => F::ListInsertValue,
            (ListOp::Replace, K::Double) => F::ListReplaceDouble,
            (ListOp::Replace, K::Bool) => F::ListReplaceBool,
            (ListOp::Replace, K::String) => F::ListReplaceString,
            (ListOp::Replace, K::Value) => F::ListReplaceValue,
            (ListOp::IndexOf, K::Double) => F::ListIndexOfDouble,
            (ListOp::IndexOf, K::Bool) => F::ListIndexOfBool,
            (ListOp::IndexOf, K::String) => F::ListIndexOfString,
            (ListOp::IndexOf, K::Value) => F::ListIndexOfValue,
            (ListOp::Contains, K::Double) => F::ListContainsDouble,
            (ListOp::Contains, K::Bool) => F::ListContainsBool,
            (ListOp::Contains, K::String) => F::ListContainsString,
            (ListOp::Contains, K::Value) => F::ListContainsValue,
        }
    }
}

// ── Slot helpers ─────────────────────────────────────────────────────

/// Borrowed view of a string operand; null reads as the empty string.
unsafe fn units<'a>(s: *const StringPtr) -> &'a [u16] {
    if s.is_null() { &[] } else { unsafe { (*s).units() } }
}

unsafe fn text(s: *const StringPtr) -> String {
    String::from_utf16_lossy(unsafe { units(s) })
}

unsafe fn store_string(dst: *mut *mut StringPtr, s: StringPtr) -> *mut StringPtr {
    unsafe {
        let old = *dst;
        let raw = s.into_raw();
        *dst = raw;
        if !old.is_null() {
            drop(StringPtr::from_raw(old));
        }
        raw
    }
}

unsafe fn copy_string(s: *const StringPtr) -> StringPtr {
    StringPtr::from_units(unsafe { units(s) }.to_vec())
}

fn ordering(o: std::cmp::Ordering) -> i32 {
    o as i32
}

// ── Frames ───────────────────────────────────────────────────────────

extern "C" fn rt_frame_alloc(layout: *const FrameLayout) -> *mut u8 {
    unsafe { (*layout).alloc() }
}

extern "C" fn rt_frame_free(frame: *mut u8) {
    if !frame.is_null() {
        unsafe { FrameLayout::free(frame) };
    }
}

// ── Strings ──────────────────────────────────────────────────────────

extern "C" fn rt_string_copy(dst: *mut *mut StringPtr, src: *const StringPtr) -> *mut StringPtr {
    unsafe { store_string(dst, copy_string(src)) }
}

/// Takes ownership of a string returned by a host function.
extern "C" fn rt_string_adopt(dst: *mut *mut StringPtr, owned: *mut StringPtr) -> *mut StringPtr {
    unsafe {
        let s = if owned.is_null() { StringPtr::new("") } else { *StringPtr::from_raw(owned) };
        store_string(dst, s)
    }
}

extern "C" fn rt_string_from_double(dst: *mut *mut StringPtr, n: f64) -> *mut StringPtr {
    unsafe { store_string(dst, StringPtr::new(&format_number(n))) }
}

extern "C" fn rt_string_from_bool(dst: *mut *mut StringPtr, b: u8) -> *mut StringPtr {
    unsafe { store_string(dst, StringPtr::new(if b != 0 { "true" } else { "false" })) }
}

extern "C" fn rt_string_to_double(s: *const StringPtr) -> f64 {
    string_to_number(&unsafe { text(s) })
}

extern "C" fn rt_string_to_bool(s: *const StringPtr) -> u8 {
    string_to_bool(&unsafe { text(s) }) as u8
}

extern "C" fn rt_string_concat(dst: *mut *mut StringPtr, a: *const StringPtr, b: *const StringPtr) -> *mut StringPtr {
    unsafe {
        let mut joined = units(a).to_vec();
        joined.extend_from_slice(units(b));
        store_string(dst, StringPtr::from_units(joined))
    }
}

/// Character at a 0-based UTF-16 index; empty when out of range.
extern "C" fn rt_string_char(dst: *mut *mut StringPtr, s: *const StringPtr, index: i64) -> *mut StringPtr {
    unsafe {
        let unit = usize::try_from(index).ok().and_then(|i| units(s).get(i).copied());
        store_string(dst, StringPtr::from_units(unit.into_iter().collect()))
    }
}

extern "C" fn rt_string_compare(a: *const StringPtr, b: *const StringPtr) -> i32 {
    unsafe {
        let (a, b) = (text(a), text(b));
        ordering(compare_parts(text_compare_number(&a), text_compare_number(&b), || a.clone(), || b.clone()))
    }
}

extern "C" fn rt_string_equals(a: *const StringPtr, b: *const StringPtr, case_sensitive: u8) -> u8 {
    unsafe {
        if case_sensitive != 0 {
            (units(a) == units(b)) as u8
        } else {
            (text(a).to_lowercase() == text(b).to_lowercase()) as u8
        }
    }
}

/// Slow path of native number comparison, taken when either side is NaN.
extern "C" fn rt_compare_doubles(a: f64, b: f64) -> i32 {
    ordering(compare_parts(a, b, || format_number(a), || format_number(b)))
}

extern "C" fn rt_compare_double_string(n: f64, s: *const StringPtr) -> i32 {
    let s = unsafe { text(s) };
    ordering(compare_parts(n, text_compare_number(&s), || format_number(n), || s.clone()))
}

// ── Boxed values ─────────────────────────────────────────────────────

extern "C" fn rt_value_set_double(dst: *mut ValueData, n: f64) {
    unsafe { *dst = ValueData::number(n) };
}

extern "C" fn rt_value_set_bool(dst: *mut ValueData, b: u8) {
    unsafe { *dst = ValueData::boolean(b != 0) };
}

extern "C" fn rt_value_set_string(dst: *mut ValueData, s: *const StringPtr) {
    unsafe { *dst = ValueData::string(copy_string(s)) };
}

extern "C" fn rt_value_assign(dst: *mut ValueData, src: *const ValueData) {
    if std::ptr::eq(dst, src) {
        return;
    }
    unsafe { *dst = (*src).clone() };
}

extern "C" fn rt_value_to_double(v: *const ValueData) -> f64 {
    unsafe { (*v).to_number() }
}

extern "C" fn rt_value_to_bool(v: *const ValueData) -> u8 {
    unsafe { (*v).to_bool() as u8 }
}

extern "C" fn rt_value_to_string(dst: *mut *mut StringPtr, v: *const ValueData) -> *mut StringPtr {
    unsafe { store_string(dst, (*v).to_string_ptr()) }
}

extern "C" fn rt_value_compare(a: *const ValueData, b: *const ValueData) -> i32 {
    unsafe { ordering(compare(&*a, &*b)) }
}

// ── Math ─────────────────────────────────────────────────────────────

extern "C" fn rt_math_mod(a: f64, b: f64) -> f64 {
    modulo(a, b)
}

extern "C" fn rt_math_random(a: f64, b: f64, integral: u8) -> f64 {
    random_between(a, b, integral != 0)
}

extern "C" fn rt_math_sin(x: f64) -> f64 {
    crate::value::sin_deg(x)
}

extern "C" fn rt_math_cos(x: f64) -> f64 {
    crate::value::cos_deg(x)
}

extern "C" fn rt_math_tan(x: f64) -> f64 {
    crate::value::tan_deg(x)
}

extern "C" fn rt_math_asin(x: f64) -> f64 {
    x.asin().to_degrees()
}

extern "C" fn rt_math_acos(x: f64) -> f64 {
    x.acos().to_degrees()
}

extern "C" fn rt_math_atan(x: f64) -> f64 {
    x.atan().to_degrees()
}

extern "C" fn rt_math_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn rt_math_log10(x: f64) -> f64 {
    x.log10()
}

extern "C" fn rt_math_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn rt_math_exp10(x: f64) -> f64 {
    10f64.powf(x)
}

// ── Lists ────────────────────────────────────────────────────────────

unsafe fn list<'a>(l: *mut List) -> &'a mut List {
    unsafe { &mut *l }
}

extern "C" fn rt_list_clear(l: *mut List) {
    unsafe { list(l).clear() }
}

extern "C" fn rt_list_remove(l: *mut List, index: i64) {
    unsafe { list(l).remove(index) }
}

extern "C" fn rt_list_size(l: *mut List) -> f64 {
    unsafe { list(l).len() as f64 }
}

extern "C" fn rt_list_contents(dst: *mut *mut StringPtr, l: *mut List) -> *mut StringPtr {
    unsafe { store_string(dst, StringPtr::new(&list(l).contents())) }
}

extern "C" fn rt_list_get_double(l: *mut List, index: i64) -> f64 {
    unsafe { list(l).get(index).map_or(0.0, ValueData::to_number) }
}

extern "C" fn rt_list_get_bool(l: *mut List, index: i64) -> u8 {
    unsafe { list(l).get(index).is_some_and(ValueData::to_bool) as u8 }
}

extern "C" fn rt_list_get_string(dst: *mut *mut StringPtr, l: *mut List, index: i64) -> *mut StringPtr {
    unsafe {
        let s = list(l).get(index).map_or_else(|| StringPtr::new(""), ValueData::to_string_ptr);
        store_string(dst, s)
    }
}

/// Out-of-range reads of an untyped list produce the empty string.
extern "C" fn rt_list_get_value(dst: *mut ValueData, l: *mut List, index: i64) {
    unsafe {
        let item = list(l).get(index).cloned().unwrap_or_else(|| ValueData::string(StringPtr::new("")));
        *dst = item;
    }
}

macro_rules! typed_list_helpers {
    ($($append:ident, $insert:ident, $replace:ident, $index_of:ident, $contains:ident: $ty:ty => |$x:ident| $make:expr;)*) => {
        $(
            extern "C" fn $append(l: *mut List, $x: $ty) {
                unsafe { list(l).push($make) }
            }

            extern "C" fn $insert(l: *mut List, index: i64, $x: $ty) {
                unsafe { list(l).insert(index, $make) }
            }

            extern "C" fn $replace(l: *mut List, index: i64, $x: $ty) {
                unsafe { list(l).replace(index, $make) }
            }

            extern "C" fn $index_of(l: *mut List, $x: $ty) -> f64 {
                let item = $make;
                unsafe { list(l).index_of(&item) as f64 }
            }

            extern "C" fn $contains(l: *mut List, $x: $ty) -> u8 {
                let item = $make;
                unsafe { (list(l).index_of(&item) >= 0) as u8 }
            }
        )*
    };
}

typed_list_helpers! {
    rt_list_append_double, rt_list_insert_double, rt_list_replace_double,
        rt_list_index_of_double, rt_list_contains_double: f64 => |n| ValueData::number(n);
    rt_list_append_bool, rt_list_insert_bool, rt_list_replace_bool,
        rt_list_index_of_bool, rt_list_contains_bool: u8 => |b| ValueData::boolean(b != 0);
    rt_list_append_string, rt_list_insert_string, rt_list_replace_string,
        rt_list_index_of_string, rt_list_contains_string: *const StringPtr => |s| ValueData::string(unsafe { copy_string(s) });
    rt_list_append_value, rt_list_insert_value, rt_list_replace_value,
        rt_list_index_of_value, rt_list_contains_value: *const ValueData => |v| unsafe { (*v).clone() };
}

// ── Execution context ────────────────────────────────────────────────

extern "C" fn rt_promise_pending(ctx: *mut c_void) -> u8 {
    if ctx.is_null() {
        return 0;
    }
    unsafe { (*(ctx as *const ExecutionContext)).has_pending_promise() as u8 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn slot() -> *mut StringPtr {
        std::ptr::null_mut()
    }

    #[test]
    fn symbol_table_is_consistent() {
        let mut names: Vec<&str> = RuntimeFn::ALL.iter().map(|f| f.name()).collect();
        let count = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), count);
        assert!(names.iter().all(|n| n.starts_with("rt_")));
        assert_eq!(RuntimeFn::StringConcat.params(), &[Abi::Ptr, Abi::Ptr, Abi::Ptr]);
        assert_eq!(RuntimeFn::ListClear.returns(), &[] as &[Abi]);
        assert_eq!(ListOp::Contains.helper(ItemKind::String), RuntimeFn::ListContainsString);
    }

    #[test]
    fn string_slots_are_reassigned() {
        let mut dst = slot();
        let a = StringPtr::new("Hello ");
        let b = StringPtr::new("world");
        rt_string_concat(&mut dst, &a, &b);
        assert_eq!(unsafe { (*dst).to_rust_string() }, "Hello world");
        rt_string_from_double(&mut dst, 2.5);
        assert_eq!(unsafe { (*dst).to_rust_string() }, "2.5");
        rt_string_char(&mut dst, &a, 1);
        assert_eq!(unsafe { (*dst).to_rust_string() }, "e");
        rt_string_char(&mut dst, &a, 99);
        assert_eq!(unsafe { (*dst).to_rust_string() }, "");
        rt_string_copy(&mut dst, std::ptr::null());
        assert_eq!(unsafe { (*dst).len() }, 0);
        unsafe { drop(StringPtr::from_raw(dst)) };
    }

    #[test]
    fn mixed_comparisons() {
        let s = StringPtr::new(" 5.25 ");
        assert_eq!(rt_compare_double_string(5.25, &s), 0);
        assert_eq!(rt_compare_doubles(f64::NAN, f64::NAN), 0);
        assert_eq!(rt_compare_doubles(f64::NAN, 5.0), 1);
        let (a, b) = (StringPtr::new("abc"), StringPtr::new("ABC"));
        assert_eq!(rt_string_compare(&a, &b), 0);
        assert_eq!(rt_string_equals(&a, &b, 0), 1);
        assert_eq!(rt_string_equals(&a, &b, 1), 0);
    }

    #[test]
    fn typed_list_helpers_share_bounds_policy() {
        let mut l = List::new("l");
        rt_list_append_double(&mut l, 1.0);
        rt_list_append_bool(&mut l, 1);
        let word = StringPtr::new("Dolor");
        rt_list_append_string(&mut l, &word);
        rt_list_insert_double(&mut l, 3, 4.0);
        rt_list_insert_double(&mut l, 9, 9.0);
        rt_list_replace_double(&mut l, 9, 9.0);
        assert_eq!(l.to_values(), vec![Value::Number(1.0), Value::Bool(true), Value::from("Dolor"), Value::Number(4.0)]);
        let query = StringPtr::new("dolor");
        assert_eq!(rt_list_index_of_string(&mut l, &query), 2.0);
        assert_eq!(rt_list_contains_double(&mut l, 7.0), 0);
        assert_eq!(rt_list_get_double(&mut l, -1), 0.0);
        let mut out = ValueData::number(1.0);
        rt_list_get_value(&mut out, &mut l, 10);
        assert_eq!(out.to_value(), Value::from(""));
    }
}
