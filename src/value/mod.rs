//! The dynamic value model: an owned host-side [`Value`], the `#[repr(C)]`
//! [`ValueData`] record generated code reads and writes, and the coercion and
//! loose-comparison rules compiled code must reproduce exactly.

mod string;

use std::cmp::Ordering;
use std::ffi::c_void;

pub use string::{StringPtr, format_number, is_canonical_number, parse_number};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl Value {
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => *b as u8 as f64,
            Value::String(s) => string_to_number(s),
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::Number(n) => number_to_bool(*n),
            Value::Bool(b) => *b,
            Value::String(s) => string_to_bool(s),
        }
    }
}

// ── Native record ────────────────────────────────────────────────────

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Number = 0,
    Bool = 1,
    String = 2,
    Pointer = 3,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union ValuePayload {
    pub number: f64,
    pub boolean: bool,
    pub string: *mut StringPtr,
    pub pointer: *mut c_void,
}

/// Boxed tagged value. All-zero bits decode as Number 0, which is what a
/// freshly zeroed frame slot holds.
#[repr(C)]
pub struct ValueData {
    payload: ValuePayload,
    kind: ValueType,
}

impl ValueData {
    pub const PAYLOAD_OFFSET: i32 = std::mem::offset_of!(ValueData, payload) as i32;
    pub const KIND_OFFSET: i32 = std::mem::offset_of!(ValueData, kind) as i32;
    pub const SIZE: u32 = std::mem::size_of::<ValueData>() as u32;

    pub fn number(n: f64) -> Self {
        ValueData { payload: ValuePayload { number: n }, kind: ValueType::Number }
    }

    pub fn boolean(b: bool) -> Self {
        ValueData { payload: ValuePayload { boolean: b }, kind: ValueType::Bool }
    }

    pub fn string(s: StringPtr) -> Self {
        ValueData { payload: ValuePayload { string: s.into_raw() }, kind: ValueType::String }
    }

    pub fn pointer(p: *mut c_void) -> Self {
        ValueData { payload: ValuePayload { pointer: p }, kind: ValueType::Pointer }
    }

    pub fn kind(&self) -> ValueType {
        self.kind
    }

    pub fn as_string(&self) -> Option<&StringPtr> {
        match self.kind {
            // SAFETY: kind String always carries a live pointer from StringPtr::into_raw.
            ValueType::String => Some(unsafe { &*self.payload.string }),
            _ => None,
        }
    }

    pub fn to_number(&self) -> f64 {
        // SAFETY: each arm reads the union field matching `kind`.
        unsafe {
            match self.kind {
                ValueType::Number => self.payload.number,
                ValueType::Bool => self.payload.boolean as u8 as f64,
                ValueType::String => string_to_number(&(*self.payload.string).to_rust_string()),
                ValueType::Pointer => 0.0,
            }
        }
    }

    pub fn to_bool(&self) -> bool {
        unsafe {
            match self.kind {
                ValueType::Number => number_to_bool(self.payload.number),
                ValueType::Bool => self.payload.boolean,
                ValueType::String => string_to_bool(&(*self.payload.string).to_rust_string()),
                ValueType::Pointer => !self.payload.pointer.is_null(),
            }
        }
    }

    pub fn to_rust_string(&self) -> String {
        unsafe {
            match self.kind {
                ValueType::Number => format_number(self.payload.number),
                ValueType::Bool => self.payload.boolean.to_string(),
                ValueType::String => (*self.payload.string).to_rust_string(),
                ValueType::Pointer => String::new(),
            }
        }
    }

    pub fn to_string_ptr(&self) -> StringPtr {
        match self.as_string() {
            Some(s) => s.clone(),
            None => StringPtr::new(&self.to_rust_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        unsafe {
            match self.kind {
                ValueType::Number => Value::Number(self.payload.number),
                ValueType::Bool => Value::Bool(self.payload.boolean),
                ValueType::String => Value::String((*self.payload.string).to_rust_string()),
                ValueType::Pointer => Value::Number(0.0),
            }
        }
    }

    /// Number view used by loose comparison: NaN marks "compare as text".
    fn compare_number(&self) -> f64 {
        unsafe {
            match self.kind {
                ValueType::Number => self.payload.number,
                ValueType::Bool => self.payload.boolean as u8 as f64,
                ValueType::String => {
                    let s = (*self.payload.string).to_rust_string();
                    if s.trim().is_empty() { f64::NAN } else { parse_number(&s).unwrap_or(f64::NAN) }
                }
                ValueType::Pointer => f64::NAN,
            }
        }
    }
}

impl Default for ValueData {
    fn default() -> Self {
        ValueData::number(0.0)
    }
}

impl Clone for ValueData {
    fn clone(&self) -> Self {
        match self.as_string() {
            Some(s) => ValueData::string(s.clone()),
            None => ValueData { payload: self.payload, kind: self.kind },
        }
    }
}

impl Drop for ValueData {
    fn drop(&mut self) {
        if self.kind == ValueType::String {
            // SAFETY: a String payload is uniquely owned by this record.
            unsafe { drop(StringPtr::from_raw(self.payload.string)) };
        }
    }
}

impl std::fmt::Debug for ValueData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueData({:?})", self.to_value())
    }
}

impl From<&Value> for ValueData {
    fn from(v: &Value) -> Self {
        match v {
            Value::Number(n) => ValueData::number(*n),
            Value::Bool(b) => ValueData::boolean(*b),
            Value::String(s) => ValueData::string(StringPtr::new(s)),
        }
    }
}

impl From<Value> for ValueData {
    fn from(v: Value) -> Self {
        ValueData::from(&v)
    }
}

// ── Coercions ────────────────────────────────────────────────────────

pub fn string_to_number(s: &str) -> f64 {
    parse_number(s).unwrap_or(0.0)
}

pub fn number_to_bool(n: f64) -> bool {
    n != 0.0 && !n.is_nan()
}

pub fn string_to_bool(s: &str) -> bool {
    !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))
}

// ── Loose comparison ─────────────────────────────────────────────────

/// Scratch comparison: numeric when both sides are numbers (whitespace-only
/// text is not), otherwise case-insensitive text comparison.
pub fn compare(a: &ValueData, b: &ValueData) -> Ordering {
    compare_parts(a.compare_number(), b.compare_number(), || a.to_rust_string(), || b.to_rust_string())
}

pub fn compare_parts(
    n1: f64,
    n2: f64,
    s1: impl FnOnce() -> String,
    s2: impl FnOnce() -> String,
) -> Ordering {
    if n1.is_nan() || n2.is_nan() {
        let l1: Vec<u16> = s1().to_lowercase().encode_utf16().collect();
        let l2: Vec<u16> = s2().to_lowercase().encode_utf16().collect();
        return l1.cmp(&l2);
    }
    if n1.is_infinite() && n2.is_infinite() && n1.signum() == n2.signum() {
        return Ordering::Equal;
    }
    n1.partial_cmp(&n2).unwrap_or(Ordering::Equal)
}

/// Number view of a text operand for [`compare_parts`].
pub fn text_compare_number(s: &str) -> f64 {
    if s.trim().is_empty() { f64::NAN } else { parse_number(s).unwrap_or(f64::NAN) }
}

pub fn values_equal(a: &ValueData, b: &ValueData) -> bool {
    compare(a, b) == Ordering::Equal
}

// ── Math ─────────────────────────────────────────────────────────────

/// Floored modulo: the result takes the sign of the divisor.
pub fn modulo(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r / b < 0.0 { r + b } else { r }
}

fn round_10(x: f64) -> f64 {
    (x * 1e10).round() / 1e10
}

pub fn sin_deg(x: f64) -> f64 {
    round_10(x.to_radians().sin())
}

pub fn cos_deg(x: f64) -> f64 {
    round_10(x.to_radians().cos())
}

pub fn tan_deg(x: f64) -> f64 {
    let r = x % 360.0;
    if r == -270.0 || r == 90.0 {
        f64::INFINITY
    } else if r == -90.0 || r == 270.0 {
        f64::NEG_INFINITY
    } else {
        round_10(x.to_radians().tan())
    }
}

pub fn random_between(a: f64, b: f64, integral: bool) -> f64 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if low == high {
        return low;
    }
    if integral || (low.fract() == 0.0 && high.fract() == 0.0) {
        let (first, last) = (low.ceil(), high.floor());
        // No integer in between: fall back to a uniform draw in range.
        if first > last {
            return low + fastrand::f64() * (high - low);
        }
        first + (fastrand::f64() * (last - first + 1.0)).floor()
    } else {
        low + fastrand::f64() * (high - low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(a: impl Into<Value>, b: impl Into<Value>) -> bool {
        values_equal(&ValueData::from(a.into()), &ValueData::from(b.into()))
    }

    fn cmp(a: impl Into<Value>, b: impl Into<Value>) -> Ordering {
        compare(&ValueData::from(a.into()), &ValueData::from(b.into()))
    }

    #[test]
    fn bool_literals_compare_case_insensitively() {
        assert!(eq(true, "true"));
        assert!(eq(true, "TRUE"));
        assert!(eq(false, "False"));
        assert!(!eq(true, "false"));
        assert!(eq(true, 1.0));
    }

    #[test]
    fn numeric_strings_ignore_surrounding_whitespace() {
        assert!(eq(5.25, " 5.25 "));
        assert!(eq(5.25, "5.25"));
        assert!(!eq(5.25, "5.26"));
        assert!(eq("10", 10.0));
        assert_eq!(cmp("10", "9"), Ordering::Greater);
    }

    #[test]
    fn special_numbers_compare_by_name() {
        assert!(eq(f64::INFINITY, "Infinity"));
        assert!(eq(f64::INFINITY, "infinity"));
        assert!(eq(f64::NEG_INFINITY, "-Infinity"));
        assert!(eq(f64::NAN, "NaN"));
        assert!(eq(f64::NAN, "nan"));
        assert!(eq("NaN", "NAN"));
        assert!(eq(f64::NAN, f64::NAN));
        assert!(!eq(f64::INFINITY, f64::NEG_INFINITY));
    }

    #[test]
    fn whitespace_only_strings_compare_as_text() {
        assert!(!eq(0.0, " "));
        assert!(!eq(0.0, ""));
        assert!(eq("", ""));
    }

    #[test]
    fn text_comparison_is_case_insensitive() {
        assert!(eq("Lorem", "lorem"));
        assert_eq!(cmp("apple", "Banana"), Ordering::Less);
    }

    #[test]
    fn floored_modulo() {
        assert_eq!(modulo(-1.0, 3.0), 2.0);
        assert_eq!(modulo(5.0, 3.0), 2.0);
        assert_eq!(modulo(-4.75, 2.0), 1.25);
        assert!(modulo(4.75, -2.0) < 0.0);
        assert!(modulo(1.0, 0.0).is_nan());
        assert_eq!(modulo(5.0, f64::INFINITY), 5.0);
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::from("abc").to_number(), 0.0);
        assert_eq!(Value::from(" 12 ").to_number(), 12.0);
        assert!(!Value::from("FALSE").to_bool());
        assert!(!Value::from("0").to_bool());
        assert!(Value::from("0.0").to_bool());
        assert!(!Value::from(f64::NAN).to_bool());
        assert_eq!(ValueData::from(Value::from(true)).to_rust_string(), "true");
    }

    #[test]
    fn trigonometry_in_degrees() {
        assert_eq!(sin_deg(30.0), 0.5);
        assert_eq!(cos_deg(90.0), 0.0);
        assert_eq!(tan_deg(90.0), f64::INFINITY);
        assert_eq!(tan_deg(-90.0), f64::NEG_INFINITY);
        assert_eq!(tan_deg(45.0), 1.0);
    }

    #[test]
    fn random_respects_bounds() {
        for _ in 0..100 {
            let n = random_between(1.0, 3.0, false);
            assert!(n == 1.0 || n == 2.0 || n == 3.0);
            let f = random_between(0.5, 1.5, false);
            assert!((0.5..=1.5).contains(&f));
        }
        assert_eq!(random_between(4.0, 4.0, true), 4.0);
    }

    #[test]
    fn integral_random_without_an_integer_in_range_stays_in_range() {
        for _ in 0..100 {
            let n = random_between(0.5, 0.7, true);
            assert!((0.5..=0.7).contains(&n), "got {n}");
            let m = random_between(0.8, 0.2, true);
            assert!((0.2..=0.8).contains(&m), "got {m}");
            let k = random_between(0.5, 2.5, true);
            assert!(k == 1.0 || k == 2.0, "got {k}");
        }
    }

    #[test]
    fn record_layout() {
        assert_eq!(ValueData::SIZE, 16);
        assert_eq!(ValueData::PAYLOAD_OFFSET, 0);
        assert_eq!(ValueData::KIND_OFFSET, 8);
        let zeroed: ValueData = unsafe { std::mem::zeroed() };
        assert_eq!(zeroed.to_value(), Value::Number(0.0));
    }
}
