//! UTF-16 string record shared with generated code, plus the JavaScript-style
//! number <-> text conversions the value model is defined by.

use std::mem::ManuallyDrop;

/// Immutable UTF-16 string as seen by native code.
///
/// Generated code only ever reads `size` directly (string length is
/// open-coded); everything else goes through runtime helpers.
#[repr(C)]
pub struct StringPtr {
    data: *mut u16,
    size: usize,
    allocated: usize,
}

impl StringPtr {
    pub const SIZE_OFFSET: i32 = std::mem::offset_of!(StringPtr, size) as i32;

    pub fn from_units(units: Vec<u16>) -> Self {
        let mut units = ManuallyDrop::new(units);
        StringPtr { data: units.as_mut_ptr(), size: units.len(), allocated: units.capacity() }
    }

    pub fn new(s: &str) -> Self {
        Self::from_units(s.encode_utf16().collect())
    }

    pub fn into_raw(self) -> *mut StringPtr {
        Box::into_raw(Box::new(self))
    }

    /// # Safety
    /// `ptr` must come from [`StringPtr::into_raw`] and not have been freed.
    pub unsafe fn from_raw(ptr: *mut StringPtr) -> Box<StringPtr> {
        unsafe { Box::from_raw(ptr) }
    }

    pub fn units(&self) -> &[u16] {
        // SAFETY: data/size/allocated always describe a live Vec<u16> buffer
        // owned by this record (see from_units / Drop).
        unsafe { std::slice::from_raw_parts(self.data, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn to_rust_string(&self) -> String {
        String::from_utf16_lossy(self.units())
    }
}

impl Clone for StringPtr {
    fn clone(&self) -> Self {
        Self::from_units(self.units().to_vec())
    }
}

impl Drop for StringPtr {
    fn drop(&mut self) {
        // SAFETY: reconstructs the Vec that from_units decomposed.
        unsafe { drop(Vec::from_raw_parts(self.data, self.size, self.allocated)) };
    }
}

impl std::fmt::Debug for StringPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_rust_string())
    }
}

impl PartialEq for StringPtr {
    fn eq(&self, other: &Self) -> bool {
        self.units() == other.units()
    }
}

// ── Number parsing ───────────────────────────────────────────────────

/// Parse text the way JavaScript's `Number()` does. `None` stands for NaN.
pub fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return Some(0.0);
    }
    match t {
        "Infinity" | "+Infinity" => return Some(f64::INFINITY),
        "-Infinity" => return Some(f64::NEG_INFINITY),
        _ => {}
    }
    let bytes = t.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'0' {
        let radix = match bytes[1] {
            b'x' | b'X' => Some(16),
            b'b' | b'B' => Some(2),
            b'o' | b'O' => Some(8),
            _ => None,
        };
        if let Some(radix) = radix {
            // Digits only: no sign, and no u64 ceiling.
            return t[2..]
                .chars()
                .try_fold(0.0, |n: f64, c| c.to_digit(radix).map(|d| n * f64::from(radix) + f64::from(d)));
        }
    }
    if !is_decimal_literal(bytes) {
        return None;
    }
    t.parse::<f64>().ok()
}

/// `[+-] digits [. digits] [e [+-] digits]` with at least one mantissa digit.
/// Rejects the `inf`/`nan` spellings Rust's parser would otherwise accept.
fn is_decimal_literal(b: &[u8]) -> bool {
    let mut i = 0;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    let mut digits = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        digits += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return false;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return false;
        }
    }
    i == b.len()
}

// ── Number formatting ────────────────────────────────────────────────

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let s = format!("{:e}", n);
        match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        }
    } else {
        format!("{}", n)
    }
}

/// True when `s` survives a text -> number -> text round trip unchanged, which
/// lets string constants stand in for numbers without runtime parsing.
pub fn is_canonical_number(s: &str) -> Option<f64> {
    let n = parse_number(s)?;
    if s.trim().is_empty() {
        return None;
    }
    (format_number(n) == s).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_like_javascript() {
        assert_eq!(parse_number(" 5.25 "), Some(5.25));
        assert_eq!(parse_number(""), Some(0.0));
        assert_eq!(parse_number("0x10"), Some(16.0));
        assert_eq!(parse_number("0b101"), Some(5.0));
        assert_eq!(parse_number("-Infinity"), Some(f64::NEG_INFINITY));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("1e3"), Some(1000.0));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("nan"), None);
        assert_eq!(parse_number("infinity"), None);
        assert_eq!(parse_number("12abc"), None);
        assert_eq!(parse_number("1e"), None);
    }

    #[test]
    fn prefixed_literals_take_only_radix_digits() {
        assert_eq!(parse_number("0x+5"), None);
        assert_eq!(parse_number("0x-5"), None);
        assert_eq!(parse_number("0b102"), None);
        assert_eq!(parse_number("0o17"), Some(15.0));
        assert_eq!(parse_number("0xff"), Some(255.0));
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn prefixed_literals_past_u64_stay_finite() {
        assert_eq!(parse_number("0x10000000000000000"), Some(18446744073709551616.0));
        let big = parse_number("0xffffffffffffffffffff").expect("hex literal parses");
        assert!(big.is_finite() && big > 1.2e24);
    }

    #[test]
    fn formats_like_javascript() {
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(3.14), "3.14");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn canonical_number_strings() {
        assert_eq!(is_canonical_number("3.14"), Some(3.14));
        assert_eq!(is_canonical_number("-7"), Some(-7.0));
        assert_eq!(is_canonical_number("Infinity"), Some(f64::INFINITY));
        assert_eq!(is_canonical_number("3.140"), None);
        assert_eq!(is_canonical_number(" 3"), None);
        assert_eq!(is_canonical_number(""), None);
        assert_eq!(is_canonical_number("hello"), None);
    }

    #[test]
    fn string_record_round_trip() {
        let s = StringPtr::new("héllo");
        assert_eq!(s.len(), 5);
        assert_eq!(s.to_rust_string(), "héllo");
        let raw = s.clone().into_raw();
        let back = unsafe { StringPtr::from_raw(raw) };
        assert_eq!(*back, s);
    }
}
