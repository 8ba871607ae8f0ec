//! Abstract operations: coercions, equality, ordering, string conversion.
//!
//! The fast paths in the interpreter only reach here when an operand is
//! not a number; these helpers implement the slow-path coercion cascades.
//! `ToPrimitive` on objects may re-enter the interpreter through
//! `valueOf`/`toString`.

use heron_vm_heap::value::{Value, ValueKind};

use crate::error::{ErrorKind, JsResult};
use crate::identifiers::Predefined;
use crate::interpreter;
use crate::object;
use crate::runtime::Runtime;
use crate::strings;

/// Recursion bound for loose-equality and ToPrimitive chains, protecting
/// against adversarial valueOf/toString cycles.
const MAX_COERCION_DEPTH: u32 = 64;

/// Preferred type for `ToPrimitive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredType {
    /// No preference (treated as number)
    Default,
    /// Number conversion
    Number,
    /// String conversion
    String,
}

/// `ToBoolean`.
pub fn to_boolean(value: Value) -> bool {
    match value.kind() {
        ValueKind::Undefined | ValueKind::Null | ValueKind::Empty => false,
        ValueKind::Bool => value.as_bool(),
        ValueKind::Number => {
            let n = value.as_number();
            n != 0.0 && !n.is_nan()
        }
        // SAFETY: string values point at live string cells.
        ValueKind::String => !unsafe { strings::as_str(value) }.is_empty(),
        ValueKind::Object | ValueKind::Symbol | ValueKind::NativeU32 => true,
    }
}

/// `ToNumber`.
pub fn to_number(rt: &mut Runtime, value: Value) -> JsResult<f64> {
    to_number_depth(rt, value, 0)
}

fn to_number_depth(rt: &mut Runtime, value: Value, depth: u32) -> JsResult<f64> {
    match value.kind() {
        ValueKind::Number => Ok(value.as_number()),
        ValueKind::Undefined => Ok(f64::NAN),
        ValueKind::Null => Ok(0.0),
        ValueKind::Bool => Ok(if value.as_bool() { 1.0 } else { 0.0 }),
        ValueKind::String => {
            // SAFETY: copied before any allocation can happen.
            Ok(parse_number(unsafe { strings::as_str(value) }))
        }
        ValueKind::Object => {
            if depth >= MAX_COERCION_DEPTH {
                return Err(rt.raise(ErrorKind::TypeError, "too much coercion recursion"));
            }
            let primitive = to_primitive(rt, value, PreferredType::Number)?;
            to_number_depth(rt, primitive, depth + 1)
        }
        ValueKind::Symbol | ValueKind::NativeU32 | ValueKind::Empty => {
            Err(rt.raise(ErrorKind::TypeError, "cannot convert value to number"))
        }
    }
}

/// The ECMAScript string-to-number grammar, reduced to what the VM needs:
/// whitespace trim, empty is zero, hex literals, `Infinity` forms, and
/// decimal parsing. Everything else is NaN.
fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace());
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return match u64::from_str_radix(hex, 16) {
            Ok(v) => v as f64,
            Err(_) => f64::NAN,
        };
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    // Rust's grammar accepts the remaining JS decimal forms; reject the
    // Rust-only ones JS does not ("inf", "nan", underscores).
    if trimmed.contains(['i', 'n', 'N', '_']) && !trimmed.contains('e') && !trimmed.contains('E') {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// `ToInt32`: modulo 2^32, wrapped to signed.
pub fn to_int32(rt: &mut Runtime, value: Value) -> JsResult<i32> {
    Ok(double_to_int32(to_number(rt, value)?))
}

/// `ToUint32`.
pub fn to_uint32(rt: &mut Runtime, value: Value) -> JsResult<u32> {
    Ok(double_to_int32(to_number(rt, value)?) as u32)
}

/// The ToInt32 truncation on a double.
pub fn double_to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let n = n.trunc();
    let modulo = n.rem_euclid(4_294_967_296.0);
    if modulo >= 2_147_483_648.0 {
        (modulo - 4_294_967_296.0) as i32
    } else {
        modulo as i32
    }
}

/// Array-length coercion: ToUint32 plus the RangeError check for
/// non-integral inputs.
pub fn to_length(rt: &mut Runtime, value: Value) -> JsResult<u32> {
    let n = to_number(rt, value)?;
    let len = double_to_int32(n) as u32;
    if len as f64 != n {
        return Err(rt.raise(ErrorKind::RangeError, "invalid array length"));
    }
    Ok(len)
}

/// `ToPrimitive`. Objects try `valueOf`/`toString` (order by hint),
/// re-entering the interpreter when those are callable.
pub fn to_primitive(rt: &mut Runtime, value: Value, hint: PreferredType) -> JsResult<Value> {
    if object::as_object(value).is_none() {
        return Ok(value);
    }
    let converted = rt.with_scope(|rt| {
        let h_value = rt.handles.new_handle(value);
        let methods = match hint {
            PreferredType::String => [Predefined::ToString, Predefined::ValueOf],
            PreferredType::Number | PreferredType::Default => {
                [Predefined::ValueOf, Predefined::ToString]
            }
        };
        for method in methods {
            let receiver = rt.handles.get(h_value);
            let obj = object::as_object(receiver).expect("handle keeps the object");
            let Some(f) = object::get_property(rt, obj, method.symbol()) else {
                continue;
            };
            if !crate::function::is_callable(f) {
                continue;
            }
            let receiver = rt.handles.get(h_value);
            let result = interpreter::call_value(rt, f, receiver, &[], Value::undefined())?;
            if !result.is_object() {
                return Ok(Some(result));
            }
        }
        Ok(None)
    })?;
    match converted {
        Some(primitive) => Ok(primitive),
        None => Err(rt.raise(ErrorKind::TypeError, "cannot convert object to primitive value")),
    }
}

/// `ToString` producing a heap string.
pub fn to_string_value(rt: &mut Runtime, value: Value) -> JsResult<Value> {
    match value.kind() {
        ValueKind::String => Ok(value),
        ValueKind::Undefined => strings::new_string(rt, "undefined"),
        ValueKind::Null => strings::new_string(rt, "null"),
        ValueKind::Bool => {
            strings::new_string(rt, if value.as_bool() { "true" } else { "false" })
        }
        ValueKind::Number => {
            let text = number_to_string(value.as_number());
            strings::new_string(rt, &text)
        }
        ValueKind::Object => {
            let primitive = to_primitive(rt, value, PreferredType::String)?;
            to_string_value(rt, primitive)
        }
        ValueKind::Symbol | ValueKind::NativeU32 | ValueKind::Empty => {
            Err(rt.raise(ErrorKind::TypeError, "cannot convert value to string"))
        }
    }
}

/// ECMAScript number formatting: integers print without a fraction, the
/// rest use shortest round-trip form with `e+` exponents.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_owned();
    }
    if n == 0.0 {
        return "0".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{}", n as i64);
    }
    let text = format!("{n}");
    // Rust prints `1e300`; JS prints `1e+300`.
    if let Some(pos) = text.find('e') {
        if text.as_bytes().get(pos + 1) != Some(&b'-') {
            let (mantissa, exp) = text.split_at(pos + 1);
            return format!("{mantissa}+{exp}");
        }
    }
    text
}

/// `typeof`.
pub fn typeof_str(value: Value) -> &'static str {
    match value.kind() {
        ValueKind::Undefined | ValueKind::Empty => "undefined",
        ValueKind::Null => "object",
        ValueKind::Bool => "boolean",
        ValueKind::Number => "number",
        ValueKind::String => "string",
        ValueKind::Symbol => "symbol",
        ValueKind::NativeU32 => "number",
        ValueKind::Object => {
            if crate::function::is_callable(value) {
                "function"
            } else {
                "object"
            }
        }
    }
}

/// `==` with the specified coercion cascade.
pub fn loose_equals(rt: &mut Runtime, a: Value, b: Value) -> JsResult<bool> {
    loose_equals_depth(rt, a, b, 0)
}

fn loose_equals_depth(rt: &mut Runtime, a: Value, b: Value, depth: u32) -> JsResult<bool> {
    if depth >= MAX_COERCION_DEPTH {
        return Err(rt.raise(ErrorKind::TypeError, "too much coercion recursion"));
    }
    use ValueKind::*;
    let (ka, kb) = (a.kind(), b.kind());
    match (ka, kb) {
        _ if ka == kb => Ok(a.strict_equals(b)),
        (Undefined, Null) | (Null, Undefined) => Ok(true),
        (Number, String) => {
            // SAFETY: content copied inside parse before any allocation.
            Ok(a.as_number() == parse_number(unsafe { strings::as_str(b) }))
        }
        (String, Number) => {
            // SAFETY: as above.
            Ok(parse_number(unsafe { strings::as_str(a) }) == b.as_number())
        }
        (Bool, _) => {
            let a = Value::number(if a.as_bool() { 1.0 } else { 0.0 });
            loose_equals_depth(rt, a, b, depth + 1)
        }
        (_, Bool) => {
            let b = Value::number(if b.as_bool() { 1.0 } else { 0.0 });
            loose_equals_depth(rt, a, b, depth + 1)
        }
        (Object, Number) | (Object, String) => rt.with_scope(|rt| {
            let h_b = rt.handles.new_handle(b);
            let a = to_primitive(rt, a, PreferredType::Default)?;
            let b = rt.handles.get(h_b);
            loose_equals_depth(rt, a, b, depth + 1)
        }),
        (Number, Object) | (String, Object) => rt.with_scope(|rt| {
            let h_a = rt.handles.new_handle(a);
            let b = to_primitive(rt, b, PreferredType::Default)?;
            let a = rt.handles.get(h_a);
            loose_equals_depth(rt, a, b, depth + 1)
        }),
        _ => Ok(false),
    }
}

/// Abstract relational comparison. `None` means "undefined" (NaN was
/// involved); the caller maps it to false.
pub fn compare_less(rt: &mut Runtime, a: Value, b: Value) -> JsResult<Option<bool>> {
    rt.with_scope(|rt| {
        let h_b = rt.handles.new_handle(b);
        let pa = to_primitive(rt, a, PreferredType::Number)?;
        let h_pa = rt.handles.new_handle(pa);
        let b = rt.handles.get(h_b);
        let pb = to_primitive(rt, b, PreferredType::Number)?;
        let pa = rt.handles.get(h_pa);

        if pa.is_string() && pb.is_string() {
            // SAFETY: both read immediately, no allocation in between.
            let result = unsafe { strings::as_str(pa) < strings::as_str(pb) };
            return Ok(Some(result));
        }
        // Both are primitives now; numeric coercion cannot allocate.
        let na = to_number(rt, pa)?;
        let nb = to_number(rt, pb)?;
        if na.is_nan() || nb.is_nan() {
            return Ok(None);
        }
        Ok(Some(na < nb))
    })
}

/// Short rendering of a value for diagnostics and error messages.
pub fn value_brief(rt: &Runtime, value: Value) -> String {
    match value.kind() {
        ValueKind::Undefined => "undefined".to_owned(),
        ValueKind::Null => "null".to_owned(),
        ValueKind::Bool => value.as_bool().to_string(),
        ValueKind::Number => number_to_string(value.as_number()),
        ValueKind::String => strings::to_rust_string(value),
        ValueKind::Symbol => {
            let sym = value.as_symbol();
            match rt.identifiers.try_text(sym) {
                Some(text) => format!("Symbol({text})"),
                None => format!("Symbol(#{})", sym.0),
            }
        }
        ValueKind::Object => {
            if crate::function::is_callable(value) {
                "[function]".to_owned()
            } else {
                "[object Object]".to_owned()
            }
        }
        ValueKind::NativeU32 => format!("[native {}]", value.as_native_u32()),
        ValueKind::Empty => "<empty>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_truncation_matches_the_spec_cases() {
        assert_eq!(double_to_int32(0.0), 0);
        assert_eq!(double_to_int32(-0.0), 0);
        assert_eq!(double_to_int32(3.9), 3);
        assert_eq!(double_to_int32(-3.9), -3);
        assert_eq!(double_to_int32(f64::NAN), 0);
        assert_eq!(double_to_int32(f64::INFINITY), 0);
        assert_eq!(double_to_int32(4_294_967_296.0), 0);
        assert_eq!(double_to_int32(4_294_967_297.0), 1);
        assert_eq!(double_to_int32(2_147_483_648.0), -2_147_483_648);
        assert_eq!(double_to_int32(-2_147_483_649.0), 2_147_483_647);
    }

    #[test]
    fn string_number_grammar() {
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("  42  "), 42.0);
        assert_eq!(parse_number("0x10"), 16.0);
        assert_eq!(parse_number("-1.5e3"), -1500.0);
        assert_eq!(parse_number("Infinity"), f64::INFINITY);
        assert_eq!(parse_number("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_number("12abc").is_nan());
        assert!(parse_number("inf").is_nan());
        assert!(parse_number("NaN").is_nan());
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(10.0), "10");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(2.5), "2.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(1e300), "1e+300");
        assert_eq!(number_to_string(1e-300), "1e-300");
    }
}
