//! `String` and its prototype. Indices count UTF-16 code units.

use std::cmp::Ordering;
use std::rc::Rc;

use super::{Intrinsics, arg, constructor, define, define_static, relative_index, to_integer};
use crate::sandbox::env::Env;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Completion, JsValue};

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    define(
        &intrinsics.string_proto,
        &[
            ("at", at),
            ("charAt", char_at),
            ("charCodeAt", char_code_at),
            ("codePointAt", code_point_at),
            ("concat", concat),
            ("endsWith", ends_with),
            ("includes", includes),
            ("indexOf", index_of),
            ("lastIndexOf", last_index_of),
            ("localeCompare", locale_compare),
            ("padEnd", pad_end),
            ("padStart", pad_start),
            ("repeat", repeat),
            ("replace", replace),
            ("replaceAll", replace_all),
            ("slice", slice),
            ("split", split),
            ("startsWith", starts_with),
            ("substr", substr),
            ("substring", substring),
            ("toLowerCase", to_lower_case),
            ("toString", to_string),
            ("toUpperCase", to_upper_case),
            ("trim", trim),
            ("trimEnd", trim_end),
            ("trimStart", trim_start),
            ("valueOf", to_string),
        ],
    );
    let string = constructor("String", string_call, None, &intrinsics.string_proto);
    define_static(&string, &[("fromCharCode", from_char_code)]);
    globals.declare("String", Some(string), true);
}

pub fn utf16_len(s: &str) -> usize {
    if s.is_ascii() {
        s.len()
    } else {
        s.encode_utf16().count()
    }
}

/// The code unit at `index` as a one-unit string.
pub fn unit_at(s: &str, index: usize) -> Option<String> {
    if s.is_ascii() {
        let end = index.checked_add(1)?;
        return s.get(index..end).map(str::to_string);
    }
    s.encode_utf16()
        .nth(index)
        .map(|unit| String::from_utf16_lossy(&[unit]))
}

fn units(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Substring by code-unit range; callers keep `start <= end <= len`.
fn slice_units(s: &str, start: usize, end: usize) -> String {
    if s.is_ascii() {
        return s.get(start..end).unwrap_or_default().to_string();
    }
    let units = units(s);
    units
        .get(start..end)
        .map(String::from_utf16_lossy)
        .unwrap_or_default()
}

fn find_units(haystack: &[u16], needle: &[u16], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(haystack.len()));
    }
    (from..haystack.len().saturating_sub(needle.len() - 1))
        .find(|&i| haystack[i..].starts_with(needle))
}

fn rfind_units(haystack: &[u16], needle: &[u16], from: usize) -> Option<usize> {
    let last_start = haystack.len().checked_sub(needle.len())?;
    (0..=from.min(last_start))
        .rev()
        .find(|&i| haystack[i..].starts_with(needle))
}

fn this_str(this: &JsValue) -> Rc<str> {
    match this {
        JsValue::String(s) => s.clone(),
        other => Rc::from(other.to_js_string()),
    }
}

fn arg_str(args: &[JsValue], index: usize) -> String {
    arg(args, index).to_js_string()
}

fn string_call(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(match args.first() {
        None => JsValue::string(""),
        Some(value) => interp.to_string_checked(value)?.into(),
    })
}

fn from_char_code(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let units: Vec<u16> = args.iter().map(|code| code.to_uint32() as u16).collect();
    Ok(String::from_utf16_lossy(&units).into())
}

fn to_string(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(JsValue::String(this_str(this)))
}

fn at(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let len = utf16_len(&s) as f64;
    let n = to_integer(&arg(args, 0));
    let index = if n < 0.0 { len + n } else { n };
    if index < 0.0 || index >= len {
        return Ok(JsValue::Undefined);
    }
    Ok(unit_at(&s, index as usize).map_or(JsValue::Undefined, JsValue::from))
}

fn char_at(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let n = to_integer(&arg(args, 0));
    if n < 0.0 {
        return Ok(JsValue::string(""));
    }
    Ok(unit_at(&s, n as usize).unwrap_or_default().into())
}

fn char_code_at(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let n = to_integer(&arg(args, 0));
    if n < 0.0 {
        return Ok(JsValue::Number(f64::NAN));
    }
    Ok(JsValue::Number(
        s.encode_utf16().nth(n as usize).map_or(f64::NAN, f64::from),
    ))
}

fn code_point_at(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let n = to_integer(&arg(args, 0));
    if n < 0.0 {
        return Ok(JsValue::Undefined);
    }
    let units = units(&s);
    let index = n as usize;
    let Some(&first) = units.get(index) else {
        return Ok(JsValue::Undefined);
    };
    let code = match char::decode_utf16(units[index..].iter().copied()).next() {
        Some(Ok(c)) => u32::from(c),
        _ => u32::from(first),
    };
    Ok(JsValue::Number(f64::from(code)))
}

fn concat(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut out = this_str(this).to_string();
    for value in args {
        let piece = interp.to_string_checked(value)?;
        interp.push_str_checked(&mut out, &piece)?;
    }
    Ok(out.into())
}

fn index_of(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let needle = arg_str(args, 0);
    let haystack = units(&s);
    let from = relative_index(&arg(args, 1), haystack.len(), 0);
    let found = find_units(&haystack, &units(&needle), from);
    Ok(JsValue::Number(found.map_or(-1.0, |i| i as f64)))
}

fn last_index_of(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let needle = arg_str(args, 0);
    let haystack = units(&s);
    let from = match arg(args, 1).to_number() {
        n if n.is_nan() => haystack.len(),
        n => n.max(0.0) as usize,
    };
    let found = rfind_units(&haystack, &units(&needle), from);
    Ok(JsValue::Number(found.map_or(-1.0, |i| i as f64)))
}

fn includes(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let index = index_of(interp, this, args)?;
    Ok((index.to_number() >= 0.0).into())
}

fn starts_with(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let haystack = units(&this_str(this));
    let needle = units(&arg_str(args, 0));
    let from = relative_index(&arg(args, 1), haystack.len(), 0).min(haystack.len());
    Ok(haystack[from..].starts_with(&needle).into())
}

fn ends_with(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let haystack = units(&this_str(this));
    let needle = units(&arg_str(args, 0));
    let end = relative_index(&arg(args, 1), haystack.len(), haystack.len());
    Ok(haystack[..end].ends_with(&needle).into())
}

fn slice(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let len = utf16_len(&s);
    let start = relative_index(&arg(args, 0), len, 0);
    let end = relative_index(&arg(args, 1), len, len);
    if start >= end {
        return Ok(JsValue::string(""));
    }
    Ok(slice_units(&s, start, end).into())
}

fn substring(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let len = utf16_len(&s);
    let clamp = |value: &JsValue, default: usize| match value {
        JsValue::Undefined => default,
        other => to_integer(other).clamp(0.0, len as f64) as usize,
    };
    let a = clamp(&arg(args, 0), 0);
    let b = clamp(&arg(args, 1), len);
    Ok(slice_units(&s, a.min(b), a.max(b)).into())
}

fn substr(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let len = utf16_len(&s);
    let start = relative_index(&arg(args, 0), len, 0);
    let count = match arg(args, 1) {
        JsValue::Undefined => len - start,
        other => to_integer(&other).clamp(0.0, (len - start) as f64) as usize,
    };
    Ok(slice_units(&s, start, start + count).into())
}

fn to_lower_case(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(this_str(this).to_lowercase().into())
}

fn to_upper_case(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(this_str(this).to_uppercase().into())
}

fn trim(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(this_str(this).trim().into())
}

fn trim_start(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(this_str(this).trim_start().into())
}

fn trim_end(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(this_str(this).trim_end().into())
}

fn pad(interp: &Interpreter, this: &JsValue, args: &[JsValue], at_start: bool) -> Completion<JsValue> {
    let s = this_str(this);
    let target = to_integer(&arg(args, 0));
    let filler = match arg(args, 1) {
        JsValue::Undefined => vec![u16::from(b' ')],
        other => units(&other.to_js_string()),
    };
    let len = utf16_len(&s);
    if target <= len as f64 || filler.is_empty() {
        return Ok(JsValue::String(s));
    }
    // Every code unit takes at least one byte, at most three.
    interp.check_string_length(target as usize)?;
    let missing = target as usize - len;
    let unit_bytes = if filler.iter().all(|&unit| unit < 0x80) { 1 } else { 3 };
    interp.check_string_length(s.len().saturating_add(missing.saturating_mul(unit_bytes)))?;

    let padding: Vec<u16> = filler.iter().copied().cycle().take(missing).collect();
    let padding = String::from_utf16_lossy(&padding);
    Ok(if at_start {
        format!("{padding}{s}").into()
    } else {
        format!("{s}{padding}").into()
    })
}

fn pad_start(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    pad(interp, this, args, true)
}

fn pad_end(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    pad(interp, this, args, false)
}

fn repeat(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let count = arg(args, 0).to_number();
    if count < 0.0 || count.is_infinite() {
        return Err(interp.throw(
            super::ErrorType::RangeError,
            format!("Invalid count value: {}", JsValue::Number(count).to_js_string()),
        ));
    }
    if s.is_empty() {
        return Ok(JsValue::string(""));
    }
    let count = if count.is_nan() { 0 } else { count as usize };
    interp.check_string_length(s.len().saturating_mul(count))?;
    Ok(s.repeat(count).into())
}

fn split(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let s = this_str(this);
    let limit = match arg(args, 1) {
        JsValue::Undefined => usize::MAX,
        other => other.to_uint32() as usize,
    };
    let parts: Vec<JsValue> = match arg(args, 0) {
        JsValue::Undefined => vec![JsValue::String(s)],
        separator => {
            let separator = separator.to_js_string();
            if separator.is_empty() {
                s.encode_utf16()
                    .map(|unit| String::from_utf16_lossy(&[unit]).into())
                    .collect()
            } else {
                s.split(separator.as_str()).map(JsValue::from).collect()
            }
        }
    };
    interp.check_array_length(parts.len())?;
    Ok(JsValue::array(parts.into_iter().take(limit).collect()))
}

/// Expands `$$` and `$&` in a replacement template.
fn expand_template(interp: &Interpreter, template: &str, matched: &str) -> Completion<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('$', Some('$')) => {
                chars.next();
                out.push('$');
            }
            ('$', Some('&')) => {
                chars.next();
                interp.push_str_checked(&mut out, matched)?;
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn replace_impl(
    interp: &mut Interpreter,
    this: &JsValue,
    args: &[JsValue],
    all: bool,
) -> Completion<JsValue> {
    let s = this_str(this);
    let pattern = arg_str(args, 0);
    let replacement = arg(args, 1);
    let mut matches: Vec<usize> = if pattern.is_empty() {
        let boundaries = s.char_indices().map(|(i, _)| i).chain([s.len()]);
        if all { boundaries.collect() } else { vec![0] }
    } else {
        s.match_indices(pattern.as_str()).map(|(i, _)| i).collect()
    };
    if !all {
        matches.truncate(1);
    }

    let mut out = String::new();
    let mut last = 0;
    for start in matches {
        interp.push_str_checked(&mut out, &s[last..start])?;
        let piece = if replacement.is_callable() {
            let offset = utf16_len(&s[..start]);
            let call_args = [pattern.as_str().into(), offset.into(), JsValue::String(s.clone())];
            let result = interp.call_function(&replacement, JsValue::Undefined, &call_args)?;
            interp.to_string_checked(&result)?
        } else {
            expand_template(interp, &replacement.to_js_string(), &pattern)?
        };
        interp.push_str_checked(&mut out, &piece)?;
        last = start + pattern.len();
    }
    interp.push_str_checked(&mut out, &s[last..])?;
    Ok(out.into())
}

fn replace(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    replace_impl(interp, this, args, false)
}

fn replace_all(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    replace_impl(interp, this, args, true)
}

/// Case-insensitive first, lowercase before uppercase on ties.
fn locale_compare(_: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let a = this_str(this);
    let b = arg_str(args, 0);
    let ordering = a
        .to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.as_str().cmp(&a));
    Ok(JsValue::Number(match ordering {
        Ordering::Less => -1.0,
        Ordering::Equal => 0.0,
        Ordering::Greater => 1.0,
    }))
}

#[cfg(test)]
mod tests {
    use crate::sandbox::interpreter::tests::call;

    fn eval(expr: &str) -> String {
        call(&format!("function main() {{ return {expr}; }}"), "main", &[])
            .unwrap_or_else(|error| format!("threw {error}"))
    }

    #[test]
    fn test_slicing_and_searching() {
        assert_eq!(eval("'hello'.slice(1, -1)"), "ell");
        assert_eq!(eval("'hello'.substring(3, 1)"), "el");
        assert_eq!(eval("'hello'.indexOf('l')"), "2");
        assert_eq!(eval("'hello'.lastIndexOf('l')"), "3");
        assert_eq!(eval("'hello'.includes('lo')"), "true");
        assert_eq!(eval("'hello'.at(-1)"), "o");
        assert_eq!(eval("'abc'.charCodeAt(1)"), "98");
    }

    #[test]
    fn test_split_and_join_round_trip() {
        assert_eq!(eval("'a,b,,c'.split(',').length"), "4");
        assert_eq!(eval("'abc'.split('').reverse().join('')"), "cba");
        assert_eq!(eval("'a b c'.split(' ', 2).join('|')"), "a|b");
    }

    #[test]
    fn test_padding_and_repeat() {
        assert_eq!(eval("'7'.padStart(3, '0')"), "007");
        assert_eq!(eval("'ab'.padEnd(5, 'xy')"), "abxyx");
        assert_eq!(eval("'-'.repeat(3)"), "---");
        assert_eq!(eval("'x'.repeat(-1)"), "threw RangeError: Invalid count value: -1");
        assert_eq!(eval("''.repeat(1e12)"), "");
    }

    #[test]
    fn test_oversized_strings_throw_range_errors() {
        let too_long = "threw RangeError: Invalid string length";
        assert_eq!(eval("'x'.padStart(1e11).length"), too_long);
        assert_eq!(eval("'x'.padEnd(Infinity)"), too_long);
        assert_eq!(eval("'ab'.repeat(2 ** 29)"), too_long);
        assert_eq!(eval("'x'.padEnd(4, '')"), "x");
    }

    #[test]
    fn test_huge_indices_are_out_of_range() {
        assert_eq!(eval("'abc'.charAt(1e300)"), "");
        assert_eq!(eval("'abc'.charAt(Infinity)"), "");
        assert_eq!(eval("'abc'.charCodeAt(1e300)"), "NaN");
        assert_eq!(eval("'abc'.codePointAt(1e300) === undefined"), "true");
        assert_eq!(eval("'abc'.at(1e300) === undefined"), "true");
    }

    #[test]
    fn test_replace_variants() {
        assert_eq!(eval("'a-b-c'.replace('-', '+')"), "a+b-c");
        assert_eq!(eval("'a-b-c'.replaceAll('-', '+')"), "a+b+c");
        assert_eq!(eval("'abc'.replace('b', m => m.toUpperCase())"), "aBc");
    }

    #[test]
    fn test_non_ascii_indices_count_code_units() {
        assert_eq!(eval("'héllo'.length"), "5");
        assert_eq!(eval("'héllo'.slice(1, 3)"), "él");
        assert_eq!(eval("'😀a'.length"), "3");
    }

    #[test]
    fn test_locale_compare_orders_case_insensitively() {
        assert_eq!(eval("['b', 'A', 'a'].sort((x, y) => x.localeCompare(y)).join('')"), "aAb");
    }
}
