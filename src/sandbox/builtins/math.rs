//! `Math`, `Number`, `Boolean` and the global numeric helpers.

use super::{ErrorType, Intrinsics, arg, constructor, define, define_static, namespace, set_static};
use crate::core::value::format_number;
use crate::sandbox::env::Env;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Completion, JsValue, NativeFn};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    let math = namespace(
        intrinsics,
        &[
            ("abs", |_, _, args| unary(args, f64::abs)),
            ("acos", |_, _, args| unary(args, f64::acos)),
            ("asin", |_, _, args| unary(args, f64::asin)),
            ("atan", |_, _, args| unary(args, f64::atan)),
            ("atan2", |_, _, args| binary(args, f64::atan2)),
            ("cbrt", |_, _, args| unary(args, f64::cbrt)),
            ("ceil", |_, _, args| unary(args, f64::ceil)),
            ("cos", |_, _, args| unary(args, f64::cos)),
            ("exp", |_, _, args| unary(args, f64::exp)),
            ("floor", |_, _, args| unary(args, f64::floor)),
            ("hypot", hypot),
            ("log", |_, _, args| unary(args, f64::ln)),
            ("log10", |_, _, args| unary(args, f64::log10)),
            ("log2", |_, _, args| unary(args, f64::log2)),
            ("max", max),
            ("min", min),
            ("pow", |_, _, args| binary(args, pow)),
            ("random", |interp, _, _| Ok(JsValue::Number(interp.random()))),
            ("round", |_, _, args| unary(args, round)),
            ("sign", |_, _, args| unary(args, sign)),
            ("sin", |_, _, args| unary(args, f64::sin)),
            ("sqrt", |_, _, args| unary(args, f64::sqrt)),
            ("tan", |_, _, args| unary(args, f64::tan)),
            ("trunc", |_, _, args| unary(args, f64::trunc)),
        ],
    );
    {
        let mut math = math.borrow_mut();
        for (name, value) in [
            ("PI", std::f64::consts::PI),
            ("E", std::f64::consts::E),
            ("LN2", std::f64::consts::LN_2),
            ("LN10", std::f64::consts::LN_10),
            ("LOG2E", std::f64::consts::LOG2_E),
            ("LOG10E", std::f64::consts::LOG10_E),
            ("SQRT2", std::f64::consts::SQRT_2),
            ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
        ] {
            math.props.set(name, JsValue::Number(value));
        }
    }
    globals.declare("Math", Some(JsValue::Object(math)), true);

    define(
        &intrinsics.number_proto,
        &[
            ("toFixed", to_fixed),
            ("toPrecision", to_precision),
            ("toString", number_to_string),
            ("valueOf", |_, this, _| Ok(JsValue::Number(this.to_number()))),
        ],
    );
    let number = constructor("Number", number_call, None, &intrinsics.number_proto);
    define_static(
        &number,
        &[
            ("isFinite", |_, _, args| {
                Ok(matches!(arg(args, 0), JsValue::Number(n) if n.is_finite()).into())
            }),
            ("isInteger", |_, _, args| {
                Ok(matches!(arg(args, 0), JsValue::Number(n) if n.is_finite() && n.fract() == 0.0).into())
            }),
            ("isNaN", |_, _, args| {
                Ok(matches!(arg(args, 0), JsValue::Number(n) if n.is_nan()).into())
            }),
            ("isSafeInteger", |_, _, args| {
                Ok(matches!(arg(args, 0), JsValue::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER).into())
            }),
            ("parseFloat", parse_float),
            ("parseInt", parse_int),
        ],
    );
    for (name, value) in [
        ("MAX_SAFE_INTEGER", MAX_SAFE_INTEGER),
        ("MIN_SAFE_INTEGER", -MAX_SAFE_INTEGER),
        ("MAX_VALUE", f64::MAX),
        ("MIN_VALUE", 5e-324),
        ("EPSILON", f64::EPSILON),
        ("POSITIVE_INFINITY", f64::INFINITY),
        ("NEGATIVE_INFINITY", f64::NEG_INFINITY),
        ("NaN", f64::NAN),
    ] {
        set_static(&number, name, JsValue::Number(value));
    }
    globals.declare("Number", Some(number), true);

    define(
        &intrinsics.boolean_proto,
        &[
            ("toString", |_, this, _| Ok(this.to_js_string().into())),
            ("valueOf", |_, this, _| Ok(this.is_truthy().into())),
        ],
    );
    let boolean = constructor(
        "Boolean",
        |_, _, args| Ok(arg(args, 0).is_truthy().into()),
        None,
        &intrinsics.boolean_proto,
    );
    globals.declare("Boolean", Some(boolean), true);

    let helpers: [(&'static str, NativeFn); 4] = [
        ("parseInt", parse_int),
        ("parseFloat", parse_float),
        ("isNaN", |_, _, args| Ok(arg(args, 0).to_number().is_nan().into())),
        ("isFinite", |_, _, args| Ok(arg(args, 0).to_number().is_finite().into())),
    ];
    for (name, func) in helpers {
        globals.declare(name, Some(super::native(name, func)), true);
    }
}

fn unary(args: &[JsValue], f: fn(f64) -> f64) -> Completion<JsValue> {
    Ok(JsValue::Number(f(arg(args, 0).to_number())))
}

fn binary(args: &[JsValue], f: fn(f64, f64) -> f64) -> Completion<JsValue> {
    Ok(JsValue::Number(f(arg(args, 0).to_number(), arg(args, 1).to_number())))
}

fn pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        f64::NAN
    } else {
        base.powf(exponent)
    }
}

/// Rounds half up, towards positive infinity.
fn round(n: f64) -> f64 {
    if !n.is_finite() || n.fract() == 0.0 {
        return n;
    }
    let floor = n.floor();
    let rounded = if n - floor >= 0.5 { floor + 1.0 } else { floor };
    if rounded == 0.0 && n < 0.0 { -0.0 } else { rounded }
}

fn sign(n: f64) -> f64 {
    if n.is_nan() || n == 0.0 { n } else { n.signum() }
}

fn hypot(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let sum: f64 = args.iter().map(|v| v.to_number().powi(2)).sum();
    Ok(JsValue::Number(sum.sqrt()))
}

fn extreme(args: &[JsValue], start: f64, pick: fn(f64, f64) -> bool) -> JsValue {
    let mut best = start;
    for value in args {
        let n = value.to_number();
        if n.is_nan() {
            return JsValue::Number(f64::NAN);
        }
        // -0 is smaller than +0 here.
        if pick(n, best) || (n == 0.0 && best == 0.0 && pick(1.0 / n, 1.0 / best)) {
            best = n;
        }
    }
    JsValue::Number(best)
}

fn max(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(extreme(args, f64::NEG_INFINITY, |a, b| a > b))
}

fn min(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(extreme(args, f64::INFINITY, |a, b| a < b))
}

fn number_call(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(JsValue::Number(args.first().map_or(0.0, JsValue::to_number)))
}

fn parse_int(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let text = arg(args, 0).to_js_string();
    let radix = arg(args, 1).to_int32();
    Ok(JsValue::Number(parse_int_str(&text, radix)))
}

pub(crate) fn parse_int_str(text: &str, radix: i32) -> f64 {
    let mut s = text.trim_start();
    let negative = s.starts_with('-');
    if s.starts_with(['+', '-']) {
        s = &s[1..];
    }
    let mut radix = radix;
    if radix == 0 || radix == 16 {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: Vec<u32> = s
        .chars()
        .map_while(|c| c.to_digit(radix as u32))
        .collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .iter()
        .fold(0.0, |acc, &d| acc * f64::from(radix) + f64::from(d));
    if negative { -value } else { value }
}

fn parse_float(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(JsValue::Number(parse_float_str(&arg(args, 0).to_js_string())))
}

/// Longest numeric prefix, e.g. `"3.5kg"` is 3.5.
pub(crate) fn parse_float_str(text: &str) -> f64 {
    let s = text.trim_start();
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    if unsigned.starts_with("Infinity") {
        return if s.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    let bytes = s.as_bytes();
    let mut end = usize::from(s.len() != unsigned.len());
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };
    let int_end = digits_from(end);
    let mut saw_digits = int_end > end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        saw_digits |= frac_end > end + 1;
        end = frac_end;
    }
    if !saw_digits {
        return f64::NAN;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(f64::NAN)
}

fn this_number(interp: &Interpreter, this: &JsValue, method: &str) -> Completion<f64> {
    match this {
        JsValue::Number(n) => Ok(*n),
        _ => Err(interp.throw(
            ErrorType::TypeError,
            format!("Number.prototype.{method} requires that 'this' be a Number"),
        )),
    }
}

fn to_fixed(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let n = this_number(interp, this, "toFixed")?;
    let digits = super::to_integer(&arg(args, 0));
    if !(0.0..=100.0).contains(&digits) {
        return Err(interp.throw(
            ErrorType::RangeError,
            "toFixed() digits argument must be between 0 and 100",
        ));
    }
    if !n.is_finite() || n.abs() >= 1e21 {
        return Ok(format_number(n).into());
    }
    let digits = digits as usize;
    // Exact binary ties round away from zero rather than to even.
    let scaled = n.abs() * 10f64.powi(digits as i32);
    let n = if scaled.fract() == 0.5 {
        n.signum() * (scaled.floor() + 1.0) / 10f64.powi(digits as i32)
    } else {
        n
    };
    let n = if n == 0.0 { 0.0 } else { n };
    Ok(format!("{n:.digits$}").into())
}

fn to_precision(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let n = this_number(interp, this, "toPrecision")?;
    if matches!(arg(args, 0), JsValue::Undefined) || !n.is_finite() {
        return Ok(format_number(n).into());
    }
    let precision = super::to_integer(&arg(args, 0));
    if !(1.0..=100.0).contains(&precision) {
        return Err(interp.throw(
            ErrorType::RangeError,
            "toPrecision() argument must be between 1 and 100",
        ));
    }
    let precision = precision as usize;
    let sign = if n < 0.0 { "-" } else { "" };
    let (digits, exponent) = if n == 0.0 {
        ("0".repeat(precision), 0)
    } else {
        significant_digits(n.abs(), precision)
    };

    let text = if exponent < -6 || exponent >= precision as i32 {
        let (lead, rest) = digits.split_at(1);
        let mantissa = if rest.is_empty() { lead.to_string() } else { format!("{lead}.{rest}") };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{exponent_sign}{}", exponent.abs())
    } else if exponent >= 0 {
        let (int, frac) = digits.split_at(exponent as usize + 1);
        if frac.is_empty() { int.to_string() } else { format!("{int}.{frac}") }
    } else {
        format!("0.{}{digits}", "0".repeat((-exponent - 1) as usize))
    };
    Ok(format!("{sign}{text}").into())
}

/// The first `precision` decimal digits of positive finite `x` and the
/// exponent of the leading one. Exact ties round up.
fn significant_digits(x: f64, precision: usize) -> (String, i32) {
    let split = |formatted: String| -> (String, i32) {
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
        let digits = mantissa.chars().filter(char::is_ascii_digit).collect();
        (digits, exponent.parse().unwrap_or(0))
    };
    let (long, exponent) = split(format!("{:.*e}", precision + 25, x));
    let tie = long.as_bytes().get(precision) == Some(&b'5')
        && long.bytes().skip(precision + 1).all(|b| b == b'0');
    if !tie {
        return split(format!("{:.*e}", precision - 1, x));
    }
    let mut digits: Vec<u8> = long.bytes().take(precision).collect();
    for digit in digits.iter_mut().rev() {
        if *digit == b'9' {
            *digit = b'0';
        } else {
            *digit += 1;
            return (String::from_utf8_lossy(&digits).into_owned(), exponent);
        }
    }
    (format!("1{}", "0".repeat(precision - 1)), exponent + 1)
}

fn number_to_string(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let n = this_number(interp, this, "toString")?;
    let radix = match arg(args, 0) {
        JsValue::Undefined => 10,
        other => super::to_integer(&other) as u32,
    };
    if !(2..=36).contains(&radix) {
        return Err(interp.throw(
            ErrorType::RangeError,
            "toString() radix must be between 2 and 36",
        ));
    }
    if radix == 10 || !n.is_finite() {
        return Ok(format_number(n).into());
    }
    Ok(to_radix_string(n, radix).into())
}

fn to_radix_string(n: f64, radix: u32) -> String {
    let mut integer = n.abs().trunc();
    let mut fraction = n.abs().fract();
    let mut digits = Vec::new();
    while integer >= 1.0 {
        let digit = (integer % f64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        integer = (integer / f64::from(radix)).trunc();
    }
    if digits.is_empty() {
        digits.push('0');
    }
    let mut out: String = digits.into_iter().rev().collect();
    if fraction > 0.0 {
        out.push('.');
        for _ in 0..52 {
            fraction *= f64::from(radix);
            let digit = fraction.trunc() as u32;
            out.push(std::char::from_digit(digit, radix).unwrap_or('0'));
            fraction = fraction.fract();
            if fraction == 0.0 {
                break;
            }
        }
    }
    if n < 0.0 { format!("-{out}") } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interpreter::tests::call;

    fn eval(expr: &str) -> String {
        call(&format!("function main() {{ return {expr}; }}"), "main", &[])
            .unwrap_or_else(|error| format!("threw {error}"))
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(eval("Math.max(3, 7, 5)"), "7");
        assert_eq!(eval("Math.min()"), "Infinity");
        assert_eq!(eval("Math.max(1, NaN)"), "NaN");
        assert_eq!(eval("Math.floor(-1.5) + Math.round(2.5) + Math.round(-2.5)"), "-1");
        assert_eq!(eval("Math.abs(-4) * Math.sign(-3)"), "-4");
        assert_eq!(eval("Math.trunc(Math.PI * 100)"), "314");
    }

    #[test]
    fn test_random_is_in_unit_interval() {
        assert_eq!(
            eval("Array.from({ length: 100 }, Math.random).every(x => x >= 0 && x < 1)"),
            "true"
        );
    }

    #[test]
    fn test_parsing() {
        assert_eq!(parse_int_str("  42px", 0), 42.0);
        assert_eq!(parse_int_str("-0x1A", 0), -26.0);
        assert_eq!(parse_int_str("101", 2), 5.0);
        assert!(parse_int_str("px", 10).is_nan());
        assert_eq!(parse_float_str("3.5kg"), 3.5);
        assert_eq!(parse_float_str("-.5e1x"), -5.0);
        assert!(parse_float_str(".").is_nan());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(eval("(2.5).toFixed(0)"), "3");
        assert_eq!(eval("(1.005).toFixed(2)"), "1.00");
        assert_eq!(eval("(255).toString(16)"), "ff");
        assert_eq!(eval("(123.456).toPrecision(4)"), "123.5");
        assert_eq!(eval("(0.000123).toPrecision(2)"), "0.00012");
        assert_eq!(eval("(123456).toPrecision(2)"), "1.2e+5");
        assert_eq!(eval("(2.5).toPrecision(1)"), "3");
        assert_eq!(eval("(99.99).toPrecision(3)"), "100");
        assert_eq!(eval("(0).toPrecision(3)"), "0.00");
        assert_eq!(eval("(-1.5e-7).toPrecision(2)"), "-1.5e-7");
        assert_eq!(eval("(42).toPrecision()"), "42");
        assert_eq!(
            eval("(1).toPrecision(0)"),
            "threw RangeError: toPrecision() argument must be between 1 and 100"
        );
        assert_eq!(eval("(-5).toString(2)"), "-101");
        assert_eq!(eval("Number('12') + Number.MIN_SAFE_INTEGER"), "-9007199254740979");
        assert_eq!(eval("Number.isInteger(5) && !Number.isInteger(5.5)"), "true");
    }
}
