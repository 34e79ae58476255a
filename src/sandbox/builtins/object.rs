//! `Object`, `Function.prototype`, the error constructors and `JSON`.

use itertools::Itertools;

use super::{ErrorType, Intrinsics, arg, constructor, define, define_static, namespace};
use crate::core::value::format_number;
use crate::sandbox::env::Env;
use crate::sandbox::interpreter::{Interpreter, Key};
use crate::sandbox::value::{
    Callable, CallableKind, Completion, JsObject, JsValue, NativeFn, ObjectClass, error_summary,
    shared,
};

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    define(
        &intrinsics.object_proto,
        &[
            ("hasOwnProperty", has_own_property),
            ("toString", object_to_string),
            ("valueOf", |_, this, _| Ok(this.clone())),
        ],
    );
    let object = constructor("Object", object_call, Some(object_call), &intrinsics.object_proto);
    define_static(
        &object,
        &[
            ("assign", assign),
            ("create", create),
            ("defineProperty", define_property),
            ("entries", entries),
            ("freeze", |_, _, args| Ok(arg(args, 0))),
            ("fromEntries", from_entries),
            ("getPrototypeOf", get_prototype_of),
            ("hasOwn", |interp, _, args| has_own_property(interp, &arg(args, 0), &args[1.min(args.len())..])),
            ("isFrozen", |_, _, _| Ok(false.into())),
            ("keys", keys),
            ("values", values),
        ],
    );
    globals.declare("Object", Some(object), true);

    define(
        &intrinsics.function_proto,
        &[
            ("apply", apply),
            ("bind", bind),
            ("call", call),
            ("toString", |_, this, _| Ok(this.to_js_string().into())),
        ],
    );
    let function = constructor(
        "Function",
        |interp, _, _| {
            Err(interp.throw(
                ErrorType::Error,
                "Code generation from strings disallowed for this context",
            ))
        },
        None,
        &intrinsics.function_proto,
    );
    globals.declare("Function", Some(function), true);

    install_errors(intrinsics, globals);

    let json = namespace(intrinsics, &[("parse", json_parse), ("stringify", json_stringify)]);
    globals.declare("JSON", Some(JsValue::Object(json)), true);
}

macro_rules! error_constructors {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            fn $name(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
                construct_error(interp, ErrorType::$kind, args)
            }
        )*
    };
}

error_constructors! {
    error => Error,
    type_error => TypeError,
    range_error => RangeError,
    reference_error => ReferenceError,
    syntax_error => SyntaxError,
    aggregate_error => AggregateError,
}

fn install_errors(intrinsics: &Intrinsics, globals: &Env) {
    let constructors: [(ErrorType, NativeFn); 6] = [
        (ErrorType::Error, error),
        (ErrorType::TypeError, type_error),
        (ErrorType::RangeError, range_error),
        (ErrorType::ReferenceError, reference_error),
        (ErrorType::SyntaxError, syntax_error),
        (ErrorType::AggregateError, aggregate_error),
    ];
    for (kind, func) in constructors {
        let proto = intrinsics.error_proto(kind);
        {
            let mut proto = proto.borrow_mut();
            proto.props.set("name", kind.name().into());
            proto.props.set("message", JsValue::string(""));
        }
        let value = constructor(kind.name(), func, Some(func), proto);
        globals.declare(kind.name(), Some(value), true);
    }
    define(
        intrinsics.error_proto(ErrorType::Error),
        &[("toString", |_, this, _| {
            Ok(match this {
                JsValue::Object(object) => error_summary(&object.borrow()).into(),
                other => other.to_js_string().into(),
            })
        })],
    );
}

fn construct_error(interp: &mut Interpreter, kind: ErrorType, args: &[JsValue]) -> Completion<JsValue> {
    let (message, options) = match kind {
        ErrorType::AggregateError => (arg(args, 1), arg(args, 2)),
        _ => (arg(args, 0), arg(args, 1)),
    };
    let mut object = JsObject::with_proto(Some(interp.intrinsics.error_proto(kind).clone()));
    object.class = ObjectClass::Error;
    if !matches!(message, JsValue::Undefined) {
        object.props.set("message", message.to_js_string().into());
    }
    if let JsValue::Object(options) = &options {
        if let Some(cause) = options.borrow().props.get("cause") {
            object.props.set("cause", cause.clone());
        }
    }
    if kind == ErrorType::AggregateError {
        let errors = interp.iterate(&arg(args, 0))?;
        object.props.set("errors", JsValue::array(errors));
    }
    Ok(JsValue::Object(shared(object)))
}

fn object_call(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    match arg(args, 0) {
        JsValue::Undefined | JsValue::Null => Ok(JsValue::Object(interp.new_object())),
        value => Ok(value),
    }
}

fn has_own_property(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let key = Key::from_value(&arg(args, 0));
    let found = match this {
        JsValue::Object(object) => object.borrow().props.contains(&key.name()),
        JsValue::Function(callable) => callable.props.borrow().contains(&key.name()),
        JsValue::Array(_) | JsValue::String(_) => {
            interp.own_keys(this).iter().any(|own| **own == *key.name()) || key.name() == "length"
        }
        _ => false,
    };
    Ok(found.into())
}

fn object_to_string(_: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let tag = match this {
        JsValue::Undefined => "Undefined",
        JsValue::Null => "Null",
        JsValue::Array(_) => "Array",
        JsValue::Function(_) => "Function",
        JsValue::String(_) => "String",
        JsValue::Number(_) => "Number",
        JsValue::Bool(_) => "Boolean",
        JsValue::Object(object) if object.borrow().class == ObjectClass::Error => "Error",
        JsValue::Map(_) => "Map",
        JsValue::Set(_) => "Set",
        JsValue::Promise(_) => "Promise",
        JsValue::Object(_) => "Object",
    };
    Ok(format!("[object {tag}]").into())
}

fn require_object(interp: &Interpreter, value: &JsValue) -> Completion<()> {
    if value.is_nullish() {
        return Err(interp.throw(
            ErrorType::TypeError,
            "Cannot convert undefined or null to object",
        ));
    }
    Ok(())
}

fn keys(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let target = arg(args, 0);
    require_object(interp, &target)?;
    let keys = interp.own_keys(&target).into_iter().map(JsValue::String).collect();
    Ok(JsValue::array(keys))
}

fn values(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let target = arg(args, 0);
    require_object(interp, &target)?;
    let mut values = Vec::new();
    for key in interp.own_keys(&target) {
        values.push(interp.get_named(&target, &key)?);
    }
    Ok(JsValue::array(values))
}

fn entries(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let target = arg(args, 0);
    require_object(interp, &target)?;
    let mut entries = Vec::new();
    for key in interp.own_keys(&target) {
        let value = interp.get_named(&target, &key)?;
        entries.push(JsValue::array(vec![JsValue::String(key), value]));
    }
    Ok(JsValue::array(entries))
}

fn assign(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let target = arg(args, 0);
    require_object(interp, &target)?;
    for source in args.iter().skip(1) {
        for key in interp.own_keys(source) {
            let value = interp.get_named(source, &key)?;
            interp.set_named(&target, &key, value)?;
        }
    }
    Ok(target)
}

fn from_entries(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let object = JsValue::Object(interp.new_object());
    for entry in interp.iterate(&arg(args, 0))? {
        let key = Key::from_value(&interp.get_named(&entry, "0")?);
        let value = interp.get_named(&entry, "1")?;
        interp.set_property(&object, &key, value)?;
    }
    Ok(object)
}

fn create(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let proto = match arg(args, 0) {
        JsValue::Object(proto) => Some(proto),
        JsValue::Null => None,
        other => {
            return Err(interp.throw(
                ErrorType::TypeError,
                format!("Object prototype may only be an Object or null: {}", other.to_js_string()),
            ));
        }
    };
    Ok(JsValue::Object(shared(JsObject::with_proto(proto))))
}

fn get_prototype_of(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(interp
        .proto_of(&arg(args, 0))
        .map_or(JsValue::Null, JsValue::Object))
}

fn define_property(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let target = arg(args, 0);
    let key = Key::from_value(&arg(args, 1));
    let descriptor = arg(args, 2);
    if descriptor.identity().is_none() {
        return Err(interp.throw(
            ErrorType::TypeError,
            format!("Property description must be an object: {}", descriptor.to_js_string()),
        ));
    }
    let value = interp.get_named(&descriptor, "value")?;
    interp.set_property(&target, &key, value)?;
    Ok(target)
}

fn this_function(interp: &Interpreter, this: &JsValue, method: &str) -> Completion<()> {
    if this.is_callable() {
        Ok(())
    } else {
        Err(interp.throw(
            ErrorType::TypeError,
            format!("Function.prototype.{method} called on a non-function"),
        ))
    }
}

fn call(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    this_function(interp, this, "call")?;
    let rest = args.get(1..).unwrap_or_default();
    interp.call_function(this, arg(args, 0), rest)
}

fn apply(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    this_function(interp, this, "apply")?;
    let list = match arg(args, 1) {
        JsValue::Undefined | JsValue::Null => Vec::new(),
        other => interp.iterate(&other)?,
    };
    interp.call_function(this, arg(args, 0), &list)
}

fn bind(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    this_function(interp, this, "bind")?;
    let JsValue::Function(target) = this else {
        return Ok(JsValue::Undefined);
    };
    Ok(JsValue::Function(Callable::new(CallableKind::Bound {
        target: target.clone(),
        this: arg(args, 0),
        args: args.get(1..).unwrap_or_default().to_vec(),
    })))
}

fn json_parse(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let text = arg(args, 0).to_js_string();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => Ok(from_json(interp, value)),
        Err(error) => Err(interp.throw(ErrorType::SyntaxError, format!("Unexpected JSON input: {error}"))),
    }
}

fn from_json(interp: &Interpreter, value: serde_json::Value) -> JsValue {
    match value {
        serde_json::Value::Null => JsValue::Null,
        serde_json::Value::Bool(b) => b.into(),
        serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => s.into(),
        serde_json::Value::Array(items) => {
            JsValue::array(items.into_iter().map(|item| from_json(interp, item)).collect())
        }
        serde_json::Value::Object(map) => {
            let object = interp.new_object();
            for (key, value) in map {
                let value = from_json(interp, value);
                object.borrow_mut().props.set(&key, value);
            }
            JsValue::Object(object)
        }
    }
}

fn json_stringify(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let indent = match arg(args, 2) {
        JsValue::Number(n) => " ".repeat(n.clamp(0.0, 10.0) as usize),
        JsValue::String(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let mut writer = JsonWriter {
        interp,
        indent,
        stack: Vec::new(),
        written: 0,
    };
    Ok(writer
        .write(&arg(args, 0), "")?
        .map_or(JsValue::Undefined, JsValue::from))
}

const MAX_JSON_DEPTH: usize = 10_000;

struct JsonWriter<'a> {
    interp: &'a Interpreter,
    indent: String,
    /// Identities of the containers being written, for cycle detection.
    stack: Vec<usize>,
    /// Bytes of output produced so far, nested containers counted once.
    written: usize,
}

impl JsonWriter<'_> {
    fn quote(s: &str) -> String {
        serde_json::Value::from(s).to_string()
    }

    /// `None` for values JSON omits (`undefined`, functions).
    fn write(&mut self, value: &JsValue, current: &str) -> Completion<Option<String>> {
        let text = match value {
            JsValue::Undefined | JsValue::Function(_) => return Ok(None),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) if n.is_finite() => format_number(*n),
            JsValue::Number(_) => "null".to_string(),
            JsValue::String(s) => {
                self.grow(s.len().saturating_add(2))?;
                Self::quote(s)
            }
            JsValue::Array(items) => {
                let items = items.borrow().clone();
                self.enter(value)?;
                let inner = format!("{current}{}", self.indent);
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    self.grow(inner.len() + 2)?;
                    parts.push(self.write(item, &inner)?.unwrap_or_else(|| "null".to_string()));
                }
                self.stack.pop();
                self.wrap('[', ']', parts, current, &inner)
            }
            JsValue::Object(object) => {
                let entries = object.borrow().props.ordered();
                self.enter(value)?;
                let inner = format!("{current}{}", self.indent);
                let separator = if self.indent.is_empty() { ":" } else { ": " };
                let mut parts = Vec::new();
                for (key, item) in &entries {
                    self.grow(inner.len() + key.len() + 4)?;
                    if let Some(text) = self.write(item, &inner)? {
                        parts.push(format!("{}{separator}{text}", Self::quote(key)));
                    }
                }
                self.stack.pop();
                self.wrap('{', '}', parts, current, &inner)
            }
            JsValue::Map(_) | JsValue::Set(_) | JsValue::Promise(_) => "{}".to_string(),
        };
        Ok(Some(text))
    }

    fn grow(&mut self, bytes: usize) -> Completion<()> {
        self.written = self.written.saturating_add(bytes);
        self.interp.check_string_length(self.written)
    }

    fn enter(&mut self, value: &JsValue) -> Completion<()> {
        if self.stack.len() >= MAX_JSON_DEPTH {
            return Err(self
                .interp
                .throw(ErrorType::RangeError, "Maximum call stack size exceeded"));
        }
        let id = value.identity().unwrap_or_default();
        if self.stack.contains(&id) {
            return Err(self.interp.throw(
                ErrorType::TypeError,
                "Converting circular structure to JSON",
            ));
        }
        self.stack.push(id);
        Ok(())
    }

    fn wrap(&self, open: char, close: char, parts: Vec<String>, current: &str, inner: &str) -> String {
        if parts.is_empty() {
            return format!("{open}{close}");
        }
        if self.indent.is_empty() {
            return format!("{open}{}{close}", parts.join(","));
        }
        let body = parts.iter().map(|part| format!("{inner}{part}")).join(",\n");
        format!("{open}\n{body}\n{current}{close}")
    }
}

#[cfg(test)]
mod tests {
    use crate::sandbox::interpreter::tests::call;

    fn eval(expr: &str) -> String {
        call(&format!("function main() {{ return {expr}; }}"), "main", &[])
            .unwrap_or_else(|error| format!("threw {error}"))
    }

    #[test]
    fn test_object_statics() {
        assert_eq!(eval("Object.keys({ b: 1, a: 2, 1: 3 }).join()"), "1,b,a");
        assert_eq!(eval("Object.values({ a: 1, b: 2 }).join()"), "1,2");
        assert_eq!(eval("Object.entries({ a: 1 })[0].join('=')"), "a=1");
        assert_eq!(eval("Object.assign({}, { a: 1 }, { b: 2 }).b"), "2");
        assert_eq!(eval("Object.fromEntries([['x', 5]]).x"), "5");
        assert_eq!(eval("({ a: 1 }).hasOwnProperty('a') && !({}).hasOwnProperty('a')"), "true");
    }

    #[test]
    fn test_function_prototype_methods() {
        assert_eq!(eval("Math.max.apply(null, [1, 5, 3])"), "5");
        assert_eq!(eval("(function (a) { return this.x + a; }).call({ x: 1 }, 2)"), "3");
        assert_eq!(eval("((a, b) => a - b).bind(null, 10)(3)"), "7");
    }

    #[test]
    fn test_error_constructors() {
        assert_eq!(eval("String(new TypeError('bad'))"), "TypeError: bad");
        assert_eq!(eval("new Error().message === '' && Error('x').message === 'x'"), "true");
        assert_eq!(eval("new AggregateError([1, 2], 'many').errors.length"), "2");
    }

    #[test]
    fn test_json_round_trip() {
        assert_eq!(
            eval("JSON.stringify({ a: [1, 'x', null, undefined, NaN], f() {}, u: undefined })"),
            r#"{"a":[1,"x",null,null,null]}"#
        );
        assert_eq!(eval("JSON.stringify([1, [2]], null, 2)"), "[\n  1,\n  [\n    2\n  ]\n]");
        assert_eq!(eval("JSON.parse('{\"b\":1,\"a\":[true]}').a[0]"), "true");
        assert_eq!(eval("Object.keys(JSON.parse('{\"b\":1,\"a\":2}')).join()"), "b,a");
        assert_eq!(eval("typeof JSON.stringify(undefined)"), "undefined");
    }

    #[test]
    fn test_json_rejects_cycles() {
        assert_eq!(
            eval("(() => { const o = {}; o.self = o; return JSON.stringify(o); })()"),
            "threw TypeError: Converting circular structure to JSON"
        );
    }

    #[test]
    fn test_json_depth_is_bounded() {
        assert_eq!(
            eval("(() => { let a = []; for (let i = 0; i < 20000; i++) a = [a]; return JSON.stringify(a); })()"),
            "threw RangeError: Maximum call stack size exceeded"
        );
    }
}
