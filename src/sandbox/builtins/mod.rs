//! Global objects and prototypes available to candidate code.

pub mod array;
pub mod collections;
pub mod console;
pub mod math;
pub mod object;
pub mod promise;
pub mod string;

use super::env::Env;
use super::value::{Callable, CallableKind, JsObject, JsValue, NativeFn, Shared, shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    AggregateError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 6] = [
        ErrorType::Error,
        ErrorType::TypeError,
        ErrorType::RangeError,
        ErrorType::ReferenceError,
        ErrorType::SyntaxError,
        ErrorType::AggregateError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorType::Error => "Error",
            ErrorType::TypeError => "TypeError",
            ErrorType::RangeError => "RangeError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::SyntaxError => "SyntaxError",
            ErrorType::AggregateError => "AggregateError",
        }
    }
}

/// Prototypes shared by every value of a context.
pub struct Intrinsics {
    pub object_proto: Shared<JsObject>,
    pub function_proto: Shared<JsObject>,
    pub array_proto: Shared<JsObject>,
    pub string_proto: Shared<JsObject>,
    pub number_proto: Shared<JsObject>,
    pub boolean_proto: Shared<JsObject>,
    pub promise_proto: Shared<JsObject>,
    pub map_proto: Shared<JsObject>,
    pub set_proto: Shared<JsObject>,
    error_protos: Vec<Shared<JsObject>>,
}

impl Intrinsics {
    fn new() -> Self {
        let object_proto = shared(JsObject::with_proto(None));
        let derived = || shared(JsObject::with_proto(Some(object_proto.clone())));
        let error_base = derived();
        let error_protos = ErrorType::ALL
            .iter()
            .map(|kind| match kind {
                ErrorType::Error => error_base.clone(),
                _ => shared(JsObject::with_proto(Some(error_base.clone()))),
            })
            .collect();
        Self {
            function_proto: derived(),
            array_proto: derived(),
            string_proto: derived(),
            number_proto: derived(),
            boolean_proto: derived(),
            promise_proto: derived(),
            map_proto: derived(),
            set_proto: derived(),
            error_protos,
            object_proto,
        }
    }

    pub fn error_proto(&self, kind: ErrorType) -> &Shared<JsObject> {
        // `error_protos` follows `ErrorType::ALL`.
        &self.error_protos[kind as usize]
    }

    fn all(&self) -> impl Iterator<Item = &Shared<JsObject>> {
        [
            &self.object_proto,
            &self.function_proto,
            &self.array_proto,
            &self.string_proto,
            &self.number_proto,
            &self.boolean_proto,
            &self.promise_proto,
            &self.map_proto,
            &self.set_proto,
        ]
        .into_iter()
        .chain(self.error_protos.iter())
    }

    /// Empties every prototype, breaking the prototype/constructor cycles.
    pub fn clear(&self) {
        for proto in self.all() {
            proto.borrow_mut().props = Default::default();
        }
    }
}

/// Builds the intrinsics and declares the global bindings in `globals`.
pub fn install(globals: &Env) -> Intrinsics {
    let intrinsics = Intrinsics::new();
    object::install(&intrinsics, globals);
    array::install(&intrinsics, globals);
    string::install(&intrinsics, globals);
    math::install(&intrinsics, globals);
    collections::install(&intrinsics, globals);
    promise::install(&intrinsics, globals);
    console::install(&intrinsics, globals);
    globals.declare("undefined", Some(JsValue::Undefined), false);
    globals.declare("NaN", Some(JsValue::Number(f64::NAN)), false);
    globals.declare("Infinity", Some(JsValue::Number(f64::INFINITY)), false);
    intrinsics
}

pub(crate) fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or_default()
}

pub(crate) fn native(name: &'static str, func: NativeFn) -> JsValue {
    JsValue::Function(Callable::new(CallableKind::Native {
        name,
        func,
        construct: None,
    }))
}

/// A global constructor whose `prototype` is `proto`.
pub(crate) fn constructor(
    name: &'static str,
    func: NativeFn,
    construct: Option<NativeFn>,
    proto: &Shared<JsObject>,
) -> JsValue {
    let callable = Callable::new(CallableKind::Native {
        name,
        func,
        construct,
    });
    callable
        .props
        .borrow_mut()
        .set("prototype", JsValue::Object(proto.clone()));
    let value = JsValue::Function(callable);
    proto.borrow_mut().props.set("constructor", value.clone());
    value
}

pub(crate) fn define(target: &Shared<JsObject>, methods: &[(&'static str, NativeFn)]) {
    let mut target = target.borrow_mut();
    for (name, func) in methods {
        target.props.set(name, native(name, *func));
    }
}

/// Static methods on a constructor function.
pub(crate) fn define_static(target: &JsValue, methods: &[(&'static str, NativeFn)]) {
    if let JsValue::Function(callable) = target {
        let mut props = callable.props.borrow_mut();
        for (name, func) in methods {
            props.set(name, native(name, *func));
        }
    }
}

pub(crate) fn set_static(target: &JsValue, name: &str, value: JsValue) {
    if let JsValue::Function(callable) = target {
        callable.props.borrow_mut().set(name, value);
    }
}

/// A plain namespace object such as `Math` or `JSON`.
pub(crate) fn namespace(
    intrinsics: &Intrinsics,
    methods: &[(&'static str, NativeFn)],
) -> Shared<JsObject> {
    let object = shared(JsObject::with_proto(Some(intrinsics.object_proto.clone())));
    define(&object, methods);
    object
}

/// Integer conversion used by index arguments: `NaN` becomes 0.
pub(crate) fn to_integer(value: &JsValue) -> f64 {
    let n = value.to_number();
    if n.is_nan() { 0.0 } else { n.trunc() }
}

/// Resolves a possibly negative relative index against `len`, clamped to
/// `[0, len]`. `undefined` yields `default`.
pub(crate) fn relative_index(value: &JsValue, len: usize, default: usize) -> usize {
    if matches!(value, JsValue::Undefined) {
        return default;
    }
    let n = to_integer(value);
    let len_f = len as f64;
    let resolved = if n < 0.0 { (len_f + n).max(0.0) } else { n.min(len_f) };
    resolved as usize
}
