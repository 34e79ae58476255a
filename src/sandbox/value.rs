//! Runtime values of the candidate dialect.
//!
//! Heap values are shared through `Rc<RefCell<_>>`, which pins an
//! interpreter and everything it allocates to a single thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::ast::FunctionDef;
use super::env::Env;
use super::event_loop::PromiseState;
use super::interpreter::Interpreter;
use crate::core::value::format_number;

pub type Shared<T> = Rc<RefCell<T>>;

/// Longest string a candidate may build, in UTF-8 bytes.
pub const MAX_STRING_LENGTH: usize = (1 << 29) - 24;

/// A string would grow past its length limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringTooLong;

/// Appends `piece` unless `out` would grow past `max` bytes.
pub fn push_within(out: &mut String, piece: &str, max: usize) -> Result<(), StringTooLong> {
    if out.len().saturating_add(piece.len()) > max {
        return Err(StringTooLong);
    }
    out.push_str(piece);
    Ok(())
}

pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Abrupt completion that unwinds the interpreter.
pub enum Control {
    /// A catchable exception.
    Throw(JsValue),
    /// The host cancelled the current invocation. Never catchable.
    Interrupted,
}

pub type Completion<T> = Result<T, Control>;

pub type NativeFn = fn(&mut Interpreter, &JsValue, &[JsValue]) -> Completion<JsValue>;

#[derive(Clone, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Shared<Vec<JsValue>>),
    Object(Shared<JsObject>),
    Function(Rc<Callable>),
    Promise(Shared<PromiseState>),
    Map(Shared<MapData>),
    Set(Shared<MapData>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Plain,
    Error,
}

pub struct JsObject {
    pub props: PropertyMap,
    pub proto: Option<Shared<JsObject>>,
    pub class: ObjectClass,
}

impl JsObject {
    pub fn with_proto(proto: Option<Shared<JsObject>>) -> Self {
        Self {
            props: PropertyMap::default(),
            proto,
            class: ObjectClass::Plain,
        }
    }

    /// Property lookup along the prototype chain.
    pub fn get(&self, key: &str) -> Option<JsValue> {
        if let Some(value) = self.props.get(key) {
            return Some(value.clone());
        }
        let mut proto = self.proto.clone();
        while let Some(current) = proto {
            let current = current.borrow();
            if let Some(value) = current.props.get(key) {
                return Some(value.clone());
            }
            proto = current.proto.clone();
        }
        None
    }

    pub fn has_in_chain(&self, target: &Shared<JsObject>) -> bool {
        let mut proto = self.proto.clone();
        while let Some(current) = proto {
            if Rc::ptr_eq(&current, target) {
                return true;
            }
            proto = current.borrow().proto.clone();
        }
        false
    }
}

/// String-keyed properties in enumeration order: integer-like keys ascending,
/// then the rest in insertion order.
#[derive(Clone, Default)]
pub struct PropertyMap {
    entries: Vec<(Rc<str>, JsValue)>,
    index: HashMap<Rc<str>, usize>,
}

impl PropertyMap {
    pub fn get(&self, key: &str) -> Option<&JsValue> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: JsValue) {
        match self.index.get(key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                let key: Rc<str> = Rc::from(key);
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(position) = self.index.remove(key) else {
            return false;
        };
        self.entries.remove(position);
        for (_, slot) in self.index.iter_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        self.ordered().into_iter().map(|(key, _)| key).collect()
    }

    pub fn ordered(&self) -> Vec<(Rc<str>, JsValue)> {
        let (mut indices, named): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .cloned()
            .partition(|(key, _)| array_index(key).is_some());
        indices.sort_by_key(|(key, _)| array_index(key));
        indices.extend(named);
        indices
    }
}

/// Canonical array index for a property key, e.g. `"3"` but not `"03"`.
pub fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

pub struct Callable {
    pub kind: CallableKind,
    pub props: RefCell<PropertyMap>,
}

pub enum CallableKind {
    Script {
        def: Rc<FunctionDef>,
        env: Env,
    },
    Native {
        name: &'static str,
        func: NativeFn,
        construct: Option<NativeFn>,
    },
    /// `resolve`/`reject` handed to a promise executor.
    Resolver {
        promise: Shared<PromiseState>,
        reject: bool,
        settled: Rc<Cell<bool>>,
    },
    Bound {
        target: Rc<Callable>,
        this: JsValue,
        args: Vec<JsValue>,
    },
}

impl Callable {
    pub fn new(kind: CallableKind) -> Rc<Self> {
        Rc::new(Self {
            kind,
            props: RefCell::new(PropertyMap::default()),
        })
    }

    pub fn name(&self) -> String {
        match &self.kind {
            CallableKind::Script { def, .. } => def.name.clone().unwrap_or_default(),
            CallableKind::Native { name, .. } => name.to_string(),
            CallableKind::Resolver { .. } => String::new(),
            CallableKind::Bound { target, .. } => format!("bound {}", target.name()),
        }
    }
}

/// Hashable identity used by `Map` and `Set` (SameValueZero).
#[derive(Clone, PartialEq, Eq, Hash)]
enum MapKey {
    Undefined,
    Null,
    Bool(bool),
    Number(u64),
    String(Rc<str>),
    Ref(usize),
}

impl From<&JsValue> for MapKey {
    fn from(value: &JsValue) -> Self {
        match value {
            JsValue::Undefined => MapKey::Undefined,
            JsValue::Null => MapKey::Null,
            JsValue::Bool(b) => MapKey::Bool(*b),
            JsValue::Number(n) if n.is_nan() => MapKey::Number(f64::NAN.to_bits()),
            JsValue::Number(n) if *n == 0.0 => MapKey::Number(0f64.to_bits()),
            JsValue::Number(n) => MapKey::Number(n.to_bits()),
            JsValue::String(s) => MapKey::String(s.clone()),
            other => MapKey::Ref(other.identity().unwrap_or_default()),
        }
    }
}

/// Insertion-ordered storage behind `Map` and `Set`.
#[derive(Default)]
pub struct MapData {
    entries: Vec<Option<(JsValue, JsValue)>>,
    index: HashMap<MapKey, usize>,
}

impl MapData {
    pub fn get(&self, key: &JsValue) -> Option<JsValue> {
        let slot = *self.index.get(&MapKey::from(key))?;
        self.entries[slot].as_ref().map(|(_, value)| value.clone())
    }

    pub fn has(&self, key: &JsValue) -> bool {
        self.index.contains_key(&MapKey::from(key))
    }

    pub fn set(&mut self, key: JsValue, value: JsValue) {
        // -0 is normalized to +0 on insertion.
        let key = match key {
            JsValue::Number(n) if n == 0.0 => JsValue::Number(0.0),
            other => other,
        };
        let map_key = MapKey::from(&key);
        match self.index.get(&map_key) {
            Some(&slot) => self.entries[slot] = Some((key, value)),
            None => {
                self.index.insert(map_key, self.entries.len());
                self.entries.push(Some((key, value)));
            }
        }
    }

    pub fn delete(&mut self, key: &JsValue) -> bool {
        match self.index.remove(&MapKey::from(key)) {
            Some(slot) => {
                self.entries[slot] = None;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Snapshot of live entries in insertion order.
    pub fn entries(&self) -> Vec<(JsValue, JsValue)> {
        self.entries.iter().flatten().cloned().collect()
    }
}

impl JsValue {
    pub fn string(s: &str) -> Self {
        JsValue::String(Rc::from(s))
    }

    pub fn array(items: Vec<JsValue>) -> Self {
        JsValue::Array(shared(items))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, JsValue::Function(_))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Function(_) => "function",
            JsValue::Null
            | JsValue::Array(_)
            | JsValue::Object(_)
            | JsValue::Promise(_)
            | JsValue::Map(_)
            | JsValue::Set(_) => "object",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Heap identity, `None` for primitives.
    pub fn identity(&self) -> Option<usize> {
        let address = match self {
            JsValue::Array(rc) => Rc::as_ptr(rc) as *const u8 as usize,
            JsValue::Object(rc) => Rc::as_ptr(rc) as *const u8 as usize,
            JsValue::Function(rc) => Rc::as_ptr(rc) as *const u8 as usize,
            JsValue::Promise(rc) => Rc::as_ptr(rc) as *const u8 as usize,
            JsValue::Map(rc) | JsValue::Set(rc) => Rc::as_ptr(rc) as *const u8 as usize,
            _ => return None,
        };
        Some(address)
    }

    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => f64::from(u8::from(*b)),
            JsValue::Number(n) => *n,
            JsValue::String(s) => string_to_number(s),
            JsValue::Array(_) => string_to_number(&self.to_js_string()),
            _ => f64::NAN,
        }
    }

    /// `ToString` for every value. Arrays join their elements, errors render
    /// as `Name: message`. Output past [`MAX_STRING_LENGTH`] is cut off.
    pub fn to_js_string(&self) -> String {
        let mut out = String::new();
        // An overflow leaves the prefix written so far.
        let _ = self.write_js_string(&mut out, MAX_STRING_LENGTH, &mut Vec::new());
        out
    }

    /// String conversion that fails rather than exceed `max` bytes.
    pub fn to_js_string_within(&self, max: usize) -> Result<String, StringTooLong> {
        let mut out = String::new();
        self.write_js_string(&mut out, max, &mut Vec::new())?;
        Ok(out)
    }

    fn write_js_string(
        &self,
        out: &mut String,
        max: usize,
        seen: &mut Vec<usize>,
    ) -> Result<(), StringTooLong> {
        match self {
            JsValue::String(s) => push_within(out, s, max),
            JsValue::Array(items) => {
                let id = self.identity().unwrap_or_default();
                if seen.contains(&id) {
                    return Ok(());
                }
                seen.push(id);
                let mut result = Ok(());
                for (index, item) in items.borrow().iter().enumerate() {
                    if index > 0 {
                        result = push_within(out, ",", max);
                    }
                    if result.is_ok() && !item.is_nullish() {
                        result = item.write_js_string(out, max, seen);
                    }
                    if result.is_err() {
                        break;
                    }
                }
                seen.pop();
                result
            }
            scalar => push_within(out, &scalar.scalar_string(), max),
        }
    }

    fn scalar_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) => format_number(*n),
            JsValue::String(s) => s.to_string(),
            JsValue::Array(_) => String::new(),
            JsValue::Object(object) => {
                let object = object.borrow();
                match object.class {
                    ObjectClass::Error => error_summary(&object),
                    ObjectClass::Plain => "[object Object]".to_string(),
                }
            }
            JsValue::Function(callable) => {
                format!("function {}() {{ [native code] }}", callable.name())
            }
            JsValue::Promise(_) => "[object Promise]".to_string(),
            JsValue::Map(_) => "[object Map]".to_string(),
            JsValue::Set(_) => "[object Set]".to_string(),
        }
    }

    pub fn to_int32(&self) -> i32 {
        to_int32(self.to_number())
    }

    pub fn to_uint32(&self) -> u32 {
        to_int32(self.to_number()) as u32
    }
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

/// Renders an error object as `Name: message`, or just the name when the
/// message is empty.
pub fn error_summary(object: &JsObject) -> String {
    let name = object
        .get("name")
        .map(|n| n.to_js_string())
        .unwrap_or_else(|| "Error".to_string());
    let message = object
        .get("message")
        .map(|m| m.to_js_string())
        .unwrap_or_default();
    if message.is_empty() {
        name
    } else {
        format!("{name}: {message}")
    }
}

pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let radix = [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0O", 8)]
        .into_iter()
        .find(|(prefix, _)| trimmed.starts_with(prefix));
    if let Some((prefix, radix)) = radix {
        return u64::from_str_radix(&trimmed[prefix.len()..], radix)
            .map_or(f64::NAN, |n| n as f64);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        // Rust accepts spellings like "inf" and "NaN" that the dialect does not.
        _ if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => {
            f64::NAN
        }
        _ => trimmed.parse().unwrap_or(f64::NAN),
    }
}

pub fn strict_equals(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
        (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
        (JsValue::Number(a), JsValue::Number(b)) => a == b,
        (JsValue::String(a), JsValue::String(b)) => a == b,
        _ => match (a.identity(), b.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// `==` with the usual coercions between primitives.
pub fn loose_equals(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Undefined | JsValue::Null, JsValue::Undefined | JsValue::Null) => true,
        (JsValue::Undefined | JsValue::Null, _) | (_, JsValue::Undefined | JsValue::Null) => {
            false
        }
        (JsValue::Number(_), JsValue::String(_)) | (JsValue::String(_), JsValue::Number(_)) => {
            a.to_number() == b.to_number()
        }
        (JsValue::Bool(_), _) => loose_equals(&JsValue::Number(a.to_number()), b),
        (_, JsValue::Bool(_)) => loose_equals(a, &JsValue::Number(b.to_number())),
        (JsValue::Number(_) | JsValue::String(_), other) if other.identity().is_some() => {
            loose_equals(a, &JsValue::string(&other.to_js_string()))
        }
        (other, JsValue::Number(_) | JsValue::String(_)) if other.identity().is_some() => {
            loose_equals(&JsValue::string(&other.to_js_string()), b)
        }
        _ => strict_equals(a, b),
    }
}

pub fn same_value_zero(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Number(x), JsValue::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => strict_equals(a, b),
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<usize> for JsValue {
    fn from(n: usize) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::string(s)
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(Rc::from(s))
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::String(s) => write!(f, "{s:?}"),
            JsValue::Function(callable) => write!(f, "[Function: {}]", callable.name()),
            other => f.write_str(&other.to_js_string()),
        }
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Throw(value) => write!(f, "Throw({value:?})"),
            Control::Interrupted => f.write_str("Interrupted"),
        }
    }
}
