//! A candidate program loaded into a global environment of its own.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use super::interpreter::{Interpreter, InterpreterLimits};
use super::lexer::SyntaxError;
use super::parser::parse;
use super::value::{Control, JsValue};
use crate::core::value::Value;

/// Results nested deeper than this are rejected instead of converted.
const MAX_RESULT_DEPTH: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{0}")]
    Syntax(#[from] SyntaxError),
    #[error("{0}")]
    Thrown(String),
    #[error("function {0} is not defined")]
    EntryPointMissing(String),
    #[error("evaluation was interrupted")]
    Interrupted,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("{msg}")]
    Thrown { msg: String, console: Vec<String> },
    #[error("invocation was interrupted")]
    Interrupted,
}

#[derive(Debug)]
pub struct Invocation {
    pub value: Value,
    pub console: Vec<String>,
}

pub struct Context {
    entry: JsValue,
    interp: Interpreter,
}

impl Context {
    /// Evaluates `source` in a pristine interpreter and resolves
    /// `entry_point` to a callable.
    pub fn compile(
        source: &str,
        entry_point: &str,
        limits: InterpreterLimits,
        cancel: Arc<AtomicU64>,
        epoch: u64,
    ) -> Result<Self, LoadError> {
        let program = parse(source)?;
        let mut interp = Interpreter::new(limits, cancel);
        interp.arm(epoch);
        let scope = match interp.run_program(&program) {
            Ok(scope) => scope,
            Err(Control::Throw(error)) => return Err(LoadError::Thrown(thrown_message(&interp, &error))),
            Err(Control::Interrupted) => return Err(LoadError::Interrupted),
        };
        match scope.lookup(entry_point) {
            Ok(entry) if entry.is_callable() => Ok(Self { entry, interp }),
            _ => Err(LoadError::EntryPointMissing(entry_point.to_string())),
        }
    }

    /// Calls the entry point with fresh copies of `args`, awaiting a
    /// promise result.
    pub fn invoke(&mut self, args: &[Value], epoch: u64) -> Result<Invocation, InvokeError> {
        self.interp.arm(epoch);
        let args: Vec<JsValue> = args.iter().map(|arg| to_runtime(&self.interp, arg)).collect();
        let result = self.interp.invoke(&self.entry, &args);
        let console = self.interp.take_console();
        match result {
            Ok(value) => match from_runtime(&value) {
                Ok(value) => Ok(Invocation { value, console }),
                Err(msg) => Err(InvokeError::Thrown { msg, console }),
            },
            Err(Control::Throw(error)) => Err(InvokeError::Thrown {
                msg: thrown_message(&self.interp, &error),
                console,
            }),
            Err(Control::Interrupted) => Err(InvokeError::Interrupted),
        }
    }
}

/// `error.message`, falling back to the string form of the thrown value.
fn thrown_message(interp: &Interpreter, error: &JsValue) -> String {
    if matches!(error, JsValue::Object(_)) {
        if let Ok(message) = interp.get_named(error, "message") {
            if message.is_truthy() {
                return message.to_js_string();
            }
        }
    }
    error.to_js_string()
}

pub fn to_runtime(interp: &Interpreter, value: &Value) -> JsValue {
    match value {
        Value::Undefined => JsValue::Undefined,
        Value::Null => JsValue::Null,
        Value::Bool(b) => JsValue::Bool(*b),
        Value::Number(n) => JsValue::Number(*n),
        Value::String(s) => JsValue::from(s.as_str()),
        Value::Array(items) => {
            JsValue::array(items.iter().map(|item| to_runtime(interp, item)).collect())
        }
        Value::Object(entries) => {
            let object = interp.new_object();
            for (key, item) in entries {
                let item = to_runtime(interp, item);
                object.borrow_mut().props.set(key, item);
            }
            JsValue::Object(object)
        }
    }
}

/// Copies a result out of the runtime. Functions become `undefined`,
/// collections and promises empty objects, and cyclic structures an error.
pub fn from_runtime(value: &JsValue) -> Result<Value, String> {
    ResultReader { stack: Vec::new() }.read(value)
}

struct ResultReader {
    stack: Vec<usize>,
}

impl ResultReader {
    fn read(&mut self, value: &JsValue) -> Result<Value, String> {
        let converted = match value {
            JsValue::Undefined | JsValue::Function(_) => Value::Undefined,
            JsValue::Null => Value::Null,
            JsValue::Bool(b) => Value::Bool(*b),
            JsValue::Number(n) => Value::Number(*n),
            JsValue::String(s) => Value::String(s.to_string()),
            JsValue::Map(_) | JsValue::Set(_) | JsValue::Promise(_) => Value::Object(Vec::new()),
            JsValue::Array(items) => {
                self.enter(value)?;
                let items = items.borrow().clone();
                let converted = items
                    .iter()
                    .map(|item| self.read(item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.stack.pop();
                Value::Array(converted)
            }
            JsValue::Object(object) => {
                self.enter(value)?;
                let entries = object.borrow().props.ordered();
                let mut converted = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    converted.push((key.to_string(), self.read(item)?));
                }
                self.stack.pop();
                Value::Object(converted)
            }
        };
        Ok(converted)
    }

    fn enter(&mut self, value: &JsValue) -> Result<(), String> {
        let id = value.identity().unwrap_or_default();
        if self.stack.contains(&id) {
            return Err("Converting circular structure to a result value".to_string());
        }
        if self.stack.len() >= MAX_RESULT_DEPTH {
            return Err("Result value is nested too deeply".to_string());
        }
        self.stack.push(id);
        Ok(())
    }
}
