//! `console`, timers and clocks.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::{ErrorType, Intrinsics, arg, define_static, namespace, native};
use crate::sandbox::env::Env;
use crate::sandbox::event_loop::{
    Handler, PromiseState, PromiseStatus, resolve_promise, subscribe,
};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Completion, JsValue, NativeFn, ObjectClass, error_summary};

/// Lines kept per invocation; later output is dropped.
pub const MAX_CONSOLE_LINES: usize = 1_000;

/// Bytes of console output kept per invocation.
pub const MAX_CONSOLE_BYTES: usize = 1 << 20;

const TRUNCATED: &str = "... console output truncated";

/// Containers nested deeper than this print as `[Object]`/`[Array]`.
const INSPECT_DEPTH: usize = 4;

/// Array, Map and Set entries printed before `... N more items`.
const INSPECT_ITEMS: usize = 100;

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    let console = namespace(
        intrinsics,
        &[
            ("debug", log),
            ("error", log),
            ("info", log),
            ("log", log),
            ("warn", log),
        ],
    );
    globals.declare("console", Some(JsValue::Object(console)), true);

    let timers: [(&'static str, NativeFn); 3] = [
        ("setTimeout", set_timeout),
        ("clearTimeout", clear_timeout),
        ("queueMicrotask", queue_microtask),
    ];
    for (name, func) in timers {
        globals.declare(name, Some(native(name, func)), true);
    }

    let date = native("Date", |_, _, _| Ok(epoch_millis().to_string().into()));
    define_static(&date, &[("now", |_, _, _| Ok(epoch_millis().into()))]);
    globals.declare("Date", Some(date), true);

    let performance = namespace(intrinsics, &[("now", |_, _, _| Ok(monotonic_millis().into()))]);
    globals.declare("performance", Some(JsValue::Object(performance)), true);
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_millis() as f64)
}

fn monotonic_millis() -> f64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64() * 1000.0
}

fn log(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    emit(interp, |inspector| {
        for (index, value) in args.iter().enumerate() {
            if index > 0 {
                inspector.push(" ");
            }
            inspector.render(value, true, 0);
        }
    });
    Ok(JsValue::Undefined)
}

/// Records `text` as one console line.
pub fn print_text(interp: &mut Interpreter, text: &str) {
    emit(interp, |inspector| inspector.push(text));
}

/// Appends the line built by `write`, cutting it off once the invocation
/// runs out of lines or bytes. The marker line ends all further output.
fn emit(interp: &mut Interpreter, write: impl FnOnce(&mut Inspector)) {
    let console = &mut interp.console;
    if console.last().is_some_and(|line| line == TRUNCATED) {
        return;
    }
    let used: usize = console.iter().map(String::len).sum();
    if console.len() >= MAX_CONSOLE_LINES || used >= MAX_CONSOLE_BYTES {
        console.push(TRUNCATED.to_string());
        return;
    }
    let mut inspector = Inspector::new(MAX_CONSOLE_BYTES - used);
    write(&mut inspector);
    let overflow = inspector.overflow;
    console.push(inspector.out);
    if overflow {
        console.push(TRUNCATED.to_string());
    }
}

fn set_timeout(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let callback = arg(args, 0);
    if !callback.is_callable() {
        return Err(interp.throw(
            ErrorType::TypeError,
            format!(
                "The \"callback\" argument must be of type function. Received {}",
                callback.to_js_string()
            ),
        ));
    }
    let delay = arg(args, 1).to_number();
    let extra = args.get(2..).unwrap_or_default().to_vec();
    let id = interp.event_loop.set_timeout(callback, delay, extra);
    Ok(JsValue::Number(id as f64))
}

fn clear_timeout(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    if let JsValue::Number(id) = arg(args, 0) {
        interp.event_loop.clear_timeout(id as u64);
    }
    Ok(JsValue::Undefined)
}

fn queue_microtask(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let callback = arg(args, 0);
    if !callback.is_callable() {
        return Err(interp.throw(
            ErrorType::TypeError,
            "The \"callback\" argument must be of type function",
        ));
    }
    let ready = PromiseState::pending();
    resolve_promise(interp, &ready, JsValue::Undefined);
    subscribe(interp, &ready, Handler::Callback(callback), Handler::Identity, None);
    Ok(JsValue::Undefined)
}

/// Renders values the way `console.log` prints them. Top-level strings
/// are printed raw, nested ones quoted. Output stops at `budget` bytes.
struct Inspector {
    seen: Vec<usize>,
    out: String,
    budget: usize,
    overflow: bool,
}

impl Inspector {
    fn new(budget: usize) -> Self {
        Self {
            seen: Vec::new(),
            out: String::new(),
            budget,
            overflow: false,
        }
    }

    fn push(&mut self, text: &str) {
        if self.overflow {
            return;
        }
        let room = self.budget.saturating_sub(self.out.len());
        if text.len() <= room {
            self.out.push_str(text);
            return;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.out.push_str(&text[..cut]);
        self.overflow = true;
    }

    fn render(&mut self, value: &JsValue, top: bool, depth: usize) {
        if self.overflow {
            return;
        }
        match value {
            JsValue::String(s) if top => self.push(s),
            JsValue::String(s) => {
                self.push("'");
                for (index, piece) in s.split('\'').enumerate() {
                    if index > 0 {
                        self.push("\\'");
                    }
                    self.push(piece);
                }
                self.push("'");
            }
            JsValue::Number(n) if *n == 0.0 && n.is_sign_negative() => self.push("-0"),
            JsValue::Undefined | JsValue::Null | JsValue::Bool(_) | JsValue::Number(_) => {
                self.push(&value.to_js_string())
            }
            JsValue::Function(callable) => match callable.name() {
                name if name.is_empty() => self.push("[Function (anonymous)]"),
                name => self.push(&format!("[Function: {name}]")),
            },
            JsValue::Promise(promise) => match &promise.borrow().status {
                PromiseStatus::Pending => self.push("Promise { <pending> }"),
                PromiseStatus::Fulfilled(value) => {
                    self.push("Promise { ");
                    self.nested(value, depth);
                    self.push(" }");
                }
                PromiseStatus::Rejected(reason) => {
                    self.push("Promise { <rejected> ");
                    self.nested(reason, depth);
                    self.push(" }");
                }
            },
            JsValue::Array(_) | JsValue::Object(_) | JsValue::Map(_) | JsValue::Set(_) => {
                self.container(value, depth)
            }
        }
    }

    fn nested(&mut self, value: &JsValue, depth: usize) {
        self.render(value, false, depth + 1)
    }

    fn container(&mut self, value: &JsValue, depth: usize) {
        let id = value.identity().unwrap_or_default();
        if self.seen.contains(&id) {
            return self.push("[Circular]");
        }
        if let JsValue::Object(object) = value {
            let object = object.borrow();
            if object.class == ObjectClass::Error {
                return self.push(&error_summary(&object));
            }
        }
        if depth > INSPECT_DEPTH {
            return self.push(match value {
                JsValue::Array(_) => "[Array]",
                _ => "[Object]",
            });
        }

        self.seen.push(id);
        match value {
            JsValue::Array(items) => {
                let items = items.borrow().clone();
                self.push("[");
                for (index, item) in items.iter().take(INSPECT_ITEMS).enumerate() {
                    self.separator(index);
                    self.nested(item, depth);
                }
                self.close(']', items.len(), INSPECT_ITEMS);
            }
            JsValue::Object(object) => {
                let props = object.borrow().props.ordered();
                self.push("{");
                for (index, (key, item)) in props.iter().enumerate() {
                    self.separator(index);
                    self.push(&property_key(key));
                    self.push(": ");
                    self.nested(item, depth);
                }
                self.close('}', props.len(), usize::MAX);
            }
            JsValue::Map(data) => {
                let entries = data.borrow().entries();
                self.push(&format!("Map({}) {{", entries.len()));
                for (index, (key, item)) in entries.iter().take(INSPECT_ITEMS).enumerate() {
                    self.separator(index);
                    self.nested(key, depth);
                    self.push(" => ");
                    self.nested(item, depth);
                }
                self.close('}', entries.len(), INSPECT_ITEMS);
            }
            JsValue::Set(data) => {
                let entries = data.borrow().entries();
                self.push(&format!("Set({}) {{", entries.len()));
                for (index, (item, _)) in entries.iter().take(INSPECT_ITEMS).enumerate() {
                    self.separator(index);
                    self.nested(item, depth);
                }
                self.close('}', entries.len(), INSPECT_ITEMS);
            }
            _ => {}
        }
        self.seen.pop();
    }

    fn separator(&mut self, index: usize) {
        self.push(if index == 0 { " " } else { ", " });
    }

    /// Closes a container of `len` entries of which at most `shown` were
    /// printed.
    fn close(&mut self, bracket: char, len: usize, shown: usize) {
        if len > shown {
            self.push(&format!(", ... {} more items", len - shown));
        }
        if len > 0 {
            self.push(" ");
        }
        self.push(bracket.encode_utf8(&mut [0; 4]));
    }
}

fn property_key(key: &str) -> String {
    let mut chars = key.chars();
    let identifier = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
    if identifier || key.parse::<u32>().is_ok() {
        key.to_string()
    } else {
        format!("'{}'", key.replace('\'', "\\'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interpreter::tests::{call, interpreter, with_big_stack};
    use crate::sandbox::parser::parse;

    fn logged(body: &str) -> Vec<String> {
        let source = format!("function main() {{ {body} }}");
        with_big_stack(move || {
            let mut interp = interpreter();
            let program = parse(&source).expect("parse");
            let scope = interp.run_program(&program).ok().expect("load");
            let main = scope.lookup("main").ok().expect("main");
            interp.invoke(&main, &[]).ok().expect("invoke");
            interp.take_console()
        })
    }

    #[test]
    fn test_log_formats_like_node() {
        let lines = logged(
            "console.log('hi', 1, [1, 'a'], { k: 'v', 'two words': null });
             console.log(new Map([[1, { x: [] }]]), new Set(['s']));
             console.log(function named() {}, () => 1, new Error('bad'));",
        );
        assert_eq!(
            lines,
            vec![
                "hi 1 [ 1, 'a' ] { k: 'v', 'two words': null }",
                "Map(1) { 1 => { x: [] } } Set(1) { 's' }",
                "[Function: named] [Function (anonymous)] Error: bad",
            ]
        );
    }

    #[test]
    fn test_log_marks_cycles() {
        let lines = logged("const a = [1]; a.push(a); console.log(a);");
        assert_eq!(lines, vec!["[ 1, [Circular] ]"]);
    }

    #[test]
    fn test_console_output_is_capped() {
        let lines = logged("for (let i = 0; i < 1500; i++) console.log(i);");
        assert_eq!(lines.len(), MAX_CONSOLE_LINES + 1);
        assert_eq!(lines[MAX_CONSOLE_LINES], "... console output truncated");
    }

    #[test]
    fn test_console_bytes_are_capped() {
        let lines = logged("const big = 'x'.repeat(3e6); console.log(big); console.log([big]); console.log('after');");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_CONSOLE_BYTES);
        assert_eq!(lines[1], "... console output truncated");

        let lines = logged("console.log('ab'.repeat(300000)); console.log('cd'.repeat(300000));");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len() + lines[1].len(), MAX_CONSOLE_BYTES);
        assert!(lines[1].starts_with("cdcd"));
        assert_eq!(lines[2], "... console output truncated");
    }

    #[test]
    fn test_long_collections_are_abbreviated() {
        let lines = logged(
            "console.log(Array.from({ length: 150 }, (_, i) => i));
             console.log(new Set(Array.from({ length: 101 }, (_, i) => i)));",
        );
        assert!(lines[0].starts_with("[ 0, 1, 2,"));
        assert!(lines[0].ends_with(", 99, ... 50 more items ]"));
        assert!(lines[1].starts_with("Set(101) { 0,"));
        assert!(lines[1].ends_with(", 99, ... 1 more items }"));
    }

    #[test]
    fn test_timers_and_microtasks_order() {
        let result = call(
            "async function main() {
               const order = [];
               setTimeout(() => order.push('timeout'), 0);
               const cancelled = setTimeout(() => order.push('never'), 0);
               clearTimeout(cancelled);
               queueMicrotask(() => order.push('micro'));
               order.push('sync');
               await new Promise(r => setTimeout(r, 5));
               return order.join();
             }",
            "main",
            &[],
        );
        assert_eq!(result.as_deref(), Ok("sync,micro,timeout"));
    }

    #[test]
    fn test_clocks_advance() {
        let result = call(
            "function main() { const t = performance.now(); return Date.now() > 0 && performance.now() >= t; }",
            "main",
            &[],
        );
        assert_eq!(result.as_deref(), Ok("true"));
    }
}
