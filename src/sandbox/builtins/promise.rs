use std::cell::Cell;
use std::rc::Rc;

use super::{ErrorType, Intrinsics, arg, constructor, define, define_static};
use crate::sandbox::env::Env;
use crate::sandbox::event_loop::{
    Aggregate, AggregateKind, Handler, PromiseState, reject_promise, resolve_promise, subscribe,
};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Callable, CallableKind, Completion, Control, JsValue, Shared, shared};

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    define(
        &intrinsics.promise_proto,
        &[("catch", catch), ("finally", finally), ("then", then)],
    );
    let promise = constructor(
        "Promise",
        |interp, _, _| {
            Err(interp.throw(
                ErrorType::TypeError,
                "Promise constructor cannot be invoked without 'new'",
            ))
        },
        Some(construct),
        &intrinsics.promise_proto,
    );
    define_static(
        &promise,
        &[
            ("all", |interp, _, args| combine(interp, AggregateKind::All, args)),
            ("allSettled", |interp, _, args| combine(interp, AggregateKind::AllSettled, args)),
            ("any", |interp, _, args| combine(interp, AggregateKind::Any, args)),
            ("race", |interp, _, args| combine(interp, AggregateKind::Race, args)),
            ("reject", reject),
            ("resolve", resolve),
        ],
    );
    globals.declare("Promise", Some(promise), true);
}

/// The `resolve`/`reject` pair handed to an executor; only the first call of
/// either has an effect.
fn resolving_functions(promise: &Shared<PromiseState>) -> (JsValue, JsValue) {
    let settled = Rc::new(Cell::new(false));
    let make = |reject: bool| {
        JsValue::Function(Callable::new(CallableKind::Resolver {
            promise: promise.clone(),
            reject,
            settled: settled.clone(),
        }))
    };
    (make(false), make(true))
}

fn construct(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let executor = arg(args, 0);
    if !executor.is_callable() {
        return Err(interp.throw(
            ErrorType::TypeError,
            format!("Promise resolver {} is not a function", executor.to_js_string()),
        ));
    }
    let promise = PromiseState::pending();
    let (resolve, reject) = resolving_functions(&promise);
    match interp.call_function(&executor, JsValue::Undefined, &[resolve, reject.clone()]) {
        Ok(_) => {}
        Err(Control::Throw(error)) => {
            interp.call_function(&reject, JsValue::Undefined, &[error])?;
        }
        Err(Control::Interrupted) => return Err(Control::Interrupted),
    }
    Ok(JsValue::Promise(promise))
}

fn to_promise(interp: &mut Interpreter, value: JsValue) -> Shared<PromiseState> {
    match value {
        JsValue::Promise(promise) => promise,
        other => {
            let promise = PromiseState::pending();
            resolve_promise(interp, &promise, other);
            promise
        }
    }
}

fn resolve(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(JsValue::Promise(to_promise(interp, arg(args, 0))))
}

fn reject(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let promise = PromiseState::pending();
    reject_promise(interp, &promise, arg(args, 0));
    Ok(JsValue::Promise(promise))
}

fn this_promise(interp: &Interpreter, this: &JsValue, method: &str) -> Completion<Shared<PromiseState>> {
    match this {
        JsValue::Promise(promise) => Ok(promise.clone()),
        other => Err(interp.throw(
            ErrorType::TypeError,
            format!(
                "Method Promise.prototype.{method} called on incompatible receiver {}",
                other.to_js_string()
            ),
        )),
    }
}

fn callback(value: JsValue) -> Handler {
    if value.is_callable() {
        Handler::Callback(value)
    } else {
        Handler::Identity
    }
}

fn then(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let promise = this_promise(interp, this, "then")?;
    let target = PromiseState::pending();
    subscribe(
        interp,
        &promise,
        callback(arg(args, 0)),
        callback(arg(args, 1)),
        Some(target.clone()),
    );
    Ok(JsValue::Promise(target))
}

fn catch(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    then(interp, this, &[JsValue::Undefined, arg(args, 0)])
}

fn finally(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let promise = this_promise(interp, this, "finally")?;
    let target = PromiseState::pending();
    let handler = Handler::Finally(arg(args, 0));
    subscribe(interp, &promise, handler.clone(), handler, Some(target.clone()));
    Ok(JsValue::Promise(target))
}

/// `Promise.all`, `allSettled`, `any` and `race`.
fn combine(interp: &mut Interpreter, kind: AggregateKind, args: &[JsValue]) -> Completion<JsValue> {
    let items = interp.iterate(&arg(args, 0))?;
    let target = PromiseState::pending();
    if items.is_empty() {
        match kind {
            AggregateKind::All | AggregateKind::AllSettled => {
                resolve_promise(interp, &target, JsValue::array(Vec::new()));
            }
            AggregateKind::Any => {
                let error = interp.make_error(ErrorType::AggregateError, "All promises were rejected");
                reject_promise(interp, &target, error);
            }
            AggregateKind::Race => {}
        }
        return Ok(JsValue::Promise(target));
    }

    let state = shared(Aggregate {
        kind,
        values: vec![JsValue::Undefined; items.len()],
        remaining: items.len(),
        target: target.clone(),
        done: false,
    });
    for (index, item) in items.into_iter().enumerate() {
        let promise = to_promise(interp, item);
        let handler = Handler::Aggregate {
            state: state.clone(),
            index,
        };
        subscribe(interp, &promise, handler.clone(), handler, None);
    }
    Ok(JsValue::Promise(target))
}

#[cfg(test)]
mod tests {
    use crate::sandbox::interpreter::tests::call;

    fn run(body: &str) -> Result<String, String> {
        call(&format!("async function main() {{ {body} }}"), "main", &[])
    }

    #[test]
    fn test_then_chain() {
        let result = run("return await Promise.resolve(1).then(x => x + 1).then(x => x * 10);");
        assert_eq!(result.as_deref(), Ok("20"));
    }

    #[test]
    fn test_executor_throw_rejects() {
        let result = run(
            "try { await new Promise(() => { throw new RangeError('boom'); }); }
             catch (e) { return e.name + ':' + e.message; }",
        );
        assert_eq!(result.as_deref(), Ok("RangeError:boom"));
    }

    #[test]
    fn test_resolvers_settle_once() {
        let result = run(
            "const p = new Promise((resolve, reject) => { resolve('first'); reject('x'); resolve('y'); });
             return await p;",
        );
        assert_eq!(result.as_deref(), Ok("first"));
    }

    #[test]
    fn test_all_preserves_order() {
        let result = run(
            "const slow = new Promise(r => setTimeout(() => r('a'), 20));
             const values = await Promise.all([slow, 'b', Promise.resolve('c')]);
             return values.join('');",
        );
        assert_eq!(result.as_deref(), Ok("abc"));
    }

    #[test]
    fn test_all_settled_and_any() {
        let result = run(
            "const settled = await Promise.allSettled([Promise.reject(1), 2]);
             const first = await Promise.any([Promise.reject(0), Promise.resolve(7)]);
             return settled.map(s => s.status).join() + ':' + first;",
        );
        assert_eq!(result.as_deref(), Ok("rejected,fulfilled:7"));
    }

    #[test]
    fn test_any_of_rejections_is_aggregate_error() {
        let result = run("return await Promise.any([Promise.reject(1)]);");
        assert_eq!(result, Err("AggregateError: All promises were rejected".to_string()));
    }

    #[test]
    fn test_race_and_finally() {
        let result = run(
            "let cleaned = false;
             const fast = new Promise(r => setTimeout(() => r('fast'), 1));
             const slow = new Promise(r => setTimeout(() => r('slow'), 50));
             const winner = await Promise.race([slow, fast]).finally(() => { cleaned = true; });
             return winner + cleaned;",
        );
        assert_eq!(result.as_deref(), Ok("fasttrue"));
    }

    #[test]
    fn test_catch_recovers() {
        let result = run("return await Promise.reject(new Error('no')).catch(e => e.message + '!');");
        assert_eq!(result.as_deref(), Ok("no!"));
    }
}
