//! `Map` and `Set`, keyed by SameValueZero.

use super::{ErrorType, Intrinsics, arg, constructor, define};
use crate::sandbox::env::Env;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Completion, JsValue, MapData, Shared, shared};

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    define(
        &intrinsics.map_proto,
        &[
            ("clear", |interp, this, _| {
                this_map(interp, this, "clear")?.borrow_mut().clear();
                Ok(JsValue::Undefined)
            }),
            ("delete", |interp, this, args| {
                Ok(this_map(interp, this, "delete")?.borrow_mut().delete(&arg(args, 0)).into())
            }),
            ("entries", |interp, this, _| {
                let data = this_map(interp, this, "entries")?;
                let entries = data.borrow().entries();
                Ok(JsValue::array(
                    entries.into_iter().map(|(k, v)| JsValue::array(vec![k, v])).collect(),
                ))
            }),
            ("forEach", map_for_each),
            ("get", |interp, this, args| {
                Ok(this_map(interp, this, "get")?.borrow().get(&arg(args, 0)).unwrap_or_default())
            }),
            ("has", |interp, this, args| {
                Ok(this_map(interp, this, "has")?.borrow().has(&arg(args, 0)).into())
            }),
            ("keys", |interp, this, _| {
                let data = this_map(interp, this, "keys")?;
                let keys = data.borrow().entries().into_iter().map(|(k, _)| k).collect();
                Ok(JsValue::array(keys))
            }),
            ("set", |interp, this, args| {
                this_map(interp, this, "set")?
                    .borrow_mut()
                    .set(arg(args, 0), arg(args, 1));
                Ok(this.clone())
            }),
            ("values", |interp, this, _| {
                let data = this_map(interp, this, "values")?;
                let values = data.borrow().entries().into_iter().map(|(_, v)| v).collect();
                Ok(JsValue::array(values))
            }),
        ],
    );
    let map = constructor(
        "Map",
        |interp, _, _| Err(interp.throw(ErrorType::TypeError, "Constructor Map requires 'new'")),
        Some(construct_map),
        &intrinsics.map_proto,
    );
    globals.declare("Map", Some(map), true);

    define(
        &intrinsics.set_proto,
        &[
            ("add", |interp, this, args| {
                let value = arg(args, 0);
                this_set(interp, this, "add")?.borrow_mut().set(value.clone(), value);
                Ok(this.clone())
            }),
            ("clear", |interp, this, _| {
                this_set(interp, this, "clear")?.borrow_mut().clear();
                Ok(JsValue::Undefined)
            }),
            ("delete", |interp, this, args| {
                Ok(this_set(interp, this, "delete")?.borrow_mut().delete(&arg(args, 0)).into())
            }),
            ("entries", |interp, this, _| {
                let data = this_set(interp, this, "entries")?;
                let entries = data.borrow().entries();
                Ok(JsValue::array(
                    entries.into_iter().map(|(k, v)| JsValue::array(vec![k, v])).collect(),
                ))
            }),
            ("forEach", set_for_each),
            ("has", |interp, this, args| {
                Ok(this_set(interp, this, "has")?.borrow().has(&arg(args, 0)).into())
            }),
            ("keys", set_values),
            ("values", set_values),
        ],
    );
    let set = constructor(
        "Set",
        |interp, _, _| Err(interp.throw(ErrorType::TypeError, "Constructor Set requires 'new'")),
        Some(construct_set),
        &intrinsics.set_proto,
    );
    globals.declare("Set", Some(set), true);
}

fn this_map(interp: &Interpreter, this: &JsValue, method: &str) -> Completion<Shared<MapData>> {
    match this {
        JsValue::Map(data) => Ok(data.clone()),
        other => Err(interp.throw(
            ErrorType::TypeError,
            format!(
                "Method Map.prototype.{method} called on incompatible receiver {}",
                other.to_js_string()
            ),
        )),
    }
}

fn this_set(interp: &Interpreter, this: &JsValue, method: &str) -> Completion<Shared<MapData>> {
    match this {
        JsValue::Set(data) => Ok(data.clone()),
        other => Err(interp.throw(
            ErrorType::TypeError,
            format!(
                "Method Set.prototype.{method} called on incompatible receiver {}",
                other.to_js_string()
            ),
        )),
    }
}

fn construct_map(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut data = MapData::default();
    let source = arg(args, 0);
    if !source.is_nullish() {
        for entry in interp.iterate(&source)? {
            if entry.identity().is_none() {
                return Err(interp.throw(
                    ErrorType::TypeError,
                    format!("Iterator value {} is not an entry object", entry.to_js_string()),
                ));
            }
            let key = interp.get_named(&entry, "0")?;
            let value = interp.get_named(&entry, "1")?;
            data.set(key, value);
        }
    }
    Ok(JsValue::Map(shared(data)))
}

fn construct_set(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut data = MapData::default();
    let source = arg(args, 0);
    if !source.is_nullish() {
        for value in interp.iterate(&source)? {
            data.set(value.clone(), value);
        }
    }
    Ok(JsValue::Set(shared(data)))
}

fn map_for_each(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let data = this_map(interp, this, "forEach")?;
    let callback = arg(args, 0);
    let entries = data.borrow().entries();
    for (key, value) in entries {
        interp.call_function(&callback, arg(args, 1), &[value, key, this.clone()])?;
    }
    Ok(JsValue::Undefined)
}

fn set_for_each(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let data = this_set(interp, this, "forEach")?;
    let callback = arg(args, 0);
    let entries = data.borrow().entries();
    for (value, _) in entries {
        interp.call_function(&callback, arg(args, 1), &[value.clone(), value, this.clone()])?;
    }
    Ok(JsValue::Undefined)
}

fn set_values(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let data = this_set(interp, this, "values")?;
    let values = data.borrow().entries().into_iter().map(|(value, _)| value).collect();
    Ok(JsValue::array(values))
}

#[cfg(test)]
mod tests {
    use crate::sandbox::interpreter::tests::call;

    fn run(body: &str) -> String {
        call(&format!("function main() {{ {body} }}"), "main", &[])
            .unwrap_or_else(|error| format!("threw {error}"))
    }

    #[test]
    fn test_map_basics() {
        let result = run(
            "const m = new Map([['a', 1]]);
             m.set('b', 2).set('a', 3);
             m.delete('b');
             return [m.size, m.get('a'), m.has('b'), m.get('zz')].join();",
        );
        assert_eq!(result, "1,3,false,");
    }

    #[test]
    fn test_map_keys_use_same_value_zero() {
        let result = run(
            "const m = new Map();
             m.set(NaN, 'nan').set(0, 'zero');
             return m.get(NaN) + m.get(-0);",
        );
        assert_eq!(result, "nanzero");
    }

    #[test]
    fn test_set_dedupes_in_insertion_order() {
        let result = run(
            "const s = new Set([3, 1, 3, 2, 1]);
             s.add(1).add(9);
             return [...s].join() + '|' + s.size;",
        );
        assert_eq!(result, "3,1,2,9|4");
    }

    #[test]
    fn test_for_each_visits_entries() {
        let result = run(
            "const out = [];
             new Map([['x', 1], ['y', 2]]).forEach((v, k) => out.push(k + v));
             new Set(['p']).forEach((v, k) => out.push(v + k));
             return out.join();",
        );
        assert_eq!(result, "x1,y2,pp");
    }

    #[test]
    fn test_requires_new() {
        assert_eq!(run("return Map();"), "threw TypeError: Constructor Map requires 'new'");
    }
}
