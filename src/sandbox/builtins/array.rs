//! `Array` and its prototype.
//!
//! Callbacks may mutate the receiver, so element access re-borrows the
//! backing vector on every step instead of holding a borrow across calls.

use std::cmp::Ordering;

use super::{
    ErrorType, Intrinsics, arg, constructor, define, define_static, relative_index, to_integer,
};
use crate::sandbox::env::Env;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Completion, JsValue, Shared, same_value_zero, strict_equals};

pub fn install(intrinsics: &Intrinsics, globals: &Env) {
    define(
        &intrinsics.array_proto,
        &[
            ("at", at),
            ("concat", concat),
            ("entries", entries),
            ("every", every),
            ("fill", fill),
            ("filter", filter),
            ("find", find),
            ("findIndex", find_index),
            ("findLast", find_last),
            ("findLastIndex", find_last_index),
            ("flat", flat),
            ("flatMap", flat_map),
            ("forEach", for_each),
            ("includes", includes),
            ("indexOf", index_of),
            ("join", join),
            ("keys", keys),
            ("lastIndexOf", last_index_of),
            ("map", map),
            ("pop", pop),
            ("push", push),
            ("reduce", reduce),
            ("reduceRight", reduce_right),
            ("reverse", reverse),
            ("shift", shift),
            ("slice", slice),
            ("some", some),
            ("sort", sort),
            ("splice", splice),
            ("toString", to_string),
            ("unshift", unshift),
            ("values", values),
        ],
    );
    let array = constructor("Array", array_call, Some(array_call), &intrinsics.array_proto);
    define_static(&array, &[("from", from), ("isArray", is_array), ("of", of)]);
    globals.declare("Array", Some(array), true);
}

fn this_array(
    interp: &Interpreter,
    this: &JsValue,
    method: &str,
) -> Completion<Shared<Vec<JsValue>>> {
    match this {
        JsValue::Array(items) => Ok(items.clone()),
        _ => Err(interp.throw(
            ErrorType::TypeError,
            format!("Array.prototype.{method} called on a non-array"),
        )),
    }
}

fn element(items: &Shared<Vec<JsValue>>, index: usize) -> Option<JsValue> {
    items.borrow().get(index).cloned()
}

fn callback(interp: &Interpreter, args: &[JsValue]) -> Completion<JsValue> {
    let callback = arg(args, 0);
    if callback.is_callable() {
        Ok(callback)
    } else {
        Err(interp.throw(
            ErrorType::TypeError,
            format!("{} is not a function", callback.to_js_string()),
        ))
    }
}

/// Calls `f(element, index, array)` for each index present when the call is made.
fn visit(
    interp: &mut Interpreter,
    this: &JsValue,
    args: &[JsValue],
    method: &str,
    mut step: impl FnMut(usize, JsValue, JsValue) -> Option<Completion<JsValue>>,
) -> Completion<Option<JsValue>> {
    let items = this_array(interp, this, method)?;
    let f = callback(interp, args)?;
    let this_arg = arg(args, 1);
    let len = items.borrow().len();
    for index in 0..len {
        let Some(item) = element(&items, index) else {
            break;
        };
        let result = interp.call_function(
            &f,
            this_arg.clone(),
            &[item.clone(), index.into(), this.clone()],
        )?;
        if let Some(done) = step(index, item, result) {
            return done.map(Some);
        }
    }
    Ok(None)
}

fn array_call(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    if let [JsValue::Number(n)] = args {
        if n.fract() != 0.0 || *n < 0.0 || *n >= 4_294_967_296.0 {
            return Err(interp.throw(ErrorType::RangeError, "Invalid array length"));
        }
        interp.check_array_length(*n as usize)?;
        return Ok(JsValue::array(vec![JsValue::Undefined; *n as usize]));
    }
    Ok(JsValue::array(args.to_vec()))
}

fn is_array(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(matches!(arg(args, 0), JsValue::Array(_)).into())
}

fn of(_: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    Ok(JsValue::array(args.to_vec()))
}

/// `Array.from` over iterables and `{ length }` array-likes.
fn from(interp: &mut Interpreter, _: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let source = arg(args, 0);
    let items = match &source {
        JsValue::Object(_) => {
            let len = to_integer(&interp.get_named(&source, "length")?).max(0.0) as usize;
            interp.check_array_length(len)?;
            let mut items = Vec::with_capacity(len);
            for index in 0..len {
                items.push(interp.get_named(&source, &index.to_string())?);
            }
            items
        }
        other => interp.iterate(other)?,
    };
    let map_fn = arg(args, 1);
    if matches!(map_fn, JsValue::Undefined) {
        return Ok(JsValue::array(items));
    }
    let mut mapped = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        mapped.push(interp.call_function(&map_fn, JsValue::Undefined, &[item, index.into()])?);
    }
    Ok(JsValue::array(mapped))
}

fn push(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "push")?;
    let len = items.borrow().len() + args.len();
    interp.check_array_length(len)?;
    items.borrow_mut().extend_from_slice(args);
    Ok(len.into())
}

fn pop(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "pop")?;
    let popped = items.borrow_mut().pop();
    Ok(popped.unwrap_or_default())
}

fn shift(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "shift")?;
    let mut items = items.borrow_mut();
    if items.is_empty() {
        return Ok(JsValue::Undefined);
    }
    Ok(items.remove(0))
}

fn unshift(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "unshift")?;
    let len = items.borrow().len() + args.len();
    interp.check_array_length(len)?;
    items.borrow_mut().splice(0..0, args.iter().cloned());
    Ok(len.into())
}

fn slice(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "slice")?;
    let items = items.borrow();
    let start = relative_index(&arg(args, 0), items.len(), 0);
    let end = relative_index(&arg(args, 1), items.len(), items.len());
    let sliced = items.get(start..end.max(start)).unwrap_or_default().to_vec();
    Ok(JsValue::array(sliced))
}

fn splice(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "splice")?;
    let len = items.borrow().len();
    let start = relative_index(&arg(args, 0), len, 0);
    let delete_count = match args.len() {
        0 => 0,
        1 => len - start,
        _ => to_integer(&args[1]).clamp(0.0, (len - start) as f64) as usize,
    };
    let inserted = args.get(2..).unwrap_or_default();
    interp.check_array_length(len - delete_count + inserted.len())?;
    let removed: Vec<JsValue> = items
        .borrow_mut()
        .splice(start..start + delete_count, inserted.iter().cloned())
        .collect();
    Ok(JsValue::array(removed))
}

fn concat(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut out = this_array(interp, this, "concat")?.borrow().clone();
    for value in args {
        match value {
            JsValue::Array(other) => out.extend(other.borrow().iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    interp.check_array_length(out.len())?;
    Ok(JsValue::array(out))
}

fn join_values(interp: &Interpreter, items: &[JsValue], separator: &str) -> Completion<String> {
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            interp.push_str_checked(&mut out, separator)?;
        }
        if !item.is_nullish() {
            let text = interp.to_string_checked(item)?;
            interp.push_str_checked(&mut out, &text)?;
        }
    }
    Ok(out)
}

fn join(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "join")?.borrow().clone();
    let separator = match arg(args, 0) {
        JsValue::Undefined => ",".to_string(),
        other => other.to_js_string(),
    };
    Ok(join_values(interp, &items, &separator)?.into())
}

fn to_string(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    Ok(interp.to_string_checked(this)?.into())
}

fn reverse(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    this_array(interp, this, "reverse")?.borrow_mut().reverse();
    Ok(this.clone())
}

fn fill(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "fill")?;
    let mut items = items.borrow_mut();
    let len = items.len();
    let start = relative_index(&arg(args, 1), len, 0);
    let end = relative_index(&arg(args, 2), len, len);
    for slot in items.iter_mut().take(end).skip(start) {
        *slot = arg(args, 0);
    }
    Ok(this.clone())
}

fn at(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "at")?;
    let items = items.borrow();
    let n = to_integer(&arg(args, 0));
    let index = if n < 0.0 { items.len() as f64 + n } else { n };
    if index < 0.0 {
        return Ok(JsValue::Undefined);
    }
    Ok(items.get(index as usize).cloned().unwrap_or_default())
}

fn index_of(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "indexOf")?;
    let items = items.borrow();
    let target = arg(args, 0);
    let from = relative_index(&arg(args, 1), items.len(), 0);
    let found = items
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, item)| strict_equals(item, &target));
    Ok(JsValue::Number(found.map_or(-1.0, |(i, _)| i as f64)))
}

fn last_index_of(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "lastIndexOf")?;
    let items = items.borrow();
    let target = arg(args, 0);
    let found = items
        .iter()
        .enumerate()
        .rev()
        .find(|(_, item)| strict_equals(item, &target));
    Ok(JsValue::Number(found.map_or(-1.0, |(i, _)| i as f64)))
}

fn includes(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "includes")?;
    let target = arg(args, 0);
    let found = items.borrow().iter().any(|item| same_value_zero(item, &target));
    Ok(found.into())
}

fn keys(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let len = this_array(interp, this, "keys")?.borrow().len();
    Ok(JsValue::array((0..len).map(JsValue::from).collect()))
}

fn values(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "values")?.borrow().clone();
    Ok(JsValue::array(items))
}

fn entries(interp: &mut Interpreter, this: &JsValue, _: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "entries")?.borrow().clone();
    let pairs = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| JsValue::array(vec![index.into(), item]))
        .collect();
    Ok(JsValue::array(pairs))
}

fn for_each(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    visit(interp, this, args, "forEach", |_, _, _| None)?;
    Ok(JsValue::Undefined)
}

fn map(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut out = Vec::new();
    visit(interp, this, args, "map", |_, _, result| {
        out.push(result);
        None
    })?;
    Ok(JsValue::array(out))
}

fn filter(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mut out = Vec::new();
    visit(interp, this, args, "filter", |_, item, result| {
        if result.is_truthy() {
            out.push(item);
        }
        None
    })?;
    Ok(JsValue::array(out))
}

fn find(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let found = visit(interp, this, args, "find", |_, item, result| {
        result.is_truthy().then_some(Ok(item))
    })?;
    Ok(found.unwrap_or_default())
}

fn find_index(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let found = visit(interp, this, args, "findIndex", |index, _, result| {
        result.is_truthy().then_some(Ok(index.into()))
    })?;
    Ok(found.unwrap_or(JsValue::Number(-1.0)))
}

fn some(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let found = visit(interp, this, args, "some", |_, _, result| {
        result.is_truthy().then_some(Ok(true.into()))
    })?;
    Ok(found.unwrap_or(false.into()))
}

fn every(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let failed = visit(interp, this, args, "every", |_, _, result| {
        (!result.is_truthy()).then_some(Ok(false.into()))
    })?;
    Ok(failed.unwrap_or(true.into()))
}

/// Backwards search shared by `findLast` and `findLastIndex`.
fn find_last_entry(
    interp: &mut Interpreter,
    this: &JsValue,
    args: &[JsValue],
    method: &str,
) -> Completion<Option<(usize, JsValue)>> {
    let items = this_array(interp, this, method)?;
    let f = callback(interp, args)?;
    let len = items.borrow().len();
    for index in (0..len).rev() {
        let item = element(&items, index).unwrap_or_default();
        let hit = interp.call_function(&f, arg(args, 1), &[item.clone(), index.into(), this.clone()])?;
        if hit.is_truthy() {
            return Ok(Some((index, item)));
        }
    }
    Ok(None)
}

fn find_last(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let found = find_last_entry(interp, this, args, "findLast")?;
    Ok(found.map(|(_, item)| item).unwrap_or_default())
}

fn find_last_index(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let found = find_last_entry(interp, this, args, "findLastIndex")?;
    Ok(JsValue::Number(found.map_or(-1.0, |(index, _)| index as f64)))
}

fn reduce_impl(
    interp: &mut Interpreter,
    this: &JsValue,
    args: &[JsValue],
    method: &str,
    from_right: bool,
) -> Completion<JsValue> {
    let items = this_array(interp, this, method)?;
    let f = callback(interp, args)?;
    let len = items.borrow().len();
    let mut order: Box<dyn Iterator<Item = usize>> = if from_right {
        Box::new((0..len).rev())
    } else {
        Box::new(0..len)
    };
    let mut accumulator = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match order.next() {
            Some(first) => element(&items, first).unwrap_or_default(),
            None => {
                return Err(interp.throw(
                    ErrorType::TypeError,
                    "Reduce of empty array with no initial value",
                ));
            }
        },
    };
    for index in order {
        let Some(item) = element(&items, index) else {
            continue;
        };
        accumulator = interp.call_function(
            &f,
            JsValue::Undefined,
            &[accumulator, item, index.into(), this.clone()],
        )?;
    }
    Ok(accumulator)
}

fn reduce(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    reduce_impl(interp, this, args, "reduce", false)
}

fn reduce_right(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    reduce_impl(interp, this, args, "reduceRight", true)
}

fn flatten_into(out: &mut Vec<JsValue>, items: &[JsValue], depth: f64) {
    for item in items {
        match item {
            JsValue::Array(inner) if depth >= 1.0 => {
                let inner = inner.borrow().clone();
                flatten_into(out, &inner, depth - 1.0);
            }
            other => out.push(other.clone()),
        }
    }
}

fn flat(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "flat")?.borrow().clone();
    let depth = match arg(args, 0) {
        JsValue::Undefined => 1.0,
        other => to_integer(&other),
    };
    let mut out = Vec::new();
    flatten_into(&mut out, &items, depth);
    interp.check_array_length(out.len())?;
    Ok(JsValue::array(out))
}

fn flat_map(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let mapped = map(interp, this, args)?;
    flat(interp, &mapped, &[])
}

/// Whether `a` sorts after `b`. `undefined` always sorts last.
fn sorts_after(
    interp: &mut Interpreter,
    comparator: &JsValue,
    a: &JsValue,
    b: &JsValue,
) -> Completion<bool> {
    match (a, b) {
        (JsValue::Undefined, JsValue::Undefined) => return Ok(false),
        (JsValue::Undefined, _) => return Ok(true),
        (_, JsValue::Undefined) => return Ok(false),
        _ => {}
    }
    if comparator.is_callable() {
        let order = interp
            .call_function(comparator, JsValue::Undefined, &[a.clone(), b.clone()])?
            .to_number();
        return Ok(order > 0.0);
    }
    let (a, b) = (a.to_js_string(), b.to_js_string());
    Ok(a.encode_utf16().cmp(b.encode_utf16()) == Ordering::Greater)
}

/// Stable bottom-up merge sort. Inconsistent comparators yield some
/// permutation of the input rather than failing.
pub(crate) fn sort_values(
    interp: &mut Interpreter,
    mut values: Vec<JsValue>,
    comparator: &JsValue,
) -> Completion<Vec<JsValue>> {
    let len = values.len();
    let mut buffer = values.clone();
    let mut width = 1;
    while width < len {
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut left, mut right) = (start, mid);
            for slot in buffer.iter_mut().take(end).skip(start) {
                let take_right = right < end
                    && (left >= mid || sorts_after(interp, comparator, &values[left], &values[right])?);
                if take_right {
                    *slot = values[right].clone();
                    right += 1;
                } else {
                    *slot = values[left].clone();
                    left += 1;
                }
            }
            start += 2 * width;
        }
        std::mem::swap(&mut values, &mut buffer);
        width *= 2;
    }
    Ok(values)
}

fn sort(interp: &mut Interpreter, this: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
    let items = this_array(interp, this, "sort")?;
    let comparator = arg(args, 0);
    if !comparator.is_callable() && !matches!(comparator, JsValue::Undefined) {
        return Err(interp.throw(
            ErrorType::TypeError,
            "The comparison function must be either a function or undefined",
        ));
    }
    let snapshot = items.borrow().clone();
    let sorted = sort_values(interp, snapshot, &comparator)?;
    *items.borrow_mut() = sorted;
    Ok(this.clone())
}

#[cfg(test)]
mod tests {
    use crate::sandbox::interpreter::tests::call;

    fn eval(expr: &str) -> String {
        call(&format!("function main() {{ return {expr}; }}"), "main", &[])
            .unwrap_or_else(|error| format!("threw {error}"))
    }

    #[test]
    fn test_mutators() {
        assert_eq!(eval("(() => { const a = [1, 2]; a.push(3, 4); a.shift(); return a.join(); })()"), "2,3,4");
        assert_eq!(eval("(() => { const a = [1, 2, 3, 4]; const r = a.splice(1, 2, 'x'); return a.join() + '|' + r.join(); })()"), "1,x,4|2,3");
        assert_eq!(eval("(() => { const a = [3]; a.unshift(1, 2); return a.join(); })()"), "1,2,3");
        assert_eq!(eval("[1, 2, 3].reverse().join('-')"), "3-2-1");
        assert_eq!(eval("new Array(3).fill(0).join()"), "0,0,0");
    }

    #[test]
    fn test_higher_order_methods() {
        assert_eq!(eval("[1, 2, 3].map(x => x * 2).filter(x => x > 2).join()"), "4,6");
        assert_eq!(eval("[1, 2, 3].reduce((a, b) => a + b)"), "6");
        assert_eq!(eval("['a', 'b'].reduceRight((a, b) => a + b, '')"), "ba");
        assert_eq!(eval("[5, 6, 7].findIndex(x => x === 6)"), "1");
        assert_eq!(eval("[5, 6, 7].findLast(x => x < 7)"), "6");
        assert_eq!(eval("[1, 2].some(x => x > 1) && [1, 2].every(x => x > 0)"), "true");
        assert_eq!(eval("[[1, [2]], [3]].flat().length"), "3");
        assert_eq!(eval("[1, 2].flatMap(x => [x, x]).join()"), "1,1,2,2");
    }

    #[test]
    fn test_reduce_of_empty_array_throws() {
        assert_eq!(
            eval("[].reduce((a, b) => a + b)"),
            "threw TypeError: Reduce of empty array with no initial value"
        );
    }

    #[test]
    fn test_default_sort_compares_strings() {
        assert_eq!(eval("[10, 9, 1, undefined, 2].sort().join()"), "1,10,2,9,");
    }

    #[test]
    fn test_sort_is_stable_with_comparator() {
        let result = eval(
            "[[1, 'a'], [0, 'b'], [1, 'c'], [0, 'd']]
               .sort((x, y) => x[0] - y[0])
               .map(p => p[1]).join('')",
        );
        assert_eq!(result, "bdac");
    }

    #[test]
    fn test_array_from_and_includes() {
        assert_eq!(eval("Array.from({ length: 3 }, (_, i) => i * i).join()"), "0,1,4");
        assert_eq!(eval("Array.from('abc').length"), "3");
        assert_eq!(eval("[NaN].includes(NaN) && [NaN].indexOf(NaN) === -1"), "true");
        assert_eq!(eval("Array.isArray([]) && !Array.isArray({})"), "true");
    }

    #[test]
    fn test_invalid_length_is_a_range_error() {
        assert_eq!(eval("new Array(-1)"), "threw RangeError: Invalid array length");
    }
}
