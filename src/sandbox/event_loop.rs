//! Promises, the microtask queue and real-time timers.
//!
//! `await` drives this loop re-entrantly until the awaited promise settles,
//! so an asynchronous candidate completes inside a single invocation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::builtins::{ErrorType, console};
use super::interpreter::Interpreter;
use super::value::{shared, Completion, Control, JsValue, Shared};

/// Upper bound on a single idle sleep, so cancellation is noticed promptly.
const IDLE_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub enum PromiseStatus {
    Pending,
    Fulfilled(JsValue),
    Rejected(JsValue),
}

pub struct PromiseState {
    pub status: PromiseStatus,
    reactions: Vec<Reaction>,
}

impl PromiseState {
    pub fn pending() -> Shared<PromiseState> {
        shared(PromiseState {
            status: PromiseStatus::Pending,
            reactions: Vec::new(),
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, PromiseStatus::Pending)
    }
}

#[derive(Clone)]
pub enum Handler {
    /// Passes the settlement through unchanged.
    Identity,
    Callback(JsValue),
    Finally(JsValue),
    Aggregate {
        state: Shared<Aggregate>,
        index: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    All,
    AllSettled,
    Any,
    Race,
}

/// Shared bookkeeping of `Promise.all` and friends.
pub struct Aggregate {
    pub kind: AggregateKind,
    pub values: Vec<JsValue>,
    pub remaining: usize,
    pub target: Shared<PromiseState>,
    pub done: bool,
}

struct Reaction {
    on_fulfilled: Handler,
    on_rejected: Handler,
    target: Option<Shared<PromiseState>>,
}

struct Job {
    handler: Handler,
    argument: JsValue,
    rejected: bool,
    target: Option<Shared<PromiseState>>,
}

struct Timer {
    callback: JsValue,
    args: Vec<JsValue>,
}

#[derive(Default)]
pub struct EventLoop {
    microtasks: VecDeque<Job>,
    timers: BTreeMap<(Instant, u64), Timer>,
    timer_due: HashMap<u64, Instant>,
    next_timer_id: u64,
}

impl EventLoop {
    /// Forgets queued work left over from a previous invocation.
    pub fn reset(&mut self) {
        self.microtasks.clear();
        self.timers.clear();
        self.timer_due.clear();
    }

    pub fn set_timeout(&mut self, callback: JsValue, delay_ms: f64, args: Vec<JsValue>) -> u64 {
        self.next_timer_id += 1;
        let id = self.next_timer_id;
        let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_secs_f64(delay_ms / 1000.0)
        } else {
            Duration::ZERO
        };
        let due = Instant::now() + delay;
        self.timers.insert((due, id), Timer { callback, args });
        self.timer_due.insert(id, due);
        id
    }

    pub fn clear_timeout(&mut self, id: u64) {
        if let Some(due) = self.timer_due.remove(&id) {
            self.timers.remove(&(due, id));
        }
    }

    fn pop_due_timer(&mut self, now: Instant) -> Option<Timer> {
        let key = *self.timers.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.timer_due.remove(&key.1);
        self.timers.remove(&key)
    }

    fn next_due(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(due, _)| *due)
    }

    fn enqueue(&mut self, job: Job) {
        self.microtasks.push_back(job);
    }
}

/// Settles `promise` with `value`, adopting the state of a promise value.
pub fn resolve_promise(interp: &mut Interpreter, promise: &Shared<PromiseState>, value: JsValue) {
    if !promise.borrow().is_pending() {
        return;
    }
    match value {
        JsValue::Promise(inner) if std::rc::Rc::ptr_eq(&inner, promise) => {
            let error = interp.make_error(
                ErrorType::TypeError,
                "Chaining cycle detected for promise #<Promise>",
            );
            reject_promise(interp, promise, error);
        }
        JsValue::Promise(inner) => subscribe(
            interp,
            &inner,
            Handler::Identity,
            Handler::Identity,
            Some(promise.clone()),
        ),
        other => settle(interp, promise, PromiseStatus::Fulfilled(other)),
    }
}

pub fn reject_promise(interp: &mut Interpreter, promise: &Shared<PromiseState>, reason: JsValue) {
    settle(interp, promise, PromiseStatus::Rejected(reason));
}

fn settle(interp: &mut Interpreter, promise: &Shared<PromiseState>, status: PromiseStatus) {
    let reactions = {
        let mut state = promise.borrow_mut();
        if !state.is_pending() {
            return;
        }
        state.status = status.clone();
        std::mem::take(&mut state.reactions)
    };
    for reaction in reactions {
        schedule(interp, reaction, &status);
    }
}

fn schedule(interp: &mut Interpreter, reaction: Reaction, status: &PromiseStatus) {
    let (handler, argument, rejected) = match status {
        PromiseStatus::Fulfilled(value) => (reaction.on_fulfilled, value.clone(), false),
        PromiseStatus::Rejected(reason) => (reaction.on_rejected, reason.clone(), true),
        PromiseStatus::Pending => return,
    };
    interp.event_loop.enqueue(Job {
        handler,
        argument,
        rejected,
        target: reaction.target,
    });
}

/// Registers handlers on `promise`; they run as microtasks once it settles.
pub fn subscribe(
    interp: &mut Interpreter,
    promise: &Shared<PromiseState>,
    on_fulfilled: Handler,
    on_rejected: Handler,
    target: Option<Shared<PromiseState>>,
) {
    let reaction = Reaction {
        on_fulfilled,
        on_rejected,
        target,
    };
    let status = {
        let mut state = promise.borrow_mut();
        if state.is_pending() {
            state.reactions.push(reaction);
            return;
        }
        state.status.clone()
    };
    schedule(interp, reaction, &status);
}

fn settle_target(
    interp: &mut Interpreter,
    target: &Option<Shared<PromiseState>>,
    value: JsValue,
    rejected: bool,
) {
    if let Some(target) = target {
        if rejected {
            reject_promise(interp, target, value);
        } else {
            resolve_promise(interp, target, value);
        }
    }
}

fn run_job(interp: &mut Interpreter, job: Job) -> Completion<()> {
    let Job {
        handler,
        argument,
        rejected,
        target,
    } = job;
    match handler {
        Handler::Callback(callback) if callback.is_callable() => {
            match interp.call_function(&callback, JsValue::Undefined, &[argument]) {
                Ok(value) => settle_target(interp, &target, value, false),
                Err(Control::Throw(error)) => settle_target(interp, &target, error, true),
                Err(Control::Interrupted) => return Err(Control::Interrupted),
            }
        }
        Handler::Finally(callback) if callback.is_callable() => {
            match interp.call_function(&callback, JsValue::Undefined, &[]) {
                Ok(_) => settle_target(interp, &target, argument, rejected),
                Err(Control::Throw(error)) => settle_target(interp, &target, error, true),
                Err(Control::Interrupted) => return Err(Control::Interrupted),
            }
        }
        Handler::Aggregate { state, index } => update_aggregate(interp, &state, index, argument, rejected),
        Handler::Identity | Handler::Callback(_) | Handler::Finally(_) => {
            settle_target(interp, &target, argument, rejected)
        }
    }
    Ok(())
}

fn update_aggregate(
    interp: &mut Interpreter,
    state: &Shared<Aggregate>,
    index: usize,
    value: JsValue,
    rejected: bool,
) {
    let (kind, done, target) = {
        let aggregate = state.borrow();
        (aggregate.kind, aggregate.done, aggregate.target.clone())
    };
    if done {
        return;
    }

    let settle_now = |state: &Shared<Aggregate>| state.borrow_mut().done = true;
    match (kind, rejected) {
        (AggregateKind::Race, _) | (AggregateKind::All, true) | (AggregateKind::Any, false) => {
            settle_now(state);
            settle_target(interp, &Some(target), value, rejected);
        }
        (AggregateKind::AllSettled, _) => {
            let entry = if rejected {
                interp.make_object(vec![("status", "rejected".into()), ("reason", value)])
            } else {
                interp.make_object(vec![("status", "fulfilled".into()), ("value", value)])
            };
            if let Some(values) = record(state, index, entry) {
                settle_target(interp, &Some(target), JsValue::array(values), false);
            }
        }
        (AggregateKind::All, false) => {
            if let Some(values) = record(state, index, value) {
                settle_target(interp, &Some(target), JsValue::array(values), false);
            }
        }
        (AggregateKind::Any, true) => {
            if record(state, index, value).is_some() {
                let error = interp.make_error(ErrorType::AggregateError, "All promises were rejected");
                settle_target(interp, &Some(target), error, true);
            }
        }
    }
}

/// Stores one element; returns the collected values once all have arrived.
fn record(state: &Shared<Aggregate>, index: usize, value: JsValue) -> Option<Vec<JsValue>> {
    let mut aggregate = state.borrow_mut();
    if let Some(slot) = aggregate.values.get_mut(index) {
        *slot = value;
    }
    aggregate.remaining = aggregate.remaining.saturating_sub(1);
    if aggregate.remaining > 0 {
        return None;
    }
    aggregate.done = true;
    Some(aggregate.values.clone())
}

/// Runs queued microtasks until the queue is empty.
pub fn run_microtasks(interp: &mut Interpreter) -> Completion<()> {
    while let Some(job) = interp.event_loop.microtasks.pop_front() {
        interp.check_interrupt()?;
        run_job(interp, job)?;
    }
    Ok(())
}

fn run_timer(interp: &mut Interpreter, timer: Timer) -> Completion<()> {
    match interp.call_function(&timer.callback, JsValue::Undefined, &timer.args) {
        Ok(_) => Ok(()),
        Err(Control::Throw(error)) => {
            console::print_text(interp, &format!("Uncaught {}", error.to_js_string()));
            Ok(())
        }
        Err(Control::Interrupted) => Err(Control::Interrupted),
    }
}

/// Drives microtasks and timers until `promise` settles. A promise that
/// nothing can settle keeps the loop idle until the host cancels it.
pub fn run_until_settled(
    interp: &mut Interpreter,
    promise: &Shared<PromiseState>,
) -> Completion<JsValue> {
    loop {
        interp.check_interrupt()?;
        match &promise.borrow().status {
            PromiseStatus::Fulfilled(value) => return Ok(value.clone()),
            PromiseStatus::Rejected(reason) => return Err(Control::Throw(reason.clone())),
            PromiseStatus::Pending => {}
        }

        if let Some(job) = interp.event_loop.microtasks.pop_front() {
            run_job(interp, job)?;
            continue;
        }

        let now = Instant::now();
        if let Some(timer) = interp.event_loop.pop_due_timer(now) {
            run_timer(interp, timer)?;
            continue;
        }

        let wait = interp
            .event_loop
            .next_due()
            .map_or(IDLE_SLICE, |due| due.saturating_duration_since(now))
            .min(IDLE_SLICE);
        std::thread::sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interpreter::tests::interpreter;

    #[test]
    fn test_timers_fire_in_due_order() {
        let mut event_loop = EventLoop::default();
        event_loop.set_timeout(JsValue::string("late"), 50.0, vec![]);
        event_loop.set_timeout(JsValue::string("early"), 0.0, vec![]);
        let later = Instant::now() + Duration::from_millis(10);
        let first = event_loop.pop_due_timer(later).map(|t| t.callback.to_js_string());
        assert_eq!(first.as_deref(), Some("early"));
        assert!(event_loop.pop_due_timer(later).is_none());
    }

    #[test]
    fn test_clear_timeout_removes_timer() {
        let mut event_loop = EventLoop::default();
        let id = event_loop.set_timeout(JsValue::Undefined, 0.0, vec![]);
        event_loop.clear_timeout(id);
        assert!(event_loop.next_due().is_none());
    }

    #[test]
    fn test_resolution_adopts_inner_promise() {
        let mut interp = interpreter();
        let inner = PromiseState::pending();
        let outer = PromiseState::pending();
        resolve_promise(&mut interp, &outer, JsValue::Promise(inner.clone()));
        assert!(outer.borrow().is_pending());
        resolve_promise(&mut interp, &inner, 7.0.into());
        let value = run_until_settled(&mut interp, &outer).unwrap();
        assert_eq!(value.to_number(), 7.0);
    }

    #[test]
    fn test_settled_promise_ignores_later_resolution() {
        let mut interp = interpreter();
        let promise = PromiseState::pending();
        reject_promise(&mut interp, &promise, "first".into());
        resolve_promise(&mut interp, &promise, "second".into());
        let Err(Control::Throw(reason)) = run_until_settled(&mut interp, &promise) else {
            panic!("Expected rejection");
        };
        assert_eq!(reason.to_js_string(), "first");
    }
}
