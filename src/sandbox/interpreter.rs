//! Tree-walking evaluator for the candidate dialect.
//!
//! An [`Interpreter`] owns the global scope, the intrinsic prototypes and
//! the event loop of one execution context. Every evaluation step can be
//! cut short by bumping the shared cancellation counter, which surfaces as
//! [`Control::Interrupted`] and is never catchable by candidate code.

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::ast::{
    ArrayElem, Arg, AssignOp, BinaryOp, DeclKind, Declarator, Expr, ForHead, ForInit,
    FunctionBody, FunctionDef, LogicalOp, MemberProp, Pattern, Program, PropDef, PropKey, Stmt,
    SwitchCase, UnaryOp,
};
use super::builtins::{self, ErrorType, Intrinsics, string};
use super::env::{BindingError, Env, WeakEnv};
use super::event_loop::{self, EventLoop, PromiseState, reject_promise, resolve_promise};
use super::value::{
    Callable, CallableKind, Completion, Control, JsObject, JsValue, MAX_STRING_LENGTH,
    ObjectClass, Shared, StringTooLong, array_index, loose_equals, push_within, shared,
    strict_equals,
};

#[derive(Debug, Clone, Copy)]
pub struct InterpreterLimits {
    /// Nested calls allowed before a `RangeError` is thrown.
    pub max_call_depth: usize,
    /// Largest array the candidate may materialize.
    pub max_array_length: usize,
    /// Longest string the candidate may build, in UTF-8 bytes.
    pub max_string_length: usize,
}

impl Default for InterpreterLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 10_000,
            max_array_length: 4_000_000,
            max_string_length: MAX_STRING_LENGTH,
        }
    }
}

/// Statement completion other than an exception.
enum Flow {
    Normal,
    Return(JsValue),
    Break(Option<String>),
    Continue(Option<String>),
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare { mutable: bool },
    Assign,
}

/// Property key, with array indices kept numeric.
pub enum Key<'a> {
    Index(usize),
    Name(Cow<'a, str>),
}

impl<'a> Key<'a> {
    pub fn named(name: &'a str) -> Self {
        Key::Name(Cow::Borrowed(name))
    }

    pub fn from_value(value: &JsValue) -> Key<'static> {
        match value {
            JsValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n < 4_294_967_295.0 => {
                Key::Index(*n as usize)
            }
            JsValue::String(s) => match array_index(s) {
                Some(index) => Key::Index(index),
                None => Key::Name(Cow::Owned(s.to_string())),
            },
            other => Key::Name(Cow::Owned(other.to_js_string())),
        }
    }

    fn index(&self) -> Option<usize> {
        match self {
            Key::Index(index) => Some(*index),
            Key::Name(name) => array_index(name),
        }
    }

    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Key::Index(index) => Cow::Owned(index.to_string()),
            Key::Name(name) => Cow::Borrowed(name.as_ref()),
        }
    }

    fn is(&self, name: &str) -> bool {
        matches!(self, Key::Name(n) if n == name)
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{index}"),
            Key::Name(name) => f.write_str(name),
        }
    }
}

/// Assignment target resolved once for compound operators.
enum Reference<'a> {
    Binding(&'a str),
    Property(JsValue, Key<'static>),
}

pub struct Interpreter {
    globals: Env,
    pub(crate) intrinsics: Intrinsics,
    pub(crate) event_loop: EventLoop,
    /// Output of `console.*` since the last drain.
    pub(crate) console: Vec<String>,
    limits: InterpreterLimits,
    call_depth: usize,
    cancel: Arc<AtomicU64>,
    epoch: u64,
    /// Bumped whenever a closure captures a scope, so loops know when they
    /// must copy per-iteration bindings.
    closures_created: u64,
    closure_envs: Vec<WeakEnv>,
    rng_state: u64,
}

impl Interpreter {
    pub fn new(limits: InterpreterLimits, cancel: Arc<AtomicU64>) -> Self {
        let globals = Env::global();
        let intrinsics = builtins::install(&globals);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0x9E37_79B9_7F4A_7C15, |elapsed| elapsed.as_nanos() as u64);
        let epoch = cancel.load(Ordering::SeqCst);
        Self {
            globals,
            intrinsics,
            event_loop: EventLoop::default(),
            console: Vec::new(),
            limits,
            call_depth: 0,
            cancel,
            epoch,
            closures_created: 0,
            closure_envs: Vec::new(),
            rng_state: seed | 1,
        }
    }

    /// Accepts work stamped with `epoch`; any later bump of the
    /// cancellation counter interrupts it.
    pub fn arm(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.call_depth = 0;
    }

    pub fn check_interrupt(&self) -> Completion<()> {
        if self.cancel.load(Ordering::Relaxed) == self.epoch {
            Ok(())
        } else {
            Err(Control::Interrupted)
        }
    }

    pub fn take_console(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console)
    }

    /// Evaluates a whole program in a fresh top-level scope and returns it.
    pub fn run_program(&mut self, program: &Program) -> Completion<Env> {
        let scope = Env::function(&self.globals, Some(JsValue::Undefined));
        self.hoist(&program.body, &scope);
        if let Flow::Return(_) = self.exec_statements(&program.body, &scope)? {
            return Err(self.throw(ErrorType::SyntaxError, "Illegal return statement"));
        }
        event_loop::run_microtasks(self)?;
        Ok(scope)
    }

    /// Calls `function` with `args` and waits for an asynchronous result.
    pub fn invoke(&mut self, function: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
        self.event_loop.reset();
        self.call_depth = 0;
        let result = self.call_function(function, JsValue::Undefined, args)?;
        self.await_value(result)
    }

    // Value construction

    pub fn make_error(&self, kind: ErrorType, message: impl Into<String>) -> JsValue {
        let mut object = JsObject::with_proto(Some(self.intrinsics.error_proto(kind).clone()));
        object.class = ObjectClass::Error;
        object.props.set("message", JsValue::from(message.into()));
        JsValue::Object(shared(object))
    }

    pub fn throw(&self, kind: ErrorType, message: impl Into<String>) -> Control {
        Control::Throw(self.make_error(kind, message))
    }

    pub fn new_object(&self) -> Shared<JsObject> {
        shared(JsObject::with_proto(Some(self.intrinsics.object_proto.clone())))
    }

    pub fn make_object(&self, entries: Vec<(&str, JsValue)>) -> JsValue {
        let object = self.new_object();
        {
            let mut object = object.borrow_mut();
            for (key, value) in entries {
                object.props.set(key, value);
            }
        }
        JsValue::Object(object)
    }

    pub fn check_array_length(&self, length: usize) -> Completion<()> {
        if length > self.limits.max_array_length {
            Err(self.throw(ErrorType::RangeError, "Invalid array length"))
        } else {
            Ok(())
        }
    }

    fn add(&self, left: &JsValue, right: &JsValue) -> Completion<JsValue> {
        let stringy = |value: &JsValue| matches!(value, JsValue::String(_)) || value.identity().is_some();
        if !stringy(left) && !stringy(right) {
            return Ok(JsValue::Number(left.to_number() + right.to_number()));
        }
        if let (JsValue::String(a), JsValue::String(b)) = (left, right) {
            self.check_string_length(a.len().saturating_add(b.len()))?;
            return Ok(format!("{a}{b}").into());
        }
        let mut out = self.to_string_checked(left)?;
        let tail = self.to_string_checked(right)?;
        self.push_str_checked(&mut out, &tail)?;
        Ok(out.into())
    }

    pub fn check_string_length(&self, length: usize) -> Completion<()> {
        if length > self.limits.max_string_length {
            Err(self.throw(ErrorType::RangeError, "Invalid string length"))
        } else {
            Ok(())
        }
    }

    /// `ToString` that throws a `RangeError` instead of exceeding the
    /// string length limit.
    pub fn to_string_checked(&self, value: &JsValue) -> Completion<String> {
        value
            .to_js_string_within(self.limits.max_string_length)
            .map_err(|StringTooLong| self.throw(ErrorType::RangeError, "Invalid string length"))
    }

    /// Appends `piece` to `out` within the string length limit.
    pub fn push_str_checked(&self, out: &mut String, piece: &str) -> Completion<()> {
        push_within(out, piece, self.limits.max_string_length)
            .map_err(|StringTooLong| self.throw(ErrorType::RangeError, "Invalid string length"))
    }

    /// xorshift64* in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64 / (1u64 << 53) as f64
    }

    fn make_closure(&mut self, def: &Rc<FunctionDef>, env: &Env) -> JsValue {
        self.closures_created += 1;
        if self.closure_envs.len() == self.closure_envs.capacity() {
            self.closure_envs.retain(WeakEnv::is_alive);
        }
        self.closure_envs.push(env.downgrade());
        JsValue::Function(Callable::new(CallableKind::Script {
            def: def.clone(),
            env: env.clone(),
        }))
    }

    // Declarations

    /// Function-entry hoisting: `var` names go to the function scope, block
    /// declarations to `scope`.
    fn hoist(&mut self, body: &[Stmt], scope: &Env) {
        let function_scope = scope.function_scope();
        let mut names = Vec::new();
        for stmt in body {
            collect_var_names(stmt, &mut names);
        }
        for name in &names {
            function_scope.declare_var(name);
        }
        self.hoist_lexical(body, scope);
    }

    /// `let` and `const` enter their dead zone, function declarations are
    /// initialized up front.
    fn hoist_lexical(&mut self, body: &[Stmt], scope: &Env) {
        for stmt in body {
            match stmt {
                Stmt::VarDecl {
                    kind: DeclKind::Let | DeclKind::Const,
                    decls,
                } => {
                    let mut names = Vec::new();
                    for decl in decls {
                        pattern_names(&decl.target, &mut names);
                    }
                    for name in names {
                        scope.declare(&name, None, true);
                    }
                }
                Stmt::Function(def) => {
                    if let Some(name) = &def.name {
                        let function = self.make_closure(def, scope);
                        scope.declare(name, Some(function), true);
                    }
                }
                _ => {}
            }
        }
    }

    fn declare_all(&mut self, kind: DeclKind, decls: &[Declarator], env: &Env) -> Completion<()> {
        let mode = match kind {
            DeclKind::Var => BindMode::Assign,
            DeclKind::Let => BindMode::Declare { mutable: true },
            DeclKind::Const => BindMode::Declare { mutable: false },
        };
        for decl in decls {
            let value = match &decl.init {
                Some(init) => self.eval(init, env)?,
                None if kind == DeclKind::Var => continue,
                None => JsValue::Undefined,
            };
            self.bind_pattern(&decl.target, value, env, mode)?;
        }
        Ok(())
    }

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: JsValue,
        env: &Env,
        mode: BindMode,
    ) -> Completion<()> {
        match pattern {
            Pattern::Ident(name) => match mode {
                BindMode::Declare { mutable } => {
                    env.declare(name, Some(value), mutable);
                    Ok(())
                }
                BindMode::Assign => self.assign_name(name, value, env),
            },
            Pattern::Member(member) => {
                let (object, key) = self.resolve_member(member, env)?;
                self.set_property(&object, &key, value)
            }
            Pattern::Default { target, default } => {
                let value = match value {
                    JsValue::Undefined => self.eval(default, env)?,
                    other => other,
                };
                self.bind_pattern(target, value, env, mode)
            }
            Pattern::Array { elements, rest } => {
                let items = self.iterate(&value)?;
                for (index, element) in elements.iter().enumerate() {
                    if let Some(element) = element {
                        let item = items.get(index).cloned().unwrap_or_default();
                        self.bind_pattern(element, item, env, mode)?;
                    }
                }
                if let Some(rest) = rest {
                    let remaining = items.get(elements.len()..).map(<[JsValue]>::to_vec);
                    let remaining = JsValue::array(remaining.unwrap_or_default());
                    self.bind_pattern(rest, remaining, env, mode)?;
                }
                Ok(())
            }
            Pattern::Object { props, rest } => {
                if value.is_nullish() {
                    let shown = value.to_js_string();
                    return Err(self.throw(
                        ErrorType::TypeError,
                        format!("Cannot destructure '{shown}' as it is {shown}."),
                    ));
                }
                for (key, target) in props {
                    let item = self.get_property(&value, &Key::named(key))?;
                    self.bind_pattern(target, item, env, mode)?;
                }
                if let Some(rest) = rest {
                    let remaining = self.new_object();
                    for key in self.own_keys(&value) {
                        if props.iter().any(|(taken, _)| taken.as_str() == &*key) {
                            continue;
                        }
                        let item = self.get_property(&value, &Key::named(&key))?;
                        remaining.borrow_mut().props.set(&key, item);
                    }
                    self.bind_pattern(rest, JsValue::Object(remaining), env, mode)?;
                }
                Ok(())
            }
        }
    }

    fn lookup(&self, name: &str, env: &Env) -> Completion<JsValue> {
        env.lookup(name)
            .map_err(|error| self.binding_error(error, name))
    }

    fn assign_name(&self, name: &str, value: JsValue, env: &Env) -> Completion<()> {
        env.assign(name, value)
            .map_err(|error| self.binding_error(error, name))
    }

    fn binding_error(&self, error: BindingError, name: &str) -> Control {
        match error {
            BindingError::NotDefined => {
                self.throw(ErrorType::ReferenceError, format!("{name} is not defined"))
            }
            BindingError::Uninitialized => self.throw(
                ErrorType::ReferenceError,
                format!("Cannot access '{name}' before initialization"),
            ),
            BindingError::Constant => {
                self.throw(ErrorType::TypeError, "Assignment to constant variable.")
            }
        }
    }

    // Statements

    fn exec_statements(&mut self, body: &[Stmt], env: &Env) -> Completion<Flow> {
        for stmt in body {
            let flow = self.exec(stmt, env)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, body: &[Stmt], parent: &Env) -> Completion<Flow> {
        if !body.iter().any(is_lexical_declaration) {
            return self.exec_statements(body, parent);
        }
        let scope = Env::block(parent);
        self.hoist_lexical(body, &scope);
        self.exec_statements(body, &scope)
    }

    fn exec(&mut self, stmt: &Stmt, env: &Env) -> Completion<Flow> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            Stmt::VarDecl { kind, decls } => {
                self.declare_all(*kind, decls, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Return(argument) => {
                let value = match argument {
                    Some(argument) => self.eval(argument, env)?,
                    None => JsValue::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, env)?.is_truthy() {
                    self.exec(consequent, env)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::Block(body) => self.exec_block(body, env),
            Stmt::For { .. }
            | Stmt::ForOf { .. }
            | Stmt::ForIn { .. }
            | Stmt::While { .. }
            | Stmt::DoWhile { .. } => self.exec_loop(stmt, env, None),
            Stmt::Labeled { label, body } => {
                let flow = if is_loop(body) {
                    self.exec_loop(body, env, Some(label.as_str()))?
                } else {
                    self.exec(body, env)?
                };
                match flow {
                    Flow::Break(Some(target)) if &target == label => Ok(Flow::Normal),
                    other => Ok(other),
                }
            }
            Stmt::Break(label) => Ok(Flow::Break(label.clone())),
            Stmt::Continue(label) => Ok(Flow::Continue(label.clone())),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, env)?;
                Err(Control::Throw(value))
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => self.exec_try(block, param.as_ref(), handler.as_deref(), finalizer.as_deref(), env),
            Stmt::Switch {
                discriminant,
                cases,
            } => self.exec_switch(discriminant, cases, env),
        }
    }

    fn exec_loop(&mut self, stmt: &Stmt, env: &Env, label: Option<&str>) -> Completion<Flow> {
        match stmt {
            Stmt::While { test, body } => {
                loop {
                    self.check_interrupt()?;
                    if !self.eval(test, env)?.is_truthy() {
                        break;
                    }
                    let flow = self.exec(body, env)?;
                    if let Some(exit) = loop_exit(flow, label) {
                        return Ok(exit);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    self.check_interrupt()?;
                    let flow = self.exec(body, env)?;
                    if let Some(exit) = loop_exit(flow, label) {
                        return Ok(exit);
                    }
                    if !self.eval(test, env)?.is_truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, env, label),
            Stmt::ForOf {
                head,
                iterable,
                body,
            } => {
                let collection = self.eval(iterable, env)?;
                if let JsValue::Array(items) = &collection {
                    // Arrays are walked live, so pushes during the loop are seen.
                    let mut index = 0;
                    loop {
                        self.check_interrupt()?;
                        let Some(item) = items.borrow().get(index).cloned() else {
                            break;
                        };
                        index += 1;
                        if let Some(exit) = self.iteration(head, item, body, env, label)? {
                            return Ok(exit);
                        }
                    }
                    return Ok(Flow::Normal);
                }
                for item in self.iterate(&collection)? {
                    self.check_interrupt()?;
                    if let Some(exit) = self.iteration(head, item, body, env, label)? {
                        return Ok(exit);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForIn { head, object, body } => {
                let object = self.eval(object, env)?;
                for key in self.own_keys(&object) {
                    self.check_interrupt()?;
                    let key = JsValue::String(key);
                    if let Some(exit) = self.iteration(head, key, body, env, label)? {
                        return Ok(exit);
                    }
                }
                Ok(Flow::Normal)
            }
            other => self.exec(other, env),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&ForInit>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        env: &Env,
        label: Option<&str>,
    ) -> Completion<Flow> {
        let mut iteration_env = Env::block(env);
        let mut per_iteration = Vec::new();
        match init {
            Some(ForInit::VarDecl { kind, decls }) => {
                if *kind != DeclKind::Var {
                    for decl in decls {
                        pattern_names(&decl.target, &mut per_iteration);
                    }
                    for name in &per_iteration {
                        iteration_env.declare(name, None, true);
                    }
                }
                self.declare_all(*kind, decls, &iteration_env)?;
            }
            Some(ForInit::Expr(expr)) => {
                self.eval(expr, &iteration_env)?;
            }
            None => {}
        }

        loop {
            self.check_interrupt()?;
            if let Some(test) = test {
                if !self.eval(test, &iteration_env)?.is_truthy() {
                    break;
                }
            }
            let closures_before = self.closures_created;
            let flow = self.exec(body, &iteration_env)?;
            if let Some(exit) = loop_exit(flow, label) {
                return Ok(exit);
            }
            // Closures captured this iteration keep the old bindings.
            if !per_iteration.is_empty() && self.closures_created != closures_before {
                let next = Env::block(env);
                for name in &per_iteration {
                    next.declare(name, iteration_env.lookup(name).ok(), true);
                }
                iteration_env = next;
            }
            if let Some(update) = update {
                self.eval(update, &iteration_env)?;
            }
        }
        Ok(Flow::Normal)
    }

    /// One `for...of`/`for...in` step; `Some` when the loop must stop.
    fn iteration(
        &mut self,
        head: &ForHead,
        item: JsValue,
        body: &Stmt,
        env: &Env,
        label: Option<&str>,
    ) -> Completion<Option<Flow>> {
        let iteration_env = Env::block(env);
        let mode = match head.kind {
            Some(DeclKind::Let) => BindMode::Declare { mutable: true },
            Some(DeclKind::Const) => BindMode::Declare { mutable: false },
            Some(DeclKind::Var) | None => BindMode::Assign,
        };
        self.bind_pattern(&head.target, item, &iteration_env, mode)?;
        let flow = self.exec(body, &iteration_env)?;
        Ok(loop_exit(flow, label))
    }

    fn exec_try(
        &mut self,
        block: &[Stmt],
        param: Option<&Pattern>,
        handler: Option<&[Stmt]>,
        finalizer: Option<&[Stmt]>,
        env: &Env,
    ) -> Completion<Flow> {
        let mut result = self.exec_block(block, env);
        if let Some(handler) = handler {
            if let Err(Control::Throw(error)) = result {
                let catch_env = Env::block(env);
                result = match param {
                    Some(param) => self
                        .bind_pattern(param, error, &catch_env, BindMode::Declare { mutable: true })
                        .and_then(|()| self.exec_block(handler, &catch_env)),
                    None => self.exec_block(handler, &catch_env),
                };
            }
        }
        if let Some(finalizer) = finalizer {
            if matches!(result, Err(Control::Interrupted)) {
                return result;
            }
            let flow = self.exec_block(finalizer, env)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        result
    }

    fn exec_switch(
        &mut self,
        discriminant: &Expr,
        cases: &[SwitchCase],
        env: &Env,
    ) -> Completion<Flow> {
        let value = self.eval(discriminant, env)?;
        let scope = Env::block(env);
        for case in cases {
            self.hoist_lexical(&case.body, &scope);
        }

        let mut start = None;
        for (index, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if strict_equals(&self.eval(test, &scope)?, &value) {
                    start = Some(index);
                    break;
                }
            }
        }
        let Some(start) = start.or_else(|| cases.iter().position(|case| case.test.is_none()))
        else {
            return Ok(Flow::Normal);
        };

        for case in &cases[start..] {
            match self.exec_statements(&case.body, &scope)? {
                Flow::Normal => {}
                Flow::Break(None) => return Ok(Flow::Normal),
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    // Expressions

    pub(crate) fn eval(&mut self, expr: &Expr, env: &Env) -> Completion<JsValue> {
        match expr {
            Expr::Number(n) => Ok(JsValue::Number(*n)),
            Expr::String(s) => Ok(JsValue::String(s.clone())),
            Expr::Bool(b) => Ok(JsValue::Bool(*b)),
            Expr::Null => Ok(JsValue::Null),
            Expr::Template { quasis, exprs } => {
                let mut out = String::new();
                for (index, quasi) in quasis.iter().enumerate() {
                    self.push_str_checked(&mut out, quasi)?;
                    if let Some(expr) = exprs.get(index) {
                        let value = self.eval(expr, env)?;
                        let text = self.to_string_checked(&value)?;
                        self.push_str_checked(&mut out, &text)?;
                    }
                }
                Ok(out.into())
            }
            Expr::Ident(name) => self.lookup(name, env),
            Expr::This => Ok(env.this_value()),
            Expr::Array(elements) => self.eval_array(elements, env),
            Expr::Object(props) => self.eval_object(props, env),
            Expr::Function(def) => Ok(self.eval_function(def, env)),
            Expr::Unary { op, arg } => self.eval_unary(*op, arg, env),
            Expr::Update {
                increment,
                prefix,
                target,
            } => self.eval_update(*increment, *prefix, target, env),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                self.binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, env)?;
                if short_circuits(*op, &left) {
                    Ok(left)
                } else {
                    self.eval(right, env)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value, env),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, env)?.is_truthy() {
                    self.eval(consequent, env)
                } else {
                    self.eval(alternate, env)
                }
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => self.eval_call(callee, args, *optional, env),
            Expr::New { callee, args } => {
                let constructor = self.eval(callee, env)?;
                let args = self.eval_args(args, env)?;
                if !constructor.is_callable() {
                    return Err(self.throw(
                        ErrorType::TypeError,
                        format!("{} is not a constructor", describe(callee)),
                    ));
                }
                self.construct(&constructor, &args)
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let object = self.eval(object, env)?;
                if *optional && object.is_nullish() {
                    return Ok(JsValue::Undefined);
                }
                let key = self.member_key(property, env)?;
                self.get_property(&object, &key)
            }
            Expr::Sequence(exprs) => {
                let mut last = JsValue::Undefined;
                for expr in exprs {
                    last = self.eval(expr, env)?;
                }
                Ok(last)
            }
            Expr::Await(argument) => {
                let value = self.eval(argument, env)?;
                self.await_value(value)
            }
        }
    }

    fn member_key<'a>(&mut self, property: &'a MemberProp, env: &Env) -> Completion<Key<'a>> {
        match property {
            MemberProp::Named(name) => Ok(Key::named(name)),
            MemberProp::Computed(expr) => {
                let value = self.eval(expr, env)?;
                Ok(Key::from_value(&value))
            }
        }
    }

    /// Evaluates the object and key of a member expression used as a target.
    fn resolve_member(&mut self, member: &Expr, env: &Env) -> Completion<(JsValue, Key<'static>)> {
        let Expr::Member {
            object, property, ..
        } = member
        else {
            return Err(self.throw(ErrorType::SyntaxError, "Invalid assignment target"));
        };
        let object = self.eval(object, env)?;
        let key = match property {
            MemberProp::Named(name) => Key::Name(Cow::Owned(name.clone())),
            MemberProp::Computed(expr) => Key::from_value(&self.eval(expr, env)?),
        };
        Ok((object, key))
    }

    fn eval_array(&mut self, elements: &[ArrayElem], env: &Env) -> Completion<JsValue> {
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                ArrayElem::Expr(expr) => items.push(self.eval(expr, env)?),
                ArrayElem::Spread(expr) => {
                    let value = self.eval(expr, env)?;
                    items.extend(self.iterate(&value)?);
                }
                ArrayElem::Hole => items.push(JsValue::Undefined),
            }
        }
        self.check_array_length(items.len())?;
        Ok(JsValue::array(items))
    }

    fn eval_object(&mut self, props: &[PropDef], env: &Env) -> Completion<JsValue> {
        let object = self.new_object();
        for prop in props {
            match prop {
                PropDef::KeyValue(key, value) => {
                    let key = match key {
                        PropKey::Named(name) => name.clone(),
                        PropKey::Computed(expr) => {
                            Key::from_value(&self.eval(expr, env)?).name().into_owned()
                        }
                    };
                    let value = self.eval(value, env)?;
                    object.borrow_mut().props.set(&key, value);
                }
                PropDef::Spread(expr) => {
                    let source = self.eval(expr, env)?;
                    for key in self.own_keys(&source) {
                        let value = self.get_property(&source, &Key::named(&key))?;
                        object.borrow_mut().props.set(&key, value);
                    }
                }
            }
        }
        Ok(JsValue::Object(object))
    }

    fn eval_function(&mut self, def: &Rc<FunctionDef>, env: &Env) -> JsValue {
        match &def.name {
            Some(name) if !def.is_arrow => {
                // A named function expression sees itself under its name.
                let scope = Env::block(env);
                let function = self.make_closure(def, &scope);
                scope.declare(name, Some(function.clone()), false);
                function
            }
            _ => self.make_closure(def, env),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, argument: &Expr, env: &Env) -> Completion<JsValue> {
        match op {
            UnaryOp::Typeof => {
                let value = match argument {
                    Expr::Ident(name) => match env.lookup(name) {
                        Ok(value) => value,
                        Err(BindingError::NotDefined) => JsValue::Undefined,
                        Err(error) => return Err(self.binding_error(error, name)),
                    },
                    other => self.eval(other, env)?,
                };
                Ok(value.type_of().into())
            }
            UnaryOp::Delete => {
                if let Expr::Member { .. } = argument {
                    let (object, key) = self.resolve_member(argument, env)?;
                    self.delete_property(&object, &key);
                } else {
                    self.eval(argument, env)?;
                }
                Ok(true.into())
            }
            UnaryOp::Not => Ok((!self.eval(argument, env)?.is_truthy()).into()),
            UnaryOp::Neg => Ok((-self.eval(argument, env)?.to_number()).into()),
            UnaryOp::Plus => Ok(self.eval(argument, env)?.to_number().into()),
            UnaryOp::BitNot => Ok(f64::from(!self.eval(argument, env)?.to_int32()).into()),
            UnaryOp::Void => {
                self.eval(argument, env)?;
                Ok(JsValue::Undefined)
            }
        }
    }

    fn eval_update(
        &mut self,
        increment: bool,
        prefix: bool,
        target: &Expr,
        env: &Env,
    ) -> Completion<JsValue> {
        let delta = if increment { 1.0 } else { -1.0 };
        let old = match target {
            Expr::Ident(name) => {
                let old = self.lookup(name, env)?.to_number();
                self.assign_name(name, (old + delta).into(), env)?;
                old
            }
            Expr::Member { .. } => {
                let (object, key) = self.resolve_member(target, env)?;
                let old = self.get_property(&object, &key)?.to_number();
                self.set_property(&object, &key, (old + delta).into())?;
                old
            }
            _ => {
                return Err(self.throw(
                    ErrorType::SyntaxError,
                    "Invalid left-hand side expression in postfix operation",
                ));
            }
        };
        Ok(JsValue::Number(if prefix { old + delta } else { old }))
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Pattern,
        value: &Expr,
        env: &Env,
    ) -> Completion<JsValue> {
        match op {
            AssignOp::Assign => {
                if let Pattern::Member(member) = target {
                    // The target is resolved before the right-hand side runs.
                    let (object, key) = self.resolve_member(member, env)?;
                    let value = self.eval(value, env)?;
                    self.set_property(&object, &key, value.clone())?;
                    return Ok(value);
                }
                let value = self.eval(value, env)?;
                self.bind_pattern(target, value.clone(), env, BindMode::Assign)?;
                Ok(value)
            }
            AssignOp::Binary(op) => {
                let (current, reference) = self.read_reference(target, env)?;
                let right = self.eval(value, env)?;
                let result = self.binary(op, &current, &right)?;
                self.write_reference(reference, result.clone(), env)?;
                Ok(result)
            }
            AssignOp::Logical(op) => {
                let (current, reference) = self.read_reference(target, env)?;
                if short_circuits(op, &current) {
                    return Ok(current);
                }
                let value = self.eval(value, env)?;
                self.write_reference(reference, value.clone(), env)?;
                Ok(value)
            }
        }
    }

    fn read_reference<'a>(
        &mut self,
        target: &'a Pattern,
        env: &Env,
    ) -> Completion<(JsValue, Reference<'a>)> {
        match target {
            Pattern::Ident(name) => Ok((self.lookup(name, env)?, Reference::Binding(name))),
            Pattern::Member(member) => {
                let (object, key) = self.resolve_member(member, env)?;
                let current = self.get_property(&object, &key)?;
                Ok((current, Reference::Property(object, key)))
            }
            _ => Err(self.throw(ErrorType::SyntaxError, "Invalid left-hand side in assignment")),
        }
    }

    fn write_reference(&mut self, reference: Reference<'_>, value: JsValue, env: &Env) -> Completion<()> {
        match reference {
            Reference::Binding(name) => self.assign_name(name, value, env),
            Reference::Property(object, key) => self.set_property(&object, &key, value),
        }
    }

    fn eval_args(&mut self, args: &[Arg], env: &Env) -> Completion<Vec<JsValue>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::Expr(expr) => values.push(self.eval(expr, env)?),
                Arg::Spread(expr) => {
                    let value = self.eval(expr, env)?;
                    values.extend(self.iterate(&value)?);
                }
            }
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Arg],
        optional: bool,
        env: &Env,
    ) -> Completion<JsValue> {
        let (function, this) = match callee {
            Expr::Member {
                object,
                property,
                optional: optional_member,
            } => {
                let object = self.eval(object, env)?;
                if *optional_member && object.is_nullish() {
                    return Ok(JsValue::Undefined);
                }
                let key = self.member_key(property, env)?;
                (self.get_property(&object, &key)?, object)
            }
            other => (self.eval(other, env)?, JsValue::Undefined),
        };
        if optional && function.is_nullish() {
            return Ok(JsValue::Undefined);
        }
        let args = self.eval_args(args, env)?;
        match &function {
            JsValue::Function(callable) => self.call_callable(callable, this, &args),
            _ => Err(self.throw(
                ErrorType::TypeError,
                format!("{} is not a function", describe(callee)),
            )),
        }
    }

    pub fn await_value(&mut self, value: JsValue) -> Completion<JsValue> {
        match value {
            JsValue::Promise(promise) => event_loop::run_until_settled(self, &promise),
            other => Ok(other),
        }
    }

    // Calls

    pub fn call_function(
        &mut self,
        function: &JsValue,
        this: JsValue,
        args: &[JsValue],
    ) -> Completion<JsValue> {
        match function {
            JsValue::Function(callable) => self.call_callable(callable, this, args),
            other => Err(self.throw(
                ErrorType::TypeError,
                format!("{} is not a function", describe_value(other)),
            )),
        }
    }

    pub fn call_callable(
        &mut self,
        callable: &Rc<Callable>,
        this: JsValue,
        args: &[JsValue],
    ) -> Completion<JsValue> {
        match &callable.kind {
            CallableKind::Script { def, env } => self.call_script(def, env, this, args),
            CallableKind::Native { func, .. } => {
                self.enter_call()?;
                let result = func(self, &this, args);
                self.call_depth -= 1;
                result
            }
            CallableKind::Resolver {
                promise,
                reject,
                settled,
            } => {
                if !settled.replace(true) {
                    let value = args.first().cloned().unwrap_or_default();
                    if *reject {
                        reject_promise(self, promise, value);
                    } else {
                        resolve_promise(self, promise, value);
                    }
                }
                Ok(JsValue::Undefined)
            }
            CallableKind::Bound {
                target,
                this,
                args: bound,
            } => {
                let mut all = bound.clone();
                all.extend_from_slice(args);
                self.call_callable(target, this.clone(), &all)
            }
        }
    }

    fn enter_call(&mut self) -> Completion<()> {
        self.check_interrupt()?;
        if self.call_depth >= self.limits.max_call_depth {
            return Err(self.throw(ErrorType::RangeError, "Maximum call stack size exceeded"));
        }
        self.call_depth += 1;
        Ok(())
    }

    fn call_script(
        &mut self,
        def: &Rc<FunctionDef>,
        closure: &Env,
        this: JsValue,
        args: &[JsValue],
    ) -> Completion<JsValue> {
        self.enter_call()?;
        let result = self.run_function_body(def, closure, this, args);
        self.call_depth -= 1;
        if !def.is_async {
            return result;
        }
        let promise = PromiseState::pending();
        match result {
            Ok(value) => resolve_promise(self, &promise, value),
            Err(Control::Throw(error)) => reject_promise(self, &promise, error),
            Err(Control::Interrupted) => return Err(Control::Interrupted),
        }
        Ok(JsValue::Promise(promise))
    }

    fn run_function_body(
        &mut self,
        def: &Rc<FunctionDef>,
        closure: &Env,
        this: JsValue,
        args: &[JsValue],
    ) -> Completion<JsValue> {
        let scope = Env::function(closure, (!def.is_arrow).then_some(this));
        if def.uses_arguments {
            scope.declare("arguments", Some(JsValue::array(args.to_vec())), true);
        }
        let declare = BindMode::Declare { mutable: true };
        for (index, param) in def.params.iter().enumerate() {
            let arg = args.get(index).cloned().unwrap_or_default();
            self.bind_pattern(param, arg, &scope, declare)?;
        }
        if let Some(rest) = &def.rest {
            let extra = args.get(def.params.len()..).map(<[JsValue]>::to_vec);
            self.bind_pattern(rest, JsValue::array(extra.unwrap_or_default()), &scope, declare)?;
        }
        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, &scope),
            FunctionBody::Block(body) => {
                self.hoist(body, &scope);
                match self.exec_statements(body, &scope)? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(JsValue::Undefined),
                }
            }
        }
    }

    pub fn construct(&mut self, constructor: &JsValue, args: &[JsValue]) -> Completion<JsValue> {
        match constructor {
            JsValue::Function(callable) => self.construct_callable(callable, args),
            other => Err(self.throw(
                ErrorType::TypeError,
                format!("{} is not a constructor", describe_value(other)),
            )),
        }
    }

    fn construct_callable(&mut self, callable: &Rc<Callable>, args: &[JsValue]) -> Completion<JsValue> {
        match &callable.kind {
            CallableKind::Script { def, .. } if !def.is_arrow && !def.is_async => {
                let proto = match self.function_property(callable, &Key::named("prototype")) {
                    JsValue::Object(proto) => proto,
                    _ => self.intrinsics.object_proto.clone(),
                };
                let instance = JsValue::Object(shared(JsObject::with_proto(Some(proto))));
                let result = self.call_callable(callable, instance.clone(), args)?;
                Ok(if result.identity().is_some() { result } else { instance })
            }
            CallableKind::Native {
                construct: Some(construct),
                ..
            } => {
                self.enter_call()?;
                let result = construct(self, &JsValue::Undefined, args);
                self.call_depth -= 1;
                result
            }
            CallableKind::Bound {
                target,
                args: bound,
                ..
            } => {
                let mut all = bound.clone();
                all.extend_from_slice(args);
                self.construct_callable(target, &all)
            }
            _ => Err(self.throw(
                ErrorType::TypeError,
                format!("{} is not a constructor", callable.name()),
            )),
        }
    }

    // Properties

    pub fn get_named(&self, object: &JsValue, name: &str) -> Completion<JsValue> {
        self.get_property(object, &Key::named(name))
    }

    pub fn get_property(&self, object: &JsValue, key: &Key<'_>) -> Completion<JsValue> {
        let proto = match object {
            JsValue::Undefined | JsValue::Null => {
                return Err(self.throw(
                    ErrorType::TypeError,
                    format!(
                        "Cannot read properties of {} (reading '{key}')",
                        object.to_js_string()
                    ),
                ));
            }
            JsValue::Array(items) => {
                if key.is("length") {
                    return Ok(items.borrow().len().into());
                }
                if let Some(index) = key.index() {
                    return Ok(items.borrow().get(index).cloned().unwrap_or_default());
                }
                &self.intrinsics.array_proto
            }
            JsValue::String(s) => {
                if key.is("length") {
                    return Ok(string::utf16_len(s).into());
                }
                if let Some(index) = key.index() {
                    return Ok(string::unit_at(s, index).map_or(JsValue::Undefined, JsValue::from));
                }
                &self.intrinsics.string_proto
            }
            JsValue::Object(object) => {
                return Ok(object.borrow().get(&key.name()).unwrap_or_default());
            }
            JsValue::Function(callable) => return Ok(self.function_property(callable, key)),
            JsValue::Map(data) | JsValue::Set(data) if key.is("size") => {
                return Ok(data.borrow().len().into());
            }
            JsValue::Map(_) => &self.intrinsics.map_proto,
            JsValue::Set(_) => &self.intrinsics.set_proto,
            JsValue::Promise(_) => &self.intrinsics.promise_proto,
            JsValue::Number(_) => &self.intrinsics.number_proto,
            JsValue::Bool(_) => &self.intrinsics.boolean_proto,
        };
        Ok(proto.borrow().get(&key.name()).unwrap_or_default())
    }

    fn function_property(&self, callable: &Rc<Callable>, key: &Key<'_>) -> JsValue {
        let name = key.name();
        if let Some(value) = callable.props.borrow().get(&name) {
            return value.clone();
        }
        match (&callable.kind, name.as_ref()) {
            (CallableKind::Script { def, .. }, "prototype") if !def.is_arrow => {
                let proto = self.new_object();
                proto
                    .borrow_mut()
                    .props
                    .set("constructor", JsValue::Function(callable.clone()));
                let proto = JsValue::Object(proto);
                callable.props.borrow_mut().set("prototype", proto.clone());
                proto
            }
            (_, "name") => callable.name().into(),
            (CallableKind::Script { def, .. }, "length") => def.params.len().into(),
            _ => self
                .intrinsics
                .function_proto
                .borrow()
                .get(&name)
                .unwrap_or_default(),
        }
    }

    pub fn set_named(&self, object: &JsValue, name: &str, value: JsValue) -> Completion<()> {
        self.set_property(object, &Key::named(name), value)
    }

    pub fn set_property(&self, object: &JsValue, key: &Key<'_>, value: JsValue) -> Completion<()> {
        match object {
            JsValue::Undefined | JsValue::Null => Err(self.throw(
                ErrorType::TypeError,
                format!(
                    "Cannot set properties of {} (setting '{key}')",
                    object.to_js_string()
                ),
            )),
            JsValue::Array(items) => {
                if key.is("length") {
                    let length = value.to_number();
                    if length.fract() != 0.0 || !(0.0..4_294_967_296.0).contains(&length) {
                        return Err(self.throw(ErrorType::RangeError, "Invalid array length"));
                    }
                    self.check_array_length(length as usize)?;
                    items.borrow_mut().resize(length as usize, JsValue::Undefined);
                    return Ok(());
                }
                if let Some(index) = key.index() {
                    if index >= items.borrow().len() {
                        self.check_array_length(index + 1)?;
                        items.borrow_mut().resize(index + 1, JsValue::Undefined);
                    }
                    items.borrow_mut()[index] = value;
                }
                Ok(())
            }
            JsValue::Object(object) => {
                object.borrow_mut().props.set(&key.name(), value);
                Ok(())
            }
            JsValue::Function(callable) => {
                callable.props.borrow_mut().set(&key.name(), value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn delete_property(&self, object: &JsValue, key: &Key<'_>) {
        match object {
            JsValue::Object(object) => {
                object.borrow_mut().props.remove(&key.name());
            }
            JsValue::Function(callable) => {
                callable.props.borrow_mut().remove(&key.name());
            }
            JsValue::Array(items) => {
                if let Some(index) = key.index() {
                    if let Some(slot) = items.borrow_mut().get_mut(index) {
                        *slot = JsValue::Undefined;
                    }
                }
            }
            _ => {}
        }
    }

    /// Enumerable own keys in property order.
    pub fn own_keys(&self, value: &JsValue) -> Vec<Rc<str>> {
        let indices = |length: usize| -> Vec<Rc<str>> {
            (0..length).map(|i| Rc::from(i.to_string())).collect()
        };
        match value {
            JsValue::Object(object) => object.borrow().props.keys(),
            JsValue::Array(items) => indices(items.borrow().len()),
            JsValue::String(s) => indices(string::utf16_len(s)),
            JsValue::Function(callable) => callable
                .props
                .borrow()
                .keys()
                .into_iter()
                .filter(|key| &**key != "prototype")
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn proto_of(&self, value: &JsValue) -> Option<Shared<JsObject>> {
        match value {
            JsValue::Object(object) => object.borrow().proto.clone(),
            JsValue::Array(_) => Some(self.intrinsics.array_proto.clone()),
            JsValue::Function(_) => Some(self.intrinsics.function_proto.clone()),
            JsValue::Promise(_) => Some(self.intrinsics.promise_proto.clone()),
            JsValue::Map(_) => Some(self.intrinsics.map_proto.clone()),
            JsValue::Set(_) => Some(self.intrinsics.set_proto.clone()),
            _ => None,
        }
    }

    fn has_property(&self, object: &JsValue, key: &JsValue) -> Completion<bool> {
        let key = Key::from_value(key);
        let found = match object {
            JsValue::Object(object) => object.borrow().get(&key.name()).is_some(),
            JsValue::Array(items) => {
                key.is("length")
                    || key.index().is_some_and(|i| i < items.borrow().len())
                    || self.intrinsics.array_proto.borrow().get(&key.name()).is_some()
            }
            JsValue::Function(callable) => {
                callable.props.borrow().contains(&key.name())
                    || !self.function_property(callable, &key).is_nullish()
            }
            JsValue::Map(_) | JsValue::Set(_) | JsValue::Promise(_) => self
                .proto_of(object)
                .is_some_and(|proto| proto.borrow().get(&key.name()).is_some()),
            other => {
                return Err(self.throw(
                    ErrorType::TypeError,
                    format!(
                        "Cannot use 'in' operator to search for '{key}' in {}",
                        other.to_js_string()
                    ),
                ));
            }
        };
        Ok(found)
    }

    fn instance_of(&self, value: &JsValue, constructor: &JsValue) -> Completion<bool> {
        if !constructor.is_callable() {
            return Err(self.throw(
                ErrorType::TypeError,
                "Right-hand side of 'instanceof' is not callable",
            ));
        }
        let JsValue::Object(target) = self.get_named(constructor, "prototype")? else {
            return Ok(false);
        };
        let mut current = self.proto_of(value);
        while let Some(proto) = current {
            if Rc::ptr_eq(&proto, &target) {
                return Ok(true);
            }
            current = proto.borrow().proto.clone();
        }
        Ok(false)
    }

    /// Materializes an iterable: arrays, strings (by code point), `Map`
    /// entries and `Set` values.
    pub fn iterate(&self, value: &JsValue) -> Completion<Vec<JsValue>> {
        match value {
            JsValue::Array(items) => Ok(items.borrow().clone()),
            JsValue::String(s) => Ok(s.chars().map(|c| JsValue::from(c.to_string())).collect()),
            JsValue::Map(data) => Ok(data
                .borrow()
                .entries()
                .into_iter()
                .map(|(key, value)| JsValue::array(vec![key, value]))
                .collect()),
            JsValue::Set(data) => Ok(data.borrow().entries().into_iter().map(|(key, _)| key).collect()),
            other => Err(self.throw(
                ErrorType::TypeError,
                format!("{} is not iterable", describe_value(other)),
            )),
        }
    }

    // Operators

    pub(crate) fn binary(
        &mut self,
        op: BinaryOp,
        left: &JsValue,
        right: &JsValue,
    ) -> Completion<JsValue> {
        let numeric = |apply: fn(f64, f64) -> f64| {
            JsValue::Number(apply(left.to_number(), right.to_number()))
        };
        let shift = right.to_uint32() & 31;
        let value = match op {
            BinaryOp::Add => self.add(left, right)?,
            BinaryOp::Sub => numeric(|a, b| a - b),
            BinaryOp::Mul => numeric(|a, b| a * b),
            BinaryOp::Div => numeric(|a, b| a / b),
            BinaryOp::Rem => numeric(|a, b| a % b),
            BinaryOp::Pow => numeric(pow),
            BinaryOp::Eq => loose_equals(left, right).into(),
            BinaryOp::NotEq => (!loose_equals(left, right)).into(),
            BinaryOp::StrictEq => strict_equals(left, right).into(),
            BinaryOp::StrictNotEq => (!strict_equals(left, right)).into(),
            BinaryOp::Lt => (compare(left, right) == Some(CmpOrdering::Less)).into(),
            BinaryOp::Gt => (compare(left, right) == Some(CmpOrdering::Greater)).into(),
            BinaryOp::LtEq => matches!(
                compare(left, right),
                Some(CmpOrdering::Less | CmpOrdering::Equal)
            )
            .into(),
            BinaryOp::GtEq => matches!(
                compare(left, right),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            )
            .into(),
            BinaryOp::BitAnd => f64::from(left.to_int32() & right.to_int32()).into(),
            BinaryOp::BitOr => f64::from(left.to_int32() | right.to_int32()).into(),
            BinaryOp::BitXor => f64::from(left.to_int32() ^ right.to_int32()).into(),
            BinaryOp::Shl => f64::from(left.to_int32().wrapping_shl(shift)).into(),
            BinaryOp::Shr => f64::from(left.to_int32() >> shift).into(),
            BinaryOp::UShr => f64::from(left.to_uint32() >> shift).into(),
            BinaryOp::In => self.has_property(right, left)?.into(),
            BinaryOp::InstanceOf => self.instance_of(left, right)?.into(),
        };
        Ok(value)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Scopes and the closures stored in them form reference cycles.
        self.event_loop.reset();
        self.intrinsics.clear();
        for env in self.closure_envs.drain(..).filter_map(|weak| weak.upgrade()) {
            env.clear_chain();
        }
        self.globals.clear_chain();
    }
}

fn loop_exit(flow: Flow, label: Option<&str>) -> Option<Flow> {
    match flow {
        Flow::Normal => None,
        Flow::Break(None) => Some(Flow::Normal),
        Flow::Continue(None) => None,
        Flow::Continue(Some(target)) if Some(target.as_str()) == label => None,
        other => Some(other),
    }
}

fn short_circuits(op: LogicalOp, left: &JsValue) -> bool {
    match op {
        LogicalOp::And => !left.is_truthy(),
        LogicalOp::Or => left.is_truthy(),
        LogicalOp::Nullish => !left.is_nullish(),
    }
}

fn is_loop(stmt: &Stmt) -> bool {
    matches!(
        stmt,
        Stmt::For { .. }
            | Stmt::ForOf { .. }
            | Stmt::ForIn { .. }
            | Stmt::While { .. }
            | Stmt::DoWhile { .. }
    )
}

fn is_lexical_declaration(stmt: &Stmt) -> bool {
    matches!(
        stmt,
        Stmt::Function(_)
            | Stmt::VarDecl {
                kind: DeclKind::Let | DeclKind::Const,
                ..
            }
    )
}

fn pattern_names(pattern: &Pattern, names: &mut Vec<String>) {
    match pattern {
        Pattern::Ident(name) => names.push(name.clone()),
        Pattern::Array { elements, rest } => {
            for element in elements.iter().flatten() {
                pattern_names(element, names);
            }
            if let Some(rest) = rest {
                pattern_names(rest, names);
            }
        }
        Pattern::Object { props, rest } => {
            for (_, target) in props {
                pattern_names(target, names);
            }
            if let Some(rest) = rest {
                pattern_names(rest, names);
            }
        }
        Pattern::Default { target, .. } => pattern_names(target, names),
        Pattern::Member(_) => {}
    }
}

/// `var` names declared anywhere in `stmt`, not descending into functions.
fn collect_var_names(stmt: &Stmt, names: &mut Vec<String>) {
    let var_head = |head: &ForHead, names: &mut Vec<String>| {
        if head.kind == Some(DeclKind::Var) {
            pattern_names(&head.target, names);
        }
    };
    match stmt {
        Stmt::VarDecl {
            kind: DeclKind::Var,
            decls,
        } => {
            for decl in decls {
                pattern_names(&decl.target, names);
            }
        }
        Stmt::If {
            consequent,
            alternate,
            ..
        } => {
            collect_var_names(consequent, names);
            if let Some(alternate) = alternate {
                collect_var_names(alternate, names);
            }
        }
        Stmt::Block(body) => body.iter().for_each(|s| collect_var_names(s, names)),
        Stmt::For { init, body, .. } => {
            if let Some(ForInit::VarDecl {
                kind: DeclKind::Var,
                decls,
            }) = init.as_deref()
            {
                for decl in decls {
                    pattern_names(&decl.target, names);
                }
            }
            collect_var_names(body, names);
        }
        Stmt::ForOf { head, body, .. } | Stmt::ForIn { head, body, .. } => {
            var_head(head, names);
            collect_var_names(body, names);
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::Labeled { body, .. } => {
            collect_var_names(body, names)
        }
        Stmt::Try {
            block,
            handler,
            finalizer,
            ..
        } => {
            let blocks = [Some(block), handler.as_ref(), finalizer.as_ref()];
            for body in blocks.into_iter().flatten() {
                body.iter().for_each(|s| collect_var_names(s, names));
            }
        }
        Stmt::Switch { cases, .. } => {
            for case in cases {
                case.body.iter().for_each(|s| collect_var_names(s, names));
            }
        }
        _ => {}
    }
}

/// Source-like rendering of a callee for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::This => "this".to_string(),
        Expr::Member {
            object,
            property: MemberProp::Named(name),
            ..
        } => format!("{}.{name}", describe(object)),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        _ => "expression".to_string(),
    }
}

fn describe_value(value: &JsValue) -> String {
    match value {
        JsValue::String(s) => format!("\"{s}\""),
        JsValue::Array(_) | JsValue::Object(_) => "object".to_string(),
        other => other.to_js_string(),
    }
}

fn to_primitive(value: &JsValue) -> Cow<'_, JsValue> {
    if value.identity().is_some() {
        Cow::Owned(JsValue::from(value.to_js_string()))
    } else {
        Cow::Borrowed(value)
    }
}

fn compare(left: &JsValue, right: &JsValue) -> Option<CmpOrdering> {
    let (left, right) = (to_primitive(left), to_primitive(right));
    match (left.as_ref(), right.as_ref()) {
        (JsValue::String(a), JsValue::String(b)) => Some(a.encode_utf16().cmp(b.encode_utf16())),
        (a, b) => a.to_number().partial_cmp(&b.to_number()),
    }
}

fn pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        f64::NAN
    } else {
        base.powf(exponent)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sandbox::parser::parse;

    pub fn interpreter() -> Interpreter {
        Interpreter::new(InterpreterLimits::default(), Arc::new(AtomicU64::new(0)))
    }

    /// Interpreter whose strings stop at one mebibyte.
    fn short_strings() -> Interpreter {
        let limits = InterpreterLimits {
            max_string_length: 1 << 20,
            ..InterpreterLimits::default()
        };
        Interpreter::new(limits, Arc::new(AtomicU64::new(0)))
    }

    /// Runs the body of `main` under `short_strings` limits.
    fn eval_short(body: &str) -> String {
        let source = format!("function main() {{ {body} }}");
        with_big_stack(move || {
            let mut interp = short_strings();
            let program = parse(&source).map_err(|e| e.to_string())?;
            let scope = interp.run_program(&program).map_err(describe_control)?;
            let function = scope.lookup("main").map_err(|e| format!("{e:?}"))?;
            interp
                .invoke(&function, &[])
                .map(|value| value.to_js_string())
                .map_err(describe_control)
        })
        .unwrap_or_else(|error| format!("threw {error}"))
    }

    /// Runs `test` on a thread with a worker-sized stack.
    pub fn with_big_stack<T: Send + 'static>(test: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(1 << 30)
            .spawn(test)
            .expect("spawn test thread")
            .join()
            .expect("test thread panicked")
    }

    /// Loads `source`, calls the global function `entry` with numeric
    /// `args` and renders the outcome.
    pub fn call(source: &str, entry: &str, args: &[f64]) -> Result<String, String> {
        let (source, entry, args) = (source.to_string(), entry.to_string(), args.to_vec());
        with_big_stack(move || {
            let mut interp = interpreter();
            let program = parse(&source).map_err(|e| e.to_string())?;
            let scope = interp.run_program(&program).map_err(describe_control)?;
            let function = scope.lookup(&entry).map_err(|e| format!("{e:?}"))?;
            let args: Vec<JsValue> = args.into_iter().map(JsValue::from).collect();
            interp
                .invoke(&function, &args)
                .map(|value| value.to_js_string())
                .map_err(describe_control)
        })
    }

    fn describe_control(control: Control) -> String {
        match control {
            Control::Throw(value) => value.to_js_string(),
            Control::Interrupted => "interrupted".to_string(),
        }
    }

    fn eval_str(body: &str) -> String {
        match call(&format!("function main() {{ {body} }}"), "main", &[]) {
            Ok(value) => value,
            Err(error) => format!("threw {error}"),
        }
    }

    #[test]
    fn test_arithmetic_and_coercion() {
        assert_eq!(eval_str("return 1 + 2 * 3 ** 2;"), "19");
        assert_eq!(eval_str("return '1' + 2;"), "12");
        assert_eq!(eval_str("return [1, 2] + 3;"), "1,23");
        assert_eq!(eval_str("return 7 % -3;"), "1");
        assert_eq!(eval_str("return -7 >>> 28;"), "15");
        assert_eq!(eval_str("return 1 << 31;"), "-2147483648");
        assert_eq!(eval_str("return 'b' > 'a' && 10 > 9 && '10' < '9';"), "true");
        assert_eq!(eval_str("return null ?? 'fallback';"), "fallback");
    }

    #[test]
    fn test_closures_capture_per_iteration_bindings() {
        let result = eval_str(
            "const fns = [];
             for (let i = 0; i < 3; i++) { fns.push(() => i); }
             return fns.map(f => f()).join(',');",
        );
        assert_eq!(result, "0,1,2");
    }

    #[test]
    fn test_var_is_function_scoped() {
        let result = eval_str(
            "if (true) { var x = 1; }
             for (var i = 0; i < 3; i++) {}
             return x + i;",
        );
        assert_eq!(result, "4");
    }

    #[test]
    fn test_function_declarations_are_hoisted() {
        assert_eq!(eval_str("return twice(4); function twice(n) { return n * 2; }"), "8");
    }

    #[test]
    fn test_temporal_dead_zone() {
        assert_eq!(
            eval_str("x; let x = 1;"),
            "threw ReferenceError: Cannot access 'x' before initialization"
        );
    }

    #[test]
    fn test_const_assignment_throws() {
        assert_eq!(
            eval_str("const a = 1; a = 2;"),
            "threw TypeError: Assignment to constant variable."
        );
    }

    #[test]
    fn test_reading_property_of_undefined() {
        assert_eq!(
            eval_str("let o; return o.x;"),
            "threw TypeError: Cannot read properties of undefined (reading 'x')"
        );
    }

    #[test]
    fn test_calling_non_function_names_callee() {
        assert_eq!(
            eval_str("const arr = [1]; arr.nope();"),
            "threw TypeError: arr.nope is not a function"
        );
    }

    #[test]
    fn test_destructuring_and_spread() {
        let result = eval_str(
            "const [a, , b = 5, ...rest] = [1, 2, undefined, 4, 6];
             const { x, y: { z }, ...others } = { x: 1, y: { z: 2 }, p: 3, q: 4 };
             return [a, b, rest.length, x, z, Object.keys(others).join('')].join(' ');",
        );
        assert_eq!(result, "1 5 2 1 2 pq");
    }

    #[test]
    fn test_swap_by_destructuring_assignment() {
        assert_eq!(
            eval_str("const a = [3, 1]; [a[0], a[1]] = [a[1], a[0]]; return a.join();"),
            "1,3"
        );
    }

    #[test]
    fn test_labeled_continue_and_break() {
        let result = eval_str(
            "let hits = 0;
             outer: for (let i = 0; i < 3; i++) {
               for (let j = 0; j < 3; j++) {
                 if (j === 1) continue outer;
                 if (i === 2) break outer;
                 hits++;
               }
             }
             return hits;",
        );
        assert_eq!(result, "2");
    }

    #[test]
    fn test_switch_falls_through_to_break() {
        let result = eval_str(
            "let log = '';
             switch (2) { case 1: log += 'a'; case 2: log += 'b'; case 3: log += 'c'; break; default: log += 'd'; }
             return log;",
        );
        assert_eq!(result, "bc");
    }

    #[test]
    fn test_try_catch_finally() {
        let result = eval_str(
            "let log = [];
             try { throw new RangeError('bad'); }
             catch (e) { log.push(e.name, e.message, e instanceof RangeError, e instanceof Error); }
             finally { log.push('done'); }
             return log.join(' ');",
        );
        assert_eq!(result, "RangeError bad true true done");
    }

    #[test]
    fn test_finally_return_overrides() {
        assert_eq!(eval_str("try { return 1; } finally { return 2; }"), "2");
    }

    #[test]
    fn test_constructor_functions_and_prototypes() {
        let result = eval_str(
            "function Point(x) { this.x = x; }
             Point.prototype.double = function () { return this.x * 2; };
             const p = new Point(21);
             return p.double() + (p instanceof Point ? 1 : 0);",
        );
        assert_eq!(result, "43");
    }

    #[test]
    fn test_arguments_and_rest_parameters() {
        assert_eq!(
            eval_str("function f() { return arguments.length; } return f(1, 2, 3);"),
            "3"
        );
        assert_eq!(
            eval_str("const f = (a, ...r) => a + r.length; return f(1, 2, 3);"),
            "3"
        );
    }

    #[test]
    fn test_recursion_limit_is_a_range_error() {
        assert_eq!(
            eval_str("function f() { return f(); } return f();"),
            "threw RangeError: Maximum call stack size exceeded"
        );
    }

    #[test]
    fn test_deep_recursion_within_limit() {
        assert_eq!(
            eval_str("function depth(n) { return n === 0 ? 0 : 1 + depth(n - 1); } return depth(8000);"),
            "8000"
        );
    }

    #[test]
    fn test_string_doubling_stops_at_length_limit() {
        assert_eq!(
            eval_short("let s = 'x'; for (let i = 0; i < 40; i++) s += s; return s.length;"),
            "threw RangeError: Invalid string length"
        );
        assert_eq!(
            eval_short("let s = 'x'; for (let i = 0; i < 40; i++) { try { s += s; } catch (e) { return s.length; } }"),
            "1048576"
        );
    }

    #[test]
    fn test_every_string_builder_is_bounded() {
        let too_long = "threw RangeError: Invalid string length";
        let big = "const big = 'ab'.repeat(300000);";
        assert_eq!(eval_short(&format!("{big} return `${{big}}${{big}}`;")), too_long);
        assert_eq!(eval_short(&format!("{big} return [big, big].join('');")), too_long);
        assert_eq!(eval_short(&format!("{big} return String([big, big]);")), too_long);
        assert_eq!(eval_short(&format!("{big} return big.concat(big);")), too_long);
        assert_eq!(eval_short(&format!("{big} return big.replace('a', big);")), too_long);
        assert_eq!(eval_short(&format!("{big} return [big] + big;")), too_long);
        assert_eq!(eval_short(&format!("{big} return JSON.stringify({{ a: big, b: big }});")), too_long);
        assert_eq!(eval_short(&format!("{big} return big.padEnd(2e6, '-');")), too_long);
        assert_eq!(eval_short("return 'x'.repeat(1 << 21);"), too_long);
        assert_eq!(eval_short(&format!("{big} return (big + big.slice(500000)).length;")), "700000");
    }

    #[test]
    fn test_async_function_resolves_through_await() {
        let result = call(
            "async function main(x) {
               const doubled = await new Promise(resolve => setTimeout(() => resolve(x * 2), 1));
               return doubled + await 1;
             }",
            "main",
            &[20.0],
        );
        assert_eq!(result, Ok("41".to_string()));
    }

    #[test]
    fn test_async_rejection_surfaces_as_throw() {
        let result = call(
            "async function main() { throw new Error('nope'); }",
            "main",
            &[],
        );
        assert_eq!(result, Err("Error: nope".to_string()));
    }

    #[test]
    fn test_cancellation_interrupts_infinite_loop() {
        let cancel = Arc::new(AtomicU64::new(0));
        let mut interp = Interpreter::new(InterpreterLimits::default(), cancel.clone());
        let program = parse("function spin() { while (true) {} }").unwrap();
        let scope = interp.run_program(&program).unwrap();
        let spin = scope.lookup("spin").unwrap();
        let flag = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            flag.fetch_add(1, Ordering::SeqCst);
        });
        let result = interp.invoke(&spin, &[]);
        canceller.join().unwrap();
        assert!(matches!(result, Err(Control::Interrupted)));
    }

    #[test]
    fn test_interrupt_is_not_catchable() {
        let cancel = Arc::new(AtomicU64::new(0));
        let mut interp = Interpreter::new(InterpreterLimits::default(), cancel.clone());
        let program =
            parse("function spin() { try { while (true) {} } catch (e) { return 1; } }").unwrap();
        let scope = interp.run_program(&program).unwrap();
        let spin = scope.lookup("spin").unwrap();
        cancel.fetch_add(1, Ordering::SeqCst);
        assert!(matches!(interp.invoke(&spin, &[]), Err(Control::Interrupted)));
    }

    #[test]
    fn test_for_of_over_strings_maps_and_sets() {
        let result = eval_str(
            "let out = '';
             for (const ch of 'ab') out += ch;
             for (const [k, v] of new Map([['x', 1]])) out += k + v;
             for (const v of new Set([3, 3, 4])) out += v;
             for (const k in { p: 1, q: 2 }) out += k;
             return out;",
        );
        assert_eq!(result, "abx134pq");
    }
}
