use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use super::value::JsValue;

struct Binding {
    /// `None` while a `let`/`const` binding is in its temporal dead zone.
    value: Option<JsValue>,
    mutable: bool,
}

struct Scope {
    bindings: HashMap<String, Binding>,
    parent: Option<Env>,
    /// Receiver of a non-arrow function call.
    this: Option<JsValue>,
    /// Target of `var` hoisting.
    is_function: bool,
}

/// Lexical environment handle.
#[derive(Clone)]
pub struct Env(Rc<RefCell<Scope>>);

/// Non-owning handle, used to break closure cycles when a context is torn down.
#[derive(Clone)]
pub struct WeakEnv(Weak<RefCell<Scope>>);

impl WeakEnv {
    pub fn upgrade(&self) -> Option<Env> {
        self.0.upgrade().map(Env)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingError {
    NotDefined,
    Uninitialized,
    Constant,
}

impl Env {
    pub fn global() -> Self {
        Self::with(None, Some(JsValue::Undefined), true)
    }

    pub fn block(parent: &Env) -> Self {
        Self::with(Some(parent.clone()), None, false)
    }

    pub fn function(parent: &Env, this: Option<JsValue>) -> Self {
        Self::with(Some(parent.clone()), this, true)
    }

    fn with(parent: Option<Env>, this: Option<JsValue>, is_function: bool) -> Self {
        Env(Rc::new(RefCell::new(Scope {
            bindings: HashMap::new(),
            parent,
            this,
            is_function,
        })))
    }

    /// Creates or replaces a binding in this scope. `None` leaves it
    /// uninitialized.
    pub fn declare(&self, name: &str, value: Option<JsValue>, mutable: bool) {
        self.0
            .borrow_mut()
            .bindings
            .insert(name.to_string(), Binding { value, mutable });
    }

    /// Declares a `var`-style binding unless one already exists here.
    pub fn declare_var(&self, name: &str) {
        let mut scope = self.0.borrow_mut();
        scope.bindings.entry(name.to_string()).or_insert(Binding {
            value: Some(JsValue::Undefined),
            mutable: true,
        });
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.0.borrow().bindings.contains_key(name)
    }

    /// Initializes a binding declared in this scope, e.g. at a `let` statement.
    pub fn initialize(&self, name: &str, value: JsValue) {
        if let Some(binding) = self.0.borrow_mut().bindings.get_mut(name) {
            binding.value = Some(value);
        }
    }

    pub fn lookup(&self, name: &str) -> Result<JsValue, BindingError> {
        let mut current = self.clone();
        loop {
            let parent = {
                let scope = current.0.borrow();
                if let Some(binding) = scope.bindings.get(name) {
                    return binding.value.clone().ok_or(BindingError::Uninitialized);
                }
                scope.parent.clone()
            };
            match parent {
                Some(parent) => current = parent,
                None => return Err(BindingError::NotDefined),
            }
        }
    }

    /// Assigns to the nearest binding named `name`. Assignments to undeclared
    /// names create a global, as sloppy-mode scripts do.
    pub fn assign(&self, name: &str, value: JsValue) -> Result<(), BindingError> {
        let mut current = self.clone();
        loop {
            let parent = {
                let mut scope = current.0.borrow_mut();
                if let Some(binding) = scope.bindings.get_mut(name) {
                    if binding.value.is_none() {
                        return Err(BindingError::Uninitialized);
                    }
                    if !binding.mutable {
                        return Err(BindingError::Constant);
                    }
                    binding.value = Some(value);
                    return Ok(());
                }
                scope.parent.clone()
            };
            match parent {
                Some(parent) => current = parent,
                None => {
                    current.declare(name, Some(value), true);
                    return Ok(());
                }
            }
        }
    }

    pub fn this_value(&self) -> JsValue {
        let mut current = self.clone();
        loop {
            let parent = {
                let scope = current.0.borrow();
                if let Some(this) = &scope.this {
                    return this.clone();
                }
                scope.parent.clone()
            };
            match parent {
                Some(parent) => current = parent,
                None => return JsValue::Undefined,
            }
        }
    }

    /// Nearest enclosing function (or global) scope.
    pub fn function_scope(&self) -> Env {
        let mut current = self.clone();
        loop {
            let parent = {
                let scope = current.0.borrow();
                if scope.is_function {
                    None
                } else {
                    scope.parent.clone()
                }
            };
            match parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    pub fn downgrade(&self) -> WeakEnv {
        WeakEnv(Rc::downgrade(&self.0))
    }

    /// Drops every binding of this scope and its ancestors. Closures stored
    /// in bindings reference their scope, so clearing breaks those cycles
    /// when a context is discarded.
    pub fn clear_chain(&self) {
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let (bindings, parent) = {
                let mut scope = env.0.borrow_mut();
                scope.this = None;
                (std::mem::take(&mut scope.bindings), scope.parent.clone())
            };
            drop(bindings);
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let global = Env::global();
        global.declare("x", Some(1.0.into()), true);
        let block = Env::block(&global);
        assert_eq!(block.lookup("x").map(|v| v.to_number()), Ok(1.0));
        assert_eq!(
            block.lookup("y").map(|v| v.to_number()),
            Err(BindingError::NotDefined)
        );
    }

    #[test]
    fn test_const_and_tdz() {
        let global = Env::global();
        global.declare("c", Some(1.0.into()), false);
        global.declare("l", None, true);
        assert_eq!(global.assign("c", 2.0.into()), Err(BindingError::Constant));
        assert!(matches!(global.lookup("l"), Err(BindingError::Uninitialized)));
        global.initialize("l", 3.0.into());
        assert_eq!(global.lookup("l").map(|v| v.to_number()), Ok(3.0));
    }

    #[test]
    fn test_undeclared_assignment_creates_global() {
        let global = Env::global();
        let inner = Env::function(&global, None);
        inner.assign("leak", true.into()).unwrap();
        assert!(global.has_own("leak"));
    }

    #[test]
    fn test_function_scope_and_this() {
        let global = Env::global();
        let func = Env::function(&global, Some(JsValue::string("receiver")));
        let block = Env::block(&func);
        assert!(Rc::ptr_eq(&block.function_scope().0, &func.0));
        assert_eq!(block.this_value().to_js_string(), "receiver");
    }
}
