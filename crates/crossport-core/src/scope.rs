//! Named variables with change notification.
//!
//! A [`Scope`] is the host-side object whose members get published and
//! bound. Each variable is backed by a `tokio::sync::watch` channel, which
//! serves as the change-detection hook: publications re-evaluate on every
//! change, and bindings watch the local copy to forward edits.
//!
//! Assignments are compared by value. Writing a value equal to the current
//! one is not a change and wakes nobody.

use crate::{CrossportError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Cloneable handle to a set of named JSON variables.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Arc<RwLock<HashMap<String, watch::Sender<Value>>>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable with an initial value.
    ///
    /// Re-declaring an existing variable assigns `initial` to it, keeping
    /// existing watchers attached.
    pub fn declare(&self, name: impl Into<String>, initial: Value) {
        let name = name.into();
        let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
        match vars.get(&name) {
            Some(tx) => {
                assign(tx, initial);
            }
            None => {
                let (tx, _) = watch::channel(initial);
                vars.insert(name, tx);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Current value of a variable.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|tx| tx.borrow().clone())
    }

    /// Assign a declared variable.
    ///
    /// Returns whether the value actually changed.
    pub fn set(&self, name: &str, value: Value) -> Result<bool> {
        let vars = self.vars.read().unwrap_or_else(PoisonError::into_inner);
        let tx = vars.get(name).ok_or_else(|| undeclared(name))?;
        Ok(assign(tx, value))
    }

    /// Watch a declared variable for changes.
    ///
    /// The current value counts as already seen.
    pub fn watch(&self, name: &str) -> Result<watch::Receiver<Value>> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| undeclared(name))
    }

    /// Names of all declared variables.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn assign(tx: &watch::Sender<Value>, value: Value) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

fn undeclared(name: &str) -> CrossportError {
    CrossportError::configuration(format!("scope has no variable named {:?}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declare_get_set() {
        let scope = Scope::new();
        scope.declare("user", json!({}));

        assert!(scope.contains("user"));
        assert_eq!(scope.get("user"), Some(json!({})));

        assert!(scope.set("user", json!({"name": "Alice"})).unwrap());
        assert_eq!(scope.get("user"), Some(json!({"name": "Alice"})));
    }

    #[test]
    fn test_equal_value_is_not_a_change() {
        let scope = Scope::new();
        scope.declare("x", json!({"a": [1, 2]}));
        assert!(!scope.set("x", json!({"a": [1, 2]})).unwrap());
    }

    #[test]
    fn test_undeclared_variable_is_configuration_error() {
        let scope = Scope::new();
        assert!(scope.set("missing", json!(1)).unwrap_err().is_configuration());
        assert!(scope.watch("missing").unwrap_err().is_configuration());
        assert_eq!(scope.get("missing"), None);
    }

    #[tokio::test]
    async fn test_watch_sees_changes_only() {
        let scope = Scope::new();
        scope.declare("x", Value::Null);
        let mut rx = scope.watch("x").unwrap();

        scope.set("x", Value::Null).unwrap();
        assert!(!rx.has_changed().unwrap());

        scope.set("x", json!(42)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), json!(42));
    }

    #[test]
    fn test_clones_share_variables() {
        let scope = Scope::new();
        let other = scope.clone();
        scope.declare("x", json!(1));
        other.set("x", json!(2)).unwrap();
        assert_eq!(scope.get("x"), Some(json!(2)));
        assert_eq!(other.names(), vec!["x".to_string()]);
    }
}
