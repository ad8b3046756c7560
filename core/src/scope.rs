//! Variable maps and the session/step scope they live in.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeMap;

pub type Variables = BTreeMap<String, Value>;

/// Variables as written in a case file, evaluated in declaration order.
pub type Declarations = IndexMap<String, Value>;

/// Session variables overlaid by the bindings of the step in flight.
///
/// Step bindings are discarded by [`VariableScope::end_step`]; only names
/// passed to [`VariableScope::export`] or written through
/// [`VariableScope::update_session`] outlive the step.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    session: Variables,
    step: Option<Variables>,
}

impl VariableScope {
    pub fn new(session: Variables) -> Self {
        Self {
            session,
            step: None,
        }
    }

    pub fn begin_step(&mut self) {
        self.step = Some(Variables::new());
    }

    pub fn end_step(&mut self) {
        self.step = None;
    }

    pub fn in_step(&self) -> bool {
        self.step.is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.step
            .as_ref()
            .and_then(|step| step.get(name))
            .or_else(|| self.session.get(name))
    }

    /// Binds a variable in the innermost active layer.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        match self.step.as_mut() {
            Some(step) => step.insert(name.into(), value),
            None => self.session.insert(name.into(), value),
        };
    }

    /// Writes into the session, shadowing any step binding of the same name.
    pub fn update_session(&mut self, values: Variables) {
        for (name, value) in values {
            if let Some(step) = self.step.as_mut() {
                step.insert(name.clone(), value.clone());
            }
            self.session.insert(name, value);
        }
    }

    /// Copies the current value of each name into the session.
    pub fn export(&mut self, names: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        for name in names {
            match self.get(name).cloned() {
                Some(value) => {
                    self.session.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }
        missing
    }

    pub fn session(&self) -> &Variables {
        &self.session
    }

    /// Flattened view used for evaluation.
    pub fn snapshot(&self) -> Variables {
        let mut merged = self.session.clone();
        if let Some(step) = &self.step {
            merged.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(x: i64) -> VariableScope {
        let mut vars = Variables::new();
        vars.insert("x".to_string(), json!(x));
        VariableScope::new(vars)
    }

    #[test]
    fn step_binding_shadows_then_disappears() {
        let mut scope = session(1);
        scope.begin_step();
        scope.set("x", json!(2));
        assert_eq!(scope.get("x"), Some(&json!(2)));
        assert_eq!(scope.snapshot().get("x"), Some(&json!(2)));
        scope.end_step();
        assert_eq!(scope.get("x"), Some(&json!(1)));
    }

    #[test]
    fn exported_names_survive_the_step() {
        let mut scope = session(1);
        scope.begin_step();
        scope.set("x", json!(2));
        let missing = scope.export(&["x".to_string(), "nope".to_string()]);
        scope.end_step();
        assert_eq!(scope.get("x"), Some(&json!(2)));
        assert_eq!(missing, vec!["nope".to_string()]);
    }

    #[test]
    fn session_updates_are_visible_inside_the_step() {
        let mut scope = session(1);
        scope.begin_step();
        scope.set("x", json!(2));
        let mut extracted = Variables::new();
        extracted.insert("x".to_string(), json!(3));
        scope.update_session(extracted);
        assert_eq!(scope.get("x"), Some(&json!(3)));
        scope.end_step();
        assert_eq!(scope.get("x"), Some(&json!(3)));
    }

    #[test]
    fn set_outside_a_step_targets_the_session() {
        let mut scope = VariableScope::default();
        assert!(!scope.in_step());
        scope.set("token", json!("abc"));
        assert_eq!(scope.session().get("token"), Some(&json!("abc")));
    }
}
