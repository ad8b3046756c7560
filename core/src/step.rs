//! Normalized step and case definitions.

use crate::error::StepError;
use crate::eval::render;
use crate::metadata::StepKind;
use crate::scope::Declarations;
use crate::validate::Validator;
use serde_json::{Map, Value};
use tracing::warn;

/// A hook action: either binds the evaluated content to a name or
/// evaluates it for its side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Hook {
    Assign { name: String, content: Value },
    Call(Value),
}

impl Hook {
    pub fn parse(raw: &Value) -> Self {
        match raw {
            Value::Object(map) if map.len() == 1 => {
                let (name, content) = map
                    .iter()
                    .next()
                    .map(|(name, content)| (name.clone(), content.clone()))
                    .unwrap_or_default();
                Hook::Assign { name, content }
            }
            other => Hook::Call(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipDirective {
    Always(Value),
    If(Value),
    Unless(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepBody {
    Request(Value),
    Database(Value),
    Plugin(Value),
    Composite(Box<TestCase>),
}

impl StepBody {
    pub fn kind(&self) -> StepKind {
        match self {
            StepBody::Request(_) => StepKind::Http,
            StepBody::Database(_) => StepKind::Database,
            StepBody::Plugin(_) => StepKind::Plugin,
            StepBody::Composite(_) => StepKind::Composite,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub skip: Option<SkipDirective>,
    pub variables: Declarations,
    pub body: StepBody,
    pub base_url: Option<Value>,
    pub extract: Vec<(String, String)>,
    pub validators: Vec<Validator>,
    pub setup_hooks: Vec<Hook>,
    pub teardown_hooks: Vec<Hook>,
    pub export: Vec<String>,
}

impl StepSpec {
    pub fn from_value(raw: &Value) -> Result<Self, StepError> {
        let map = lower_keys(
            raw.as_object()
                .ok_or_else(|| StepError::params(format!("step must be a mapping: {raw}")))?,
        );
        let name = map.get("name").map(render).unwrap_or_default();

        let skip = if let Some(reason) = map.get("skip") {
            Some(SkipDirective::Always(reason.clone()))
        } else if let Some(condition) = map.get("skipif") {
            Some(SkipDirective::If(condition.clone()))
        } else {
            map.get("skipunless")
                .map(|condition| SkipDirective::Unless(condition.clone()))
        };

        let validators = match map.get("validate").or_else(|| map.get("validators")) {
            Some(Value::Array(items)) => Validator::parse_all(items)?,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(StepError::params(format!(
                    "step '{name}': validate must be a list, got {other}"
                )))
            }
        };

        Ok(Self {
            body: select_body(&name, &map)?,
            skip,
            variables: variables_from(map.get("variables"))?,
            base_url: map.get("base_url").cloned(),
            extract: extractors_from(&name, map.get("extract"))?,
            validators,
            setup_hooks: hooks_from(map.get("setup_hooks")),
            teardown_hooks: hooks_from(map.get("teardown_hooks")),
            export: names_from(map.get("export")),
            name,
        })
    }

    pub fn kind(&self) -> StepKind {
        self.body.kind()
    }

    /// HTTP method of a request step, as written.
    pub fn method(&self) -> Option<String> {
        match &self.body {
            StepBody::Request(request) => request
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_uppercase),
            _ => None,
        }
    }
}

fn select_body(name: &str, map: &Map<String, Value>) -> Result<StepBody, StepError> {
    if map.contains_key("teststeps") {
        return TestCase::from_map(map).map(|case| StepBody::Composite(Box::new(case)));
    }

    let present: Vec<&str> = ["database", "plugin", "request"]
        .into_iter()
        .filter(|key| map.contains_key(*key))
        .collect();
    if present.len() > 1 {
        warn!(
            "step '{name}' declares {}; using '{}'",
            present.join(", "),
            present[0]
        );
    }

    match present.first() {
        Some(&"database") => Ok(StepBody::Database(map["database"].clone())),
        Some(&"plugin") => Ok(StepBody::Plugin(map["plugin"].clone())),
        Some(_) => Ok(StepBody::Request(lower_request_keys(&map["request"]))),
        None => Err(StepError::params(format!(
            "step '{name}' has none of request, database, plugin or teststeps"
        ))),
    }
}

fn lower_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.to_lowercase(), value.clone()))
        .collect()
}

fn lower_request_keys(request: &Value) -> Value {
    match request {
        Value::Object(map) => Value::Object(lower_keys(map)),
        other => other.clone(),
    }
}

/// Variables as a mapping or a list of single-entry mappings.
pub fn variables_from(raw: Option<&Value>) -> Result<Declarations, StepError> {
    let mut variables = Declarations::new();
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            variables.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Value::Object(entry) = item else {
                    return Err(StepError::params(format!(
                        "variable entry must be a mapping, got {item}"
                    )));
                };
                variables.extend(entry.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Some(other) => {
            return Err(StepError::params(format!(
                "variables must be a mapping, got {other}"
            )))
        }
    }
    Ok(variables)
}

fn extractors_from(name: &str, raw: Option<&Value>) -> Result<Vec<(String, String)>, StepError> {
    let entries: Vec<(&String, &Value)> = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(map)) => map.iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|entry| entry.iter())
            .collect(),
        Some(other) => {
            return Err(StepError::params(format!(
                "step '{name}': extract must be a mapping, got {other}"
            )))
        }
    };
    entries
        .into_iter()
        .map(|(variable, query)| match query {
            Value::String(query) => Ok((variable.clone(), query.clone())),
            other => Err(StepError::params(format!(
                "step '{name}': extractor '{variable}' must be a path query, got {other}"
            ))),
        })
        .collect()
}

fn hooks_from(raw: Option<&Value>) -> Vec<Hook> {
    match raw {
        Some(Value::Array(items)) => items.iter().map(Hook::parse).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![Hook::parse(single)],
    }
}

fn names_from(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::Array(items)) => items.iter().map(render).collect(),
        Some(Value::String(name)) => vec![name.clone()],
        _ => Vec::new(),
    }
}

/// Settings of one case, from its `config` block.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseConfig {
    pub name: String,
    pub base_url: Option<Value>,
    pub verify: bool,
    pub variables: Declarations,
    pub export: Vec<String>,
    pub setup_hooks: Vec<Hook>,
    pub teardown_hooks: Vec<Hook>,
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: None,
            verify: true,
            variables: Declarations::new(),
            export: Vec::new(),
            setup_hooks: Vec::new(),
            teardown_hooks: Vec::new(),
        }
    }
}

impl CaseConfig {
    pub fn from_value(raw: &Value) -> Result<Self, StepError> {
        let map = match raw {
            Value::Object(map) => lower_keys(map),
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(StepError::params(format!(
                    "config must be a mapping, got {other}"
                )))
            }
        };
        Ok(Self {
            name: map.get("name").map(render).unwrap_or_default(),
            base_url: map.get("base_url").cloned(),
            verify: map.get("verify").and_then(Value::as_bool).unwrap_or(true),
            variables: variables_from(map.get("variables"))?,
            export: names_from(map.get("export").or_else(|| map.get("output"))),
            setup_hooks: hooks_from(map.get("setup_hooks")),
            teardown_hooks: hooks_from(map.get("teardown_hooks")),
        })
    }
}

/// An ordered sequence of steps sharing one session.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub config: CaseConfig,
    pub teststeps: Vec<StepSpec>,
}

impl TestCase {
    pub fn from_value(raw: &Value) -> Result<Self, StepError> {
        let map = raw
            .as_object()
            .ok_or_else(|| StepError::params("test case must be a mapping"))?;
        Self::from_map(&lower_keys(map))
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self, StepError> {
        let config = CaseConfig::from_value(map.get("config").unwrap_or(&Value::Null))?;
        let steps = match map.get("teststeps") {
            Some(Value::Array(steps)) => steps,
            _ => {
                return Err(StepError::params(format!(
                    "case '{}': teststeps must be a list",
                    config.name
                )))
            }
        };
        let teststeps = steps
            .iter()
            .map(StepSpec::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, teststeps })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}
