//! Template evaluation for step payloads, hooks and skip conditions.
//!
//! Strings may reference variables as `$name` or `${name}` and call
//! registered functions as `${func(arg, ...)}`. A string made of a single
//! placeholder evaluates to the referenced value itself, keeping its type;
//! anything else is rendered into a new string. `$$` produces a literal `$`.

use crate::scope::Variables;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("undefined function '{0}'")]
    UndefinedFunction(String),
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
    #[error("invalid placeholder '{0}'")]
    InvalidPlaceholder(String),
    #[error("function '{name}' failed: {message}")]
    FunctionFailed { name: String, message: String },
}

/// Evaluates templated content against a variable mapping.
pub trait Evaluator: Send + Sync {
    fn eval(&self, content: &Value, variables: &Variables) -> Result<Value, EvalError>;
}

type Function = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named functions callable from `${func(...)}` placeholders.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("get_timestamp", builtin_get_timestamp);
        registry.register("sleep", builtin_sleep);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| EvalError::UndefinedFunction(name.to_string()))?;
        function(args).map_err(|message| EvalError::FunctionFailed {
            name: name.to_string(),
            message,
        })
    }
}

fn builtin_get_timestamp(args: &[Value]) -> Result<Value, String> {
    let length = match args.first() {
        Some(value) => value
            .as_u64()
            .ok_or_else(|| format!("length must be a positive integer, got {value}"))?
            as usize,
        None => 13,
    };
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos().to_string();
    Ok(Value::String(nanos.chars().take(length).collect()))
}

fn builtin_sleep(args: &[Value]) -> Result<Value, String> {
    let seconds = args
        .first()
        .and_then(Value::as_f64)
        .ok_or_else(|| "sleep expects a number of seconds".to_string())?;
    if seconds > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    }
    Ok(Value::Null)
}

#[derive(Debug, Clone, Default)]
pub struct TemplateEvaluator {
    functions: FunctionRegistry,
}

impl TemplateEvaluator {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self { functions }
    }

    fn eval_string(&self, raw: &str, variables: &Variables) -> Result<Value, EvalError> {
        let tokens = tokenize(raw)?;
        if let [single] = tokens.as_slice() {
            match single {
                Token::Text(text) => return Ok(Value::String(text.clone())),
                other => return self.resolve_token(other, variables),
            }
        }

        let mut rendered = String::with_capacity(raw.len());
        for token in &tokens {
            match token {
                Token::Text(text) => rendered.push_str(text),
                other => rendered.push_str(&render(&self.resolve_token(other, variables)?)),
            }
        }
        Ok(Value::String(rendered))
    }

    fn resolve_token(&self, token: &Token, variables: &Variables) -> Result<Value, EvalError> {
        match token {
            Token::Text(text) => Ok(Value::String(text.clone())),
            Token::Variable(name) => variables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
            Token::Call { name, args } => {
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    resolved.push(self.resolve_argument(arg, variables)?);
                }
                self.functions.call(name, &resolved)
            }
        }
    }

    fn resolve_argument(&self, arg: &str, variables: &Variables) -> Result<Value, EvalError> {
        if arg.starts_with('$') {
            return self.eval_string(arg, variables);
        }
        if let Some(quoted) = strip_quotes(arg) {
            return Ok(Value::String(quoted.to_string()));
        }
        match arg {
            "true" | "True" => return Ok(Value::Bool(true)),
            "false" | "False" => return Ok(Value::Bool(false)),
            "null" | "None" => return Ok(Value::Null),
            _ => {}
        }
        if let Ok(number) = arg.parse::<i64>() {
            return Ok(Value::from(number));
        }
        if let Ok(number) = arg.parse::<f64>() {
            return Ok(Value::from(number));
        }
        Ok(Value::String(arg.to_string()))
    }
}

impl Evaluator for TemplateEvaluator {
    fn eval(&self, content: &Value, variables: &Variables) -> Result<Value, EvalError> {
        match content {
            Value::String(raw) => self.eval_string(raw, variables),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.eval(item, variables)?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (key, value) in map {
                    resolved.insert(key.clone(), self.eval(value, variables)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Truthiness used by skip conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a value the way it is spliced into a larger string.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Variable(String),
    Call { name: String, args: Vec<String> },
}

fn tokenize(raw: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut cursor = 0;

    while let Some(offset) = raw[cursor..].find('$') {
        let start = cursor + offset;
        text.push_str(&raw[cursor..start]);
        let rest = &raw[start + 1..];

        if rest.starts_with('$') {
            text.push('$');
            cursor = start + 2;
        } else if let Some(body) = rest.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| EvalError::Unterminated(raw.to_string()))?;
            flush_text(&mut text, &mut tokens);
            tokens.push(parse_placeholder(body[..end].trim())?);
            cursor = start + 2 + end + 1;
        } else {
            let ident_len = identifier_len(rest);
            if ident_len == 0 {
                text.push('$');
                cursor = start + 1;
            } else {
                flush_text(&mut text, &mut tokens);
                tokens.push(Token::Variable(rest[..ident_len].to_string()));
                cursor = start + 1 + ident_len;
            }
        }
    }

    text.push_str(&raw[cursor..]);
    flush_text(&mut text, &mut tokens);
    if tokens.is_empty() {
        tokens.push(Token::Text(String::new()));
    }
    Ok(tokens)
}

fn flush_text(text: &mut String, tokens: &mut Vec<Token>) {
    if !text.is_empty() {
        tokens.push(Token::Text(std::mem::take(text)));
    }
}

fn identifier_len(input: &str) -> usize {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    input
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(idx, _)| idx)
        .unwrap_or(input.len())
}

fn parse_placeholder(inner: &str) -> Result<Token, EvalError> {
    if inner.is_empty() {
        return Err(EvalError::InvalidPlaceholder(inner.to_string()));
    }
    let name_len = identifier_len(inner);
    if name_len == inner.len() {
        return Ok(Token::Variable(inner.to_string()));
    }
    let name = &inner[..name_len];
    let call = inner[name_len..].trim_start();
    match call.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
        Some(args) if name_len > 0 => Ok(Token::Call {
            name: name.to_string(),
            args: split_arguments(args),
        }),
        _ => Err(EvalError::InvalidPlaceholder(inner.to_string())),
    }
}

fn split_arguments(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ',') => args.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn strip_quotes(arg: &str) -> Option<&str> {
    ['"', '\''].iter().find_map(|quote| {
        arg.strip_prefix(*quote)
            .and_then(|rest| rest.strip_suffix(*quote))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Variables::new(),
        }
    }

    #[test]
    fn single_placeholder_keeps_type() {
        let evaluator = TemplateEvaluator::default();
        let variables = vars(json!({"uid": 42, "tags": ["a", "b"]}));
        assert_eq!(evaluator.eval(&json!("$uid"), &variables), Ok(json!(42)));
        assert_eq!(evaluator.eval(&json!("${tags}"), &variables), Ok(json!(["a", "b"])));
    }

    #[test]
    fn mixed_text_is_rendered() {
        let evaluator = TemplateEvaluator::default();
        let variables = vars(json!({"uid": 42, "host": "api.local"}));
        let value = evaluator
            .eval(&json!({"url": "http://${host}/users/$uid?x=$$1"}), &variables)
            .expect("evaluates");
        assert_eq!(value, json!({"url": "http://api.local/users/42?x=$1"}));
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let evaluator = TemplateEvaluator::default();
        let err = evaluator
            .eval(&json!("Bearer $token"), &Variables::new())
            .expect_err("missing variable");
        assert_eq!(err, EvalError::UndefinedVariable("token".to_string()));
    }

    #[test]
    fn calls_registered_functions_with_arguments() {
        let mut functions = FunctionRegistry::new();
        functions.register("sum", |args: &[Value]| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        functions.register("greet", |args: &[Value]| {
            Ok(json!(format!("hi {}", render(&args[0]))))
        });
        let evaluator = TemplateEvaluator::new(functions);
        let variables = vars(json!({"n": 5}));

        assert_eq!(evaluator.eval(&json!("${sum(1, $n, 4)}"), &variables), Ok(json!(10)));
        assert_eq!(
            evaluator.eval(&json!("${greet('a, b')}!"), &variables),
            Ok(json!("hi a, b!"))
        );
        assert_eq!(
            evaluator.eval(&json!("${missing()}"), &variables),
            Err(EvalError::UndefinedFunction("missing".to_string()))
        );
    }

    #[test]
    fn builtin_timestamp_honours_length() {
        let evaluator = TemplateEvaluator::new(FunctionRegistry::with_builtins());
        let value = evaluator
            .eval(&json!("${get_timestamp(10)}"), &Variables::new())
            .expect("timestamp");
        assert_eq!(value.as_str().map(str::len), Some(10));
    }

    #[test]
    fn empty_and_zero_values_are_falsy() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!(1.5)));
    }

    #[test]
    fn lone_dollar_is_literal() {
        let evaluator = TemplateEvaluator::default();
        assert_eq!(
            evaluator.eval(&json!("cost: 5$ each"), &Variables::new()),
            Ok(json!("cost: 5$ each"))
        );
    }
}
