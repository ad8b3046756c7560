//! Comparator-based assertions over a step result.

use crate::error::StepError;
use crate::eval::{render, Evaluator};
use crate::response::StepResult;
use crate::scope::Variables;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equals,
    NotEquals,
    LessThan,
    LessOrEquals,
    GreaterThan,
    GreaterOrEquals,
    StringEquals,
    LengthEquals,
    LengthGreaterThan,
    LengthGreaterOrEquals,
    LengthLessThan,
    LengthLessOrEquals,
    Contains,
    ContainedBy,
    TypeMatch,
    RegexMatch,
    StartsWith,
    EndsWith,
}

impl Comparator {
    pub fn from_name(name: &str) -> Option<Self> {
        let comparator = match name.trim() {
            "eq" | "equals" | "equal" | "==" | "is" => Comparator::Equals,
            "ne" | "not_equals" | "not_equal" | "!=" => Comparator::NotEquals,
            "lt" | "less_than" | "<" => Comparator::LessThan,
            "le" | "less_than_or_equals" | "<=" => Comparator::LessOrEquals,
            "gt" | "greater_than" | ">" => Comparator::GreaterThan,
            "ge" | "greater_than_or_equals" | ">=" => Comparator::GreaterOrEquals,
            "str_eq" | "string_equals" => Comparator::StringEquals,
            "len_eq" | "length_equals" | "length_equal" | "count_eq" => Comparator::LengthEquals,
            "len_gt" | "length_greater_than" | "count_gt" => Comparator::LengthGreaterThan,
            "len_ge" | "length_greater_than_or_equals" | "count_ge" => {
                Comparator::LengthGreaterOrEquals
            }
            "len_lt" | "length_less_than" | "count_lt" => Comparator::LengthLessThan,
            "len_le" | "length_less_than_or_equals" | "count_le" => Comparator::LengthLessOrEquals,
            "contains" => Comparator::Contains,
            "contained_by" => Comparator::ContainedBy,
            "type_match" | "type" => Comparator::TypeMatch,
            "regex_match" | "regex" => Comparator::RegexMatch,
            "startswith" | "starts_with" => Comparator::StartsWith,
            "endswith" | "ends_with" => Comparator::EndsWith,
            _ => return None,
        };
        Some(comparator)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Comparator::Equals => "eq",
            Comparator::NotEquals => "ne",
            Comparator::LessThan => "lt",
            Comparator::LessOrEquals => "le",
            Comparator::GreaterThan => "gt",
            Comparator::GreaterOrEquals => "ge",
            Comparator::StringEquals => "str_eq",
            Comparator::LengthEquals => "len_eq",
            Comparator::LengthGreaterThan => "len_gt",
            Comparator::LengthGreaterOrEquals => "len_ge",
            Comparator::LengthLessThan => "len_lt",
            Comparator::LengthLessOrEquals => "len_le",
            Comparator::Contains => "contains",
            Comparator::ContainedBy => "contained_by",
            Comparator::TypeMatch => "type_match",
            Comparator::RegexMatch => "regex_match",
            Comparator::StartsWith => "startswith",
            Comparator::EndsWith => "endswith",
        }
    }

    /// `Ok(())` when the assertion holds, otherwise the reason it does not.
    fn apply(&self, check: &Value, expect: &Value) -> Result<(), String> {
        let holds = match self {
            Comparator::Equals => values_equal(check, expect),
            Comparator::NotEquals => !values_equal(check, expect),
            Comparator::LessThan => order(check, expect)? == Ordering::Less,
            Comparator::LessOrEquals => order(check, expect)? != Ordering::Greater,
            Comparator::GreaterThan => order(check, expect)? == Ordering::Greater,
            Comparator::GreaterOrEquals => order(check, expect)? != Ordering::Less,
            Comparator::StringEquals => render(check) == render(expect),
            Comparator::LengthEquals => length(check)? == expected_length(expect)?,
            Comparator::LengthGreaterThan => length(check)? > expected_length(expect)?,
            Comparator::LengthGreaterOrEquals => length(check)? >= expected_length(expect)?,
            Comparator::LengthLessThan => length(check)? < expected_length(expect)?,
            Comparator::LengthLessOrEquals => length(check)? <= expected_length(expect)?,
            Comparator::Contains => contains(check, expect)?,
            Comparator::ContainedBy => contains(expect, check)?,
            Comparator::TypeMatch => type_matches(check, expect)?,
            Comparator::RegexMatch => {
                let pattern = render(expect);
                let regex = Regex::new(&format!("^(?:{pattern})"))
                    .map_err(|err| format!("invalid regex '{pattern}': {err}"))?;
                regex.is_match(&render(check))
            }
            Comparator::StartsWith => render(check).starts_with(&render(expect)),
            Comparator::EndsWith => render(check).ends_with(&render(expect)),
        };
        if holds {
            Ok(())
        } else {
            Err(format!("{check} {} {expect} does not hold", self.name()))
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One assertion of a step's `validate` list.
#[derive(Debug, Clone, PartialEq)]
pub struct Validator {
    pub check: Value,
    pub comparator: Comparator,
    pub expect: Value,
}

impl Validator {
    /// Accepts `{check, comparator, expect}` or `{<comparator>: [check, expect]}`.
    pub fn parse(raw: &Value) -> Result<Self, StepError> {
        let map = raw
            .as_object()
            .ok_or_else(|| StepError::params(format!("validator must be a mapping: {raw}")))?;

        if let Some(check) = map.get("check") {
            let name = map
                .get("comparator")
                .and_then(Value::as_str)
                .unwrap_or("eq");
            return Ok(Self {
                check: check.clone(),
                comparator: comparator_named(name)?,
                expect: map.get("expect").cloned().unwrap_or(Value::Null),
            });
        }

        let mut entries = map.iter();
        match (entries.next(), entries.next()) {
            (Some((name, Value::Array(pair))), None) if pair.len() == 2 => Ok(Self {
                check: pair[0].clone(),
                comparator: comparator_named(name)?,
                expect: pair[1].clone(),
            }),
            _ => Err(StepError::params(format!(
                "validator must be {{check, comparator, expect}} or {{comparator: [check, expect]}}: {raw}"
            ))),
        }
    }

    pub fn parse_all(raw: &[Value]) -> Result<Vec<Self>, StepError> {
        raw.iter().map(Self::parse).collect()
    }
}

fn comparator_named(name: &str) -> Result<Comparator, StepError> {
    Comparator::from_name(name)
        .ok_or_else(|| StepError::params(format!("unknown comparator '{name}'")))
}

/// Outcome of one validator, kept in the step's metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorResult {
    pub check: String,
    pub comparator: String,
    pub check_value: Value,
    pub expect: Value,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Evaluates every validator. Extraction and evaluation errors are hard
/// failures; assertions that do not hold are reported in the results.
pub fn validate(
    validators: &[Validator],
    result: &StepResult,
    variables: &Variables,
    evaluator: &dyn Evaluator,
) -> Result<Vec<ValidatorResult>, StepError> {
    let mut results = Vec::with_capacity(validators.len());
    validate_into(validators, result, variables, evaluator, &mut results)?;
    Ok(results)
}

/// Like [`validate`], appending to `results` as it goes so the outcomes
/// before a hard failure are kept.
pub fn validate_into(
    validators: &[Validator],
    result: &StepResult,
    variables: &Variables,
    evaluator: &dyn Evaluator,
    results: &mut Vec<ValidatorResult>,
) -> Result<(), StepError> {
    for validator in validators {
        let check_value = match &validator.check {
            Value::String(text) if text.contains('$') => {
                evaluator.eval(&validator.check, variables)?
            }
            Value::String(query) => result.extract(query)?,
            literal => literal.clone(),
        };
        let expect = evaluator.eval(&validator.expect, variables)?;
        let outcome = validator.comparator.apply(&check_value, &expect);
        debug!(
            "validate: {} {} {expect} => {}",
            render(&validator.check),
            validator.comparator,
            if outcome.is_ok() { "pass" } else { "fail" }
        );
        results.push(ValidatorResult {
            check: render(&validator.check),
            comparator: validator.comparator.name().to_string(),
            check_value,
            expect,
            passed: outcome.is_ok(),
            message: outcome.err(),
        });
    }
    Ok(())
}

/// Fails with every assertion that did not hold.
pub fn ensure_passed(results: &[ValidatorResult]) -> Result<(), StepError> {
    let failed: Vec<String> = results
        .iter()
        .filter(|result| !result.passed)
        .map(|result| {
            format!(
                "{} {} {}: {}",
                result.check,
                result.comparator,
                result.expect,
                result.message.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(StepError::Validation(failed.join("; ")))
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, String> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| format!("cannot order {a} and {b}"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!("cannot order {left} and {right}")),
    }
}

fn length(value: &Value) -> Result<usize, String> {
    match value {
        Value::String(text) => Ok(text.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(format!("{other} has no length")),
    }
}

fn expected_length(value: &Value) -> Result<usize, String> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("expected length must be a non-negative integer, got {number}")),
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| format!("expected length must be an integer, got '{text}'")),
        other => Err(format!("expected length must be an integer, got {other}")),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match container {
        Value::String(text) => Ok(text.contains(&render(item))),
        Value::Array(items) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::Object(map) => Ok(map.contains_key(&render(item))),
        other => Err(format!("{other} is not a container")),
    }
}

fn type_matches(value: &Value, type_name: &Value) -> Result<bool, String> {
    let name = render(type_name);
    let matches = match name.as_str() {
        "int" | "integer" => value.is_i64() || value.is_u64(),
        "float" => value.is_f64(),
        "number" => value.is_number(),
        "str" | "string" => value.is_string(),
        "bool" | "boolean" => value.is_boolean(),
        "list" | "array" => value.is_array(),
        "dict" | "object" | "map" => value.is_object(),
        "None" | "null" | "NoneType" => value.is_null(),
        other => return Err(format!("unknown type '{other}'")),
    };
    Ok(matches)
}
