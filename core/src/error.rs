//! Step failure taxonomy and its attribution to a named step.

use crate::eval::EvalError;
use crate::sql::driver::DriverError;
use crate::transport::TransportError;
use std::fmt;

/// Failure raised while running a single step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid step parameters: {0}")]
    Params(String),
    #[error("skipped: {0}")]
    Skip(String),
    #[error("database query failed: {source}")]
    DatabaseQuery {
        #[source]
        source: DriverError,
    },
    #[error("script '{script}' failed: {message}")]
    ScriptExecute { script: String, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("extraction failed: {0}")]
    Extract(String),
    #[error("request failed: {0}")]
    Request(#[from] TransportError),
}

impl StepError {
    pub fn params(message: impl Into<String>) -> Self {
        Self::Params(message.into())
    }

    pub fn extract(message: impl Into<String>) -> Self {
        Self::Extract(message.into())
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, StepError::Skip(_))
    }
}

impl From<EvalError> for StepError {
    fn from(err: EvalError) -> Self {
        StepError::Params(err.to_string())
    }
}

/// A step error attributed to the step that raised it.
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    /// HTTP method, only set for request steps.
    pub method: Option<String>,
    pub error: StepError,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, method: Option<String>, error: StepError) -> Self {
        Self {
            step: step.into(),
            method,
            error,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.error.is_skip()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "step '{}' ({method}) {}", self.step, self.error),
            None => write!(f, "step '{}' {}", self.step, self.error),
        }
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display_includes_method_for_requests() {
        let failure = StepFailure::new(
            "login",
            Some("POST".to_string()),
            StepError::Validation("status_code eq 200".to_string()),
        );
        assert_eq!(
            failure.to_string(),
            "step 'login' (POST) validation failed: status_code eq 200"
        );
    }

    #[test]
    fn eval_errors_surface_as_params() {
        let err: StepError = EvalError::UndefinedVariable("token".to_string()).into();
        assert!(matches!(err, StepError::Params(ref msg) if msg.contains("token")));
    }
}
