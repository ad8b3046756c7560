//! Step orchestration: skip checks, variable binding, hooks, dispatch,
//! extraction, validation and nested cases.

use crate::error::{StepError, StepFailure};
use crate::eval::{is_truthy, render, Evaluator};
use crate::metadata::{
    ExecutionMetadata, ExecutionStatus, MetadataEntry, MetadataRecorder, StepKind,
};
use crate::plugin::{PluginDispatcher, PluginRegistry};
use crate::response::{ResultVariant, StepResult};
use crate::scope::{Declarations, VariableScope, Variables};
use crate::sql::driver::DatabaseDriver;
use crate::sql::SqlExecutor;
use crate::step::{CaseConfig, Hook, SkipDirective, StepBody, StepSpec, TestCase};
use crate::transport::{HttpRequest, Transport, VALID_METHODS};
use crate::validate::{ensure_passed, validate_into};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reserved variable holding the evaluated request of a request step.
pub const REQUEST_VARIABLE: &str = "request";
/// Reserved variable holding the step result during teardown hooks.
pub const RESPONSE_VARIABLE: &str = "response";

/// Shared, stateless collaborators handed to every runner of a case tree.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub driver: Arc<dyn DatabaseDriver>,
    pub plugins: Arc<PluginRegistry>,
    pub evaluator: Arc<dyn Evaluator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub db_connect_timeout: Duration,
    pub http_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            db_connect_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs the steps of one case against a private variable scope.
pub struct Runner {
    collaborators: Collaborators,
    settings: RunnerSettings,
    config: CaseConfig,
    scope: VariableScope,
    recorder: MetadataRecorder,
    last: Option<StepResult>,
}

impl Runner {
    pub fn new(collaborators: Collaborators, settings: RunnerSettings) -> Self {
        Self {
            collaborators,
            settings,
            config: CaseConfig::default(),
            scope: VariableScope::default(),
            recorder: MetadataRecorder::new(),
            last: None,
        }
    }

    /// Seeds the session scope.
    pub fn with_session(mut self, session: Variables) -> Self {
        self.scope = VariableScope::new(session);
        self
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn recorder(&self) -> &MetadataRecorder {
        &self.recorder
    }

    pub fn into_recorder(self) -> MetadataRecorder {
        self.recorder
    }

    /// Result of the most recent successful simple step.
    pub fn last_result(&self) -> Option<&StepResult> {
        self.last.as_ref()
    }

    /// Runs a case and collects its report instead of returning the failure.
    pub fn execute(mut self, case: &TestCase, overrides: Variables) -> CaseReport {
        let failure = self.run_case(case, overrides).err();
        CaseReport {
            name: case.name().to_string(),
            session: self.scope.session().clone(),
            entries: self.recorder.into_entries(),
            failure: failure.map(|failure| failure.to_string()),
        }
    }

    /// Seeds the session with `overrides`, fills in config variables the
    /// session does not already hold, and runs setup hooks, steps and
    /// teardown hooks.
    ///
    /// A skipped step does not stop the case; any other failure does.
    /// Teardown hooks run either way.
    pub fn run_case(&mut self, case: &TestCase, overrides: Variables) -> Result<(), StepFailure> {
        self.config = case.config.clone();
        let case_name = case.name().to_string();
        info!("start case: {case_name}");

        self.open_session(overrides)
            .and_then(|()| self.run_hooks(&case.config.setup_hooks, None))
            .map_err(|err| StepFailure::new(&case_name, None, err))?;

        let mut failure = None;
        for step in &case.teststeps {
            match self.run_step(step) {
                Ok(()) => {}
                Err(skipped) if skipped.is_skip() => info!("{skipped}"),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Err(err) = self.run_hooks(&case.config.teardown_hooks, None) {
            warn!("teardown hooks of case '{case_name}' failed: {err}");
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Current session values of `names`. Missing names are skipped with a warning.
    pub fn exported(&self, names: &[String]) -> Variables {
        let session = self.scope.session();
        let mut output = Variables::new();
        for name in names {
            match session.get(name) {
                Some(value) => {
                    output.insert(name.clone(), value.clone());
                }
                None => warn!("variable '{name}' can not be found in session, failed to export"),
            }
        }
        output
    }

    /// Runs one step. Metadata is recorded whatever the outcome.
    pub fn run_step(&mut self, spec: &StepSpec) -> Result<(), StepFailure> {
        self.last = None;
        if let StepBody::Composite(case) = &spec.body {
            return self.run_composite(spec, case);
        }

        let method = spec.method();
        self.scope.begin_step();
        let bound = self
            .check_skip(spec.skip.as_ref())
            .and_then(|()| self.bind_variables(&spec.variables));
        let name = self.step_name(spec, &Variables::new());
        let mut meta = ExecutionMetadata::start(spec.kind(), &name);
        info!("run step: {name}");

        let dispatched = bound.and_then(|()| self.prepare_and_dispatch(spec, &mut meta));
        let outcome = match dispatched {
            Ok(mut result) => match self.complete(spec, &mut result) {
                Ok(()) => Ok(result),
                Err(err) => Err((err, Some(result))),
            },
            Err(err) => Err((err, None)),
        };
        self.scope.end_step();

        match outcome {
            Ok(mut result) => {
                result.metadata_mut().finish(ExecutionStatus::Passed);
                self.recorder.record_step(result.metadata().clone());
                self.last = Some(result);
                Ok(())
            }
            Err((error, result)) => {
                let mut meta = result.map(StepResult::into_metadata).unwrap_or(meta);
                let status = if error.is_skip() {
                    ExecutionStatus::Skipped
                } else {
                    ExecutionStatus::Failed
                };
                meta.finish(status);
                if meta.error.is_none() {
                    meta.record_error(error.to_string());
                }
                self.recorder.record_step(meta);
                Err(StepFailure::new(name, method, error))
            }
        }
    }

    /// Evaluates the step name against the scope plus `extra`; an
    /// unresolvable name is used as written.
    fn step_name(&self, spec: &StepSpec, extra: &Variables) -> String {
        let raw = Value::String(spec.name.clone());
        let mut variables = self.scope.snapshot();
        variables.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        match self.collaborators.evaluator.eval(&raw, &variables) {
            Ok(value) => render(&value),
            Err(err) => {
                debug!("step name '{}' not evaluated: {err}", spec.name);
                spec.name.clone()
            }
        }
    }

    /// Config variables are defaults: a name already in the session,
    /// inherited or overridden, keeps its value and is not evaluated.
    fn open_session(&mut self, overrides: Variables) -> Result<(), StepError> {
        self.scope.update_session(overrides);
        let config_variables = self.config.variables.clone();
        for (name, content) in &config_variables {
            if self.scope.session().contains_key(name) {
                debug!("config variable '{name}' taken from session");
                continue;
            }
            let value = self.eval(content)?;
            self.scope.set(name.clone(), value);
        }
        Ok(())
    }

    fn eval(&self, content: &Value) -> Result<Value, StepError> {
        Ok(self
            .collaborators
            .evaluator
            .eval(content, &self.scope.snapshot())?)
    }

    fn check_skip(&self, directive: Option<&SkipDirective>) -> Result<(), StepError> {
        let reason = match directive {
            None => None,
            Some(SkipDirective::Always(reason)) => is_truthy(reason).then(|| render(reason)),
            Some(SkipDirective::If(condition)) => is_truthy(&self.eval(condition)?)
                .then(|| format!("{} evaluate to true", render(condition))),
            Some(SkipDirective::Unless(condition)) => (!is_truthy(&self.eval(condition)?))
                .then(|| format!("{} evaluate to false", render(condition))),
        };
        match reason {
            Some(reason) => Err(StepError::Skip(reason)),
            None => Ok(()),
        }
    }

    fn bind_variables(&mut self, variables: &Declarations) -> Result<(), StepError> {
        for (name, content) in variables {
            let value = self.eval(content)?;
            self.scope.set(name.clone(), value);
        }
        Ok(())
    }

    fn run_hooks(
        &mut self,
        hooks: &[Hook],
        mut result: Option<&mut StepResult>,
    ) -> Result<(), StepError> {
        for hook in hooks {
            match hook {
                Hook::Assign { name, content } => {
                    let value = self.eval(content)?;
                    debug!("assignment with hook: {name} = {content} => {value}");
                    let attribute = name.strip_prefix("response.");
                    match (attribute, result.as_deref_mut()) {
                        (Some(attribute), Some(result)) => {
                            result.set_attribute(attribute, value);
                            self.scope.set(RESPONSE_VARIABLE, result.to_value());
                        }
                        _ => self.scope.set(name.clone(), value),
                    }
                }
                Hook::Call(content) => {
                    debug!("call hook function: {content}");
                    self.eval(content)?;
                }
            }
        }
        Ok(())
    }

    /// Setup hooks and dispatch.
    fn prepare_and_dispatch(
        &mut self,
        spec: &StepSpec,
        meta: &mut ExecutionMetadata,
    ) -> Result<StepResult, StepError> {
        if !spec.setup_hooks.is_empty() {
            debug!("call setup hook actions");
            self.run_hooks(&spec.setup_hooks, None)?;
        }

        let variant = match &spec.body {
            StepBody::Database(payload) => {
                let payload = self.eval(payload)?;
                let executor = SqlExecutor::new(
                    Arc::clone(&self.collaborators.driver),
                    self.settings.db_connect_timeout,
                );
                ResultVariant::Database(executor.execute(&payload, meta)?)
            }
            StepBody::Plugin(payload) => {
                let payload = self.eval(payload)?;
                let dispatcher = PluginDispatcher::new(Arc::clone(&self.collaborators.plugins));
                ResultVariant::Plugin(dispatcher.dispatch(&payload, meta)?)
            }
            StepBody::Request(payload) => self.send_request(spec, payload, meta)?,
            StepBody::Composite(_) => {
                return Err(StepError::params("composite step dispatched as a simple step"))
            }
        };

        Ok(StepResult::new(variant, meta.clone()))
    }

    fn send_request(
        &mut self,
        spec: &StepSpec,
        payload: &Value,
        meta: &mut ExecutionMetadata,
    ) -> Result<ResultVariant, StepError> {
        let evaluated = self.eval(payload)?;
        let Value::Object(mut options) = evaluated.clone() else {
            return Err(StepError::params(format!(
                "request must be a mapping, got {evaluated}"
            )));
        };
        self.scope.set(REQUEST_VARIABLE, evaluated.clone());

        let url = options
            .remove("url")
            .map(|url| render(&url))
            .ok_or_else(|| StepError::params("URL or METHOD missed"))?;
        let method = options
            .remove("method")
            .map(|method| render(&method).to_uppercase())
            .ok_or_else(|| StepError::params("URL or METHOD missed"))?;
        options.remove("group");
        if !VALID_METHODS.contains(&method.as_str()) {
            return Err(StepError::params(format!(
                "invalid HTTP method '{method}', available: {}",
                VALID_METHODS.join("/")
            )));
        }

        let base_url = match spec.base_url.as_ref().or(self.config.base_url.as_ref()) {
            Some(base) => render(&self.eval(base)?),
            None => String::new(),
        };
        let url = build_url(&base_url, &url)?;

        let mut request = HttpRequest::from_options(&method, &url, &options, self.config.verify)?;
        request.timeout.get_or_insert(self.settings.http_timeout);

        info!("{method} {url}");
        let raw_options = Value::Object(options);
        debug!("request kwargs(raw): {raw_options}");
        meta.identity = url;
        meta.request = evaluated;

        let response = self.collaborators.transport.request(&request)?;
        meta.stat.set_elapsed(response.elapsed);
        meta.stat.set_response_time(response.elapsed);
        meta.stat.content_size = Some(response.body.len() as u64);
        meta.result = json!({
            "status_code": response.status_code,
            "headers": response.headers,
            "content": response.body_value(),
        });
        Ok(ResultVariant::Http(response))
    }

    /// Teardown hooks, extraction, validation and export.
    fn complete(&mut self, spec: &StepSpec, result: &mut StepResult) -> Result<(), StepError> {
        if !spec.teardown_hooks.is_empty() {
            debug!("call teardown hook actions");
            self.scope.set(RESPONSE_VARIABLE, result.to_value());
            self.run_hooks(&spec.teardown_hooks, Some(&mut *result))?;
        }

        let mut extracted = Variables::new();
        for (name, query) in &spec.extract {
            match result.extract(query) {
                Ok(value) => {
                    debug!("extract: {name} = {query} => {value}");
                    extracted.insert(name.clone(), value);
                }
                Err(err) => {
                    result.metadata_mut().record_error(err.to_string());
                    result.dump_diagnostics();
                    return Err(err);
                }
            }
        }
        self.scope.update_session(extracted);

        if !spec.validators.is_empty() {
            let snapshot = self.scope.snapshot();
            let mut outcomes = Vec::with_capacity(spec.validators.len());
            let evaluated = validate_into(
                &spec.validators,
                result,
                &snapshot,
                self.collaborators.evaluator.as_ref(),
                &mut outcomes,
            );
            result.metadata_mut().validators = outcomes;
            let checked =
                evaluated.and_then(|()| ensure_passed(&result.metadata().validators));
            if let Err(err) = checked {
                result.metadata_mut().record_error(err.to_string());
                result.dump_diagnostics();
                return Err(err);
            }
        }

        for missing in self.scope.export(&spec.export) {
            warn!("variable '{missing}' can not be found, failed to export");
        }
        Ok(())
    }

    /// The child case sees its config variables as defaults, the parent
    /// session over them, and the step's own variables over both.
    fn run_composite(&mut self, spec: &StepSpec, case: &TestCase) -> Result<(), StepFailure> {
        let mut overrides = Variables::new();
        let prepared = self.check_skip(spec.skip.as_ref()).and_then(|()| {
            for (variable, content) in &spec.variables {
                let mut variables = self.scope.snapshot();
                variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                let value = self.collaborators.evaluator.eval(content, &variables)?;
                overrides.insert(variable.clone(), value);
            }
            Ok(())
        });
        let name = self.step_name(spec, &overrides);
        info!("run composite step: {name}");
        if let Err(err) = prepared {
            let status = if err.is_skip() {
                ExecutionStatus::Skipped
            } else {
                ExecutionStatus::Failed
            };
            self.recorder
                .record_composite(&name, status, MetadataRecorder::new());
            return Err(StepFailure::new(name, None, err));
        }

        let mut seed = self.scope.session().clone();
        seed.extend(overrides);
        let mut child = Runner::new(self.collaborators.clone(), self.settings).with_session(seed);
        let outcome = child.run_case(case, Variables::new());

        let status = match &outcome {
            Ok(()) => {
                let exported = child.exported(&case.config.export);
                self.scope.update_session(exported);
                let entries = child.recorder.entries();
                if !entries.is_empty()
                    && entries
                        .iter()
                        .all(|entry| entry.status() == ExecutionStatus::Skipped)
                {
                    ExecutionStatus::Skipped
                } else {
                    ExecutionStatus::Passed
                }
            }
            Err(_) => ExecutionStatus::Failed,
        };
        self.recorder
            .record_composite(name, status, child.into_recorder());
        outcome
    }
}

/// Joins a relative url onto the base url; absolute urls pass through.
fn build_url(base_url: &str, url: &str) -> Result<String, StepError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(url.to_string());
    }
    if base_url.is_empty() {
        return Err(StepError::params(format!("base url missed for '{url}'")));
    }
    Ok(format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    ))
}

/// Metadata and final session of one case run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub name: String,
    pub entries: Vec<MetadataEntry>,
    pub session: Variables,
    pub failure: Option<String>,
}

impl CaseReport {
    pub fn has_failures(&self) -> bool {
        self.failure.is_some()
            || self
                .entries
                .iter()
                .any(|entry| entry.status() == ExecutionStatus::Failed)
    }
}

impl fmt::Display for CaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            writeln!(f, "No steps executed.")?;
        } else {
            writeln!(f, "Case '{}':", self.name)?;
            write_entries(f, &self.entries, 1)?;
        }
        if let Some(failure) = &self.failure {
            writeln!(f, "Failure: {failure}")?;
        }
        Ok(())
    }
}

fn write_entries(
    f: &mut fmt::Formatter<'_>,
    entries: &[MetadataEntry],
    depth: usize,
) -> fmt::Result {
    let indent = "  ".repeat(depth);
    for entry in entries {
        let status = status_label(entry.status());
        match entry {
            MetadataEntry::Step(meta) => {
                writeln!(f, "{indent}- [{status}] {} ({})", meta.name, meta.kind)?;
                if let Some(error) = &meta.error {
                    for line in error.lines() {
                        writeln!(f, "{indent}    {line}")?;
                    }
                }
            }
            MetadataEntry::Composite { name, steps, .. } => {
                writeln!(f, "{indent}- [{status}] {name} ({})", StepKind::Composite)?;
                write_entries(f, steps, depth + 1)?;
            }
        }
    }
    Ok(())
}

pub fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Passed => "passed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_urls_join_the_base_url() {
        assert_eq!(
            build_url("http://api.local/", "/users/1").expect("joins"),
            "http://api.local/users/1"
        );
        assert_eq!(
            build_url("http://api.local", "https://other/x").expect("absolute"),
            "https://other/x"
        );
        assert!(matches!(
            build_url("", "/users"),
            Err(StepError::Params(_))
        ));
    }

    #[test]
    fn report_display_nests_composites() {
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "ping");
        meta.finish(ExecutionStatus::Failed);
        meta.record_error("refused");
        let report = CaseReport {
            name: "smoke".to_string(),
            entries: vec![MetadataEntry::Composite {
                name: "prepare".to_string(),
                status: ExecutionStatus::Failed,
                steps: vec![MetadataEntry::Step(meta)],
            }],
            session: Variables::new(),
            failure: Some("step 'ping' script 'tcp_ping' failed: refused".to_string()),
        };

        let rendered = report.to_string();
        assert!(rendered.contains("- [failed] prepare (composite)"));
        assert!(rendered.contains("    - [failed] ping (plugin)"));
        assert!(rendered.contains("refused"));
        assert!(report.has_failures());
    }
}
