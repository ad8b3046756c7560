//! `command` plugin: runs a program and captures its output.

use super::Plugin;
use crate::eval::render;
use crate::metadata::ExecutionMetadata;
use anyhow::{bail, Context};
use serde_json::{json, Map, Value};
use std::process::Command;
use std::time::Instant;

const MAX_OUTPUT: usize = 4096;

/// Runs a local program.
///
/// Parameters: `run` (program and leading arguments, shell-word split),
/// optional `args`, `cwd`, `env` mapping and `check` (default true: a
/// non-zero exit status fails the step).
#[derive(Debug, Default)]
pub struct CommandPlugin;

impl Plugin for CommandPlugin {
    fn execute(
        &mut self,
        params: &Map<String, Value>,
        meta: &mut ExecutionMetadata,
    ) -> anyhow::Result<Value> {
        let run = params
            .get("run")
            .map(render)
            .filter(|value| !value.trim().is_empty())
            .context("missing required parameter: run")?;

        let mut invocation =
            shell_words::split(&run).context("failed to parse 'run' command")?;
        if let Some(args) = params.get("args") {
            let extra = shell_words::split(&render(args)).context("failed to parse 'args' value")?;
            invocation.extend(extra);
        }
        let Some((program, arguments)) = invocation.split_first() else {
            bail!("run command produced no executable");
        };

        let mut cmd = Command::new(program);
        cmd.args(arguments);
        if let Some(cwd) = params.get("cwd") {
            cmd.current_dir(render(cwd));
        }
        if let Some(Value::Object(env)) = params.get("env") {
            for (key, value) in env {
                cmd.env(key, render(value));
            }
        }

        let timer = Instant::now();
        let output = cmd
            .output()
            .with_context(|| format!("failed to execute '{program}'"))?;
        let duration = timer.elapsed();
        meta.stat.set_response_time(duration);

        let stdout = truncate(&output.stdout);
        let stderr = truncate(&output.stderr);
        let exit_code = output.status.code();
        let check = params.get("check").and_then(Value::as_bool).unwrap_or(true);
        if check && !output.status.success() {
            bail!("'{program}' exited with {exit_code:?}: {}", stderr.trim());
        }

        Ok(json!({
            "command": invocation,
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
            "duration_ms": duration.as_millis() as u64,
        }))
    }
}

fn truncate(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(MAX_OUTPUT) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::metadata::StepKind;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "echo");
        let value = CommandPlugin
            .execute(&params(json!({"run": "echo", "args": "'hello world'"})), &mut meta)
            .expect("runs");
        assert_eq!(value["stdout"], json!("hello world\n"));
        assert_eq!(value["exit_code"], json!(0));
        assert_eq!(value["command"], json!(["echo", "hello world"]));
        assert!(meta.stat.response_time_ms.is_some());
    }

    #[test]
    fn non_zero_exit_fails_unless_unchecked() {
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "false");
        assert!(CommandPlugin
            .execute(&params(json!({"run": "false"})), &mut meta)
            .is_err());
        let value = CommandPlugin
            .execute(&params(json!({"run": "false", "check": false})), &mut meta)
            .expect("unchecked");
        assert_eq!(value["exit_code"], json!(1));
    }

    #[test]
    fn missing_run_is_an_error() {
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "none");
        let err = CommandPlugin
            .execute(&params(json!({"args": "x"})), &mut meta)
            .expect_err("missing run");
        assert!(err.to_string().contains("run"));
    }
}
