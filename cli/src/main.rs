use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand};
use comfy_table::{presets::ASCII_FULL, Table};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use steprunner_core::runner::status_label;
use steprunner_core::{
    CaseReport, Collaborators, FunctionRegistry, MetadataEntry, PluginRegistry, ReqwestTransport,
    Runner, RunnerSettings, SqlxDriver, StepBody, StepSpec, TemplateEvaluator, TestCase,
    Variables,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run API test cases step by step")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a test case file
    Run {
        /// Path to the YAML or JSON case file
        input: PathBuf,
        /// Output the metadata report as JSON instead of a table
        #[arg(long)]
        json: bool,
        /// Override a variable (format: key=value). Repeat for multiple overrides.
        #[arg(long = "var", value_parser = parse_key_val, value_name = "KEY=VALUE", action = ArgAction::Append)]
        vars: Vec<(String, String)>,
        /// Database connect timeout in seconds
        #[arg(long, default_value_t = 10.0)]
        db_timeout: f64,
        /// HTTP request timeout in seconds
        #[arg(long, default_value_t = 30.0)]
        http_timeout: f64,
        /// Log filter, e.g. "debug" or "steprunner_core=trace" (defaults to RUST_LOG, then "info")
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Load a test case file and print its step plan without executing it
    Check {
        /// Path to the YAML or JSON case file
        input: PathBuf,
    },
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            input,
            json,
            vars,
            db_timeout,
            http_timeout,
            log_level,
        } => {
            init_tracing(log_level.as_deref());
            let case = load_case(&input)?;
            tracing::debug!(
                "loaded case '{}' with {} steps",
                case.name(),
                case.teststeps.len()
            );
            let overrides = parse_overrides(vars);
            let settings = RunnerSettings {
                db_connect_timeout: seconds("--db-timeout", db_timeout)?,
                http_timeout: seconds("--http-timeout", http_timeout)?,
            };
            let collaborators = Collaborators {
                transport: Arc::new(ReqwestTransport::with_timeout(settings.http_timeout)),
                driver: Arc::new(SqlxDriver::new()?),
                plugins: Arc::new(PluginRegistry::with_builtins()),
                evaluator: Arc::new(TemplateEvaluator::new(FunctionRegistry::with_builtins())),
            };

            let report = Runner::new(collaborators, settings).execute(&case, overrides);
            output_run(&report, json)?;
            if report.has_failures() {
                anyhow::bail!("case '{}' failed", report.name);
            }
        }
        Command::Check { input } => {
            init_tracing(None);
            let case = load_case(&input)?;
            println!("{}", render_plan(&case));
        }
    }

    Ok(())
}

fn load_case(path: &Path) -> anyhow::Result<TestCase> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let raw: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let raw = match raw {
        Value::Array(steps) => json!({ "teststeps": steps }),
        other => other,
    };
    TestCase::from_value(&raw).map_err(|err| anyhow!("invalid case {}: {err}", path.display()))
}

fn seconds(flag: &str, value: f64) -> anyhow::Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("{flag} must be a non-negative number of seconds, got {value}");
    }
    Ok(Duration::from_secs_f64(value))
}

fn output_run(report: &CaseReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["Step", "Kind", "Status", "Elapsed (ms)", "Error"]);
    summary_rows(&report.entries, 0, &mut table);

    println!("Case: {}", report.name);
    println!("{table}");
    if let Some(failure) = &report.failure {
        println!("\n[error] {failure}");
    }
    Ok(())
}

fn summary_rows(entries: &[MetadataEntry], depth: usize, table: &mut Table) {
    let indent = "  ".repeat(depth);
    for entry in entries {
        let status = status_label(entry.status());
        match entry {
            MetadataEntry::Step(meta) => {
                let elapsed = meta
                    .stat
                    .elapsed_ms
                    .map(|ms| format!("{ms:.2}"))
                    .unwrap_or_default();
                table.add_row(vec![
                    format!("{indent}{}", meta.name),
                    meta.kind.to_string(),
                    status.to_string(),
                    elapsed,
                    meta.error.clone().unwrap_or_default(),
                ]);
            }
            MetadataEntry::Composite { name, steps, .. } => {
                table.add_row(vec![
                    format!("{indent}{name}"),
                    "composite".to_string(),
                    status.to_string(),
                    String::new(),
                    String::new(),
                ]);
                summary_rows(steps, depth + 1, table);
            }
        }
    }
}

fn render_plan(case: &TestCase) -> String {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["#", "Step", "Kind", "Target"]);
    plan_rows(&case.teststeps, "", &mut table);
    format!("Case: {}\n{table}", case.name())
}

fn plan_rows(steps: &[StepSpec], prefix: &str, table: &mut Table) {
    for (index, step) in steps.iter().enumerate() {
        let number = format!("{prefix}{}", index + 1);
        table.add_row(vec![
            number.clone(),
            step.name.clone(),
            step.kind().to_string(),
            plan_target(step),
        ]);
        if let StepBody::Composite(case) = &step.body {
            plan_rows(&case.teststeps, &format!("{number}."), table);
        }
    }
}

fn plan_target(step: &StepSpec) -> String {
    let field = |payload: &Value, key: &str| {
        payload
            .get(key)
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };
    match &step.body {
        StepBody::Request(request) => format!(
            "{} {}",
            step.method().unwrap_or_default(),
            field(request, "url")
        ),
        StepBody::Database(database) => field(database, "dialect"),
        StepBody::Plugin(plugin) => field(plugin, "script"),
        StepBody::Composite(case) => format!("{} steps", case.teststeps.len()),
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() {
        return Err(format!("expected KEY=VALUE, got '{s}'"));
    }
    Ok((parts[0].trim().to_string(), parts[1].to_string()))
}

/// Values parse as JSON, falling back to the raw string.
fn parse_overrides(vars: Vec<(String, String)>) -> Variables {
    vars.into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn key_val_requires_a_key() {
        assert_eq!(
            parse_key_val("token= a=b").expect("parses"),
            ("token".to_string(), " a=b".to_string())
        );
        assert!(parse_key_val("=value").is_err());
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn overrides_parse_json_with_string_fallback() {
        let vars = parse_overrides(vec![
            ("n".to_string(), "42".to_string()),
            ("flag".to_string(), "true".to_string()),
            ("name".to_string(), "alice".to_string()),
            ("list".to_string(), "[1, 2]".to_string()),
        ]);
        assert_eq!(vars.get("n"), Some(&json!(42)));
        assert_eq!(vars.get("flag"), Some(&json!(true)));
        assert_eq!(vars.get("name"), Some(&json!("alice")));
        assert_eq!(vars.get("list"), Some(&json!([1, 2])));
    }

    #[test]
    fn loads_yaml_case_and_renders_plan() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
config:
  name: smoke
  base_url: http://api.local
teststeps:
  - name: get user
    request:
      url: /users/1
      method: get
  - name: count rows
    database:
      dialect: postgres
      connection: {{url: "db.local/app", user: reader}}
      sql: select count(*) from users
  - name: nested
    config: {{name: inner}}
    teststeps:
      - name: ping
        plugin: {{script: tcp_ping, url: db.local}}
"#
        )
        .expect("write case");

        let case = load_case(file.path()).expect("loads");
        assert_eq!(case.name(), "smoke");
        assert_eq!(case.teststeps.len(), 3);

        let plan = render_plan(&case);
        assert!(plan.contains("GET /users/1"));
        assert!(plan.contains("postgres"));
        assert!(plan.contains("3.1"));
        assert!(plan.contains("tcp_ping"));
    }

    #[test]
    fn bare_step_list_is_a_case() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"name": "echo", "plugin": {{"script": "command", "run": "echo hi"}}}}]"#
        )
        .expect("write case");

        let case = load_case(file.path()).expect("loads");
        assert_eq!(case.teststeps.len(), 1);
        assert_eq!(case.teststeps[0].name, "echo");
    }

    #[test]
    fn negative_timeouts_are_rejected() {
        assert!(seconds("--db-timeout", -1.0).is_err());
        assert_eq!(
            seconds("--http-timeout", 1.5).expect("valid"),
            Duration::from_millis(1500)
        );
    }
}
