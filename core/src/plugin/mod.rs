//! Named script plugins and their dispatch.

pub mod command;
pub mod tcp_ping;

use crate::error::StepError;
use crate::metadata::ExecutionMetadata;
use crate::response::PluginOutput;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub use command::CommandPlugin;
pub use tcp_ping::TcpPingPlugin;

/// Entry point of a script module. A fresh instance serves each invocation.
pub trait Plugin {
    fn execute(
        &mut self,
        params: &Map<String, Value>,
        meta: &mut ExecutionMetadata,
    ) -> anyhow::Result<Value>;
}

type Factory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Factory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register::<CommandPlugin>("command");
        registry.register::<TcpPingPlugin>("tcp_ping");
        registry
    }

    pub fn register<P>(&mut self, name: impl Into<String>)
    where
        P: Plugin + Default + 'static,
    {
        self.register_with(name, || Box::new(P::default()));
    }

    pub fn register_with<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn instantiate(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }
}

pub struct PluginDispatcher {
    registry: Arc<PluginRegistry>,
}

impl PluginDispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn dispatch(
        &self,
        payload: &Value,
        meta: &mut ExecutionMetadata,
    ) -> Result<PluginOutput, StepError> {
        let params = payload
            .as_object()
            .ok_or_else(|| StepError::params("plugin step must be a mapping"))?;
        let script = params
            .get("script")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StepError::params("script not set in plugin step"))?
            .to_string();
        let mut plugin = self
            .registry
            .instantiate(&script)
            .ok_or_else(|| StepError::params(format!("{script} plugin not found")))?;

        meta.identity = script.clone();
        meta.request = payload.clone();
        debug!("invoke plugin '{script}'");

        let timer = Instant::now();
        let outcome = plugin.execute(params, meta);
        meta.stat.set_elapsed(timer.elapsed());

        match outcome {
            Ok(value) => {
                meta.result = value.clone();
                Ok(PluginOutput { script, value })
            }
            Err(err) => {
                let message = format!("{err:#}");
                meta.record_error(message.clone());
                Err(StepError::ScriptExecute { script, message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StepKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Echo {
        calls: usize,
    }

    impl Plugin for Echo {
        fn execute(
            &mut self,
            params: &Map<String, Value>,
            _meta: &mut ExecutionMetadata,
        ) -> anyhow::Result<Value> {
            self.calls += 1;
            Ok(json!({"echo": params.get("message").cloned(), "calls": self.calls}))
        }
    }

    struct Failing;

    impl Plugin for Failing {
        fn execute(
            &mut self,
            _params: &Map<String, Value>,
            _meta: &mut ExecutionMetadata,
        ) -> anyhow::Result<Value> {
            anyhow::bail!("socket refused")
        }
    }

    fn dispatcher() -> PluginDispatcher {
        let mut registry = PluginRegistry::new();
        registry.register::<Echo>("echo");
        registry.register_with("failing", || {
            CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
            Box::new(Failing)
        });
        PluginDispatcher::new(Arc::new(registry))
    }

    #[test]
    fn each_invocation_gets_a_fresh_instance() {
        let dispatcher = dispatcher();
        for _ in 0..2 {
            let mut meta = ExecutionMetadata::start(StepKind::Plugin, "echo");
            let output = dispatcher
                .dispatch(&json!({"script": "echo", "message": "hi"}), &mut meta)
                .expect("runs");
            assert_eq!(output.value, json!({"echo": "hi", "calls": 1}));
            assert_eq!(meta.identity, "echo");
        }
    }

    #[test]
    fn unregistered_or_missing_script_is_a_params_error() {
        let dispatcher = dispatcher();
        let before = CONSTRUCTED.load(Ordering::SeqCst);
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "x");
        let err = dispatcher
            .dispatch(&json!({"script": "nope"}), &mut meta)
            .expect_err("unknown");
        assert!(matches!(err, StepError::Params(ref msg) if msg.contains("nope")));
        let err = dispatcher.dispatch(&json!({"url": "x"}), &mut meta).expect_err("missing");
        assert!(matches!(err, StepError::Params(_)));
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before);
    }

    #[test]
    fn entry_failure_is_recorded_and_surfaced() {
        let dispatcher = dispatcher();
        let mut meta = ExecutionMetadata::start(StepKind::Plugin, "fail");
        let err = dispatcher
            .dispatch(&json!({"script": "failing"}), &mut meta)
            .expect_err("fails");
        assert!(matches!(err, StepError::ScriptExecute { ref script, .. } if script == "failing"));
        assert_eq!(meta.error.as_deref(), Some("socket refused"));
        assert!(meta.stat.elapsed_ms.is_some());
    }

    #[test]
    fn builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["command", "tcp_ping"]);
    }
}
