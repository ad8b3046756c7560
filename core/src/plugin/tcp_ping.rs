//! `tcp_ping` plugin: TCP connect latency to a host.

use super::Plugin;
use crate::eval::render;
use crate::metadata::ExecutionMetadata;
use anyhow::Context;
use serde_json::{Map, Value};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Measures TCP connect latency to `url` (host or host:port).
///
/// Returns the delay in seconds, or null when the target does not answer
/// within `timeout` seconds (default 5).
#[derive(Debug, Default)]
pub struct TcpPingPlugin;

impl Plugin for TcpPingPlugin {
    fn execute(
        &mut self,
        params: &Map<String, Value>,
        meta: &mut ExecutionMetadata,
    ) -> anyhow::Result<Value> {
        let host = params
            .get("url")
            .or_else(|| params.get("host"))
            .map(render)
            .filter(|host| !host.trim().is_empty())
            .context("missing required parameter: url")?;
        let port = params.get("port").and_then(Value::as_u64).unwrap_or(80);
        let timeout = params.get("timeout").and_then(Value::as_f64).unwrap_or(5.0);

        let host = host.trim_start_matches("tcp://");
        let target = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        let address = target
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve '{target}'"))?
            .next()
            .with_context(|| format!("no address for '{target}'"))?;

        let timer = Instant::now();
        match TcpStream::connect_timeout(&address, Duration::from_secs_f64(timeout.max(0.001))) {
            Ok(_) => {
                let delay = timer.elapsed();
                meta.stat.set_response_time(delay);
                Ok(Value::from(delay.as_secs_f64()))
            }
            Err(err) => {
                debug!("tcp ping to {target} got no answer: {err}");
                Ok(Value::Null)
            }
        }
    }
}
