//! Built-in interceptors.

use std::sync::Arc;

use muxrpc_common::Status;
use muxrpc_metrics::MetricsCollector;

use crate::interceptor::Interceptor;

/// Rejects calls that do not carry `key` in their metadata.
pub fn require_metadata(key: impl Into<String>) -> Interceptor {
    let key = key.into().to_ascii_lowercase();
    Interceptor::new(format!("require-metadata:{key}")).on_start(move |ctx| {
        if ctx.metadata.contains_key(&key) {
            Ok(())
        } else {
            Err(Status::invalid_argument(format!("missing required metadata '{key}'")))
        }
    })
}

/// Adds `key: value` to every call's metadata.
pub fn static_metadata(key: impl Into<String>, value: impl Into<String>) -> Interceptor {
    let key = key.into();
    let value = value.into();
    Interceptor::new(format!("static-metadata:{key}")).on_start(move |ctx| {
        ctx.metadata.append(key.clone(), value.clone());
        Ok(())
    })
}

/// Records each call's latency and final status.
pub fn metrics(collector: Arc<dyn MetricsCollector>) -> Interceptor {
    Interceptor::new("metrics").on_finish(move |ctx, status| {
        collector.record_call(&ctx.method, ctx.started_at.elapsed(), status.code);
        Ok(())
    })
}

/// Logs each finished call.
pub fn logging() -> Interceptor {
    Interceptor::new("logging").on_finish(|ctx, status| {
        let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
        if status.is_ok() {
            tracing::debug!(endpoint = %ctx.endpoint, method = %ctx.method, attempt = ctx.attempt, elapsed_ms, "call ok");
        } else {
            tracing::info!(
                endpoint = %ctx.endpoint,
                method = %ctx.method,
                attempt = ctx.attempt,
                elapsed_ms,
                code = %status.code,
                message = %status.message,
                "call failed"
            );
        }
        Ok(())
    })
}
