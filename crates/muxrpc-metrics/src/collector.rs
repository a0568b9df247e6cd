// Copyright 2025 MuxRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;
use muxrpc_common::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Sink for finished-call measurements.
///
/// The client's metrics interceptor reports every call through this trait,
/// so applications can plug in their own exporter instead of the in-memory
/// [`MetricsRegistry`].
///
/// # Example
///
/// ```rust
/// use muxrpc_common::StatusCode;
/// use muxrpc_metrics::{MetricsCollector, MetricsRegistry};
/// use std::time::Duration;
///
/// let collector = MetricsRegistry::new();
/// collector.record_call("echo", Duration::from_micros(250), StatusCode::Ok);
/// assert_eq!(collector.snapshot().total_calls, 1);
/// ```
pub trait MetricsCollector: Send + Sync {
    /// Records an RPC call with its final status and latency.
    ///
    /// # Arguments
    /// * `method` - The name of the method that was called
    /// * `latency` - Time from call start until its final status
    /// * `code` - The final status code
    fn record_call(&self, method: &str, latency: Duration, code: StatusCode);

    /// Takes a snapshot of the current metrics state.
    fn snapshot(&self) -> MetricsSnapshot;
}

impl MetricsCollector for MetricsRegistry {
    fn record_call(&self, method: &str, latency: Duration, code: StatusCode) {
        MetricsRegistry::record_call(self, method, latency, code);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsRegistry::snapshot(self)
    }
}

impl<T: MetricsCollector + ?Sized> MetricsCollector for Arc<T> {
    fn record_call(&self, method: &str, latency: Duration, code: StatusCode) {
        (**self).record_call(method, latency, code);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        (**self).snapshot()
    }
}
