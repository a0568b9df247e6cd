//! MuxRPC Metrics Collection
//!
//! This crate provides thread-safe, per-method call metrics for muxrpc
//! clients: call counts, counts per final status code and latency
//! percentiles.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: in-memory storage with lock-free counters
//! - [`MetricsCollector`]: trait the client's metrics interceptor reports into
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Usage Example
//!
//! ```rust
//! use muxrpc_common::StatusCode;
//! use muxrpc_metrics::MetricsRegistry;
//! use std::time::Duration;
//!
//! let registry = MetricsRegistry::new();
//! registry.record_call("echo", Duration::from_millis(1), StatusCode::Ok);
//! registry.record_call("echo", Duration::from_millis(9), StatusCode::Unavailable);
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.failed_calls, 1);
//! println!("{}", snapshot.to_json_pretty().unwrap());
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::MetricsCollector;
pub use registry::{MetricsConfig, MetricsRegistry, OVERFLOW_METHOD};
pub use snapshot::{MethodMetrics, MetricsSnapshot};
