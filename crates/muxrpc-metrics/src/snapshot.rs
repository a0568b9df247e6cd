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


use muxrpc_common::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics for a specific method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub ok_count: u64,
    pub error_count: u64,
    /// Calls per final status code. Codes never observed are omitted.
    pub status_counts: BTreeMap<StatusCode, u64>,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub ok_calls: u64,
    pub failed_calls: u64,
    pub uptime_ms: u64,
    pub methods: BTreeMap<String, MethodMetrics>,
}

impl MetricsSnapshot {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
