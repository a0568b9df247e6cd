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

//! # MuxRPC CLI
//!
//! Pieces of the `muxrpc` binary that are worth testing on their own:
//!
//! - [`demo_server`]: the handlers `muxrpc serve` hosts
//! - [`call_options`] and [`retry_policy`]: map `muxrpc call` flags onto client options
//! - [`parse_metadata`]: parses repeated `--metadata key=value` flags

use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use muxrpc_client::{CallOptions, RetryPolicy};
use muxrpc_common::{CallKind, Status};
use muxrpc_server::Server;

/// Methods hosted by `muxrpc serve`.
///
/// - `echo` (unary): returns the request
/// - `upper` (unary): returns the request in upper case, rejects non UTF-8
/// - `echo_stream` (bidi): echoes every message until the client half-closes
/// - `_ping` (unary, built in)
pub fn demo_server() -> Server {
    Server::builder()
        .unary("echo", |req| async move { Ok(req.payload) })
        .unary("upper", |req| async move {
            let text = std::str::from_utf8(&req.payload)
                .map_err(|_| Status::invalid_argument("request is not UTF-8"))?;
            Ok(Bytes::from(text.to_uppercase()))
        })
        .streaming("echo_stream", CallKind::BidiStream, |mut stream| async move {
            while let Some(message) = stream.next().await? {
                stream.send(message).await?;
            }
            Ok(())
        })
        .build()
}

/// Parses `key=value` pairs. The value may contain `=`; the key may not be empty.
pub fn parse_metadata(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => bail!("Invalid metadata '{}': expected key=value", pair),
        })
        .collect()
}

/// Retry policy for `--max-attempts`. Zero is rejected.
pub fn retry_policy(max_attempts: u32) -> Result<RetryPolicy> {
    if max_attempts == 0 {
        bail!("--max-attempts must be at least 1");
    }
    Ok(RetryPolicy::default().with_max_attempts(max_attempts))
}

/// Builds the options for one `muxrpc call`.
pub fn call_options(timeout_ms: u64, max_attempts: u32, metadata: &[String]) -> Result<CallOptions> {
    if timeout_ms == 0 {
        bail!("--timeout-ms must be at least 1");
    }
    let mut options = CallOptions::new()
        .with_timeout(Duration::from_millis(timeout_ms))
        .with_retry_policy(retry_policy(max_attempts)?);
    for (key, value) in parse_metadata(metadata)? {
        options = options.with_metadata(key, value);
    }
    Ok(options)
}
