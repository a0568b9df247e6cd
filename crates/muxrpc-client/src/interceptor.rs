use std::sync::{Arc, RwLock};

use muxrpc_common::{CallKind, Metadata, MethodDescriptor, MuxrpcError, Result, Status};
use tokio::time::Instant;

/// What interceptors see of a call.
///
/// Outbound hooks may edit `metadata` before it is sent.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub endpoint: String,
    pub method: String,
    pub kind: CallKind,
    pub metadata: Metadata,
    /// 1-based attempt number. Retries run the pipeline again.
    pub attempt: u32,
    pub deadline: Option<Instant>,
    pub started_at: Instant,
}

impl CallContext {
    pub fn new(
        endpoint: impl Into<String>,
        method: &MethodDescriptor,
        metadata: Metadata,
        attempt: u32,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.name.clone(),
            kind: method.kind,
            metadata,
            attempt,
            deadline,
            started_at: Instant::now(),
        }
    }
}

pub type StartHook = Arc<dyn Fn(&mut CallContext) -> std::result::Result<(), Status> + Send + Sync>;
pub type FinishHook =
    Arc<dyn Fn(&CallContext, &Status) -> std::result::Result<(), Status> + Send + Sync>;

/// A named pair of hooks run around every call.
///
/// `on_start` runs before the call is sent and may edit metadata or reject
/// the call. `on_finish` runs once with the final status and may replace
/// it with a rejection.
#[derive(Clone)]
pub struct Interceptor {
    name: String,
    on_start: Option<StartHook>,
    on_finish: Option<FinishHook>,
}

impl Interceptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_finish: None,
        }
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut CallContext) -> std::result::Result<(), Status> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext, &Status) -> std::result::Result<(), Status> + Send + Sync + 'static,
    {
        self.on_finish = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn rejected(&self, status: Status) -> MuxrpcError {
        MuxrpcError::InterceptorRejected {
            interceptor: self.name.clone(),
            status,
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("name", &self.name)
            .field("on_start", &self.on_start.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

/// Ordered set of interceptors shared by all calls of a client.
///
/// Lower `order` runs first on the way out and last on the way in.
/// Interceptors with equal order keep their registration order.
#[derive(Debug, Default)]
pub struct InterceptorPipeline {
    entries: RwLock<Vec<(i32, Interceptor)>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, interceptor: Interceptor, order: i32) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tracing::debug!(interceptor = %interceptor.name, order, "registering interceptor");
        entries.push((order, interceptor));
        entries.sort_by_key(|(order, _)| *order);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Interceptor names in outbound order.
    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|(_, i)| i.name.clone()).collect()
    }

    /// Freezes the current interceptors for one call. Registrations made
    /// afterwards do not affect it.
    pub fn snapshot(&self) -> InterceptorChain {
        InterceptorChain {
            interceptors: self.read().iter().map(|(_, i)| i.clone()).collect(),
            entered: 0,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(i32, Interceptor)>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The interceptors of one call attempt.
#[derive(Debug)]
pub struct InterceptorChain {
    interceptors: Vec<Interceptor>,
    entered: usize,
}

impl InterceptorChain {
    /// Runs outbound hooks in order. Stops at the first rejection, which
    /// is returned as [`MuxrpcError::InterceptorRejected`].
    pub fn run_outbound(&mut self, ctx: &mut CallContext) -> Result<()> {
        self.entered = 0;
        for interceptor in &self.interceptors {
            if let Some(hook) = &interceptor.on_start {
                if let Err(status) = hook(ctx) {
                    tracing::debug!(
                        interceptor = %interceptor.name,
                        method = %ctx.method,
                        code = %status.code,
                        "call rejected on the way out"
                    );
                    return Err(interceptor.rejected(status));
                }
            }
            self.entered += 1;
        }
        Ok(())
    }

    /// Runs inbound hooks in reverse order, only for interceptors whose
    /// outbound hook ran. Runs at most once per outbound pass.
    ///
    /// Every hook sees the status as replaced by the hooks after it. The
    /// first rejection wins.
    pub fn run_inbound(&mut self, ctx: &CallContext, status: &Status) -> Result<()> {
        let entered = std::mem::take(&mut self.entered);
        let mut current = status.clone();
        let mut rejection = None;

        for interceptor in self.interceptors[..entered].iter().rev() {
            let Some(hook) = &interceptor.on_finish else {
                continue;
            };
            if let Err(replacement) = hook(ctx, &current) {
                tracing::debug!(
                    interceptor = %interceptor.name,
                    method = %ctx.method,
                    code = %replacement.code,
                    "call rejected on the way in"
                );
                if rejection.is_none() {
                    rejection = Some(interceptor.rejected(replacement.clone()));
                }
                current = replacement;
            }
        }

        match rejection {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
