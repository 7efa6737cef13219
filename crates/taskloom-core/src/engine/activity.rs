//! Activity calls and the call pipeline.
//!
//! An `ActivityCall` is a named, re-invocable unit of externally visible work.
//! Before the runtime invokes it, every call passes through the same
//! `CallPipeline`: an ordered list of `ActivityCall -> ActivityCall` layers
//! (retry policy, timeout, result offload, error rewrap).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use taskloom_types::error::ActivityErrorKind;

use super::error::ExecutionError;
use super::expression::ExpressionError;
use super::offload::PayloadOffloader;
use super::retry::RetryPolicy;
use super::runtime::WorkflowRuntime;

// ---------------------------------------------------------------------------
// ActivityError
// ---------------------------------------------------------------------------

/// Failure of a single activity attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("{message}")]
    Failed {
        kind: ActivityErrorKind,
        message: String,
    },
}

impl ActivityError {
    pub fn new(kind: ActivityErrorKind, message: impl Into<String>) -> Self {
        ActivityError::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ActivityErrorKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ActivityErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ActivityErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ActivityErrorKind::Internal, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ActivityErrorKind::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ActivityErrorKind::Cancelled, "cancelled")
    }

    pub fn kind(&self) -> ActivityErrorKind {
        match self {
            ActivityError::Expression(_) => ActivityErrorKind::Expression,
            ActivityError::Failed { kind, .. } => *kind,
        }
    }
}

// ---------------------------------------------------------------------------
// ActivityCall
// ---------------------------------------------------------------------------

pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send>>;

/// Re-invocable body of an activity. Each attempt calls it again.
pub type ActivityFn = Arc<dyn Fn() -> ActivityFuture + Send + Sync>;

/// A named externally visible call plus the policy the runtime applies to it.
#[derive(Clone)]
pub struct ActivityCall {
    pub name: String,
    /// Start-to-close timeout per attempt.
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    body: ActivityFn,
}

impl ActivityCall {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            retry_policy: None,
            body: Arc::new(move || -> ActivityFuture { Box::pin(body()) }),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Start one attempt.
    pub fn invoke(&self) -> ActivityFuture {
        (self.body)()
    }

    /// Replace the body with a wrapper around the current one.
    pub fn wrap_body(mut self, wrap: impl FnOnce(ActivityFn) -> ActivityFn) -> Self {
        self.body = wrap(self.body);
        self
    }
}

impl std::fmt::Debug for ActivityCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityCall")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One transformation applied to every activity call.
pub trait CallLayer: Send + Sync {
    fn apply(&self, call: ActivityCall) -> ActivityCall;
}

/// Ordered list of layers applied uniformly to activity calls.
#[derive(Clone, Default)]
pub struct CallPipeline {
    layers: Vec<Arc<dyn CallLayer>>,
}

impl CallPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: impl CallLayer + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Standard engine pipeline: shared retry policy, default timeout,
    /// error rewrap, then result offload (outermost).
    pub fn standard(
        retry_policy: RetryPolicy,
        default_timeout: Duration,
        offloader: PayloadOffloader,
    ) -> Self {
        Self::new()
            .with_layer(RetryLayer(retry_policy))
            .with_layer(TimeoutLayer(default_timeout))
            .with_layer(ErrorRewrapLayer)
            .with_layer(OffloadLayer(offloader))
    }

    pub fn apply(&self, call: ActivityCall) -> ActivityCall {
        self.layers
            .iter()
            .fold(call, |call, layer| layer.apply(call))
    }
}

/// Attaches the shared retry policy.
pub struct RetryLayer(pub RetryPolicy);

impl CallLayer for RetryLayer {
    fn apply(&self, mut call: ActivityCall) -> ActivityCall {
        call.retry_policy = Some(self.0.clone());
        call
    }
}

/// Attaches a timeout unless the call already carries its own.
pub struct TimeoutLayer(pub Duration);

impl CallLayer for TimeoutLayer {
    fn apply(&self, mut call: ActivityCall) -> ActivityCall {
        call.timeout.get_or_insert(self.0);
        call
    }
}

/// Prefixes failure messages with the activity name so they stay
/// attributable after crossing execution boundaries.
pub struct ErrorRewrapLayer;

impl CallLayer for ErrorRewrapLayer {
    fn apply(&self, call: ActivityCall) -> ActivityCall {
        let name = call.name.clone();
        call.wrap_body(move |inner| {
            Arc::new(move || -> ActivityFuture {
                let attempt = inner();
                let name = name.clone();
                Box::pin(async move {
                    attempt.await.map_err(|e| match e {
                        ActivityError::Failed { kind, message } if !message.starts_with('[') => {
                            ActivityError::Failed {
                                kind,
                                message: format!("[{name}] {message}"),
                            }
                        }
                        other => other,
                    })
                })
            })
        })
    }
}

/// Offloads large results before they reach history.
pub struct OffloadLayer(pub PayloadOffloader);

impl CallLayer for OffloadLayer {
    fn apply(&self, call: ActivityCall) -> ActivityCall {
        let offloader = self.0.clone();
        call.wrap_body(move |inner| {
            Arc::new(move || -> ActivityFuture {
                let attempt = inner();
                let offloader = offloader.clone();
                Box::pin(async move {
                    let value = attempt.await?;
                    offloader
                        .offload(value)
                        .await
                        .map_err(|e| ActivityError::transient(e.to_string()))
                })
            })
        })
    }
}

// ---------------------------------------------------------------------------
// ActivityInvoker
// ---------------------------------------------------------------------------

/// Runs activity calls through the pipeline and the runtime, then resolves
/// offloaded results.
#[derive(Clone)]
pub struct ActivityInvoker {
    pipeline: CallPipeline,
    offloader: PayloadOffloader,
}

impl ActivityInvoker {
    pub fn new(pipeline: CallPipeline, offloader: PayloadOffloader) -> Self {
        Self {
            pipeline,
            offloader,
        }
    }

    pub fn offloader(&self) -> &PayloadOffloader {
        &self.offloader
    }

    pub async fn invoke(
        &self,
        runtime: &dyn WorkflowRuntime,
        call: ActivityCall,
    ) -> Result<Value, ExecutionError> {
        let call = self.pipeline.apply(call);
        let name = call.name.clone();
        let value = runtime
            .execute_activity(call)
            .await
            .map_err(|e| ExecutionError::from_activity(name, e))?;
        Ok(self.offloader.resolve(value).await?)
    }
}
