//! Middleware Pipeline
//!
//! A composable chain invoked around every ledger operation, outside the
//! storage transaction so it can short-circuit requests before any lock
//! is acquired. Onion order is a property of `Pipeline::execute`:
//! `before` hooks run in declaration order, `after` hooks in reverse,
//! and a failing `before` unwinds only the middlewares already entered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ClearingError;
use crate::types::Actor;

/// Context threaded through the chain.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub action: String,
    pub params: serde_json::Value,
    pub actor: Actor,
    pub start_time: DateTime<Utc>,
    /// Free-form annotations written by middlewares.
    pub annotations: HashMap<String, serde_json::Value>,
}

impl OperationContext {
    pub fn new(action: impl Into<String>, actor: Actor, params: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            params,
            actor,
            start_time: Utc::now(),
            annotations: HashMap::new(),
        }
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.annotations.insert(key.into(), value);
    }
}

/// One interceptor around a ledger operation.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs before the operation, in declaration order. An error here
    /// short-circuits the request.
    async fn before(&self, _ctx: &mut OperationContext) -> Result<(), ClearingError> {
        Ok(())
    }

    /// Runs after the operation, in reverse declaration order.
    async fn after(&self, _ctx: &mut OperationContext, _error: Option<&ClearingError>) {}

    /// Maps the outgoing error, applied during the after phase.
    fn transform_error(&self, error: ClearingError) -> ClearingError {
        error
    }
}

/// Ordered middleware chain, composed at registration time.
#[derive(Default)]
pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.chain.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run an operation through the chain.
    pub async fn execute<T, F, Fut>(&self, ctx: &mut OperationContext, op: F) -> Result<T, ClearingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClearingError>>,
    {
        for (entered, middleware) in self.chain.iter().enumerate() {
            if let Err(e) = middleware.before(ctx).await {
                let mut error = e;
                for unwound in self.chain[..entered].iter().rev() {
                    unwound.after(ctx, Some(&error)).await;
                    error = unwound.transform_error(error);
                }
                return Err(error);
            }
        }

        let mut outcome = op().await;

        for middleware in self.chain.iter().rev() {
            middleware.after(ctx, outcome.as_ref().err()).await;
            outcome = match outcome {
                Err(e) => Err(middleware.transform_error(e)),
                ok => ok,
            };
        }

        outcome
    }
}

// ── Built-in middlewares ──

/// Structured request logging.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn before(&self, ctx: &mut OperationContext) -> Result<(), ClearingError> {
        tracing::debug!(action = %ctx.action, actor = %ctx.actor.id, "Operation started");
        Ok(())
    }

    async fn after(&self, ctx: &mut OperationContext, error: Option<&ClearingError>) {
        match error {
            None => tracing::info!(action = %ctx.action, actor = %ctx.actor.id, "Operation completed"),
            Some(e) => {
                tracing::warn!(action = %ctx.action, actor = %ctx.actor.id, error = %e, "Operation failed")
            }
        }
    }
}

/// Duration annotation on the context.
pub struct TimingMiddleware;

#[async_trait]
impl Middleware for TimingMiddleware {
    async fn after(&self, ctx: &mut OperationContext, _error: Option<&ClearingError>) {
        let elapsed = Utc::now() - ctx.start_time;
        ctx.annotate("duration_ms", serde_json::json!(elapsed.num_milliseconds()));
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiting per actor.
pub struct RateLimitMiddleware {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimitMiddleware {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_take(&self, actor_id: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let bucket = buckets.entry(actor_id.to_string()).or_insert_with(|| TokenBucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn before(&self, ctx: &mut OperationContext) -> Result<(), ClearingError> {
        if self.try_take(&ctx.actor.id) {
            Ok(())
        } else {
            Err(ClearingError::RateLimited {
                actor_id: ctx.actor.id.clone(),
            })
        }
    }
}

type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), ClearingError> + Send + Sync>;

/// Per-action input validation.
#[derive(Default)]
pub struct ValidationMiddleware {
    validators: HashMap<String, Validator>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator<F>(mut self, action: &str, validator: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), ClearingError> + Send + Sync + 'static,
    {
        self.validators.insert(action.to_string(), Arc::new(validator));
        self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn before(&self, ctx: &mut OperationContext) -> Result<(), ClearingError> {
        if let Some(validator) = self.validators.get(&ctx.action) {
            validator(&ctx.params)?;
        }
        Ok(())
    }
}

/// Outgoing error mapping.
pub struct ErrorTransformMiddleware {
    transform: Arc<dyn Fn(ClearingError) -> ClearingError + Send + Sync>,
}

impl ErrorTransformMiddleware {
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(ClearingError) -> ClearingError + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl Middleware for ErrorTransformMiddleware {
    fn transform_error(&self, error: ClearingError) -> ClearingError {
        (self.transform)(error)
    }
}

/// Conditional gating on the context.
pub struct GateMiddleware {
    predicate: Arc<dyn Fn(&OperationContext) -> bool + Send + Sync>,
}

impl GateMiddleware {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&OperationContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl Middleware for GateMiddleware {
    async fn before(&self, ctx: &mut OperationContext) -> Result<(), ClearingError> {
        if (self.predicate)(ctx) {
            Ok(())
        } else {
            Err(ClearingError::Forbidden {
                actor_id: ctx.actor.id.clone(),
                action: ctx.action.clone(),
            })
        }
    }
}
