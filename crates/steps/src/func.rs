//! Adapter turning async closures into step handlers.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::{StepContext, StepError, StepHandler};

/// A [`StepHandler`] backed by a closure returning a future.
pub struct FnStep<F> {
    func: F,
}

/// Wrap an async closure as a step handler.
///
/// ```ignore
/// let double = handler_fn(|input, _ctx| async move {
///     Ok(json!({ "x": input["x"].as_i64().unwrap_or(0) * 2 }))
/// });
/// ```
pub fn handler_fn<F, Fut>(func: F) -> FnStep<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    FnStep { func }
}

#[async_trait]
impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    async fn execute(&self, input: Value, ctx: &StepContext) -> Result<Value, StepError> {
        (self.func)(input, ctx.clone()).await
    }
}
