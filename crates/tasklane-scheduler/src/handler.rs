//! Handler SPI.

use async_trait::async_trait;

use tasklane_core::{HandlerOutcome, Result, Task};

use crate::context::ExecutionContext;

/// Business logic selected by intent type.
///
/// `task` is the record as claimed; all mutation goes through `ctx`, which is
/// only valid for the duration of this call. Returning `Err` or panicking is
/// converted to a FAILED transition by the worker harness.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &ExecutionContext, task: &Task) -> Result<HandlerOutcome>;
}
