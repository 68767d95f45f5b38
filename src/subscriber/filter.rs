//! Hooks around handler invocation.

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::message::Message;

use super::registry::HandlerContext;

/// What to do with a handler error.
#[derive(Debug)]
pub enum ExceptionVerdict {
    /// Treat the invocation as successful with `result` as its output.
    Suppressed { result: Value },
    /// Keep the error as is.
    Rethrown,
    /// Replace the error.
    Transformed(eyre::Report),
}

/// Runs before and after every handler invocation, in registration order.
///
/// An error from [`on_subscribe_executing`](Self::on_subscribe_executing) or
/// [`on_subscribe_executed`](Self::on_subscribe_executed) counts as a handler
/// failure.
pub trait SubscribeFilter: Send + Sync + 'static {
    fn on_subscribe_executing<'a>(
        &'a self,
        _context: &'a HandlerContext,
        _message: &'a Message,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_subscribe_executed<'a>(
        &'a self,
        _context: &'a HandlerContext,
        _result: &'a Value,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_subscribe_exception<'a>(
        &'a self,
        _context: &'a HandlerContext,
        _error: &'a eyre::Report,
    ) -> BoxFuture<'a, ExceptionVerdict> {
        Box::pin(async { ExceptionVerdict::Rethrown })
    }
}

/// Passes `error` through every filter. `Suppressed` ends the chain with a
/// success; `Transformed` swaps the error seen by the remaining filters.
pub async fn resolve_exception(
    filters: &[std::sync::Arc<dyn SubscribeFilter>],
    context: &HandlerContext,
    mut error: eyre::Report,
) -> Result<Value, eyre::Report> {
    for filter in filters {
        match filter.on_subscribe_exception(context, &error).await {
            ExceptionVerdict::Suppressed { result } => return Ok(result),
            ExceptionVerdict::Rethrown => {}
            ExceptionVerdict::Transformed(replacement) => error = replacement,
        }
    }
    Err(error)
}
