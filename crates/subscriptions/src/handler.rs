//! Handlers and the terminal dispatch stage.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use eventflow_core::TraceContext;
use eventflow_observability::telemetry::spans;

use crate::ack::HandlingStatus;
use crate::context::{MessageConsumeContext, MessageInfo};
use crate::error::ConsumeError;
use crate::pipe::{ConsumeFilter, Next};

/// What a handler did with a message it did not fail on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventHandlingStatus {
    Handled,
    Ignored,
}

impl From<EventHandlingStatus> for HandlingStatus {
    fn from(status: EventHandlingStatus) -> Self {
        match status {
            EventHandlingStatus::Handled => HandlingStatus::Handled,
            EventHandlingStatus::Ignored => HandlingStatus::Ignored,
        }
    }
}

/// A consumer of delivered events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs and failure reports.
    fn handler_type(&self) -> &str;

    async fn handle(&self, ctx: &MessageConsumeContext) -> Result<EventHandlingStatus, ConsumeError>;
}

type Route = Box<dyn Fn(eventflow_core::Payload, MessageInfo) -> BoxFuture<'static, RouteOutcome> + Send + Sync>;

enum RouteOutcome {
    Done,
    WrongType,
    Failed(anyhow::Error),
}

/// Handler routing by message type to closures over the concrete payload.
///
/// ```ignore
/// let handler = TypedEventHandler::new("orders")
///     .on::<OrderPlaced, _, _>("OrderPlaced", |evt, info| async move {
///         println!("{} at {}", evt.order_id, info.stream_position);
///         Ok(())
///     });
/// ```
pub struct TypedEventHandler {
    name: String,
    routes: HashMap<String, Route>,
}

impl TypedEventHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: HashMap::new(),
        }
    }

    /// Route `message_type` to `f`. A later route for the same type replaces
    /// the earlier one.
    pub fn on<T, F, Fut>(mut self, message_type: impl Into<String>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, MessageInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let route: Route = Box::new(move |payload, info| match payload.downcast::<T>() {
            Ok(typed) => {
                let fut = f(typed, info);
                async move {
                    match fut.await {
                        Ok(()) => RouteOutcome::Done,
                        Err(e) => RouteOutcome::Failed(e),
                    }
                }
                .boxed()
            }
            Err(_) => futures::future::ready(RouteOutcome::WrongType).boxed(),
        });
        self.routes.insert(message_type.into(), route);
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }
}

#[async_trait]
impl EventHandler for TypedEventHandler {
    fn handler_type(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &MessageConsumeContext) -> Result<EventHandlingStatus, ConsumeError> {
        let Some(route) = self.routes.get(ctx.message_type()) else {
            return Ok(EventHandlingStatus::Ignored);
        };
        let Some(payload) = ctx.payload().cloned() else {
            return Ok(EventHandlingStatus::Ignored);
        };

        match route(payload, ctx.info()).await {
            RouteOutcome::Done => Ok(EventHandlingStatus::Handled),
            RouteOutcome::WrongType => Err(ConsumeError::handler(
                &self.name,
                ctx.message_type(),
                "payload does not match the registered type",
            )),
            RouteOutcome::Failed(e) => Err(ConsumeError::handler(
                &self.name,
                ctx.message_type(),
                format!("{e:#}"),
            )),
        }
    }
}

/// Terminal pipe stage: runs every handler and merges their statuses.
#[derive(Default)]
pub struct HandlerDispatch {
    handlers: Vec<Arc<dyn EventHandler>>,
    fail_on_unknown_type: bool,
}

impl HandlerDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: impl EventHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Treat messages no handler processed as failures instead of ignoring them.
    pub fn fail_on_unknown_type(mut self, fail: bool) -> Self {
        self.fail_on_unknown_type = fail;
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    async fn dispatch(&self, ctx: &MessageConsumeContext) -> HandlingStatus {
        let mut status = HandlingStatus::Ignored;

        for handler in &self.handlers {
            let outcome = AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await;
            let handled = match outcome {
                Ok(Ok(s)) => s.into(),
                Ok(Err(err)) => {
                    tracing::warn!(
                        handler = handler.handler_type(),
                        message_type = ctx.message_type(),
                        stream_position = ctx.stream_position(),
                        error = %err,
                        "event handler failed"
                    );
                    HandlingStatus::Failed(err)
                }
                Err(_) => {
                    tracing::error!(
                        handler = handler.handler_type(),
                        message_type = ctx.message_type(),
                        "event handler panicked"
                    );
                    HandlingStatus::Failed(ConsumeError::handler(
                        handler.handler_type(),
                        ctx.message_type(),
                        "handler panicked",
                    ))
                }
            };
            status = status.merge(handled);
        }

        if self.fail_on_unknown_type && status == HandlingStatus::Ignored {
            return HandlingStatus::Failed(ConsumeError::UnknownMessageType(
                ctx.message_type().to_string(),
            ));
        }
        status
    }
}

#[async_trait]
impl ConsumeFilter for HandlerDispatch {
    async fn send(&self, mut ctx: MessageConsumeContext, _next: Next) {
        // Already failed upstream (e.g. undecodable payload): nothing to hand out.
        if ctx.has_failed() {
            return;
        }

        let trace = TraceContext::from_metadata(ctx.metadata())
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::new_root);
        let span = tracing::info_span!(
            spans::HANDLE_EVENT,
            subscription = ctx.subscription_id(),
            message_type = ctx.message_type(),
            stream = %ctx.stream(),
            stream_position = ctx.stream_position(),
            trace_id = %trace.trace_id,
        );

        let status = trace.scope(self.dispatch(&ctx)).instrument(span).await;
        match status {
            HandlingStatus::Handled => ctx.handled(),
            HandlingStatus::Failed(err) => ctx.nack(err),
            HandlingStatus::Ignored | HandlingStatus::Pending => ctx.ignore(),
        }
    }
}
