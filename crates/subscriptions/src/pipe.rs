//! The consume pipe: an immutable chain of filters ending in handler dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::MessageConsumeContext;
use crate::handler::HandlerDispatch;

/// One stage of the consume pipe.
///
/// A filter receives the context and the continuation. It may call
/// `next.run(ctx)` (possibly after changing the context), hand both to
/// another task, or drop the context to short-circuit. Short-circuiting is
/// not a failure; record one with [`MessageConsumeContext::nack`].
#[async_trait]
pub trait ConsumeFilter: Send + Sync + 'static {
    async fn send(&self, ctx: MessageConsumeContext, next: Next);
}

/// Continuation into the rest of the pipe.
#[derive(Clone)]
pub struct Next {
    filters: Arc<[Arc<dyn ConsumeFilter>]>,
    index: usize,
}

impl Next {
    /// Run the remaining stages. Past the last stage the context is dropped,
    /// which acknowledges it.
    pub async fn run(self, ctx: MessageConsumeContext) {
        let Some(filter) = self.filters.get(self.index).cloned() else {
            return;
        };
        let next = Next {
            filters: self.filters,
            index: self.index + 1,
        };
        filter.send(ctx, next).await;
    }

    /// Number of stages still ahead of this cursor.
    pub fn remaining(&self) -> usize {
        self.filters.len().saturating_sub(self.index)
    }
}

impl core::fmt::Debug for Next {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("stages", &self.filters.len())
            .finish()
    }
}

/// Ordered chain shared by every message in a subscription.
#[derive(Clone)]
pub struct ConsumePipe {
    filters: Arc<[Arc<dyn ConsumeFilter>]>,
}

impl ConsumePipe {
    pub fn builder() -> ConsumePipeBuilder {
        ConsumePipeBuilder::default()
    }

    /// Pipe that only dispatches to handlers.
    pub fn new(dispatch: HandlerDispatch) -> Self {
        Self::builder().build(dispatch)
    }

    /// Push one context through every stage.
    pub async fn send(&self, ctx: MessageConsumeContext) {
        Next {
            filters: Arc::clone(&self.filters),
            index: 0,
        }
        .run(ctx)
        .await;
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl core::fmt::Debug for ConsumePipe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumePipe")
            .field("stages", &self.filters.len())
            .finish()
    }
}

#[derive(Default)]
pub struct ConsumePipeBuilder {
    filters: Vec<Arc<dyn ConsumeFilter>>,
}

impl ConsumePipeBuilder {
    pub fn add_filter(mut self, filter: impl ConsumeFilter) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Finish the chain with the terminal handler stage.
    pub fn build(mut self, dispatch: HandlerDispatch) -> ConsumePipe {
        self.filters.push(Arc::new(dispatch));
        ConsumePipe {
            filters: self.filters.into(),
        }
    }
}

type Predicate = dyn Fn(&MessageConsumeContext) -> bool + Send + Sync;

/// Lets through only contexts matching a predicate; the rest are ignored.
pub struct MessageFilter {
    predicate: Box<Predicate>,
}

impl MessageFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&MessageConsumeContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
        }
    }

    /// Keep only the listed message types.
    pub fn message_types<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        Self::new(move |ctx| types.iter().any(|t| t == ctx.message_type()))
    }
}

#[async_trait]
impl ConsumeFilter for MessageFilter {
    async fn send(&self, mut ctx: MessageConsumeContext, next: Next) {
        if (self.predicate)(&ctx) {
            next.run(ctx).await;
        } else {
            tracing::trace!(message_type = ctx.message_type(), "message filtered out");
            ctx.ignore();
        }
    }
}
