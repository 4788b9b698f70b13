//! Logical trace identifiers that survive a round trip through the store.
//!
//! A [`TraceContext`] is carried in event metadata (`$traceId`, `$spanId`,
//! `$parentSpanId`). Appends inject the ambient context; consumers read it back
//! and scope it around handler execution, so an append made by a handler
//! continues the trace of the event that caused it.

use std::future::Future;

use uuid::Uuid;

use crate::event::{Metadata, meta_keys};

tokio::task_local! {
    static CURRENT: TraceContext;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// A new span within the same trace, parented to this one.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// The context scoped on the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Child of the current context, or a fresh root when none is active.
    pub fn current_or_new() -> Self {
        Self::current().map(|c| c.child()).unwrap_or_else(Self::new_root)
    }

    /// Run `fut` with this context as the ambient one.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }

    /// Read a context previously injected into metadata.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let trace_id = metadata.get_str(meta_keys::TRACE_ID)?;
        let span_id = metadata.get_str(meta_keys::SPAN_ID)?;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: metadata.get_str(meta_keys::PARENT_SPAN_ID).map(str::to_string),
        })
    }

    /// Copy of `metadata` carrying this context's identifiers.
    pub fn inject(&self, metadata: &Metadata) -> Metadata {
        let mut out = metadata.clone();
        out.insert(meta_keys::TRACE_ID, self.trace_id.as_str());
        out.insert(meta_keys::SPAN_ID, self.span_id.as_str());
        match &self.parent_span_id {
            Some(parent) => out.insert(meta_keys::PARENT_SPAN_ID, parent.as_str()),
            None => {
                out.remove(meta_keys::PARENT_SPAN_ID);
            }
        }
        out
    }
}

fn new_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}
