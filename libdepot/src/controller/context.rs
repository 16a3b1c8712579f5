use crate::auth::Identity;
use crate::error::{DepotError, Result};
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Per-request state carried into the controller.
///
/// Foreground operations stop when the token is cancelled or the deadline
/// passes. Work that must outlive the request uses [`RequestContext::detach`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    operator: Identity,
    span: Span,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context for `operator` inside the current span.
    pub fn new(operator: Identity) -> Self {
        Self {
            operator,
            span: Span::current(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn operator(&self) -> &Identity {
        &self.operator
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A copy that keeps the operator and span but not the request's
    /// cancellation or deadline. Its token is a child of `parent`.
    pub fn detach(&self, parent: &CancellationToken) -> Self {
        Self {
            operator: self.operator.clone(),
            span: self.span.clone(),
            cancel: parent.child_token(),
            deadline: None,
        }
    }

    /// Drives `work` until it finishes, the request is cancelled, or the
    /// deadline passes.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let work = work.instrument(self.span.clone());
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            result = work => result,
            _ = self.cancel.cancelled() => Err(DepotError::network("request cancelled")),
            _ = deadline => Err(DepotError::network("request deadline exceeded")),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(Identity::Anonymous)
    }
}
