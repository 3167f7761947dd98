use tokio_util::sync::CancellationToken;

/// Per-request scope and cancellation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Namespace the request is addressed to; empty means all namespaces
    /// for reads and is required to be filled by the object on create.
    pub namespace: String,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), cancel: CancellationToken::new() }
    }

    pub fn all_namespaces() -> Self {
        Self::new("")
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::all_namespaces()
    }
}
