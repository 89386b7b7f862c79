use tokio_util::sync::CancellationToken;

/// Cancels one pending lookup.
///
/// After [`cancel`](Self::cancel) returns, that lookup's completion is never
/// invoked. Other lookups joined to the same download are unaffected; the
/// download itself is abandoned once nobody is waiting for it. Dropping the
/// handle does not cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
