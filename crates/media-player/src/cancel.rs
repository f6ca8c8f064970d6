//! Cancellation tokens for blocking stage operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on how long a blocked stage takes to observe cancellation.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Shared cancellation flag.
///
/// A child token observes its own flag and every ancestor's, so cancelling an item
/// cancels every segment pipeline below it while a segment can be cancelled alone.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Node>,
}

#[derive(Debug, Default)]
struct Node {
    flag: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Node {
                flag: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.flag.load(Ordering::Acquire) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false)
    }
}
