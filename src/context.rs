use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::EngineError;

/// Cancellation signal shared by everything working on behalf of one call.
///
/// Children observe their parent's cancellation; canceling a child leaves the
/// parent untouched.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    canceled: AtomicBool,
    parent: Option<Context>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().is_some_and(Context::is_canceled)
    }

    pub fn check(&self) -> Result<(), EngineError> {
        match self.is_canceled() {
            true => Err(EngineError::Canceled),
            false => Ok(()),
        }
    }
}
