//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a cheap, cloneable flag. Tokens form a shallow tree:
//! a child observes its parent's cancellation, while cancelling a child leaves
//! the parent untouched. The listener owns the root token; every client
//! connection gets a child so that `COM_QUIT` or a disconnect stops only that
//! connection, while a server shutdown stops all of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Return `Err(Error::Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        assert!(matches!(other.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn child_follows_parent_but_not_reverse() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!b.is_cancelled());

        root.cancel();
        assert!(b.is_cancelled());
    }
}
