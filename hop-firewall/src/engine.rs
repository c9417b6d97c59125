//! Filter engine abstraction and scoped transactions
//!
//! Every rule-set mutation happens inside a [`Transaction`]. The guard aborts
//! on drop unless [`Transaction::commit`] succeeded, so an early return with
//! `?` never leaves half of a rule set visible.

use std::ops::{Deref, DerefMut};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::rule::{FirewallRule, SubLayer};

/// Transactional packet-filter engine session
///
/// Implementations own the native engine handle exclusively.
pub trait FilterEngine: Send {
    fn begin_transaction(&mut self) -> Result<()>;

    fn commit_transaction(&mut self) -> Result<()>;

    fn abort_transaction(&mut self) -> Result<()>;

    /// Add a sublayer; an existing sublayer with the same key is reported as
    /// `FWP_E_ALREADY_EXISTS`
    fn add_sublayer(&mut self, sublayer: &SubLayer) -> Result<()>;

    fn delete_sublayer(&mut self, key: Uuid) -> Result<()>;

    /// Add a rule and return its engine-assigned id
    fn add_filter(&mut self, rule: &FirewallRule) -> Result<u64>;

    fn delete_filter(&mut self, id: u64) -> Result<()>;

    /// Close the engine session; a second call is a no-op
    fn close(&mut self) -> Result<()>;
}

/// An open engine transaction
///
/// Dereferences to the engine so mutations read naturally:
///
/// ```ignore
/// let mut txn = Transaction::begin(&mut engine)?;
/// let id = txn.add_filter(&rule)?;
/// txn.commit()?;
/// ```
pub struct Transaction<'a, E: FilterEngine + ?Sized> {
    engine: &'a mut E,
    finished: bool,
}

impl<'a, E: FilterEngine + ?Sized> Transaction<'a, E> {
    /// Begin a transaction on `engine`
    pub fn begin(engine: &'a mut E) -> Result<Self> {
        engine.begin_transaction()?;
        Ok(Self {
            engine,
            finished: false,
        })
    }

    /// Commit; a failed commit is followed by an explicit abort
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.engine.commit_transaction() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.rollback(e)),
        }
    }

    /// Abort explicitly
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.engine.abort_transaction()
    }

    /// Abort after `error` and return the error to report
    ///
    /// When the abort fails as well both errors are kept in
    /// [`Error::CleanupFailed`].
    pub fn fail(mut self, error: Error) -> Error {
        self.finished = true;
        self.rollback(error)
    }

    fn rollback(&mut self, error: Error) -> Error {
        log::warn!("Aborting filter transaction: {}", error);
        match self.engine.abort_transaction() {
            Ok(()) => error,
            Err(cleanup) => {
                log::error!("Filter transaction abort failed: {}", cleanup);
                Error::CleanupFailed {
                    original: Box::new(error),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }
}

impl<E: FilterEngine + ?Sized> Deref for Transaction<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &*self.engine
    }
}

impl<E: FilterEngine + ?Sized> DerefMut for Transaction<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut *self.engine
    }
}

impl<E: FilterEngine + ?Sized> Drop for Transaction<'_, E> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("Filter transaction dropped without commit, aborting");
            if let Err(e) = self.engine.abort_transaction() {
                log::error!("Filter transaction abort failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryEngine;
    use crate::rule::FirewallRule;

    fn block_rule() -> FirewallRule {
        FirewallRule::block_all(SubLayer::DEFAULT_KEY)
    }

    #[test]
    fn test_commit_publishes() {
        let mut engine = MemoryEngine::new();
        let observer = engine.clone();
        let mut txn = Transaction::begin(&mut engine).unwrap();
        txn.add_sublayer(&SubLayer::default()).unwrap();
        txn.add_filter(&block_rule()).unwrap();
        // Nothing visible mid-transaction
        assert!(observer.visible_rules().is_empty());
        assert!(observer.in_transaction());
        txn.commit().unwrap();

        assert_eq!(engine.visible_rules().len(), 1);
        assert!(!engine.in_transaction());
    }

    #[test]
    fn test_drop_aborts() {
        let mut engine = MemoryEngine::new();
        {
            let mut txn = Transaction::begin(&mut engine).unwrap();
            txn.add_filter(&block_rule()).unwrap();
        }
        assert!(engine.visible_rules().is_empty());
        assert!(!engine.in_transaction());
        assert_eq!(engine.abort_count(), 1);
    }

    #[test]
    fn test_failed_commit_aborts() {
        let mut engine = MemoryEngine::new();
        engine.fail_commit(true);
        let mut txn = Transaction::begin(&mut engine).unwrap();
        txn.add_filter(&block_rule()).unwrap();
        assert!(txn.commit().is_err());

        assert!(!engine.in_transaction());
        assert_eq!(engine.abort_count(), 1);
        assert!(engine.visible_rules().is_empty());
    }

    #[test]
    fn test_fail_reports_cleanup_failure_distinctly() {
        let mut engine = MemoryEngine::new();
        engine.fail_abort(true);
        let txn = Transaction::begin(&mut engine).unwrap();
        let err = txn.fail(Error::platform("FwpmFilterAdd0", 0x8032_0011));
        match err {
            Error::CleanupFailed { original, cleanup } => {
                assert_eq!(original.code(), Some(0x8032_0011));
                assert!(matches!(*cleanup, Error::Platform { op: "FwpmTransactionAbort0", .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_begin_failure_leaves_no_guard() {
        let mut engine = MemoryEngine::new();
        engine.fail_begin(true);
        assert!(Transaction::begin(&mut engine).is_err());
        assert_eq!(engine.abort_count(), 0);
    }
}
