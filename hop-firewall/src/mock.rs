//! In-memory filter engine for testing
//!
//! [`MemoryEngine`] keeps a committed rule set plus a working copy while a
//! transaction is open, so tests can assert exactly what the OS would see.
//! Handles are cheap clones of one shared state: keep one clone outside the
//! kill-switch to inspect it or to inject faults.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::engine::FilterEngine;
use crate::error::{codes, Error, Result};
use crate::rule::{FirewallRule, SubLayer};

#[derive(Debug, Clone, Default)]
struct RuleSet {
    sublayers: BTreeMap<Uuid, SubLayer>,
    filters: BTreeMap<u64, FirewallRule>,
}

#[derive(Debug, Default)]
struct Faults {
    begin: bool,
    commit: bool,
    abort: bool,
    delete_filter: bool,
    /// Successful adds left before the next add fails
    filter_add_countdown: Option<usize>,
}

#[derive(Debug)]
struct State {
    committed: RuleSet,
    working: Option<RuleSet>,
    next_id: u64,
    closed: bool,
    close_count: usize,
    abort_count: usize,
    faults: Faults,
}

impl Default for State {
    fn default() -> Self {
        Self {
            committed: RuleSet::default(),
            working: None,
            next_id: 0x10000,
            closed: false,
            close_count: 0,
            abort_count: 0,
            faults: Faults::default(),
        }
    }
}

impl State {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::platform("engine call", codes::ERROR_INVALID_HANDLE));
        }
        Ok(())
    }

    /// Set mutated by the current call: the working copy if a transaction is
    /// open, the committed set otherwise
    fn target(&mut self) -> &mut RuleSet {
        match self.working {
            Some(ref mut working) => working,
            None => &mut self.committed,
        }
    }
}

/// Shared-state in-memory [`FilterEngine`]
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a sublayer as if another session had created it
    pub fn preinstall_sublayer(&self, sublayer: SubLayer) {
        self.state().committed.sublayers.insert(sublayer.key, sublayer);
    }

    /// Make `begin_transaction` fail
    pub fn fail_begin(&self, fail: bool) {
        self.state().faults.begin = fail;
    }

    /// Make `commit_transaction` fail
    pub fn fail_commit(&self, fail: bool) {
        self.state().faults.commit = fail;
    }

    /// Make `abort_transaction` fail
    pub fn fail_abort(&self, fail: bool) {
        self.state().faults.abort = fail;
    }

    /// Make `delete_filter` fail
    pub fn fail_delete_filter(&self, fail: bool) {
        self.state().faults.delete_filter = fail;
    }

    /// Let `successes` more filter adds succeed, then fail the next one
    pub fn fail_filter_add_after(&self, successes: usize) {
        self.state().faults.filter_add_countdown = Some(successes);
    }

    /// Committed rules ordered by id
    pub fn visible_rules(&self) -> Vec<(u64, FirewallRule)> {
        self.state()
            .committed
            .filters
            .iter()
            .map(|(id, rule)| (*id, rule.clone()))
            .collect()
    }

    /// Committed sublayers
    pub fn sublayers(&self) -> Vec<SubLayer> {
        self.state().committed.sublayers.values().cloned().collect()
    }

    pub fn in_transaction(&self) -> bool {
        self.state().working.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of `close` calls that actually closed the session
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    /// Number of successful aborts
    pub fn abort_count(&self) -> usize {
        self.state().abort_count
    }
}

impl FilterEngine for MemoryEngine {
    fn begin_transaction(&mut self) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        if state.faults.begin {
            return Err(Error::platform("FwpmTransactionBegin0", 0x8032_0017));
        }
        if state.working.is_some() {
            return Err(Error::platform("FwpmTransactionBegin0", codes::FWP_E_TXN_IN_PROGRESS));
        }
        state.working = Some(state.committed.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        if state.working.is_none() {
            return Err(Error::platform("FwpmTransactionCommit0", codes::FWP_E_NO_TXN_IN_PROGRESS));
        }
        if state.faults.commit {
            return Err(Error::platform("FwpmTransactionCommit0", 0x8032_0017));
        }
        if let Some(working) = state.working.take() {
            state.committed = working;
        }
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        if state.faults.abort {
            return Err(Error::platform("FwpmTransactionAbort0", codes::ERROR_INVALID_HANDLE));
        }
        if state.working.take().is_none() {
            return Err(Error::platform("FwpmTransactionAbort0", codes::FWP_E_NO_TXN_IN_PROGRESS));
        }
        state.abort_count += 1;
        Ok(())
    }

    fn add_sublayer(&mut self, sublayer: &SubLayer) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        let target = state.target();
        if target.sublayers.contains_key(&sublayer.key) {
            return Err(Error::platform("FwpmSubLayerAdd0", codes::FWP_E_ALREADY_EXISTS));
        }
        target.sublayers.insert(sublayer.key, sublayer.clone());
        Ok(())
    }

    fn delete_sublayer(&mut self, key: Uuid) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        let target = state.target();
        if target.filters.values().any(|f| f.sublayer == key) {
            return Err(Error::platform("FwpmSubLayerDeleteByKey0", codes::FWP_E_IN_USE));
        }
        if target.sublayers.remove(&key).is_none() {
            return Err(Error::platform("FwpmSubLayerDeleteByKey0", codes::FWP_E_SUBLAYER_NOT_FOUND));
        }
        Ok(())
    }

    fn add_filter(&mut self, rule: &FirewallRule) -> Result<u64> {
        let mut state = self.state();
        state.check_open()?;

        if let Some(left) = state.faults.filter_add_countdown {
            if left == 0 {
                state.faults.filter_add_countdown = None;
                return Err(Error::platform("FwpmFilterAdd0", 0x8032_0011));
            }
            state.faults.filter_add_countdown = Some(left - 1);
        }

        if !state.target().sublayers.contains_key(&rule.sublayer) {
            return Err(Error::platform("FwpmFilterAdd0", codes::FWP_E_SUBLAYER_NOT_FOUND));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.target().filters.insert(id, rule.clone());
        Ok(id)
    }

    fn delete_filter(&mut self, id: u64) -> Result<()> {
        let mut state = self.state();
        state.check_open()?;
        if state.faults.delete_filter {
            return Err(Error::platform("FwpmFilterDeleteById0", 0x8032_0017));
        }
        if state.target().filters.remove(&id).is_none() {
            return Err(Error::platform("FwpmFilterDeleteById0", codes::FWP_E_FILTER_NOT_FOUND));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Ok(());
        }
        // Dynamic session: everything it added disappears with it
        state.committed = RuleSet::default();
        state.working = None;
        state.closed = true;
        state.close_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sublayer_reports_already_exists() {
        let mut engine = MemoryEngine::new();
        engine.add_sublayer(&SubLayer::default()).unwrap();
        let err = engine.add_sublayer(&SubLayer::default()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_filter_requires_sublayer() {
        let mut engine = MemoryEngine::new();
        let err = engine
            .add_filter(&FirewallRule::block_all(SubLayer::DEFAULT_KEY))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut engine = MemoryEngine::new();
        engine.begin_transaction().unwrap();
        let err = engine.begin_transaction().unwrap_err();
        assert_eq!(err.code(), Some(codes::FWP_E_TXN_IN_PROGRESS));
    }

    #[test]
    fn test_close_is_idempotent_and_drops_rules() {
        let mut engine = MemoryEngine::new();
        engine.add_sublayer(&SubLayer::default()).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
        assert_eq!(engine.close_count(), 1);
        assert!(engine.sublayers().is_empty());
        assert!(engine.begin_transaction().is_err());
    }
}
