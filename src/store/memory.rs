//! In-process store for tests and local runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use crate::{account::AccountId, ledger::LedgerEntry, money::Money};

use super::{AccountStore, FaultPoint, ScopedTransaction, StoreError};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Every account row sits behind its own async lock, held by at most one
/// [`ScopedTransaction`] at a time. Writes are staged in the transaction and
/// only reach the rows and the ledger on commit.
///
/// Committed balances are mirrored outside the row locks so reads never
/// wait on a running transaction.
pub struct InMemoryStore {
    rows: Mutex<HashMap<AccountId, Arc<RowLock<Money>>>>,
    committed: Mutex<HashMap<AccountId, Money>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    faults: Mutex<Vec<FaultPoint>>,
    lock_timeout: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn open_account(
        &self,
        account_id: impl Into<AccountId>,
        opening_balance: Money,
    ) -> Result<(), StoreError> {
        let account_id = account_id.into();
        let mut rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        if rows.contains_key(&account_id) {
            return Err(StoreError::DuplicateAccount(account_id));
        }
        self.committed
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(account_id.clone(), opening_balance);
        rows.insert(account_id, Arc::new(RowLock::new(opening_balance)));
        Ok(())
    }

    /// Makes the next operation at `point` fail once.
    pub fn inject_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        self.faults
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(point);
        Ok(())
    }

    /// Number of entries across all accounts.
    pub fn ledger_len(&self) -> Result<usize, StoreError> {
        Ok(self.ledger.lock().map_err(|_| StoreError::Poisoned)?.len())
    }

    fn row(&self, account_id: &AccountId) -> Result<Arc<RowLock<Money>>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        rows.get(account_id)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))
    }

    fn trip(&self, point: FaultPoint) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::Poisoned)?;
        match faults.iter().position(|fault| *fault == point) {
            Some(idx) => {
                faults.remove(idx);
                debug!(?point, "injected store fault");
                Err(StoreError::Injected(point))
            }
            None => Ok(()),
        }
    }
}

struct InMemoryTransaction<'a> {
    store: &'a InMemoryStore,
    locked: HashMap<AccountId, OwnedMutexGuard<Money>>,
    staged: HashMap<AccountId, Money>,
    entries: Vec<LedgerEntry>,
}

#[async_trait]
impl ScopedTransaction for InMemoryTransaction<'_> {
    async fn lock_balance(&mut self, account_id: &AccountId) -> Result<Money, StoreError> {
        if let Some(guard) = self.locked.get(account_id) {
            return Ok(self.staged.get(account_id).copied().unwrap_or(**guard));
        }
        let row = self.store.row(account_id)?;
        let guard = tokio::time::timeout(self.store.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(account_id.clone()))?;
        let balance = *guard;
        self.locked.insert(account_id.clone(), guard);
        Ok(balance)
    }

    async fn update_balance(
        &mut self,
        account_id: &AccountId,
        balance: Money,
    ) -> Result<(), StoreError> {
        self.store.trip(FaultPoint::UpdateBalance)?;
        if !self.locked.contains_key(account_id) {
            return Err(StoreError::RowNotLocked(account_id.clone()));
        }
        self.staged.insert(account_id.clone(), balance);
        Ok(())
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.store.trip(FaultPoint::AppendLedger)?;
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            store,
            mut locked,
            staged,
            entries,
        } = *self;
        store.trip(FaultPoint::Commit)?;
        let mut ledger = store.ledger.lock().map_err(|_| StoreError::Poisoned)?;
        let mut committed = store.committed.lock().map_err(|_| StoreError::Poisoned)?;
        // Past this point nothing can fail, so the ledger and the rows change together.
        ledger.extend(entries);
        for (account_id, balance) in staged {
            if let Some(guard) = locked.get_mut(&account_id) {
                **guard = balance;
            }
            committed.insert(account_id, balance);
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn ScopedTransaction + '_>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            store: self,
            locked: HashMap::new(),
            staged: HashMap::new(),
            entries: Vec::new(),
        }))
    }

    async fn get_balance(&self, account_id: &AccountId) -> Result<Money, StoreError> {
        self.committed
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(account_id)
            .copied()
            .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))
    }

    async fn ledger(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.row(account_id)?;
        let ledger = self.ledger.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(ledger
            .iter()
            .filter(|entry| &entry.account_id == account_id)
            .cloned()
            .collect())
    }
}
