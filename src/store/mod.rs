use async_trait::async_trait;
use thiserror::Error;

use crate::{account::AccountId, ledger::LedgerEntry, money::Money};

pub mod memory;
pub mod postgres;

/// Points where [`memory::InMemoryStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    UpdateBalance,
    AppendLedger,
    Commit,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Account {0} already exists")]
    DuplicateAccount(AccountId),
    #[error("Timed out waiting for the row lock on account {0}")]
    LockTimeout(AccountId),
    #[error("Row of account {0} is not locked by this transaction")]
    RowNotLocked(AccountId),
    #[error("Stored balance of account {0} is negative")]
    CorruptBalance(AccountId),
    #[error("Injected fault at {0:?}")]
    Injected(FaultPoint),
    #[error("Store state is poisoned")]
    Poisoned,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Atomic unit of work against the balance and ledger tables.
///
/// Dropping a transaction without calling [`ScopedTransaction::commit`]
/// rolls it back and releases every row lock it holds.
#[async_trait]
pub trait ScopedTransaction: Send {
    /// Locks the account row until the transaction ends and returns its balance.
    async fn lock_balance(&mut self, account_id: &AccountId) -> Result<Money, StoreError>;

    async fn update_balance(
        &mut self,
        account_id: &AccountId,
        balance: Money,
    ) -> Result<(), StoreError>;

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Balance and ledger storage sharing one transactional boundary.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ScopedTransaction + '_>, StoreError>;

    /// Unlocked read of the committed balance.
    async fn get_balance(&self, account_id: &AccountId) -> Result<Money, StoreError>;

    /// Committed ledger entries of the account, oldest first.
    async fn ledger(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError>;
}

#[async_trait]
impl<S> AccountStore for std::sync::Arc<S>
where
    S: AccountStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn ScopedTransaction + '_>, StoreError> {
        (**self).begin().await
    }

    async fn get_balance(&self, account_id: &AccountId) -> Result<Money, StoreError> {
        (**self).get_balance(account_id).await
    }

    async fn ledger(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).ledger(account_id).await
    }
}
