use chrono::Utc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    account::{Account, AccountError, AccountId},
    instruction::{Instruction, Operation},
    ledger::LedgerEntry,
    money::Money,
    store::{AccountStore, StoreError},
};

/// Whether retrying an instruction could change its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Insufficient balance on account {account_id}: {balance} available, {requested} requested")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Money,
        requested: Money,
    },
    #[error("Balance of account {0} would overflow")]
    BalanceOverflow(AccountId),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl MutationError {
    pub fn disposition(&self) -> Disposition {
        match self {
            MutationError::StoreUnavailable(_) => Disposition::Retryable,
            MutationError::AccountNotFound(_)
            | MutationError::InsufficientBalance { .. }
            | MutationError::BalanceOverflow(_) => Disposition::Terminal,
        }
    }
}

impl From<StoreError> for MutationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(account_id) => MutationError::AccountNotFound(account_id),
            other => MutationError::StoreUnavailable(other),
        }
    }
}

impl From<AccountError> for MutationError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InsufficientBalance {
                account_id,
                balance,
                requested,
            } => MutationError::InsufficientBalance {
                account_id,
                balance,
                requested,
            },
            AccountError::BalanceOverflow(account_id) => MutationError::BalanceOverflow(account_id),
        }
    }
}

/// Ledger entries written by one committed instruction, one per account touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOutcome {
    pub entries: Vec<LedgerEntry>,
}

impl AppliedOutcome {
    pub fn balance_of(&self, account_id: &AccountId) -> Option<Money> {
        self.entries
            .iter()
            .find(|entry| &entry.account_id == account_id)
            .map(|entry| entry.resulting_balance)
    }
}

/// Applies instructions to the store, one scoped transaction each.
///
/// Rows are locked in [`Instruction::lock_order`], so two transfers between
/// the same pair of accounts in opposite directions queue up on the same
/// first row instead of deadlocking.
pub struct BalanceMutator<S> {
    store: S,
}

impl<S> BalanceMutator<S>
where
    S: AccountStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(level = "debug", skip_all, fields(kind = ?instruction.kind(), amount = %instruction.amount()))]
    pub async fn apply(&self, instruction: &Instruction) -> Result<AppliedOutcome, MutationError> {
        let mut tx = self.store.begin().await?;
        let mut accounts = Vec::with_capacity(2);
        for account_id in instruction.lock_order() {
            let balance = tx.lock_balance(account_id).await?;
            accounts.push(Account::new(account_id.clone(), balance));
        }

        let amount = instruction.amount();
        let touched = match instruction.operation() {
            Operation::Deposit { account_id } => vec![credit(&mut accounts, account_id, amount)?],
            Operation::Withdrawal { account_id } => vec![debit(&mut accounts, account_id, amount)?],
            Operation::Transfer { from, to } => {
                let source = debit(&mut accounts, from, amount)?;
                let destination = credit(&mut accounts, to, amount)?;
                vec![source, destination]
            }
        };

        let created_at = Utc::now();
        let mut entries = Vec::with_capacity(touched.len());
        for account in &touched {
            tx.update_balance(account.id(), account.balance()).await?;
            entries.push(LedgerEntry::record(instruction, account, created_at));
        }
        for entry in &entries {
            tx.append_ledger(entry).await?;
        }
        tx.commit().await?;

        debug!(entries = entries.len(), "instruction committed");
        Ok(AppliedOutcome { entries })
    }
}

fn locked<'a>(
    accounts: &'a mut [Account],
    account_id: &AccountId,
) -> Result<&'a mut Account, MutationError> {
    // every account of the instruction was locked above
    accounts
        .iter_mut()
        .find(|account| account.id() == account_id)
        .ok_or_else(|| MutationError::AccountNotFound(account_id.clone()))
}

fn credit(
    accounts: &mut [Account],
    account_id: &AccountId,
    amount: Money,
) -> Result<Account, MutationError> {
    let account = locked(accounts, account_id)?;
    let event = account.handle_credit(amount)?;
    account.apply(&event);
    Ok(account.clone())
}

fn debit(
    accounts: &mut [Account],
    account_id: &AccountId,
    amount: Money,
) -> Result<Account, MutationError> {
    let account = locked(accounts, account_id)?;
    let event = account.handle_debit(amount)?;
    account.apply(&event);
    Ok(account.clone())
}
