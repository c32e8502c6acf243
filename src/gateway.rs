use thiserror::Error;
use tracing::{info, warn};

use crate::{
    account::AccountId,
    instruction::{Instruction, InstructionError, Operation, QueuedTransaction},
    ledger::LedgerEntry,
    money::Money,
    queue::{PublishError, QueueChannel},
    store::{AccountStore, StoreError},
};

/// Response class a client-facing surface maps each failure to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    BadRequest,
    NotFound,
    Unprocessable,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] InstructionError),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Insufficient balance on account {account_id}: {balance} available, {requested} requested")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Money,
        requested: Money,
    },
    #[error("Failed to queue transaction: {0}")]
    Publish(#[from] PublishError),
    #[error("Store unavailable: {0}")]
    Store(#[source] StoreError),
}

impl SubmitError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            SubmitError::Invalid(_) => StatusClass::BadRequest,
            SubmitError::AccountNotFound(_) => StatusClass::NotFound,
            SubmitError::InsufficientBalance { .. } => StatusClass::Unprocessable,
            SubmitError::Publish(_) | SubmitError::Store(_) => StatusClass::Unavailable,
        }
    }
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(account_id) => SubmitError::AccountNotFound(account_id),
            other => SubmitError::Store(other),
        }
    }
}

/// Synchronous side of the engine: validates requests before they are
/// queued and serves ledger history.
///
/// Balance checks here read without locks and only spare the queue requests
/// that are already known to fail; the mutator checks again under lock.
pub struct TransactionGateway<Q, S> {
    queue: Q,
    store: S,
}

impl<Q, S> TransactionGateway<Q, S>
where
    Q: QueueChannel,
    S: AccountStore,
{
    pub fn new(queue: Q, store: S) -> Self {
        Self { queue, store }
    }

    pub async fn submit(&self, request: QueuedTransaction) -> Result<Instruction, SubmitError> {
        let instruction = Instruction::try_from(request)?;
        let amount = instruction.amount();
        let debited = match instruction.operation() {
            Operation::Deposit { account_id } => {
                self.store.get_balance(account_id).await?;
                None
            }
            Operation::Withdrawal { account_id } => Some(account_id),
            Operation::Transfer { from, to } => {
                self.store.get_balance(to).await?;
                Some(from)
            }
        };
        if let Some(account_id) = debited {
            let balance = self.store.get_balance(account_id).await?;
            if balance < amount {
                warn!(%account_id, %balance, %amount, "rejecting submission, insufficient balance");
                return Err(SubmitError::InsufficientBalance {
                    account_id: account_id.clone(),
                    balance,
                    requested: amount,
                });
            }
        }

        self.queue.publish(&instruction).await?;
        info!(kind = ?instruction.kind(), %amount, "transaction queued");
        Ok(instruction)
    }

    /// Ledger history of one account, oldest entry first.
    pub async fn history(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, SubmitError> {
        Ok(self.store.ledger(account_id).await?)
    }
}
