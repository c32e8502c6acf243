use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{account::AccountId, money::Money};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Transfer,
}

/// Accounts touched by an [`Instruction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Deposit { account_id: AccountId },
    Withdrawal { account_id: AccountId },
    Transfer { from: AccountId, to: AccountId },
}

impl Operation {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Operation::Deposit { .. } => TransactionKind::Deposit,
            Operation::Withdrawal { .. } => TransactionKind::Withdrawal,
            Operation::Transfer { .. } => TransactionKind::Transfer,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstructionError {
    #[error("account_id is required for {kind:?}")]
    AccountRequired { kind: TransactionKind },
    #[error("from_account_id and to_account_id are required for Transfer")]
    TransferAccountsRequired,
    #[error("Transfer source and destination must differ, both are `{0}`")]
    SameAccountTransfer(AccountId),
    #[error("Amount must be greater than 0 for {kind:?}")]
    NonPositiveAmount { kind: TransactionKind },
}

/// A validated, immutable request to mutate balances.
///
/// The only ways to build one check that `amount > 0` and that a transfer
/// names two distinct accounts, so the mutator can rely on both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    operation: Operation,
    amount: Money,
}

impl Instruction {
    pub fn new(operation: Operation, amount: Money) -> Result<Self, InstructionError> {
        if amount.is_zero() {
            return Err(InstructionError::NonPositiveAmount {
                kind: operation.kind(),
            });
        }
        if let Operation::Transfer { from, to } = &operation {
            if from == to {
                return Err(InstructionError::SameAccountTransfer(from.clone()));
            }
        }
        Ok(Self { operation, amount })
    }

    pub fn deposit(account_id: impl Into<AccountId>, amount: Money) -> Result<Self, InstructionError> {
        Self::new(
            Operation::Deposit {
                account_id: account_id.into(),
            },
            amount,
        )
    }

    pub fn withdrawal(
        account_id: impl Into<AccountId>,
        amount: Money,
    ) -> Result<Self, InstructionError> {
        Self::new(
            Operation::Withdrawal {
                account_id: account_id.into(),
            },
            amount,
        )
    }

    pub fn transfer(
        from: impl Into<AccountId>,
        to: impl Into<AccountId>,
        amount: Money,
    ) -> Result<Self, InstructionError> {
        Self::new(
            Operation::Transfer {
                from: from.into(),
                to: to.into(),
            },
            amount,
        )
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn kind(&self) -> TransactionKind {
        self.operation.kind()
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    /// Accounts this instruction locks, in the order the mutator must lock them.
    pub fn lock_order(&self) -> Vec<&AccountId> {
        match &self.operation {
            Operation::Deposit { account_id } | Operation::Withdrawal { account_id } => {
                vec![account_id]
            }
            Operation::Transfer { from, to } => {
                if from < to {
                    vec![from, to]
                } else {
                    vec![to, from]
                }
            }
        }
    }
}

/// Queue payload of an [`Instruction`].
///
/// Field presence depends on `type`; unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedTransaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_account_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: rust_decimal::Decimal,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] InstructionError),
}

impl QueuedTransaction {
    pub fn decode(body: &[u8]) -> Result<Instruction, DecodeError> {
        let wire: QueuedTransaction = serde_json::from_slice(body)?;
        Ok(Instruction::try_from(wire)?)
    }

    pub fn encode(instruction: &Instruction) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&QueuedTransaction::from(instruction))
    }
}

fn non_empty(id: Option<String>) -> Option<AccountId> {
    id.filter(|id| !id.trim().is_empty()).map(AccountId::from)
}

impl TryFrom<QueuedTransaction> for Instruction {
    type Error = InstructionError;

    fn try_from(wire: QueuedTransaction) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        // amounts on the wire are signed; anything not strictly positive is invalid
        let amount = Money::new(wire.amount)
            .map_err(|_| InstructionError::NonPositiveAmount { kind })?;
        let operation = match kind {
            TransactionKind::Deposit => Operation::Deposit {
                account_id: non_empty(wire.account_id)
                    .ok_or(InstructionError::AccountRequired { kind })?,
            },
            TransactionKind::Withdrawal => Operation::Withdrawal {
                account_id: non_empty(wire.account_id)
                    .ok_or(InstructionError::AccountRequired { kind })?,
            },
            TransactionKind::Transfer => {
                match (non_empty(wire.from_account_id), non_empty(wire.to_account_id)) {
                    (Some(from), Some(to)) => Operation::Transfer { from, to },
                    _ => return Err(InstructionError::TransferAccountsRequired),
                }
            }
        };
        Instruction::new(operation, amount)
    }
}

impl From<&Instruction> for QueuedTransaction {
    fn from(instruction: &Instruction) -> Self {
        let (account_id, from_account_id, to_account_id) = match instruction.operation() {
            Operation::Deposit { account_id } | Operation::Withdrawal { account_id } => {
                (Some(account_id.to_string()), None, None)
            }
            Operation::Transfer { from, to } => (None, Some(from.to_string()), Some(to.to_string())),
        };
        Self {
            account_id,
            from_account_id,
            to_account_id,
            kind: instruction.kind(),
            amount: instruction.amount().amount(),
        }
    }
}
