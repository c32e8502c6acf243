use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    account::{Account, AccountId},
    instruction::{Instruction, Operation, TransactionKind},
    money::Money,
};

/// Immutable audit record of one committed instruction's effect on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_account_id: Option<AccountId>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "current_balance")]
    pub resulting_balance: Money,
}

impl LedgerEntry {
    /// Entry for `account` after `instruction` has been applied to it.
    pub fn record(instruction: &Instruction, account: &Account, created_at: DateTime<Utc>) -> Self {
        let (from_account_id, to_account_id) = match instruction.operation() {
            Operation::Transfer { from, to } => (Some(from.clone()), Some(to.clone())),
            Operation::Deposit { .. } | Operation::Withdrawal { .. } => (None, None),
        };
        Self {
            id: Uuid::new_v4(),
            account_id: account.id().clone(),
            from_account_id,
            to_account_id,
            kind: instruction.kind(),
            amount: instruction.amount(),
            created_at,
            resulting_balance: account.balance(),
        }
    }

    /// Effect of this entry on its own account's balance.
    pub fn signed_amount(&self) -> Decimal {
        let amount = self.amount.amount();
        match self.kind {
            TransactionKind::Deposit => amount,
            TransactionKind::Withdrawal => -amount,
            TransactionKind::Transfer if self.from_account_id.as_ref() == Some(&self.account_id) => {
                -amount
            }
            TransactionKind::Transfer => amount,
        }
    }
}

/// Balance implied by an opening balance plus an account's ledger history.
pub fn reconcile<'a>(opening: Money, entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Decimal {
    entries
        .into_iter()
        .fold(opening.amount(), |acc, entry| acc + entry.signed_amount())
}
