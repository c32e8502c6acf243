use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Money;

/// Opaque account identifier issued by the account directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&AccountId> for AccountId {
    fn from(value: &AccountId) -> Self {
        value.clone()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEventKind {
    Credited,
    Debited,
}

/// Outcome of a validated balance change, carrying the balance it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEvent {
    pub kind: AccountEventKind,
    pub amount: Money,
    pub balance_after: Money,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient balance on account {account_id}: {balance} available, {requested} requested")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Money,
        requested: Money,
    },
    #[error("Balance of account {0} would overflow")]
    BalanceOverflow(AccountId),
}

/// A locked account row as seen inside one scoped transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    balance: Money,
}

impl Account {
    pub fn new(id: AccountId, balance: Money) -> Self {
        Self { id, balance }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    pub fn apply(&mut self, event: &AccountEvent) {
        self.balance = event.balance_after;
    }

    pub fn handle_credit(&self, amount: Money) -> Result<AccountEvent, AccountError> {
        let balance_after = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| AccountError::BalanceOverflow(self.id.clone()))?;
        Ok(AccountEvent {
            kind: AccountEventKind::Credited,
            amount,
            balance_after,
        })
    }

    pub fn handle_debit(&self, amount: Money) -> Result<AccountEvent, AccountError> {
        match self.balance.checked_sub(amount) {
            Some(balance_after) => Ok(AccountEvent {
                kind: AccountEventKind::Debited,
                amount,
                balance_after,
            }),
            None => Err(AccountError::InsufficientBalance {
                account_id: self.id.clone(),
                balance: self.balance,
                requested: amount,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn account(balance: u32) -> Account {
        Account::new(AccountId::from("acc-1"), Money::from(balance))
    }

    #[test]
    fn apply_events() {
        let mut acc = account(0);
        let deposit = acc.handle_credit(Money::from(10)).unwrap();
        assert_eq!(deposit.kind, AccountEventKind::Credited);
        // handling a command never mutates the account
        assert_eq!(acc.balance(), Money::ZERO);
        acc.apply(&deposit);
        assert_eq!(acc.balance(), Money::from(10));

        let withdrawal = acc.handle_debit(Money::from(3)).unwrap();
        assert_eq!(withdrawal.kind, AccountEventKind::Debited);
        assert_eq!(withdrawal.balance_after, Money::from(7));
        acc.apply(&withdrawal);
        assert_eq!(acc.balance(), Money::from(7));
    }

    #[test]
    fn debit_requires_sufficient_balance() {
        let acc = account(150);
        let err = acc.handle_debit(Money::from(200)).unwrap_err();
        assert_eq!(
            err,
            AccountError::InsufficientBalance {
                account_id: AccountId::from("acc-1"),
                balance: Money::from(150),
                requested: Money::from(200),
            }
        );
        assert_eq!(
            err.to_string(),
            "Insufficient balance on account acc-1: 150 available, 200 requested"
        );

        let evt = acc.handle_debit(Money::from(150)).unwrap();
        assert_eq!(evt.balance_after, Money::ZERO);
    }

    #[test]
    fn credit_reports_overflow() {
        let acc = Account::new(AccountId::from("rich"), Money::new(Decimal::MAX).unwrap());
        let err = acc.handle_credit(Money::from(1)).unwrap_err();
        assert_eq!(err, AccountError::BalanceOverflow(AccountId::from("rich")));
    }
}
