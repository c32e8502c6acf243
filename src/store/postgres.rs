//! PostgreSQL backend.
//!
//! Balances and ledger entries live in the same database, so a single
//! Postgres transaction covers both and the ledger can never disagree with
//! the balances it explains.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    account::AccountId,
    instruction::TransactionKind,
    ledger::LedgerEntry,
    money::Money,
};

use super::{AccountStore, ScopedTransaction, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT PRIMARY KEY,
        balance NUMERIC NOT NULL DEFAULT 0 CHECK (balance >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        seq BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        account_id TEXT NOT NULL REFERENCES accounts (account_id),
        from_account_id TEXT,
        to_account_id TEXT,
        kind TEXT NOT NULL,
        amount NUMERIC NOT NULL CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL,
        current_balance NUMERIC NOT NULL CHECK (current_balance >= 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ledger_entries_account_idx ON ledger_entries (account_id, seq)",
];

pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn open_account(
        &self,
        account_id: &AccountId,
        opening_balance: Money,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO accounts (account_id, balance) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(account_id.as_str())
        .bind(opening_balance.amount())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateAccount(account_id.clone()));
        }
        Ok(())
    }
}

fn money(account_id: &AccountId, amount: Decimal) -> Result<Money, StoreError> {
    Money::new(amount).map_err(|_| StoreError::CorruptBalance(account_id.clone()))
}

fn kind_str(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Deposit => "deposit",
        TransactionKind::Withdrawal => "withdrawal",
        TransactionKind::Transfer => "transfer",
    }
}

fn parse_kind(kind: &str) -> Option<TransactionKind> {
    match kind {
        "deposit" => Some(TransactionKind::Deposit),
        "withdrawal" => Some(TransactionKind::Withdrawal),
        "transfer" => Some(TransactionKind::Transfer),
        _ => None,
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, StoreError> {
    let account_id = AccountId::from(row.try_get::<String, _>("account_id")?);
    let kind: String = row.try_get("kind")?;
    let kind = parse_kind(&kind).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("unknown ledger entry kind `{kind}`").into(),
        ))
    })?;
    let amount = money(&account_id, row.try_get("amount")?)?;
    let resulting_balance = money(&account_id, row.try_get("current_balance")?)?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let id: Uuid = row.try_get("id")?;
    Ok(LedgerEntry {
        id,
        from_account_id: row.try_get::<Option<String>, _>("from_account_id")?.map(AccountId::from),
        to_account_id: row.try_get::<Option<String>, _>("to_account_id")?.map(AccountId::from),
        account_id,
        kind,
        amount,
        created_at,
        resulting_balance,
    })
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ScopedTransaction for PgTransaction {
    async fn lock_balance(&mut self, account_id: &AccountId) -> Result<Money, StoreError> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1 FOR UPDATE")
                .bind(account_id.as_str())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|err| lock_error(account_id, err))?;
        match balance {
            Some(balance) => money(account_id, balance),
            None => Err(StoreError::AccountNotFound(account_id.clone())),
        }
    }

    async fn update_balance(
        &mut self,
        account_id: &AccountId,
        balance: Money,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE accounts SET balance = $1 WHERE account_id = $2")
            .bind(balance.amount())
            .bind(account_id.as_str())
            .execute(&mut *self.tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(account_id.clone()));
        }
        Ok(())
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, account_id, from_account_id, to_account_id, kind, amount, created_at, current_balance)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id.as_str())
        .bind(entry.from_account_id.as_ref().map(AccountId::as_str))
        .bind(entry.to_account_id.as_ref().map(AccountId::as_str))
        .bind(kind_str(entry.kind))
        .bind(entry.amount.amount())
        .bind(entry.created_at)
        .bind(entry.resulting_balance.amount())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// SQLSTATE codes for waiting on a row lock that never came:
/// 55P03 lock_not_available, 40P01 deadlock_detected.
fn is_lock_failure(code: &str) -> bool {
    matches!(code, "55P03" | "40P01")
}

fn lock_error(account_id: &AccountId, err: sqlx::Error) -> StoreError {
    let lock_failure = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| is_lock_failure(&code));
    if lock_failure {
        StoreError::LockTimeout(account_id.clone())
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn ScopedTransaction + '_>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters
        let timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&timeout).execute(&mut *tx).await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn get_balance(&self, account_id: &AccountId) -> Result<Money, StoreError> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1")
                .bind(account_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match balance {
            Some(balance) => money(account_id, balance),
            None => Err(StoreError::AccountNotFound(account_id.clone())),
        }
    }

    async fn ledger(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        // distinguishes an unknown account from one without history
        self.get_balance(account_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, from_account_id, to_account_id, kind, amount,
                   created_at, current_balance
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }
}
