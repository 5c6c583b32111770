//! Postgres Storage Adapter
//!
//! Durable backend on a sqlx connection pool. Row-level exclusivity via
//! `SELECT ... FOR UPDATE`, balances as `NUMERIC(20,8)`, and the
//! versioned migration suite applied on connect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;

use crate::account::{Account, AccountLimits, AccountStatus};
use crate::audit::{AuditAction, AuditFilter, AuditLogEntry};
use crate::batch::{BatchStatus, BatchTransfer};
use crate::error::ClearingError;
use crate::escrow::{Escrow, EscrowStatus};
use crate::idempotency::IdempotencyRecord;
use crate::ledger::{BalanceOperation, BalanceOperationKind, TransactionRecord, TransactionStatus};
use crate::scheduler::{PaymentStatus, ScheduledPayment};
use crate::types::{Amount, Role};

use super::{migrations, AccountFilter, EscrowFilter, LedgerStatistics, Storage, StorageTx, TransactionFilter};

/// Connection options for the durable backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Durable storage on a Postgres pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and apply pending migrations.
    pub async fn connect(options: &PostgresOptions) -> Result<Self, ClearingError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(&options.url)
            .await?;

        migrations::apply(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PostgresTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn parse_status<T>(raw: &str, parse: impl Fn(&str) -> Option<T>, what: &str) -> Result<T, ClearingError> {
    parse(raw).ok_or_else(|| ClearingError::storage(format!("unknown {what} in row: {raw}")))
}

fn account_from_row(row: &PgRow) -> Result<Account, ClearingError> {
    let status: String = row.try_get("status")?;
    let roles: Vec<String> = row.try_get("roles")?;
    let max_transfer_amount: Option<Decimal> = row.try_get("max_transfer_amount")?;
    let daily_transfer_limit: Option<Decimal> = row.try_get("daily_transfer_limit")?;
    let min_balance: Decimal = row.try_get("min_balance")?;

    Ok(Account {
        account_id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_id: row.try_get("owner_id")?,
        api_key: row.try_get("api_key")?,
        balance: Amount::new(row.try_get::<Decimal, _>("balance")?),
        frozen_balance: Amount::new(row.try_get::<Decimal, _>("frozen_balance")?),
        roles: roles.iter().filter_map(|r| Role::parse(r)).collect(),
        status: parse_status(&status, AccountStatus::parse, "account status")?,
        limits: AccountLimits {
            max_transfer_amount: max_transfer_amount.map(Amount::new),
            daily_transfer_limit: daily_transfer_limit.map(Amount::new),
            min_balance: Amount::new(min_balance),
        },
        metadata: row.try_get("metadata")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionRecord, ClearingError> {
    let status: String = row.try_get("status")?;
    Ok(TransactionRecord {
        transaction_id: row.try_get("id")?,
        from: row.try_get("from_account")?,
        to: row.try_get("to_account")?,
        amount: Amount::new(row.try_get::<Decimal, _>("amount")?),
        fee: Amount::new(row.try_get::<Decimal, _>("fee")?),
        tx_type: row.try_get("tx_type")?,
        status: parse_status(&status, TransactionStatus::parse, "transaction status")?,
        initiated_by: row.try_get("initiated_by")?,
        escrow_id: row.try_get("escrow_id")?,
        batch_id: row.try_get("batch_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        meta: row.try_get("meta")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn escrow_from_row(row: &PgRow) -> Result<Escrow, ClearingError> {
    let status: String = row.try_get("status")?;
    Ok(Escrow {
        escrow_id: row.try_get("id")?,
        from: row.try_get("from_account")?,
        to: row.try_get("to_account")?,
        amount: Amount::new(row.try_get::<Decimal, _>("amount")?),
        status: parse_status(&status, EscrowStatus::parse, "escrow status")?,
        condition: row.try_get("condition")?,
        expires_at: row.try_get("expires_at")?,
        transaction_id: row.try_get("transaction_id")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<BatchTransfer, ClearingError> {
    let status: String = row.try_get("status")?;
    Ok(BatchTransfer {
        batch_id: row.try_get("id")?,
        status: parse_status(&status, BatchStatus::parse, "batch status")?,
        total_amount: Amount::new(row.try_get::<Decimal, _>("total_amount")?),
        success_count: row.try_get::<i32, _>("success_count")? as u32,
        failed_count: row.try_get::<i32, _>("failed_count")? as u32,
        all_or_nothing: row.try_get("all_or_nothing")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<ScheduledPayment, ClearingError> {
    let status: String = row.try_get("status")?;
    let schedule: serde_json::Value = row.try_get("schedule")?;
    Ok(ScheduledPayment {
        payment_id: row.try_get("id")?,
        from: row.try_get("from_account")?,
        to: row.try_get("to_account")?,
        amount: Amount::new(row.try_get::<Decimal, _>("amount")?),
        tx_type: row.try_get("tx_type")?,
        meta: row.try_get("meta")?,
        schedule: serde_json::from_value(schedule)
            .map_err(|e| ClearingError::storage(format!("bad schedule json: {e}")))?,
        status: parse_status(&status, PaymentStatus::parse, "payment status")?,
        enabled: row.try_get("enabled")?,
        execution_count: row.try_get::<i32, _>("execution_count")? as u32,
        failure_count: row.try_get::<i32, _>("failure_count")? as u32,
        last_error: row.try_get("last_error")?,
        next_execute_at: row.try_get("next_execute_at")?,
        max_executions: row.try_get::<Option<i32>, _>("max_executions")?.map(|n| n as u32),
        expires_at: row.try_get("expires_at")?,
        last_executed_at: row.try_get("last_executed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditLogEntry, ClearingError> {
    let action: String = row.try_get("action")?;
    Ok(AuditLogEntry {
        action: AuditAction::parse(&action)
            .ok_or_else(|| ClearingError::storage(format!("unknown audit action in row: {action}")))?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        actor_id: row.try_get("actor_id")?,
        changes: row.try_get("changes")?,
        meta: row.try_get("meta")?,
        timestamp: row.try_get("timestamp")?,
    })
}

const SELECT_ACCOUNT: &str = r#"
    SELECT id, name, owner_id, api_key, balance, frozen_balance, roles, status,
           max_transfer_amount, daily_transfer_limit, min_balance, metadata, tags,
           created_at, updated_at
    FROM accounts
"#;

const SELECT_TRANSACTION: &str = r#"
    SELECT id, from_account, to_account, amount, fee, tx_type, status, initiated_by,
           escrow_id, batch_id, idempotency_key, meta, created_at, completed_at
    FROM transactions
"#;

const SELECT_ESCROW: &str = r#"
    SELECT id, from_account, to_account, amount, status, condition, expires_at,
           transaction_id, created_at, resolved_at
    FROM escrows
"#;

const SELECT_PAYMENT: &str = r#"
    SELECT id, from_account, to_account, amount, tx_type, meta, schedule, status,
           enabled, execution_count, failure_count, last_error, next_execute_at,
           max_executions, expires_at, last_executed_at, created_at, updated_at
    FROM scheduled_payments
"#;

async fn select_account<'e, E>(executor: E, id: &str, for_update: bool) -> Result<Option<Account>, ClearingError>
where
    E: PgExecutor<'e>,
{
    let sql = if for_update {
        format!("{SELECT_ACCOUNT} WHERE id = $1 FOR UPDATE")
    } else {
        format!("{SELECT_ACCOUNT} WHERE id = $1")
    };
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(account_from_row).transpose()
}

async fn select_transaction<'e, E>(executor: E, id: &str) -> Result<Option<TransactionRecord>, ClearingError>
where
    E: PgExecutor<'e>,
{
    let sql = format!("{SELECT_TRANSACTION} WHERE id = $1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(transaction_from_row).transpose()
}

async fn select_idempotency<'e, E>(executor: E, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT key, transaction_id, fingerprint, created_at FROM idempotency_keys WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(executor)
    .await?;

    Ok(match row {
        Some(row) => Some(IdempotencyRecord {
            key: row.try_get("key")?,
            transaction_id: row.try_get("transaction_id")?,
            fingerprint: row.try_get("fingerprint")?,
            created_at: row.try_get("created_at")?,
        }),
        None => None,
    })
}

fn roles_to_strings(roles: &[Role]) -> Vec<String> {
    roles.iter().map(|r| r.as_str().to_string()).collect()
}

fn is_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(constraint),
        _ => false,
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, ClearingError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, ClearingError> {
        select_account(&self.pool, id, false).await
    }

    async fn get_account_by_api_key(&self, api_key: &str) -> Result<Option<Account>, ClearingError> {
        let sql = format!("{SELECT_ACCOUNT} WHERE api_key = $1");
        let row = sqlx::query(&sql).bind(api_key).fetch_optional(&self.pool).await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_accounts_by_owner(&self, owner_id: &str) -> Result<Vec<Account>, ClearingError> {
        let sql = format!("{SELECT_ACCOUNT} WHERE owner_id = $1 ORDER BY created_at");
        let rows = sqlx::query(&sql).bind(owner_id).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn list_accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>, ClearingError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_ACCOUNT);
        qb.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(role) = filter.role {
            qb.push(" AND ").push_bind(role.as_str()).push(" = ANY(roles)");
        }
        if let Some(ref tag) = filter.tag {
            qb.push(" AND ").push_bind(tag.clone()).push(" = ANY(tags)");
        }
        if let Some(ref owner_id) = filter.owner_id {
            qb.push(" AND owner_id = ").push_bind(owner_id.clone());
        }
        qb.push(" ORDER BY created_at");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>, ClearingError> {
        select_transaction(&self.pool, id).await
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, ClearingError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_TRANSACTION);
        qb.push(" WHERE TRUE");
        if let Some(ref account) = filter.account {
            qb.push(" AND (from_account = ")
                .push_bind(account.clone())
                .push(" OR to_account = ")
                .push_bind(account.clone())
                .push(")");
        }
        if let Some(ref from) = filter.from {
            qb.push(" AND from_account = ").push_bind(from.clone());
        }
        if let Some(ref to) = filter.to {
            qb.push(" AND to_account = ").push_bind(to.clone());
        }
        if let Some(ref tx_type) = filter.tx_type {
            qb.push(" AND tx_type = ").push_bind(tx_type.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.before {
            qb.push(" AND created_at < ").push_bind(before);
        }
        if let Some(min) = filter.min_amount {
            qb.push(" AND amount >= ").push_bind(min.as_decimal());
        }
        if let Some(max) = filter.max_amount {
            qb.push(" AND amount <= ").push_bind(max.as_decimal());
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn list_balance_operations(&self, account_id: &str) -> Result<Vec<BalanceOperation>, ClearingError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount, balance_after, reason, created_at
            FROM balance_operations
            WHERE account_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                Ok(BalanceOperation {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    kind: parse_status(&kind, BalanceOperationKind::parse, "balance operation kind")?,
                    amount: Amount::new(row.try_get::<Decimal, _>("amount")?),
                    balance_after: Amount::new(row.try_get::<Decimal, _>("balance_after")?),
                    reason: row.try_get("reason")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_escrow(&self, id: &str) -> Result<Option<Escrow>, ClearingError> {
        let sql = format!("{SELECT_ESCROW} WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn list_escrows(&self, filter: &EscrowFilter) -> Result<Vec<Escrow>, ClearingError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_ESCROW);
        qb.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref party) = filter.party {
            qb.push(" AND (from_account = ")
                .push_bind(party.clone())
                .push(" OR to_account = ")
                .push_bind(party.clone())
                .push(")");
        }
        qb.push(" ORDER BY created_at");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(escrow_from_row).collect()
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchTransfer>, ClearingError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, total_amount, success_count, failed_count, all_or_nothing,
                   created_at, completed_at
            FROM batch_transfers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError> {
        select_idempotency(&self.pool, key).await
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, ClearingError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT action, entity_type, entity_id, actor_id, changes, meta, timestamp FROM audit_logs",
        );
        qb.push(" WHERE TRUE");
        if let Some(ref entity_id) = filter.entity_id {
            qb.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        if let Some(action) = filter.action {
            qb.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(ref actor_id) = filter.actor_id {
            qb.push(" AND actor_id = ").push_bind(actor_id.clone());
        }
        if let Some(after) = filter.after {
            qb.push(" AND timestamp >= ").push_bind(after);
        }
        if let Some(before) = filter.before {
            qb.push(" AND timestamp < ").push_bind(before);
        }
        // Ties on timestamp break by insertion order.
        qb.push(" ORDER BY timestamp, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn get_scheduled_payment(&self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError> {
        let sql = format!("{SELECT_PAYMENT} WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn list_scheduled_payments(&self) -> Result<Vec<ScheduledPayment>, ClearingError> {
        let sql = format!("{SELECT_PAYMENT} ORDER BY created_at");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn list_due_payments(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPayment>, ClearingError> {
        let sql = format!(
            "{SELECT_PAYMENT} WHERE enabled AND status = 'ACTIVE' AND next_execute_at <= $1 ORDER BY next_execute_at"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn statistics(&self) -> Result<LedgerStatistics, ClearingError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_accounts,
                   COUNT(*) FILTER (WHERE status = 'ACTIVE') AS active_accounts,
                   COALESCE(SUM(balance), 0) AS total_balance,
                   COALESCE(SUM(frozen_balance), 0) AS total_frozen
            FROM accounts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let tx_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS transaction_count,
                   COALESCE(SUM(amount) FILTER (WHERE status = 'COMPLETED'), 0) AS completed_volume,
                   COALESCE(SUM(fee) FILTER (WHERE status = 'COMPLETED'), 0) AS total_fees
            FROM transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending_escrows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM escrows WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;

        Ok(LedgerStatistics {
            total_accounts: row.try_get::<i64, _>("total_accounts")? as u64,
            active_accounts: row.try_get::<i64, _>("active_accounts")? as u64,
            total_balance: Amount::new(row.try_get::<Decimal, _>("total_balance")?),
            total_frozen: Amount::new(row.try_get::<Decimal, _>("total_frozen")?),
            transaction_count: tx_row.try_get::<i64, _>("transaction_count")? as u64,
            completed_volume: Amount::new(tx_row.try_get::<Decimal, _>("completed_volume")?),
            total_fees: Amount::new(tx_row.try_get::<Decimal, _>("total_fees")?),
            pending_escrows: pending_escrows as u64,
        })
    }
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn insert_account(&mut self, account: &Account) -> Result<(), ClearingError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts
                (id, name, owner_id, api_key, balance, frozen_balance, roles, status,
                 max_transfer_amount, daily_transfer_limit, min_balance, metadata, tags,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.name)
        .bind(&account.owner_id)
        .bind(&account.api_key)
        .bind(account.balance.as_decimal())
        .bind(account.frozen_balance.as_decimal())
        .bind(roles_to_strings(&account.roles))
        .bind(account.status.as_str())
        .bind(account.limits.max_transfer_amount.map(|a| a.as_decimal()))
        .bind(account.limits.daily_transfer_limit.map(|a| a.as_decimal()))
        .bind(account.limits.min_balance.as_decimal())
        .bind(&account.metadata)
        .bind(&account.tags)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e, "accounts_api_key_key") => Err(ClearingError::DuplicateApiKey),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), ClearingError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                name = $2, owner_id = $3, api_key = $4, balance = $5, frozen_balance = $6,
                roles = $7, status = $8, max_transfer_amount = $9, daily_transfer_limit = $10,
                min_balance = $11, metadata = $12, tags = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.name)
        .bind(&account.owner_id)
        .bind(&account.api_key)
        .bind(account.balance.as_decimal())
        .bind(account.frozen_balance.as_decimal())
        .bind(roles_to_strings(&account.roles))
        .bind(account.status.as_str())
        .bind(account.limits.max_transfer_amount.map(|a| a.as_decimal()))
        .bind(account.limits.daily_transfer_limit.map(|a| a.as_decimal()))
        .bind(account.limits.min_balance.as_decimal())
        .bind(&account.metadata)
        .bind(&account.tags)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(ClearingError::AccountNotFound {
                id: account.account_id.clone(),
            }),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e, "accounts_api_key_key") => Err(ClearingError::DuplicateApiKey),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_account(&mut self, id: &str) -> Result<(), ClearingError> {
        let done = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(ClearingError::AccountNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>, ClearingError> {
        select_account(&mut *self.tx, id, true).await
    }

    async fn update_balance(&mut self, id: &str, delta: Amount) -> Result<Amount, ClearingError> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance + $2, updated_at = NOW() WHERE id = $1 RETURNING balance",
        )
        .bind(id)
        .bind(delta.as_decimal())
        .fetch_optional(&mut *self.tx)
        .await;

        match result {
            Ok(Some(row)) => Ok(Amount::new(row.try_get::<Decimal, _>("balance")?)),
            Ok(None) => Err(ClearingError::AccountNotFound { id: id.to_string() }),
            Err(e) if is_constraint_violation(&e, "accounts_balance_check") => {
                Err(ClearingError::InsufficientFunds {
                    account_id: id.to_string(),
                    requested: delta.neg().to_string(),
                    available: "unknown".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn freeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - $2, frozen_balance = frozen_balance + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(amount.as_decimal())
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(ClearingError::AccountNotFound { id: id.to_string() }),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e, "accounts_balance_check") => {
                Err(ClearingError::InsufficientFunds {
                    account_id: id.to_string(),
                    requested: amount.to_string(),
                    available: "unknown".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unfreeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $2, frozen_balance = frozen_balance - $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(amount.as_decimal())
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(ClearingError::AccountNotFound { id: id.to_string() }),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e, "accounts_frozen_balance_check") => Err(ClearingError::validation(
                format!("unfreeze exceeds frozen balance on {id}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>, ClearingError> {
        select_transaction(&mut *self.tx, id).await
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (id, from_account, to_account, amount, fee, tx_type, status, initiated_by,
                 escrow_id, batch_id, idempotency_key, meta, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&record.transaction_id)
        .bind(&record.from)
        .bind(&record.to)
        .bind(record.amount.as_decimal())
        .bind(record.fee.as_decimal())
        .bind(&record.tx_type)
        .bind(record.status.as_str())
        .bind(&record.initiated_by)
        .bind(&record.escrow_id)
        .bind(&record.batch_id)
        .bind(&record.idempotency_key)
        .bind(&record.meta)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e, "transactions_idempotency_key_key") => {
                Err(ClearingError::IdempotencyConflict {
                    key: record.idempotency_key.clone().unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError> {
        let done = sqlx::query(
            "UPDATE transactions SET status = $2, meta = $3, completed_at = $4 WHERE id = $1",
        )
        .bind(&record.transaction_id)
        .bind(record.status.as_str())
        .bind(&record.meta)
        .bind(record.completed_at)
        .execute(&mut *self.tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(ClearingError::TransactionNotFound {
                id: record.transaction_id.clone(),
            });
        }
        Ok(())
    }

    async fn sum_outgoing_since(&mut self, account_id: &str, since: DateTime<Utc>) -> Result<Amount, ClearingError> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM transactions
            WHERE from_account = $1
              AND from_account <> to_account
              AND status = 'COMPLETED'
              AND created_at >= $2
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Amount::new(total))
    }

    async fn insert_balance_operation(&mut self, op: &BalanceOperation) -> Result<(), ClearingError> {
        sqlx::query(
            r#"
            INSERT INTO balance_operations (id, account_id, kind, amount, balance_after, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&op.id)
        .bind(&op.account_id)
        .bind(op.kind.as_str())
        .bind(op.amount.as_decimal())
        .bind(op.balance_after.as_decimal())
        .bind(&op.reason)
        .bind(op.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError> {
        sqlx::query(
            r#"
            INSERT INTO escrows
                (id, from_account, to_account, amount, status, condition, expires_at,
                 transaction_id, created_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&escrow.escrow_id)
        .bind(&escrow.from)
        .bind(&escrow.to)
        .bind(escrow.amount.as_decimal())
        .bind(escrow.status.as_str())
        .bind(&escrow.condition)
        .bind(escrow.expires_at)
        .bind(&escrow.transaction_id)
        .bind(escrow.created_at)
        .bind(escrow.resolved_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError> {
        let done = sqlx::query(
            "UPDATE escrows SET status = $2, transaction_id = $3, resolved_at = $4 WHERE id = $1",
        )
        .bind(&escrow.escrow_id)
        .bind(escrow.status.as_str())
        .bind(&escrow.transaction_id)
        .bind(escrow.resolved_at)
        .execute(&mut *self.tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(ClearingError::EscrowNotFound { id: escrow.escrow_id.clone() });
        }
        Ok(())
    }

    async fn lock_escrow(&mut self, id: &str) -> Result<Option<Escrow>, ClearingError> {
        let sql = format!("{SELECT_ESCROW} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn list_due_escrows(&mut self, now: DateTime<Utc>) -> Result<Vec<Escrow>, ClearingError> {
        let sql = format!(
            "{SELECT_ESCROW} WHERE status = 'PENDING' AND expires_at IS NOT NULL AND expires_at <= $1 \
             ORDER BY expires_at FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&mut *self.tx).await?;
        rows.iter().map(escrow_from_row).collect()
    }

    async fn insert_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError> {
        sqlx::query(
            r#"
            INSERT INTO batch_transfers
                (id, status, total_amount, success_count, failed_count, all_or_nothing,
                 created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&batch.batch_id)
        .bind(batch.status.as_str())
        .bind(batch.total_amount.as_decimal())
        .bind(batch.success_count as i32)
        .bind(batch.failed_count as i32)
        .bind(batch.all_or_nothing)
        .bind(batch.created_at)
        .bind(batch.completed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError> {
        let done = sqlx::query(
            r#"
            UPDATE batch_transfers
            SET status = $2, total_amount = $3, success_count = $4, failed_count = $5, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&batch.batch_id)
        .bind(batch.status.as_str())
        .bind(batch.total_amount.as_decimal())
        .bind(batch.success_count as i32)
        .bind(batch.failed_count as i32)
        .bind(batch.completed_at)
        .execute(&mut *self.tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(ClearingError::BatchNotFound { id: batch.batch_id.clone() });
        }
        Ok(())
    }

    async fn get_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError> {
        select_idempotency(&mut *self.tx, key).await
    }

    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), ClearingError> {
        // Insert first; a conflicting key means a concurrent writer won.
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, transaction_id, fingerprint, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(&record.transaction_id)
        .bind(&record.fingerprint)
        .bind(record.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        if inserted.is_none() {
            return Err(ClearingError::IdempotencyConflict { key: record.key.clone() });
        }
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), ClearingError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (action, entity_type, entity_id, actor_id, changes, meta, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.action.as_str())
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.actor_id)
        .bind(&entry.changes)
        .bind(&entry.meta)
        .bind(entry.timestamp)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError> {
        let schedule = serde_json::to_value(&payment.schedule)
            .map_err(|e| ClearingError::storage(format!("bad schedule json: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_payments
                (id, from_account, to_account, amount, tx_type, meta, schedule, status, enabled,
                 execution_count, failure_count, last_error, next_execute_at, max_executions,
                 expires_at, last_executed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&payment.payment_id)
        .bind(&payment.from)
        .bind(&payment.to)
        .bind(payment.amount.as_decimal())
        .bind(&payment.tx_type)
        .bind(&payment.meta)
        .bind(schedule)
        .bind(payment.status.as_str())
        .bind(payment.enabled)
        .bind(payment.execution_count as i32)
        .bind(payment.failure_count as i32)
        .bind(&payment.last_error)
        .bind(payment.next_execute_at)
        .bind(payment.max_executions.map(|n| n as i32))
        .bind(payment.expires_at)
        .bind(payment.last_executed_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError> {
        let done = sqlx::query(
            r#"
            UPDATE scheduled_payments
            SET status = $2, enabled = $3, execution_count = $4, failure_count = $5,
                last_error = $6, next_execute_at = $7, last_executed_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(&payment.payment_id)
        .bind(payment.status.as_str())
        .bind(payment.enabled)
        .bind(payment.execution_count as i32)
        .bind(payment.failure_count as i32)
        .bind(&payment.last_error)
        .bind(payment.next_execute_at)
        .bind(payment.last_executed_at)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(ClearingError::PaymentNotFound { id: payment.payment_id.clone() });
        }
        Ok(())
    }

    async fn lock_scheduled_payment(&mut self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError> {
        let sql = format!("{SELECT_PAYMENT} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<(), ClearingError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClearingError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
