//! Versioned Migration Suite
//!
//! Migrations are numbered, applied in ascending order inside one
//! transaction each, and recorded in the `migrations` table.

use sqlx::PgPool;

use crate::error::ClearingError;

pub(crate) const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "create_core_tables",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT,
            owner_id TEXT,
            api_key TEXT NOT NULL UNIQUE,
            balance NUMERIC(20,8) NOT NULL DEFAULT 0 CHECK (balance >= 0),
            frozen_balance NUMERIC(20,8) NOT NULL DEFAULT 0 CHECK (frozen_balance >= 0),
            roles TEXT[] NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            max_transfer_amount NUMERIC(20,8),
            daily_transfer_limit NUMERIC(20,8),
            min_balance NUMERIC(20,8) NOT NULL DEFAULT 0,
            metadata JSONB NOT NULL DEFAULT '{}',
            tags TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            from_account TEXT NOT NULL,
            to_account TEXT NOT NULL,
            amount NUMERIC(20,8) NOT NULL CHECK (amount > 0),
            fee NUMERIC(20,8) NOT NULL DEFAULT 0 CHECK (fee >= 0),
            tx_type TEXT NOT NULL,
            status TEXT NOT NULL,
            initiated_by TEXT,
            escrow_id TEXT,
            batch_id TEXT,
            idempotency_key TEXT UNIQUE,
            meta JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ
        );

        CREATE TABLE IF NOT EXISTS balance_operations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('CREDIT', 'DEBIT')),
            amount NUMERIC(20,8) NOT NULL CHECK (amount > 0),
            balance_after NUMERIC(20,8) NOT NULL,
            reason TEXT,
            created_at TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS escrows (
            id TEXT PRIMARY KEY,
            from_account TEXT NOT NULL,
            to_account TEXT NOT NULL,
            amount NUMERIC(20,8) NOT NULL CHECK (amount > 0),
            status TEXT NOT NULL,
            condition TEXT,
            expires_at TIMESTAMPTZ,
            transaction_id TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            resolved_at TIMESTAMPTZ
        );

        CREATE TABLE IF NOT EXISTS batch_transfers (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            total_amount NUMERIC(20,8) NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            all_or_nothing BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id BIGSERIAL PRIMARY KEY,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            actor_id TEXT,
            changes JSONB NOT NULL DEFAULT '{}',
            meta JSONB NOT NULL DEFAULT '{}',
            timestamp TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        );
        "#,
    ),
    (
        2,
        "create_core_indexes",
        r#"
        CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);
        CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner_id);

        CREATE INDEX IF NOT EXISTS idx_transactions_from_created
            ON transactions(from_account, created_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_to_created
            ON transactions(to_account, created_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions(tx_type);
        CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);

        CREATE INDEX IF NOT EXISTS idx_balance_operations_account
            ON balance_operations(account_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_escrows_from ON escrows(from_account);
        CREATE INDEX IF NOT EXISTS idx_escrows_to ON escrows(to_account);
        CREATE INDEX IF NOT EXISTS idx_escrows_status_expires
            ON escrows(status, expires_at);

        CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_logs(entity_id);
        CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action);
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp);
        "#,
    ),
    (
        3,
        "create_scheduled_payments",
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_payments (
            id TEXT PRIMARY KEY,
            from_account TEXT NOT NULL,
            to_account TEXT NOT NULL,
            amount NUMERIC(20,8) NOT NULL CHECK (amount > 0),
            tx_type TEXT NOT NULL,
            meta JSONB NOT NULL DEFAULT '{}',
            schedule JSONB NOT NULL,
            status TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            execution_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_execute_at TIMESTAMPTZ NOT NULL,
            max_executions INTEGER,
            expires_at TIMESTAMPTZ,
            last_executed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_payments_due
            ON scheduled_payments(status, next_execute_at)
            WHERE enabled;
        "#,
    ),
];

/// Apply all pending migrations in ascending version order.
pub(crate) async fn apply(pool: &PgPool) -> Result<(), ClearingError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            version BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM migrations ORDER BY version")
        .fetch_all(pool)
        .await?;

    for &(version, name, sql) in MIGRATIONS {
        if applied.contains(&version) {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO migrations (version, name) VALUES ($1, $2)")
            .bind(version)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version, name, "Applied migration");
    }

    Ok(())
}
