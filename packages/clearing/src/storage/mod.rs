//! Storage Adapter API
//!
//! All persistence flows through the `Storage` and `StorageTx` capability
//! traits. `Storage` serves pool-level reads and opens transactions;
//! everything a `StorageTx` performs either all commits or all rolls
//! back. Two conforming implementations ship with the crate: an
//! in-memory adapter behind a single write mutex, and a Postgres adapter
//! with row-level locking and a versioned migration suite.

pub mod memory;
pub mod migrations;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::{Account, AccountStatus};
use crate::audit::{AuditFilter, AuditLogEntry};
use crate::batch::BatchTransfer;
use crate::error::ClearingError;
use crate::escrow::{Escrow, EscrowStatus};
use crate::idempotency::IdempotencyRecord;
use crate::ledger::{BalanceOperation, TransactionRecord, TransactionStatus};
use crate::scheduler::ScheduledPayment;
use crate::types::{Amount, Role};

pub use memory::MemoryStorage;
pub use postgres::{PostgresOptions, PostgresStorage};

/// Account query filter.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub status: Option<AccountStatus>,
    pub role: Option<Role>,
    pub tag: Option<String>,
    pub owner_id: Option<String>,
    pub limit: Option<usize>,
}

/// Transaction query filter.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Match either side of the transaction.
    pub account: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub tx_type: Option<String>,
    pub status: Option<TransactionStatus>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
    pub limit: Option<usize>,
}

/// Escrow query filter.
#[derive(Debug, Clone, Default)]
pub struct EscrowFilter {
    pub status: Option<EscrowStatus>,
    /// Match either party.
    pub party: Option<String>,
    pub limit: Option<usize>,
}

impl AccountFilter {
    pub fn matches(&self, account: &Account) -> bool {
        if let Some(status) = self.status {
            if account.status != status {
                return false;
            }
        }
        if let Some(role) = self.role {
            if !account.roles.contains(&role) {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !account.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(ref owner_id) = self.owner_id {
            if account.owner_id.as_deref() != Some(owner_id.as_str()) {
                return false;
            }
        }
        true
    }
}

impl TransactionFilter {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(ref account) = self.account {
            if &record.from != account && &record.to != account {
                return false;
            }
        }
        if let Some(ref from) = self.from {
            if &record.from != from {
                return false;
            }
        }
        if let Some(ref to) = self.to {
            if &record.to != to {
                return false;
            }
        }
        if let Some(ref tx_type) = self.tx_type {
            if &record.tx_type != tx_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(after) = self.after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if record.created_at >= before {
                return false;
            }
        }
        if let Some(min) = self.min_amount {
            if record.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if record.amount > max {
                return false;
            }
        }
        true
    }
}

impl EscrowFilter {
    pub fn matches(&self, escrow: &Escrow) -> bool {
        if let Some(status) = self.status {
            if escrow.status != status {
                return false;
            }
        }
        if let Some(ref party) = self.party {
            if &escrow.from != party && &escrow.to != party {
                return false;
            }
        }
        true
    }
}

/// Aggregate ledger counters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LedgerStatistics {
    pub total_accounts: u64,
    pub active_accounts: u64,
    pub total_balance: Amount,
    pub total_frozen: Amount,
    pub transaction_count: u64,
    pub completed_volume: Amount,
    pub total_fees: Amount,
    pub pending_escrows: u64,
}

/// Pool-level persistence capability.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a storage transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTx>, ClearingError>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>, ClearingError>;
    async fn get_account_by_api_key(&self, api_key: &str) -> Result<Option<Account>, ClearingError>;
    async fn get_accounts_by_owner(&self, owner_id: &str) -> Result<Vec<Account>, ClearingError>;
    async fn list_accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>, ClearingError>;

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>, ClearingError>;
    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, ClearingError>;
    async fn list_balance_operations(&self, account_id: &str) -> Result<Vec<BalanceOperation>, ClearingError>;

    async fn get_escrow(&self, id: &str) -> Result<Option<Escrow>, ClearingError>;
    async fn list_escrows(&self, filter: &EscrowFilter) -> Result<Vec<Escrow>, ClearingError>;

    async fn get_batch(&self, id: &str) -> Result<Option<BatchTransfer>, ClearingError>;

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError>;

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, ClearingError>;

    async fn get_scheduled_payment(&self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError>;
    async fn list_scheduled_payments(&self) -> Result<Vec<ScheduledPayment>, ClearingError>;
    /// Payments that are enabled, active, and due at `now`.
    async fn list_due_payments(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPayment>, ClearingError>;

    async fn statistics(&self) -> Result<LedgerStatistics, ClearingError>;
}

/// Scoped transactional capability. Dropping a transaction without
/// committing rolls it back.
#[async_trait]
pub trait StorageTx: Send {
    async fn insert_account(&mut self, account: &Account) -> Result<(), ClearingError>;
    async fn update_account(&mut self, account: &Account) -> Result<(), ClearingError>;
    async fn delete_account(&mut self, id: &str) -> Result<(), ClearingError>;
    /// Load an account under row-level exclusivity.
    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>, ClearingError>;

    /// Apply a signed delta to the spendable balance; errors if the
    /// result would go negative. Returns the new balance.
    async fn update_balance(&mut self, id: &str, delta: Amount) -> Result<Amount, ClearingError>;
    /// Move `amount` from spendable to frozen balance.
    async fn freeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError>;
    /// Move `amount` from frozen back to spendable balance.
    async fn unfreeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError>;

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>, ClearingError>;
    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError>;
    async fn update_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError>;
    /// Sum of completed outgoing transfer amounts since `since`,
    /// excluding one-sided operations.
    async fn sum_outgoing_since(&mut self, account_id: &str, since: DateTime<Utc>) -> Result<Amount, ClearingError>;

    async fn insert_balance_operation(&mut self, op: &BalanceOperation) -> Result<(), ClearingError>;

    async fn insert_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError>;
    async fn update_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError>;
    /// Load an escrow under row-level exclusivity.
    async fn lock_escrow(&mut self, id: &str) -> Result<Option<Escrow>, ClearingError>;
    /// Pending escrows expiring at or before `now`, locked for update.
    async fn list_due_escrows(&mut self, now: DateTime<Utc>) -> Result<Vec<Escrow>, ClearingError>;

    async fn insert_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError>;
    async fn update_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError>;

    async fn get_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError>;
    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), ClearingError>;

    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), ClearingError>;

    async fn insert_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError>;
    async fn update_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError>;
    /// Load a scheduled payment under row-level exclusivity.
    async fn lock_scheduled_payment(&mut self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError>;

    async fn commit(self: Box<Self>) -> Result<(), ClearingError>;
    async fn rollback(self: Box<Self>) -> Result<(), ClearingError>;
}
