//! In-Memory Storage Adapter
//!
//! Single write mutex: a transaction owns the lock for its whole
//! lifetime and mutates a working copy that is swapped in on commit.
//! Dropping the handle rolls back. Suitable for tests and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::account::{Account, AccountStatus};
use crate::audit::{AuditFilter, AuditLogEntry};
use crate::batch::BatchTransfer;
use crate::error::ClearingError;
use crate::escrow::{Escrow, EscrowStatus};
use crate::idempotency::{retention, IdempotencyRecord};
use crate::ledger::{BalanceOperation, TransactionRecord, TransactionStatus};
use crate::scheduler::{PaymentStatus, ScheduledPayment};
use crate::types::Amount;

use super::{AccountFilter, EscrowFilter, LedgerStatistics, Storage, StorageTx, TransactionFilter};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    /// api_key -> account_id
    api_keys: HashMap<String, String>,
    /// owner_id -> account ids
    owners: HashMap<String, Vec<String>>,
    transactions: HashMap<String, TransactionRecord>,
    balance_operations: Vec<BalanceOperation>,
    escrows: HashMap<String, Escrow>,
    batches: HashMap<String, BatchTransfer>,
    idempotency: HashMap<String, IdempotencyRecord>,
    audit: Vec<AuditLogEntry>,
    scheduled: HashMap<String, ScheduledPayment>,
}

impl MemoryState {
    fn unindex_account(&mut self, account: &Account) {
        self.api_keys.remove(&account.api_key);
        if let Some(owner_id) = &account.owner_id {
            if let Some(ids) = self.owners.get_mut(owner_id) {
                ids.retain(|id| id != &account.account_id);
            }
        }
    }

    fn index_account(&mut self, account: &Account) {
        self.api_keys.insert(account.api_key.clone(), account.account_id.clone());
        if let Some(owner_id) = &account.owner_id {
            self.owners.entry(owner_id.clone()).or_default().push(account.account_id.clone());
        }
    }
}

/// In-memory storage behind a single write mutex.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTx {
    fn account_mut(&mut self, id: &str) -> Result<&mut Account, ClearingError> {
        self.working
            .accounts
            .get_mut(id)
            .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, ClearingError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, ClearingError> {
        Ok(self.state.lock().await.accounts.get(id).cloned())
    }

    async fn get_account_by_api_key(&self, api_key: &str) -> Result<Option<Account>, ClearingError> {
        let state = self.state.lock().await;
        Ok(state
            .api_keys
            .get(api_key)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn get_accounts_by_owner(&self, owner_id: &str) -> Result<Vec<Account>, ClearingError> {
        let state = self.state.lock().await;
        let ids = state.owners.get(owner_id).cloned().unwrap_or_default();
        Ok(ids.iter().filter_map(|id| state.accounts.get(id)).cloned().collect())
    }

    async fn list_accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>, ClearingError> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.accounts.values().filter(|a| filter.matches(a)).cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            accounts.truncate(limit);
        }
        Ok(accounts)
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>, ClearingError> {
        Ok(self.state.lock().await.transactions.get(id).cloned())
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, ClearingError> {
        let state = self.state.lock().await;
        let mut records: Vec<TransactionRecord> =
            state.transactions.values().filter(|t| filter.matches(t)).cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn list_balance_operations(&self, account_id: &str) -> Result<Vec<BalanceOperation>, ClearingError> {
        let state = self.state.lock().await;
        Ok(state
            .balance_operations
            .iter()
            .filter(|op| op.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_escrow(&self, id: &str) -> Result<Option<Escrow>, ClearingError> {
        Ok(self.state.lock().await.escrows.get(id).cloned())
    }

    async fn list_escrows(&self, filter: &EscrowFilter) -> Result<Vec<Escrow>, ClearingError> {
        let state = self.state.lock().await;
        let mut escrows: Vec<Escrow> = state.escrows.values().filter(|e| filter.matches(e)).cloned().collect();
        escrows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            escrows.truncate(limit);
        }
        Ok(escrows)
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchTransfer>, ClearingError> {
        Ok(self.state.lock().await.batches.get(id).cloned())
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError> {
        Ok(self.state.lock().await.idempotency.get(key).cloned())
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, ClearingError> {
        let state = self.state.lock().await;
        let mut entries: Vec<AuditLogEntry> = state.audit.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn get_scheduled_payment(&self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError> {
        Ok(self.state.lock().await.scheduled.get(id).cloned())
    }

    async fn list_scheduled_payments(&self) -> Result<Vec<ScheduledPayment>, ClearingError> {
        let state = self.state.lock().await;
        let mut payments: Vec<ScheduledPayment> = state.scheduled.values().cloned().collect();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(payments)
    }

    async fn list_due_payments(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPayment>, ClearingError> {
        let state = self.state.lock().await;
        let mut due: Vec<ScheduledPayment> = state
            .scheduled
            .values()
            .filter(|p| p.enabled && p.status == PaymentStatus::Active && p.next_execute_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_execute_at.cmp(&b.next_execute_at));
        Ok(due)
    }

    async fn statistics(&self) -> Result<LedgerStatistics, ClearingError> {
        let state = self.state.lock().await;

        let mut total_balance = Amount::ZERO;
        let mut total_frozen = Amount::ZERO;
        let mut active_accounts = 0u64;
        for account in state.accounts.values() {
            total_balance = total_balance.checked_add(account.balance).unwrap_or(total_balance);
            total_frozen = total_frozen.checked_add(account.frozen_balance).unwrap_or(total_frozen);
            if account.status == AccountStatus::Active {
                active_accounts += 1;
            }
        }

        let mut completed_volume = Amount::ZERO;
        let mut total_fees = Amount::ZERO;
        for record in state.transactions.values() {
            if record.status == TransactionStatus::Completed {
                completed_volume = completed_volume.checked_add(record.amount).unwrap_or(completed_volume);
                total_fees = total_fees.checked_add(record.fee).unwrap_or(total_fees);
            }
        }

        Ok(LedgerStatistics {
            total_accounts: state.accounts.len() as u64,
            active_accounts,
            total_balance,
            total_frozen,
            transaction_count: state.transactions.len() as u64,
            completed_volume,
            total_fees,
            pending_escrows: state
                .escrows
                .values()
                .filter(|e| e.status == EscrowStatus::Pending)
                .count() as u64,
        })
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn insert_account(&mut self, account: &Account) -> Result<(), ClearingError> {
        if self.working.api_keys.contains_key(&account.api_key) {
            return Err(ClearingError::DuplicateApiKey);
        }
        self.working.accounts.insert(account.account_id.clone(), account.clone());
        self.working.index_account(account);
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), ClearingError> {
        let previous = self
            .working
            .accounts
            .get(&account.account_id)
            .cloned()
            .ok_or_else(|| ClearingError::AccountNotFound { id: account.account_id.clone() })?;

        if previous.api_key != account.api_key {
            if self.working.api_keys.contains_key(&account.api_key) {
                return Err(ClearingError::DuplicateApiKey);
            }
        }

        self.working.unindex_account(&previous);
        self.working.accounts.insert(account.account_id.clone(), account.clone());
        self.working.index_account(account);
        Ok(())
    }

    async fn delete_account(&mut self, id: &str) -> Result<(), ClearingError> {
        let account = self
            .working
            .accounts
            .remove(id)
            .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })?;
        self.working.unindex_account(&account);
        Ok(())
    }

    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>, ClearingError> {
        // The write mutex held by this transaction is the row lock.
        Ok(self.working.accounts.get(id).cloned())
    }

    async fn update_balance(&mut self, id: &str, delta: Amount) -> Result<Amount, ClearingError> {
        let account = self.account_mut(id)?;
        let next = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| ClearingError::validation("balance overflow"))?;
        if next.is_negative() {
            return Err(ClearingError::InsufficientFunds {
                account_id: id.to_string(),
                requested: delta.neg().to_string(),
                available: account.balance.to_string(),
            });
        }
        account.balance = next;
        account.updated_at = Utc::now();
        Ok(next)
    }

    async fn freeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError> {
        let account = self.account_mut(id)?;
        let next_balance = account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| ClearingError::validation("balance overflow"))?;
        if next_balance.is_negative() {
            return Err(ClearingError::InsufficientFunds {
                account_id: id.to_string(),
                requested: amount.to_string(),
                available: account.balance.to_string(),
            });
        }
        account.balance = next_balance;
        account.frozen_balance = account
            .frozen_balance
            .checked_add(amount)
            .ok_or_else(|| ClearingError::validation("frozen balance overflow"))?;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn unfreeze_balance(&mut self, id: &str, amount: Amount) -> Result<(), ClearingError> {
        let account = self.account_mut(id)?;
        let next_frozen = account
            .frozen_balance
            .checked_sub(amount)
            .ok_or_else(|| ClearingError::validation("frozen balance overflow"))?;
        if next_frozen.is_negative() {
            return Err(ClearingError::validation(format!(
                "unfreeze exceeds frozen balance on {id}"
            )));
        }
        account.frozen_balance = next_frozen;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| ClearingError::validation("balance overflow"))?;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>, ClearingError> {
        Ok(self.working.transactions.get(id).cloned())
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError> {
        self.working.transactions.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn update_transaction(&mut self, record: &TransactionRecord) -> Result<(), ClearingError> {
        if !self.working.transactions.contains_key(&record.transaction_id) {
            return Err(ClearingError::TransactionNotFound { id: record.transaction_id.clone() });
        }
        self.working.transactions.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn sum_outgoing_since(&mut self, account_id: &str, since: DateTime<Utc>) -> Result<Amount, ClearingError> {
        let mut total = Amount::ZERO;
        for record in self.working.transactions.values() {
            if record.from == account_id
                && record.from != record.to
                && record.status == TransactionStatus::Completed
                && record.created_at >= since
            {
                total = total
                    .checked_add(record.amount)
                    .ok_or_else(|| ClearingError::validation("volume overflow"))?;
            }
        }
        Ok(total)
    }

    async fn insert_balance_operation(&mut self, op: &BalanceOperation) -> Result<(), ClearingError> {
        self.working.balance_operations.push(op.clone());
        Ok(())
    }

    async fn insert_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError> {
        self.working.escrows.insert(escrow.escrow_id.clone(), escrow.clone());
        Ok(())
    }

    async fn update_escrow(&mut self, escrow: &Escrow) -> Result<(), ClearingError> {
        if !self.working.escrows.contains_key(&escrow.escrow_id) {
            return Err(ClearingError::EscrowNotFound { id: escrow.escrow_id.clone() });
        }
        self.working.escrows.insert(escrow.escrow_id.clone(), escrow.clone());
        Ok(())
    }

    async fn lock_escrow(&mut self, id: &str) -> Result<Option<Escrow>, ClearingError> {
        Ok(self.working.escrows.get(id).cloned())
    }

    async fn list_due_escrows(&mut self, now: DateTime<Utc>) -> Result<Vec<Escrow>, ClearingError> {
        let mut due: Vec<Escrow> = self
            .working
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Pending && e.expires_at.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(due)
    }

    async fn insert_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError> {
        self.working.batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn update_batch(&mut self, batch: &BatchTransfer) -> Result<(), ClearingError> {
        if !self.working.batches.contains_key(&batch.batch_id) {
            return Err(ClearingError::BatchNotFound { id: batch.batch_id.clone() });
        }
        self.working.batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn get_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, ClearingError> {
        Ok(self.working.idempotency.get(key).cloned())
    }

    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), ClearingError> {
        // Lazy retention sweep past the 24h horizon.
        let horizon = Utc::now() - retention();
        self.working.idempotency.retain(|_, r| r.created_at >= horizon);
        self.working.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), ClearingError> {
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn insert_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError> {
        self.working.scheduled.insert(payment.payment_id.clone(), payment.clone());
        Ok(())
    }

    async fn update_scheduled_payment(&mut self, payment: &ScheduledPayment) -> Result<(), ClearingError> {
        if !self.working.scheduled.contains_key(&payment.payment_id) {
            return Err(ClearingError::PaymentNotFound { id: payment.payment_id.clone() });
        }
        self.working.scheduled.insert(payment.payment_id.clone(), payment.clone());
        Ok(())
    }

    async fn lock_scheduled_payment(&mut self, id: &str) -> Result<Option<ScheduledPayment>, ClearingError> {
        Ok(self.working.scheduled.get(id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<(), ClearingError> {
        let mut this = *self;
        *this.guard = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClearingError> {
        Ok(())
    }
}
