//! Ledger Core
//!
//! Account lifecycle, balance arithmetic, and the canonical transfer
//! algorithm. Every operation runs through the middleware pipeline, then
//! opens one storage transaction, performs its reads and writes, appends
//! audit entries, and commits. Domain events fire after commit and never
//! reverse a committed operation.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::account::{Account, AccountLimits, AccountStatus};
use crate::audit::{field_change, AuditAction, AuditLogEntry};
use crate::config::ClearingConfig;
use crate::error::ClearingError;
use crate::events::{kinds, DomainEvent, EventBus};
use crate::idempotency::{fingerprint, IdempotencyRecord};
use crate::middleware::{OperationContext, Pipeline};
use crate::storage::{Storage, StorageTx, TransactionFilter};
use crate::types::{new_balance_op_id, new_transaction_id, Actor, Amount, Role};

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Reversed => "REVERSED",
        }
    }

    pub fn parse(s: &str) -> Option<TransactionStatus> {
        match s {
            "PENDING" => Some(TransactionStatus::Pending),
            "COMPLETED" => Some(TransactionStatus::Completed),
            "FAILED" => Some(TransactionStatus::Failed),
            "REVERSED" => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }

    /// Forward-only transitions.
    pub fn can_transition(self, to: TransactionStatus) -> bool {
        matches!(
            (self, to),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
                | (TransactionStatus::Completed, TransactionStatus::Reversed)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger transaction. One completed record corresponds to exactly one
/// debit/credit pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub fee: Amount,
    pub tx_type: String,
    pub status: TransactionStatus,
    pub initiated_by: Option<String>,
    pub escrow_id: Option<String>,
    pub batch_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    pub fn pending(from: impl Into<String>, to: impl Into<String>, amount: Amount, tx_type: impl Into<String>) -> Self {
        Self {
            transaction_id: new_transaction_id(),
            from: from.into(),
            to: to.into(),
            amount,
            fee: Amount::ZERO,
            tx_type: tx_type.into(),
            status: TransactionStatus::Pending,
            initiated_by: None,
            escrow_id: None,
            batch_id: None,
            idempotency_key: None,
            meta: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self) {
        self.status = TransactionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}

/// Single-side balance change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BalanceOperationKind {
    Credit,
    Debit,
}

impl BalanceOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceOperationKind::Credit => "CREDIT",
            BalanceOperationKind::Debit => "DEBIT",
        }
    }

    pub fn parse(s: &str) -> Option<BalanceOperationKind> {
        match s {
            "CREDIT" => Some(BalanceOperationKind::Credit),
            "DEBIT" => Some(BalanceOperationKind::Debit),
            _ => None,
        }
    }
}

/// Administrative single-side balance change, recorded with the balance
/// observed after the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceOperation {
    pub id: String,
    pub account_id: String,
    pub kind: BalanceOperationKind,
    pub amount: Amount,
    pub balance_after: Amount,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transfer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub memo: Option<String>,
    pub idempotency_key: Option<String>,
    /// Explicit fee; computed by the fee calculator when absent.
    pub fee: Option<Amount>,
    pub tx_type: Option<String>,
    pub batch_id: Option<String>,
}

impl TransferRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: Amount) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            memo: None,
            idempotency_key: None,
            fee: None,
            tx_type: None,
            batch_id: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_fee(mut self, fee: Amount) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_type(mut self, tx_type: impl Into<String>) -> Self {
        self.tx_type = Some(tx_type.into());
        self
    }

    fn effective_type(&self) -> String {
        self.tx_type.clone().unwrap_or_else(|| "TRANSFER".to_string())
    }
}

/// New account parameters.
#[derive(Debug, Clone, Default)]
pub struct CreateAccountRequest {
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub roles: Vec<Role>,
    pub initial_balance: Option<Amount>,
    pub limits: Option<AccountLimits>,
    pub metadata: Option<serde_json::Value>,
    pub tags: Vec<String>,
}

/// Account field updates; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
    pub status: Option<AccountStatus>,
    pub limits: Option<AccountLimits>,
    pub metadata: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
}

/// Pluggable fee policy.
pub type FeeCalculator = Arc<dyn Fn(Amount, &str) -> Amount + Send + Sync>;

pub fn zero_fee() -> FeeCalculator {
    Arc::new(|_, _| Amount::ZERO)
}

/// Operations gated by the authorization table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Read,
    Transfer,
    BalanceAdjust,
    AccountCreate,
    AccountUpdate,
    AccountDelete,
    ApiKeyRegenerate,
}

fn role_allows(role: Role, action: AuthAction) -> bool {
    match role {
        Role::Admin => true,
        Role::Operator => action != AuthAction::AccountDelete,
        Role::Auditor => action == AuthAction::Read,
        Role::Consumer | Role::Provider => matches!(
            action,
            AuthAction::Read | AuthAction::Transfer | AuthAction::ApiKeyRegenerate
        ),
    }
}

/// Check the role table.
pub fn authorize(actor: &Actor, action: AuthAction) -> Result<(), ClearingError> {
    if actor.roles.iter().any(|role| role_allows(*role, action)) {
        Ok(())
    } else {
        Err(ClearingError::Forbidden {
            actor_id: actor.id.clone(),
            action: format!("{action:?}"),
        })
    }
}

/// Whether the actor is limited to their own accounts.
fn self_scoped(actor: &Actor) -> bool {
    !actor.has_role(Role::Admin) && !actor.has_role(Role::Operator) && !actor.has_role(Role::Auditor)
}

pub(crate) fn ensure_account_scope(actor: &Actor, account: &Account) -> Result<(), ClearingError> {
    if !self_scoped(actor)
        || account.account_id == actor.id
        || account.owner_id.as_deref() == Some(actor.id.as_str())
    {
        Ok(())
    } else {
        Err(ClearingError::Forbidden {
            actor_id: actor.id.clone(),
            action: format!("access account {}", account.account_id),
        })
    }
}

pub(crate) fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

pub(crate) struct TransferOutcome {
    pub record: TransactionRecord,
    /// True when an idempotent replay returned the stored transaction.
    pub replayed: bool,
}

/// The ledger core.
pub struct Ledger {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    pipeline: Pipeline,
    config: ClearingConfig,
    fee_calculator: FeeCalculator,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<EventBus>, config: ClearingConfig) -> Self {
        Self {
            storage,
            events,
            pipeline: Pipeline::new(),
            config,
            fee_calculator: zero_fee(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_fee_calculator(mut self, fee_calculator: FeeCalculator) -> Self {
        self.fee_calculator = fee_calculator;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &ClearingConfig {
        &self.config
    }

    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, ClearingError>>,
    ) -> Result<T, ClearingError> {
        match self.config.operation_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(ClearingError::Timeout),
            },
            None => fut.await,
        }
    }

    async fn audit(&self, tx: &mut dyn StorageTx, entry: AuditLogEntry) -> Result<(), ClearingError> {
        if self.config.enable_audit_log {
            tx.append_audit(&entry).await?;
        }
        Ok(())
    }

    // ── Account operations ──

    pub async fn create_account(
        &self,
        actor: &Actor,
        request: CreateAccountRequest,
    ) -> Result<Account, ClearingError> {
        let mut ctx = OperationContext::new(
            "account.create",
            actor.clone(),
            serde_json::json!({ "name": request.name.clone(), "owner_id": request.owner_id.clone() }),
        );
        self.pipeline
            .execute(&mut ctx, || self.with_deadline(self.do_create_account(actor, request)))
            .await
    }

    async fn do_create_account(
        &self,
        actor: &Actor,
        request: CreateAccountRequest,
    ) -> Result<Account, ClearingError> {
        authorize(actor, AuthAction::AccountCreate)?;

        if let Some(balance) = request.initial_balance {
            if balance.is_negative() {
                return Err(ClearingError::InvalidAmount {
                    reason: "initial balance must not be negative".into(),
                });
            }
        }

        let mut account = Account::new(
            request.name,
            request.owner_id,
            request.roles,
            request.limits.unwrap_or_else(|| self.config.default_limits.clone()),
        );
        if let Some(metadata) = request.metadata {
            account.metadata = metadata;
        }
        account.tags = request.tags;

        let mut tx = self.storage.begin().await?;
        let result = async {
            tx.insert_account(&account).await?;
            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::AccountCreate, "account", &account.account_id)
                    .by(&actor.id),
            )
            .await?;

            if let Some(balance) = request.initial_balance {
                if balance.is_positive() {
                    self.credit_in_tx(&mut *tx, actor, &account.account_id, balance, Some("initial balance"))
                        .await?;
                    account.balance = balance;
                }
            }
            Ok::<(), ClearingError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                tracing::info!(account_id = %account.account_id, "Account created");
                self.events.emit(DomainEvent::new(
                    kinds::ACCOUNT_CREATED,
                    serde_json::json!({ "account_id": account.account_id }),
                ));
                Ok(account)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn get_account(&self, actor: &Actor, id: &str) -> Result<Account, ClearingError> {
        authorize(actor, AuthAction::Read)?;
        let account = self
            .storage
            .get_account(id)
            .await?
            .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })?;
        ensure_account_scope(actor, &account)?;
        Ok(account)
    }

    pub async fn get_account_by_api_key(&self, api_key: &str) -> Result<Account, ClearingError> {
        self.storage
            .get_account_by_api_key(api_key)
            .await?
            .ok_or_else(|| ClearingError::Unauthorized {
                action: "api key lookup".into(),
            })
    }

    pub async fn get_accounts_by_owner(&self, actor: &Actor, owner_id: &str) -> Result<Vec<Account>, ClearingError> {
        authorize(actor, AuthAction::Read)?;
        if self_scoped(actor) && actor.id != owner_id {
            return Err(ClearingError::Forbidden {
                actor_id: actor.id.clone(),
                action: format!("list accounts of {owner_id}"),
            });
        }
        self.storage.get_accounts_by_owner(owner_id).await
    }

    pub async fn update_account(
        &self,
        actor: &Actor,
        id: &str,
        request: UpdateAccountRequest,
    ) -> Result<Account, ClearingError> {
        let mut ctx = OperationContext::new("account.update", actor.clone(), serde_json::json!({ "id": id }));
        self.pipeline
            .execute(&mut ctx, || self.with_deadline(self.do_update_account(actor, id, request)))
            .await
    }

    async fn do_update_account(
        &self,
        actor: &Actor,
        id: &str,
        request: UpdateAccountRequest,
    ) -> Result<Account, ClearingError> {
        authorize(actor, AuthAction::AccountUpdate)?;

        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut account = tx
                .lock_account(id)
                .await?
                .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })?;

            let mut changes = serde_json::Map::new();
            if let Some(name) = request.name {
                merge_change(&mut changes, "name", serde_json::json!(account.name), serde_json::json!(name));
                account.name = Some(name);
            }
            if let Some(status) = request.status {
                merge_change(
                    &mut changes,
                    "status",
                    serde_json::json!(account.status.as_str()),
                    serde_json::json!(status.as_str()),
                );
                account.status = status;
            }
            if let Some(limits) = request.limits {
                merge_change(
                    &mut changes,
                    "limits",
                    serde_json::json!(account.limits),
                    serde_json::json!(limits),
                );
                account.limits = limits;
            }
            if let Some(metadata) = request.metadata {
                merge_change(&mut changes, "metadata", account.metadata.clone(), metadata.clone());
                account.metadata = metadata;
            }
            if let Some(tags) = request.tags {
                merge_change(&mut changes, "tags", serde_json::json!(account.tags), serde_json::json!(tags));
                account.tags = tags;
            }
            account.updated_at = Utc::now();

            tx.update_account(&account).await?;
            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::AccountUpdate, "account", id)
                    .by(&actor.id)
                    .with_changes(serde_json::Value::Object(changes)),
            )
            .await?;
            Ok(account)
        }
        .await;

        match result {
            Ok(account) => {
                tx.commit().await?;
                self.events.emit(DomainEvent::new(
                    kinds::ACCOUNT_UPDATED,
                    serde_json::json!({ "account_id": id }),
                ));
                Ok(account)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Delete an account. Refused while any value remains on it.
    pub async fn delete_account(&self, actor: &Actor, id: &str) -> Result<(), ClearingError> {
        let mut ctx = OperationContext::new("account.delete", actor.clone(), serde_json::json!({ "id": id }));
        self.pipeline
            .execute(&mut ctx, || self.with_deadline(self.do_delete_account(actor, id)))
            .await
    }

    async fn do_delete_account(&self, actor: &Actor, id: &str) -> Result<(), ClearingError> {
        authorize(actor, AuthAction::AccountDelete)?;

        let mut tx = self.storage.begin().await?;
        let result = async {
            let account = tx
                .lock_account(id)
                .await?
                .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })?;

            if !account.balance.is_zero() || !account.frozen_balance.is_zero() {
                return Err(ClearingError::validation(format!(
                    "account {id} must be drained to zero before deletion"
                )));
            }

            tx.delete_account(id).await?;
            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::AccountDelete, "account", id).by(&actor.id),
            )
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                self.events.emit(DomainEvent::new(
                    kinds::ACCOUNT_DELETED,
                    serde_json::json!({ "account_id": id }),
                ));
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Atomically replace the account's api key.
    pub async fn regenerate_api_key(&self, actor: &Actor, id: &str) -> Result<Account, ClearingError> {
        authorize(actor, AuthAction::ApiKeyRegenerate)?;

        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut account = tx
                .lock_account(id)
                .await?
                .ok_or_else(|| ClearingError::AccountNotFound { id: id.to_string() })?;
            ensure_account_scope(actor, &account)?;

            account.api_key = crate::types::new_api_key();
            account.updated_at = Utc::now();
            tx.update_account(&account).await?;
            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::ApiKeyRegenerate, "account", id).by(&actor.id),
            )
            .await?;
            Ok(account)
        }
        .await;

        match result {
            Ok(account) => {
                tx.commit().await?;
                Ok(account)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Balance operations ──

    /// Administrative top-up. Never fails on the balance axis.
    pub async fn credit(
        &self,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        reason: Option<&str>,
    ) -> Result<TransactionRecord, ClearingError> {
        let mut ctx = OperationContext::new(
            "balance.credit",
            actor.clone(),
            serde_json::json!({ "account_id": account_id, "amount": amount }),
        );
        self.pipeline
            .execute(&mut ctx, || {
                self.with_deadline(self.do_balance_operation(actor, account_id, amount, reason, BalanceOperationKind::Credit))
            })
            .await
    }

    /// Administrative deduction, bounded by the account's balance floor.
    pub async fn debit(
        &self,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        reason: Option<&str>,
    ) -> Result<TransactionRecord, ClearingError> {
        let mut ctx = OperationContext::new(
            "balance.debit",
            actor.clone(),
            serde_json::json!({ "account_id": account_id, "amount": amount }),
        );
        self.pipeline
            .execute(&mut ctx, || {
                self.with_deadline(self.do_balance_operation(actor, account_id, amount, reason, BalanceOperationKind::Debit))
            })
            .await
    }

    async fn do_balance_operation(
        &self,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        reason: Option<&str>,
        kind: BalanceOperationKind,
    ) -> Result<TransactionRecord, ClearingError> {
        authorize(actor, AuthAction::BalanceAdjust)?;
        if !amount.is_positive() {
            return Err(ClearingError::InvalidAmount {
                reason: "amount must be positive".into(),
            });
        }

        let mut tx = self.storage.begin().await?;
        let result = match kind {
            BalanceOperationKind::Credit => self.credit_in_tx(&mut *tx, actor, account_id, amount, reason).await,
            BalanceOperationKind::Debit => self.debit_in_tx(&mut *tx, actor, account_id, amount, reason).await,
        };

        match result {
            Ok(record) => {
                tx.commit().await?;
                let kind_event = match kind {
                    BalanceOperationKind::Credit => kinds::BALANCE_CREDITED,
                    BalanceOperationKind::Debit => kinds::BALANCE_DEBITED,
                };
                self.events.emit(DomainEvent::new(
                    kind_event,
                    serde_json::json!({
                        "account_id": account_id,
                        "amount": amount,
                        "transaction_id": record.transaction_id,
                    }),
                ));
                Ok(record)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub(crate) async fn credit_in_tx(
        &self,
        tx: &mut dyn StorageTx,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        reason: Option<&str>,
    ) -> Result<TransactionRecord, ClearingError> {
        tx.lock_account(account_id)
            .await?
            .ok_or_else(|| ClearingError::AccountNotFound { id: account_id.to_string() })?;

        let balance_after = tx.update_balance(account_id, amount).await?;
        let record = self
            .record_balance_operation(tx, actor, account_id, amount, balance_after, reason, BalanceOperationKind::Credit)
            .await?;
        Ok(record)
    }

    pub(crate) async fn debit_in_tx(
        &self,
        tx: &mut dyn StorageTx,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        reason: Option<&str>,
    ) -> Result<TransactionRecord, ClearingError> {
        let account = tx
            .lock_account(account_id)
            .await?
            .ok_or_else(|| ClearingError::AccountNotFound { id: account_id.to_string() })?;

        let floor = account.limits.min_balance;
        let after = account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| ClearingError::validation("balance overflow"))?;
        if after < floor {
            return Err(ClearingError::InsufficientFunds {
                account_id: account_id.to_string(),
                requested: amount.to_string(),
                available: account.balance.to_string(),
            });
        }

        let balance_after = tx.update_balance(account_id, amount.neg()).await?;
        let record = self
            .record_balance_operation(tx, actor, account_id, amount, balance_after, reason, BalanceOperationKind::Debit)
            .await?;
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_balance_operation(
        &self,
        tx: &mut dyn StorageTx,
        actor: &Actor,
        account_id: &str,
        amount: Amount,
        balance_after: Amount,
        reason: Option<&str>,
        kind: BalanceOperationKind,
    ) -> Result<TransactionRecord, ClearingError> {
        let op = BalanceOperation {
            id: new_balance_op_id(),
            account_id: account_id.to_string(),
            kind,
            amount,
            balance_after,
            reason: reason.map(String::from),
            created_at: Utc::now(),
        };
        tx.insert_balance_operation(&op).await?;

        // One-sided transaction so statements read as a single stream.
        let mut record = TransactionRecord::pending(account_id, account_id, amount, kind.as_str());
        record.initiated_by = Some(actor.id.clone());
        if let Some(reason) = reason {
            record.meta = serde_json::json!({ "reason": reason });
        }
        record.complete();
        tx.insert_transaction(&record).await?;

        let audit_action = match kind {
            BalanceOperationKind::Credit => AuditAction::BalanceCredit,
            BalanceOperationKind::Debit => AuditAction::BalanceDebit,
        };
        self.audit(
            tx,
            AuditLogEntry::new(audit_action, "account", account_id)
                .by(&actor.id)
                .with_meta(serde_json::json!({
                    "amount": amount,
                    "balance_after": balance_after,
                    "transaction_id": record.transaction_id,
                })),
        )
        .await?;

        Ok(record)
    }

    // ── Transfer ──

    /// Atomic double-entry transfer between two accounts.
    pub async fn transfer(&self, actor: &Actor, request: TransferRequest) -> Result<TransactionRecord, ClearingError> {
        let mut ctx = OperationContext::new(
            "transfer",
            actor.clone(),
            serde_json::json!({
                "from": request.from.clone(),
                "to": request.to.clone(),
                "amount": request.amount,
            }),
        );
        self.pipeline
            .execute(&mut ctx, || self.with_deadline(self.do_transfer(actor, request)))
            .await
    }

    async fn do_transfer(&self, actor: &Actor, request: TransferRequest) -> Result<TransactionRecord, ClearingError> {
        let mut tx = self.storage.begin().await?;
        let outcome = match self.transfer_in_tx(&mut *tx, actor, &request).await {
            Ok(outcome) => {
                tx.commit().await?;
                outcome
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        if !outcome.replayed {
            self.emit_transfer_completed(&outcome.record);
        }
        Ok(outcome.record)
    }

    pub(crate) fn emit_transfer_completed(&self, record: &TransactionRecord) {
        tracing::info!(
            transaction_id = %record.transaction_id,
            from = %record.from,
            to = %record.to,
            amount = %record.amount,
            "Transfer completed"
        );
        self.events.emit(DomainEvent::new(
            kinds::TRANSFER_COMPLETED,
            serde_json::json!({
                "transaction_id": record.transaction_id,
                "from": record.from,
                "to": record.to,
                "amount": record.amount,
                "fee": record.fee,
            }),
        ));
    }

    /// The transfer algorithm, inside the caller's transaction. The batch
    /// executor drives this directly for all-or-nothing batches.
    pub(crate) async fn transfer_in_tx(
        &self,
        tx: &mut dyn StorageTx,
        actor: &Actor,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, ClearingError> {
        authorize(actor, AuthAction::Transfer)?;

        if !request.amount.is_positive() {
            return Err(ClearingError::InvalidAmount {
                reason: "transfer amount must be positive".into(),
            });
        }
        if request.from == request.to {
            return Err(ClearingError::SelfTransfer);
        }

        let tx_type = request.effective_type();

        // Replay check first: a hit returns the stored transaction verbatim.
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = tx.get_idempotency(key).await? {
                let expected = fingerprint(
                    &request.from,
                    &request.to,
                    request.amount,
                    &tx_type,
                    request.memo.as_deref(),
                );
                if existing.fingerprint != expected {
                    return Err(ClearingError::IdempotencyConflict { key: key.clone() });
                }
                let stored = tx
                    .get_transaction(&existing.transaction_id)
                    .await?
                    .ok_or_else(|| ClearingError::TransactionNotFound {
                        id: existing.transaction_id.clone(),
                    })?;
                return Ok(TransferOutcome {
                    record: stored,
                    replayed: true,
                });
            }
        }

        let fee = request
            .fee
            .unwrap_or_else(|| (self.fee_calculator)(request.amount, &tx_type));
        if fee.is_negative() {
            return Err(ClearingError::InvalidAmount {
                reason: "fee must not be negative".into(),
            });
        }

        // Lock every touched account in ascending id order.
        let mut lock_ids = vec![request.from.clone(), request.to.clone()];
        let sink = self.config.fee_sink.clone().filter(|sink| {
            fee.is_positive() && sink != &request.from && sink != &request.to
        });
        if let Some(sink) = &sink {
            lock_ids.push(sink.clone());
        }
        lock_ids.sort();

        let mut locked: HashMap<String, Account> = HashMap::new();
        for id in &lock_ids {
            let account = tx
                .lock_account(id)
                .await?
                .ok_or_else(|| ClearingError::AccountNotFound { id: id.clone() })?;
            locked.insert(id.clone(), account);
        }

        let sender = &locked[&request.from];
        let receiver = &locked[&request.to];

        if !sender.can_initiate() {
            return Err(ClearingError::AccountInactive {
                account_id: sender.account_id.clone(),
            });
        }
        if !receiver.is_active() {
            return Err(ClearingError::AccountInactive {
                account_id: receiver.account_id.clone(),
            });
        }
        ensure_account_scope(actor, sender)?;

        // Limit checks before any balance math.
        if let Some(max) = sender.limits.max_transfer_amount {
            if request.amount > max {
                return Err(ClearingError::LimitExceeded {
                    account_id: sender.account_id.clone(),
                    limit: format!("max transfer amount {max}"),
                });
            }
        }
        if let Some(daily) = sender.limits.daily_transfer_limit {
            let day_start = start_of_utc_day(Utc::now());
            let spent = tx.sum_outgoing_since(&request.from, day_start).await?;
            let projected = spent
                .checked_add(request.amount)
                .ok_or_else(|| ClearingError::validation("volume overflow"))?;
            if projected > daily {
                return Err(ClearingError::LimitExceeded {
                    account_id: sender.account_id.clone(),
                    limit: format!("daily transfer limit {daily}"),
                });
            }
        }

        let total = request
            .amount
            .checked_add(fee)
            .ok_or_else(|| ClearingError::validation("amount overflow"))?;
        if sender.balance < total {
            return Err(ClearingError::InsufficientFunds {
                account_id: sender.account_id.clone(),
                requested: total.to_string(),
                available: sender.balance.to_string(),
            });
        }
        let after = sender
            .balance
            .checked_sub(total)
            .ok_or_else(|| ClearingError::validation("balance overflow"))?;
        if after < sender.limits.min_balance {
            return Err(ClearingError::LimitExceeded {
                account_id: sender.account_id.clone(),
                limit: format!("minimum balance {}", sender.limits.min_balance),
            });
        }

        // Pending record, then apply, then complete.
        let mut record = TransactionRecord::pending(&request.from, &request.to, request.amount, &tx_type);
        record.fee = fee;
        record.initiated_by = Some(actor.id.clone());
        record.batch_id = request.batch_id.clone();
        record.idempotency_key = request.idempotency_key.clone();
        if let Some(memo) = &request.memo {
            record.meta = serde_json::json!({ "memo": memo });
        }
        tx.insert_transaction(&record).await?;

        let sender_after = tx.update_balance(&request.from, total.neg()).await?;
        let receiver_after = tx.update_balance(&request.to, request.amount).await?;
        if let Some(sink) = &sink {
            tx.update_balance(sink, fee).await?;
        }

        record.complete();
        tx.update_transaction(&record).await?;

        if let Some(key) = &request.idempotency_key {
            let fp = fingerprint(&request.from, &request.to, request.amount, &tx_type, request.memo.as_deref());
            tx.put_idempotency(&IdempotencyRecord::new(key, &record.transaction_id, fp))
                .await?;
        }

        self.audit(
            tx,
            AuditLogEntry::new(AuditAction::BalanceDebit, "account", &request.from)
                .by(&actor.id)
                .with_meta(serde_json::json!({
                    "amount": total,
                    "balance_after": sender_after,
                    "transaction_id": record.transaction_id,
                })),
        )
        .await?;
        self.audit(
            tx,
            AuditLogEntry::new(AuditAction::BalanceCredit, "account", &request.to)
                .by(&actor.id)
                .with_meta(serde_json::json!({
                    "amount": request.amount,
                    "balance_after": receiver_after,
                    "transaction_id": record.transaction_id,
                })),
        )
        .await?;
        self.audit(
            tx,
            AuditLogEntry::new(AuditAction::TransferCompleted, "transaction", &record.transaction_id)
                .by(&actor.id),
        )
        .await?;

        Ok(TransferOutcome {
            record,
            replayed: false,
        })
    }

    /// Compensate a completed transfer with a reversing transaction. The
    /// original is marked reversed; the new record links back to it.
    pub async fn reverse_transfer(
        &self,
        actor: &Actor,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> Result<TransactionRecord, ClearingError> {
        authorize(actor, AuthAction::BalanceAdjust)?;

        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut original = tx
                .get_transaction(transaction_id)
                .await?
                .ok_or_else(|| ClearingError::TransactionNotFound {
                    id: transaction_id.to_string(),
                })?;

            if !original.status.can_transition(TransactionStatus::Reversed) {
                return Err(ClearingError::InvalidStatus {
                    from: original.status.to_string(),
                    to: TransactionStatus::Reversed.to_string(),
                });
            }

            // The fee travels back the way it came: to the sender, out
            // of the sink when one is configured, minted back otherwise.
            let fee = original.fee;
            let sink = self.config.fee_sink.clone().filter(|sink| {
                fee.is_positive() && sink != &original.from && sink != &original.to
            });

            let mut lock_ids = vec![original.from.clone(), original.to.clone()];
            if let Some(sink) = &sink {
                lock_ids.push(sink.clone());
            }
            lock_ids.sort();
            for id in &lock_ids {
                tx.lock_account(id)
                    .await?
                    .ok_or_else(|| ClearingError::AccountNotFound { id: id.clone() })?;
            }

            let total = original
                .amount
                .checked_add(fee)
                .ok_or_else(|| ClearingError::validation("amount overflow"))?;
            tx.update_balance(&original.to, original.amount.neg()).await?;
            tx.update_balance(&original.from, total).await?;
            if let Some(sink) = &sink {
                tx.update_balance(sink, fee.neg()).await?;
            }

            let mut reversal = TransactionRecord::pending(&original.to, &original.from, original.amount, "REVERSAL");
            reversal.initiated_by = Some(actor.id.clone());
            reversal.meta = serde_json::json!({
                "reverses": original.transaction_id,
                "reversed_fee": fee,
                "reason": reason,
            });
            reversal.complete();
            tx.insert_transaction(&reversal).await?;

            original.status = TransactionStatus::Reversed;
            tx.update_transaction(&original).await?;

            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::TransferCompleted, "transaction", &reversal.transaction_id)
                    .by(&actor.id)
                    .with_meta(serde_json::json!({ "reverses": original.transaction_id })),
            )
            .await?;
            Ok(reversal)
        }
        .await;

        match result {
            Ok(reversal) => {
                tx.commit().await?;
                Ok(reversal)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Queries ──

    pub async fn list_transactions(
        &self,
        actor: &Actor,
        mut filter: TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, ClearingError> {
        authorize(actor, AuthAction::Read)?;
        if self_scoped(actor) {
            filter.account = Some(actor.id.clone());
        }
        self.storage.list_transactions(&filter).await
    }

    pub async fn statistics(&self, actor: &Actor) -> Result<crate::storage::LedgerStatistics, ClearingError> {
        authorize(actor, AuthAction::Read)?;
        self.storage.statistics().await
    }
}

fn merge_change(
    changes: &mut serde_json::Map<String, serde_json::Value>,
    field: &str,
    before: serde_json::Value,
    after: serde_json::Value,
) {
    if let serde_json::Value::Object(map) = field_change(field, before, after) {
        changes.extend(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn admin() -> Actor {
        Actor::system()
    }

    async fn setup() -> Ledger {
        let storage = Arc::new(MemoryStorage::new());
        Ledger::new(storage, Arc::new(EventBus::new()), ClearingConfig::default())
    }

    async fn funded_account(ledger: &Ledger, balance: i64) -> Account {
        ledger
            .create_account(
                &admin(),
                CreateAccountRequest {
                    initial_balance: Some(Amount::from_units(balance)),
                    roles: vec![Role::Consumer],
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transfer_moves_value() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 1000).await;
        let b = funded_account(&ledger, 0).await;

        let record = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(250)))
            .await
            .unwrap();

        assert_eq!(record.status, TransactionStatus::Completed);
        assert!(record.completed_at.is_some());

        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(750));
        assert_eq!(b.balance, Amount::from_units(250));

        let transfers = ledger
            .list_transactions(
                &admin(),
                TransactionFilter {
                    tx_type: Some("TRANSFER".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(transfers.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 10).await;
        let b = funded_account(&ledger, 0).await;

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::InsufficientFunds { .. }));

        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(10));
        assert!(b.balance.is_zero());

        let transfers = ledger
            .list_transactions(
                &admin(),
                TransactionFilter {
                    tx_type: Some("TRANSFER".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_stored_transaction() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 1000).await;
        let b = funded_account(&ledger, 0).await;

        let request = TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(50))
            .with_idempotency_key("k1");

        let first = ledger.transfer(&admin(), request.clone()).await.unwrap();
        let second = ledger.transfer(&admin(), request).await.unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);

        // Only one debit applied.
        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(950));
    }

    #[tokio::test]
    async fn test_idempotency_conflict_on_changed_body() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 1000).await;
        let b = funded_account(&ledger, 0).await;

        ledger
            .transfer(
                &admin(),
                TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(50)).with_idempotency_key("k1"),
            )
            .await
            .unwrap();

        let err = ledger
            .transfer(
                &admin(),
                TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(51)).with_idempotency_key("k1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::IdempotencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_self_transfer_rejected() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 100).await;

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &a.account_id, Amount::from_units(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::SelfTransfer));
    }

    #[tokio::test]
    async fn test_inactive_sender_rejected() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        ledger
            .update_account(
                &admin(),
                &a.account_id,
                UpdateAccountRequest {
                    status: Some(AccountStatus::Frozen),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::AccountInactive { .. }));
    }

    #[tokio::test]
    async fn test_max_transfer_limit() {
        let ledger = setup().await;
        let a = ledger
            .create_account(
                &admin(),
                CreateAccountRequest {
                    initial_balance: Some(Amount::from_units(1000)),
                    limits: Some(AccountLimits {
                        max_transfer_amount: Some(Amount::from_units(100)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let b = funded_account(&ledger, 0).await;

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(101)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::LimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_daily_limit_counts_prior_transfers() {
        let ledger = setup().await;
        let a = ledger
            .create_account(
                &admin(),
                CreateAccountRequest {
                    initial_balance: Some(Amount::from_units(1000)),
                    limits: Some(AccountLimits {
                        daily_transfer_limit: Some(Amount::from_units(100)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let b = funded_account(&ledger, 0).await;

        ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(60)))
            .await
            .unwrap();

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(41)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::LimitExceeded { .. }));

        // Exactly at the limit still passes.
        ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(40)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_min_balance_floor() {
        let ledger = setup().await;
        let a = ledger
            .create_account(
                &admin(),
                CreateAccountRequest {
                    initial_balance: Some(Amount::from_units(100)),
                    limits: Some(AccountLimits {
                        min_balance: Amount::from_units(20),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let b = funded_account(&ledger, 0).await;

        let err = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(90)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::LimitExceeded { .. }));

        ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(80)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fee_burned_by_default() {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = Ledger::new(storage, Arc::new(EventBus::new()), ClearingConfig::default())
            .with_fee_calculator(Arc::new(|_, _| Amount::from_units(5)));

        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let record = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(50)))
            .await
            .unwrap();
        assert_eq!(record.fee, Amount::from_units(5));

        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(45));
        assert_eq!(b.balance, Amount::from_units(50));
    }

    #[tokio::test]
    async fn test_fee_credited_to_sink() {
        let storage = Arc::new(MemoryStorage::new());
        let bootstrap = Ledger::new(storage.clone(), Arc::new(EventBus::new()), ClearingConfig::default());
        let sink = funded_account(&bootstrap, 0).await;

        let config = ClearingConfig {
            fee_sink: Some(sink.account_id.clone()),
            ..Default::default()
        };
        let ledger = Ledger::new(storage, Arc::new(EventBus::new()), config)
            .with_fee_calculator(Arc::new(|_, _| Amount::from_units(5)));

        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(50)))
            .await
            .unwrap();

        let sink = ledger.get_account(&admin(), &sink.account_id).await.unwrap();
        assert_eq!(sink.balance, Amount::from_units(5));
    }

    #[tokio::test]
    async fn test_credit_and_debit_produce_statement_entries() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 0).await;

        ledger
            .credit(&admin(), &a.account_id, Amount::from_units(100), Some("grant"))
            .await
            .unwrap();
        ledger
            .debit(&admin(), &a.account_id, Amount::from_units(30), Some("penalty"))
            .await
            .unwrap();

        let account = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        assert_eq!(account.balance, Amount::from_units(70));

        let ops = ledger.storage().list_balance_operations(&a.account_id).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].balance_after, Amount::from_units(70));

        let statement = ledger
            .list_transactions(
                &admin(),
                TransactionFilter {
                    account: Some(a.account_id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(statement.len(), 2);
    }

    #[tokio::test]
    async fn test_debit_respects_floor() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 20).await;

        let err = ledger
            .debit(&admin(), &a.account_id, Amount::from_units(21), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_authorization_table() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let auditor = Actor::new("aud-1", vec![Role::Auditor]);
        let operator = Actor::new("op-1", vec![Role::Operator]);

        // Auditor reads but may not mutate.
        assert!(ledger.get_account(&auditor, &a.account_id).await.is_ok());
        let err = ledger
            .transfer(&auditor, TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::Forbidden { .. }));

        // Operator may do everything except delete.
        assert!(ledger
            .credit(&operator, &a.account_id, Amount::from_units(1), None)
            .await
            .is_ok());
        let err = ledger.delete_account(&operator, &b.account_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::Forbidden { .. }));

        // Consumer operates only on their own account.
        let stranger = Actor::new("bot_nobody", vec![Role::Consumer]);
        let err = ledger
            .transfer(&stranger, TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::Forbidden { .. }));

        let owner = Actor::new(a.account_id.clone(), vec![Role::Consumer]);
        assert!(ledger
            .transfer(&owner, TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(1)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_requires_drained_balance() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 10).await;

        let err = ledger.delete_account(&admin(), &a.account_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::Validation { .. }));

        ledger.debit(&admin(), &a.account_id, Amount::from_units(10), None).await.unwrap();
        ledger.delete_account(&admin(), &a.account_id).await.unwrap();

        let err = ledger.get_account(&admin(), &a.account_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::AccountNotFound { .. }));
    }

    #[tokio::test]
    async fn test_regenerate_api_key() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 0).await;
        let old_key = a.api_key.clone();

        let updated = ledger.regenerate_api_key(&admin(), &a.account_id).await.unwrap();
        assert_ne!(updated.api_key, old_key);
        assert!(crate::types::is_valid_api_key(&updated.api_key));

        // Old key no longer resolves.
        assert!(ledger.get_account_by_api_key(&old_key).await.is_err());
        let by_key = ledger.get_account_by_api_key(&updated.api_key).await.unwrap();
        assert_eq!(by_key.account_id, a.account_id);
    }

    #[tokio::test]
    async fn test_reverse_transfer() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let original = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(40)))
            .await
            .unwrap();

        let reversal = ledger
            .reverse_transfer(&admin(), &original.transaction_id, Some("disputed"))
            .await
            .unwrap();

        assert_eq!(reversal.meta["reverses"], original.transaction_id);
        let original = ledger
            .storage()
            .get_transaction(&original.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);

        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(100));
        assert!(b.balance.is_zero());
    }

    #[tokio::test]
    async fn test_reverse_transfer_returns_fee_from_sink() {
        let storage = Arc::new(MemoryStorage::new());
        let bootstrap = Ledger::new(storage.clone(), Arc::new(EventBus::new()), ClearingConfig::default());
        let sink = funded_account(&bootstrap, 0).await;

        let config = ClearingConfig {
            fee_sink: Some(sink.account_id.clone()),
            ..Default::default()
        };
        let ledger = Ledger::new(storage, Arc::new(EventBus::new()), config)
            .with_fee_calculator(Arc::new(|_, _| Amount::from_units(5)));

        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let original = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(40)))
            .await
            .unwrap();
        assert_eq!(original.fee, Amount::from_units(5));

        let sink_before = ledger.get_account(&admin(), &sink.account_id).await.unwrap();
        assert_eq!(sink_before.balance, Amount::from_units(5));

        ledger
            .reverse_transfer(&admin(), &original.transaction_id, Some("disputed"))
            .await
            .unwrap();

        // Sender is made whole, fee included; the sink gives it back.
        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        let sink = ledger.get_account(&admin(), &sink.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(100));
        assert!(b.balance.is_zero());
        assert!(sink.balance.is_zero());
    }

    #[tokio::test]
    async fn test_reverse_transfer_restores_burned_fee() {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = Ledger::new(storage, Arc::new(EventBus::new()), ClearingConfig::default())
            .with_fee_calculator(Arc::new(|_, _| Amount::from_units(5)));

        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let original = ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(40)))
            .await
            .unwrap();

        let a_after = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        assert_eq!(a_after.balance, Amount::from_units(55));

        ledger
            .reverse_transfer(&admin(), &original.transaction_id, None)
            .await
            .unwrap();

        let a = ledger.get_account(&admin(), &a.account_id).await.unwrap();
        let b = ledger.get_account(&admin(), &b.account_id).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(100));
        assert!(b.balance.is_zero());
    }

    #[tokio::test]
    async fn test_audit_written_with_mutations() {
        let ledger = setup().await;
        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        ledger
            .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(10)))
            .await
            .unwrap();

        let entries = ledger
            .storage()
            .query_audit(&crate::audit::AuditFilter {
                action: Some(AuditAction::TransferCompleted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_conservation_across_operations() {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = Ledger::new(storage, Arc::new(EventBus::new()), ClearingConfig::default())
            .with_fee_calculator(Arc::new(|_, _| Amount::from_units(2)));

        let a = funded_account(&ledger, 0).await;
        let b = funded_account(&ledger, 0).await;

        // External deposits and withdrawals.
        ledger.credit(&admin(), &a.account_id, Amount::from_units(500), None).await.unwrap();
        ledger.credit(&admin(), &b.account_id, Amount::from_units(100), None).await.unwrap();
        ledger.debit(&admin(), &b.account_id, Amount::from_units(40), None).await.unwrap();
        let deposits = Amount::from_units(600);
        let withdrawals = Amount::from_units(40);

        // Internal movement burns its fees.
        for _ in 0..3 {
            ledger
                .transfer(&admin(), TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(50)))
                .await
                .unwrap();
        }

        let stats = ledger.statistics(&admin()).await.unwrap();
        let held = stats
            .total_balance
            .checked_add(stats.total_frozen)
            .unwrap()
            .checked_add(stats.total_fees)
            .unwrap();
        assert_eq!(held, deposits.checked_sub(withdrawals).unwrap());
        assert_eq!(stats.total_fees, Amount::from_units(6));
    }

    #[tokio::test]
    async fn test_transfer_completed_event_fires_once() {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventBus::new());
        let ledger = Ledger::new(storage, events.clone(), ClearingConfig::default());

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        events.subscribe(kinds::TRANSFER_COMPLETED, move |_| {
            seen_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let a = funded_account(&ledger, 100).await;
        let b = funded_account(&ledger, 0).await;

        let request = TransferRequest::new(&a.account_id, &b.account_id, Amount::from_units(5))
            .with_idempotency_key("evt-1");
        ledger.transfer(&admin(), request.clone()).await.unwrap();
        ledger.transfer(&admin(), request).await.unwrap();

        // Replay does not re-emit.
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
