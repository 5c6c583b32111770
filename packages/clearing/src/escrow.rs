//! Escrow Engine
//!
//! Held value stays owned by the sender, earmarked for the receiver.
//! While pending, the amount lives in the sender's frozen balance and
//! never in the spendable balance. Exactly one terminal transition per
//! escrow; a background sweeper expires overdue holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::audit::{AuditAction, AuditLogEntry};
use crate::config::ClearingConfig;
use crate::error::ClearingError;
use crate::events::{kinds, DomainEvent, EventBus};
use crate::ledger::{authorize, ensure_account_scope, AuthAction, TransactionRecord};
use crate::storage::{Storage, StorageTx};
use crate::types::{new_escrow_id, Actor, Amount, Role};

/// Escrow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EscrowStatus {
    Pending,
    Released,
    Refunded,
    Expired,
    Disputed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "PENDING",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
            EscrowStatus::Expired => "EXPIRED",
            EscrowStatus::Disputed => "DISPUTED",
        }
    }

    pub fn parse(s: &str) -> Option<EscrowStatus> {
        match s {
            "PENDING" => Some(EscrowStatus::Pending),
            "RELEASED" => Some(EscrowStatus::Released),
            "REFUNDED" => Some(EscrowStatus::Refunded),
            "EXPIRED" => Some(EscrowStatus::Expired),
            "DISPUTED" => Some(EscrowStatus::Disputed),
            _ => None,
        }
    }

    /// Transition table. Disputed holds stay frozen until an admin
    /// settles them one way or the other.
    pub fn can_transition(self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (EscrowStatus::Pending, EscrowStatus::Released)
                | (EscrowStatus::Pending, EscrowStatus::Refunded)
                | (EscrowStatus::Pending, EscrowStatus::Expired)
                | (EscrowStatus::Pending, EscrowStatus::Disputed)
                | (EscrowStatus::Disputed, EscrowStatus::Released)
                | (EscrowStatus::Disputed, EscrowStatus::Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Expired)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conditional hold of sender funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub escrow_id: String,
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub status: EscrowStatus,
    /// Opaque release condition; empty means the automated policy path
    /// may release.
    pub condition: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Settling transaction, set on release.
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Escrow {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: Amount) -> Self {
        Self {
            escrow_id: new_escrow_id(),
            from: from.into(),
            to: to.into(),
            amount,
            status: EscrowStatus::Pending,
            condition: None,
            expires_at: None,
            transaction_id: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Handle for the background expiry sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper. Cancellation is synchronous; the task observes
    /// it at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        self.shutdown();
        let _ = self.task.await;
    }
}

/// The escrow engine.
pub struct EscrowEngine {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    config: ClearingConfig,
}

impl EscrowEngine {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<EventBus>, config: ClearingConfig) -> Self {
        Self { storage, events, config }
    }

    async fn audit(&self, tx: &mut dyn StorageTx, entry: AuditLogEntry) -> Result<(), ClearingError> {
        if self.config.enable_audit_log {
            tx.append_audit(&entry).await?;
        }
        Ok(())
    }

    /// Hold `amount` of the sender's funds for the receiver.
    pub async fn create(
        &self,
        actor: &Actor,
        from: &str,
        to: &str,
        amount: Amount,
        condition: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Escrow, ClearingError> {
        authorize(actor, AuthAction::Transfer)?;
        if !amount.is_positive() {
            return Err(ClearingError::InvalidAmount {
                reason: "escrow amount must be positive".into(),
            });
        }
        if from == to {
            return Err(ClearingError::SelfTransfer);
        }

        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut lock_ids = vec![from.to_string(), to.to_string()];
            lock_ids.sort();
            let mut sender = None;
            for id in &lock_ids {
                let account = tx
                    .lock_account(id)
                    .await?
                    .ok_or_else(|| ClearingError::AccountNotFound { id: id.clone() })?;
                if id == from {
                    sender = Some(account);
                }
            }
            let sender = sender.ok_or_else(|| ClearingError::AccountNotFound { id: from.to_string() })?;

            if !sender.can_initiate() {
                return Err(ClearingError::AccountInactive {
                    account_id: from.to_string(),
                });
            }
            ensure_account_scope(actor, &sender)?;
            if sender.balance < amount {
                return Err(ClearingError::InsufficientFunds {
                    account_id: from.to_string(),
                    requested: amount.to_string(),
                    available: sender.balance.to_string(),
                });
            }

            tx.freeze_balance(from, amount).await?;

            let mut escrow = Escrow::new(from, to, amount);
            escrow.condition = condition;
            escrow.expires_at = expires_at;
            tx.insert_escrow(&escrow).await?;

            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::EscrowCreated, "escrow", &escrow.escrow_id)
                    .by(&actor.id)
                    .with_meta(serde_json::json!({ "from": from, "to": to, "amount": amount })),
            )
            .await?;
            Ok(escrow)
        }
        .await;

        match result {
            Ok(escrow) => {
                tx.commit().await?;
                tracing::info!(escrow_id = %escrow.escrow_id, from = %from, amount = %amount, "Escrow created");
                self.events.emit(DomainEvent::new(
                    kinds::ESCROW_CREATED,
                    serde_json::json!({ "escrow_id": escrow.escrow_id }),
                ));
                Ok(escrow)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    fn may_release(&self, actor: &Actor, escrow: &Escrow) -> bool {
        if actor.id == escrow.from || actor.has_role(Role::Admin) {
            return true;
        }
        // Unconditional holds may be settled by the automated policy path.
        let unconditional = escrow.condition.as_deref().map(str::is_empty).unwrap_or(true);
        unconditional && actor.has_role(Role::Operator)
    }

    /// Settle the hold to the receiver.
    pub async fn release(&self, actor: &Actor, escrow_id: &str) -> Result<Escrow, ClearingError> {
        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut escrow = tx
                .lock_escrow(escrow_id)
                .await?
                .ok_or_else(|| ClearingError::EscrowNotFound { id: escrow_id.to_string() })?;

            if !escrow.status.can_transition(EscrowStatus::Released) {
                return Err(ClearingError::InvalidStatus {
                    from: escrow.status.to_string(),
                    to: EscrowStatus::Released.to_string(),
                });
            }
            if escrow.status == EscrowStatus::Disputed && !actor.has_role(Role::Admin) {
                return Err(ClearingError::Forbidden {
                    actor_id: actor.id.clone(),
                    action: "release disputed escrow".into(),
                });
            }
            if !self.may_release(actor, &escrow) {
                return Err(ClearingError::Forbidden {
                    actor_id: actor.id.clone(),
                    action: format!("release escrow {escrow_id}"),
                });
            }

            let mut lock_ids = vec![escrow.from.clone(), escrow.to.clone()];
            lock_ids.sort();
            for id in &lock_ids {
                tx.lock_account(id)
                    .await?
                    .ok_or_else(|| ClearingError::AccountNotFound { id: id.clone() })?;
            }

            // Move the hold out of the sender, then across to the receiver.
            tx.unfreeze_balance(&escrow.from, escrow.amount).await?;
            tx.update_balance(&escrow.from, escrow.amount.neg()).await?;
            tx.update_balance(&escrow.to, escrow.amount).await?;

            let mut settlement =
                TransactionRecord::pending(&escrow.from, &escrow.to, escrow.amount, "ESCROW_RELEASE");
            settlement.initiated_by = Some(actor.id.clone());
            settlement.escrow_id = Some(escrow.escrow_id.clone());
            settlement.complete();
            tx.insert_transaction(&settlement).await?;

            escrow.status = EscrowStatus::Released;
            escrow.transaction_id = Some(settlement.transaction_id.clone());
            escrow.resolved_at = Some(Utc::now());
            tx.update_escrow(&escrow).await?;

            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::EscrowReleased, "escrow", escrow_id)
                    .by(&actor.id)
                    .with_meta(serde_json::json!({ "transaction_id": settlement.transaction_id })),
            )
            .await?;
            Ok(escrow)
        }
        .await;

        match result {
            Ok(escrow) => {
                tx.commit().await?;
                tracing::info!(escrow_id = %escrow_id, "Escrow released");
                self.events.emit(DomainEvent::new(
                    kinds::ESCROW_RELEASED,
                    serde_json::json!({ "escrow_id": escrow_id }),
                ));
                Ok(escrow)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Return the hold to the sender. No settling transaction is
    /// written; the audit entry is the trace.
    pub async fn refund(&self, actor: &Actor, escrow_id: &str) -> Result<Escrow, ClearingError> {
        self.restore(actor, escrow_id, EscrowStatus::Refunded).await
    }

    async fn restore(&self, actor: &Actor, escrow_id: &str, to_status: EscrowStatus) -> Result<Escrow, ClearingError> {
        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut escrow = tx
                .lock_escrow(escrow_id)
                .await?
                .ok_or_else(|| ClearingError::EscrowNotFound { id: escrow_id.to_string() })?;

            if !escrow.status.can_transition(to_status) {
                return Err(ClearingError::InvalidStatus {
                    from: escrow.status.to_string(),
                    to: to_status.to_string(),
                });
            }
            if escrow.status == EscrowStatus::Disputed && !actor.has_role(Role::Admin) {
                return Err(ClearingError::Forbidden {
                    actor_id: actor.id.clone(),
                    action: "refund disputed escrow".into(),
                });
            }
            let authorized = actor.id == escrow.from
                || actor.has_role(Role::Admin)
                || actor.has_role(Role::Operator);
            if !authorized {
                return Err(ClearingError::Forbidden {
                    actor_id: actor.id.clone(),
                    action: format!("refund escrow {escrow_id}"),
                });
            }

            tx.lock_account(&escrow.from)
                .await?
                .ok_or_else(|| ClearingError::AccountNotFound { id: escrow.from.clone() })?;
            tx.unfreeze_balance(&escrow.from, escrow.amount).await?;

            escrow.status = to_status;
            escrow.resolved_at = Some(Utc::now());
            tx.update_escrow(&escrow).await?;

            let action = match to_status {
                EscrowStatus::Expired => AuditAction::EscrowExpired,
                _ => AuditAction::EscrowRefunded,
            };
            self.audit(&mut *tx, AuditLogEntry::new(action, "escrow", escrow_id).by(&actor.id))
                .await?;
            Ok(escrow)
        }
        .await;

        match result {
            Ok(escrow) => {
                tx.commit().await?;
                let kind = match to_status {
                    EscrowStatus::Expired => kinds::ESCROW_EXPIRED,
                    _ => kinds::ESCROW_REFUNDED,
                };
                self.events
                    .emit(DomainEvent::new(kind, serde_json::json!({ "escrow_id": escrow_id })));
                Ok(escrow)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Flag a pending hold as disputed. Funds stay frozen until an
    /// admin releases or refunds.
    pub async fn dispute(&self, actor: &Actor, escrow_id: &str, reason: &str) -> Result<Escrow, ClearingError> {
        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut escrow = tx
                .lock_escrow(escrow_id)
                .await?
                .ok_or_else(|| ClearingError::EscrowNotFound { id: escrow_id.to_string() })?;

            if !escrow.status.can_transition(EscrowStatus::Disputed) {
                return Err(ClearingError::InvalidStatus {
                    from: escrow.status.to_string(),
                    to: EscrowStatus::Disputed.to_string(),
                });
            }
            let party = actor.id == escrow.from || actor.id == escrow.to;
            if !party && !actor.has_role(Role::Admin) {
                return Err(ClearingError::Forbidden {
                    actor_id: actor.id.clone(),
                    action: format!("dispute escrow {escrow_id}"),
                });
            }

            escrow.status = EscrowStatus::Disputed;
            tx.update_escrow(&escrow).await?;

            self.audit(
                &mut *tx,
                AuditLogEntry::new(AuditAction::EscrowDisputed, "escrow", escrow_id)
                    .by(&actor.id)
                    .with_meta(serde_json::json!({ "reason": reason })),
            )
            .await?;
            Ok(escrow)
        }
        .await;

        match result {
            Ok(escrow) => {
                tx.commit().await?;
                self.events.emit(DomainEvent::new(
                    kinds::ESCROW_DISPUTED,
                    serde_json::json!({ "escrow_id": escrow_id }),
                ));
                Ok(escrow)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Expire every pending escrow whose deadline has passed. Returns
    /// the number of escrows expired. Safe to run concurrently with
    /// release/refund; due rows are locked per escrow.
    pub async fn expire_due(&self) -> Result<usize, ClearingError> {
        let now = Utc::now();
        let system = Actor::system();

        let mut tx = self.storage.begin().await?;
        let result = async {
            let due = tx.list_due_escrows(now).await?;
            let mut expired = Vec::with_capacity(due.len());

            for mut escrow in due {
                tx.lock_account(&escrow.from)
                    .await?
                    .ok_or_else(|| ClearingError::AccountNotFound { id: escrow.from.clone() })?;
                tx.unfreeze_balance(&escrow.from, escrow.amount).await?;

                escrow.status = EscrowStatus::Expired;
                escrow.resolved_at = Some(now);
                tx.update_escrow(&escrow).await?;

                self.audit(
                    &mut *tx,
                    AuditLogEntry::new(AuditAction::EscrowExpired, "escrow", &escrow.escrow_id).by(&system.id),
                )
                .await?;
                expired.push(escrow.escrow_id.clone());
            }
            Ok(expired)
        }
        .await;

        match result {
            Ok(expired) => {
                tx.commit().await?;
                for escrow_id in &expired {
                    self.events
                        .emit(DomainEvent::new(kinds::ESCROW_EXPIRED, serde_json::json!({ "escrow_id": escrow_id })));
                }
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "Expired overdue escrows");
                }
                Ok(expired.len())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Spawn the expiry sweeper on its own interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let engine = self.clone();
        let (shutdown, mut watcher) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = watcher.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.expire_due().await {
                            tracing::warn!(error = %e, "Escrow sweep failed");
                        }
                    }
                }
            }
        });

        SweeperHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClearingConfig;
    use crate::ledger::{CreateAccountRequest, Ledger};
    use crate::storage::{EscrowFilter, MemoryStorage};

    fn admin() -> Actor {
        Actor::system()
    }

    async fn setup() -> (Ledger, Arc<EscrowEngine>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventBus::new());
        let config = ClearingConfig::default();
        let ledger = Ledger::new(storage.clone(), events.clone(), config.clone());
        let engine = Arc::new(EscrowEngine::new(storage, events, config));
        (ledger, engine)
    }

    async fn funded(ledger: &Ledger, balance: i64) -> String {
        ledger
            .create_account(
                &admin(),
                CreateAccountRequest {
                    initial_balance: Some(Amount::from_units(balance)),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .account_id
    }

    #[tokio::test]
    async fn test_create_freezes_funds() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(200), None, None).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Pending);

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        let receiver = ledger.get_account(&admin(), &b).await.unwrap();
        assert_eq!(sender.balance, Amount::from_units(300));
        assert_eq!(sender.frozen_balance, Amount::from_units(200));
        assert!(receiver.balance.is_zero());
    }

    #[tokio::test]
    async fn test_create_requires_cover() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;

        let err = engine
            .create(&admin(), &a, &b, Amount::from_units(101), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_release_settles_to_receiver() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(200), None, None).await.unwrap();
        let released = engine.release(&admin(), &escrow.escrow_id).await.unwrap();

        assert_eq!(released.status, EscrowStatus::Released);
        let settlement_id = released.transaction_id.clone().unwrap();

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        let receiver = ledger.get_account(&admin(), &b).await.unwrap();
        assert_eq!(sender.balance, Amount::from_units(300));
        assert!(sender.frozen_balance.is_zero());
        assert_eq!(receiver.balance, Amount::from_units(200));

        let settlement = ledger.storage().get_transaction(&settlement_id).await.unwrap().unwrap();
        assert_eq!(settlement.tx_type, "ESCROW_RELEASE");
        assert_eq!(settlement.escrow_id.as_deref(), Some(escrow.escrow_id.as_str()));
    }

    #[tokio::test]
    async fn test_refund_restores_sender() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(200), None, None).await.unwrap();
        let refunded = engine.refund(&admin(), &escrow.escrow_id).await.unwrap();

        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert!(refunded.transaction_id.is_none());

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(sender.balance, Amount::from_units(500));
        assert!(sender.frozen_balance.is_zero());
    }

    #[tokio::test]
    async fn test_single_terminal_transition() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(100), None, None).await.unwrap();
        engine.release(&admin(), &escrow.escrow_id).await.unwrap();

        let err = engine.refund(&admin(), &escrow.escrow_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::InvalidStatus { .. }));
        let err = engine.release(&admin(), &escrow.escrow_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::InvalidStatus { .. }));
    }

    #[tokio::test]
    async fn test_expire_due_restores_balance() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let past = Utc::now() - chrono::Duration::seconds(1);
        let escrow = engine
            .create(&admin(), &a, &b, Amount::from_units(150), None, Some(past))
            .await
            .unwrap();

        let expired = engine.expire_due().await.unwrap();
        assert_eq!(expired, 1);

        let escrow = ledger.storage().get_escrow(&escrow.escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Expired);

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(sender.balance, Amount::from_units(500));
        assert!(sender.frozen_balance.is_zero());

        // Second sweep finds nothing.
        assert_eq!(engine.expire_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unexpired_escrow_survives_sweep() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let future = Utc::now() + chrono::Duration::hours(1);
        engine
            .create(&admin(), &a, &b, Amount::from_units(150), None, Some(future))
            .await
            .unwrap();

        assert_eq!(engine.expire_due().await.unwrap(), 0);
        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(sender.frozen_balance, Amount::from_units(150));
    }

    #[tokio::test]
    async fn test_release_authorization() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        // Conditional escrow: the operator path may not release it.
        let escrow = engine
            .create(&admin(), &a, &b, Amount::from_units(100), Some("delivery_confirmed".into()), None)
            .await
            .unwrap();

        let operator = Actor::new("op-1", vec![Role::Operator]);
        let err = engine.release(&operator, &escrow.escrow_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::Forbidden { .. }));

        // The sender may always release.
        let sender = Actor::new(a.clone(), vec![Role::Consumer]);
        engine.release(&sender, &escrow.escrow_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_operator_releases_unconditional() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(100), None, None).await.unwrap();
        let operator = Actor::new("op-1", vec![Role::Operator]);
        engine.release(&operator, &escrow.escrow_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispute_keeps_funds_frozen() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 500).await;
        let b = funded(&ledger, 0).await;

        let escrow = engine.create(&admin(), &a, &b, Amount::from_units(100), None, None).await.unwrap();
        let receiver = Actor::new(b.clone(), vec![Role::Provider]);
        let disputed = engine.dispute(&receiver, &escrow.escrow_id, "not delivered").await.unwrap();
        assert_eq!(disputed.status, EscrowStatus::Disputed);

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(sender.frozen_balance, Amount::from_units(100));

        // Only an admin settles a disputed hold.
        let sender_actor = Actor::new(a.clone(), vec![Role::Consumer]);
        let err = engine.refund(&sender_actor, &escrow.escrow_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::Forbidden { .. }));

        engine.refund(&admin(), &escrow.escrow_id).await.unwrap();
        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert!(sender.frozen_balance.is_zero());
    }

    #[tokio::test]
    async fn test_frozen_balance_matches_pending_escrows() {
        let (ledger, engine) = setup().await;
        let a = funded(&ledger, 1000).await;
        let b = funded(&ledger, 0).await;

        engine.create(&admin(), &a, &b, Amount::from_units(100), None, None).await.unwrap();
        engine.create(&admin(), &a, &b, Amount::from_units(250), None, None).await.unwrap();
        let released = engine.create(&admin(), &a, &b, Amount::from_units(50), None, None).await.unwrap();
        engine.release(&admin(), &released.escrow_id).await.unwrap();

        let pending = ledger
            .storage()
            .list_escrows(&EscrowFilter {
                status: Some(EscrowStatus::Pending),
                party: Some(a.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let pending_total = pending
            .iter()
            .fold(Amount::ZERO, |acc, e| acc.checked_add(e.amount).unwrap());

        let sender = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(sender.frozen_balance, pending_total);
        assert_eq!(sender.frozen_balance, Amount::from_units(350));
    }
}
