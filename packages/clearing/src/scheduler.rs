//! Recurring Payment Scheduler
//!
//! Drives `ScheduledPayment` execution on a dedicated timer task. Not a
//! general-purpose job queue: the only work it performs is invoking the
//! injected `TransferExecutor`, which delegates back to the ledger core.
//! Missed ticks coalesce — a payment that should have fired N times
//! while the process was down fires once, then advances one period.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::ClearingError;
use crate::events::{kinds, DomainEvent, EventBus};
use crate::ledger::{Ledger, TransactionRecord, TransferRequest};
use crate::storage::{Storage, StorageTx};
use crate::types::{new_payment_id, Actor, Amount};

/// Schedule kinds. Calendar fields are interpreted in UTC;
/// `day_of_week` counts from Sunday = 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    OneTime { execute_at: DateTime<Utc> },
    Interval { interval_ms: u64 },
    Daily { hour: u32, minute: u32 },
    Weekly { day_of_week: u32, hour: u32, minute: u32 },
    Monthly { day_of_month: u32, hour: u32, minute: u32 },
}

fn days_in_month(year: i32, month: u32) -> u32 {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.checked_add_months(chrono::Months::new(1)))
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn clock(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn month_occurrence(year: i32, month: u32, day_of_month: u32, time: NaiveTime) -> Option<NaiveDateTime> {
    // Days past the month's length clamp to its last day.
    let day = day_of_month.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(time))
}

impl Schedule {
    /// Validate calendar fields.
    pub fn validate(&self) -> Result<(), ClearingError> {
        let ok = match self {
            Schedule::OneTime { .. } => true,
            Schedule::Interval { interval_ms } => *interval_ms > 0,
            Schedule::Daily { hour, minute } => *hour < 24 && *minute < 60,
            Schedule::Weekly { day_of_week, hour, minute } => {
                *day_of_week < 7 && *hour < 24 && *minute < 60
            }
            Schedule::Monthly { day_of_month, hour, minute } => {
                (1..=31).contains(day_of_month) && *hour < 24 && *minute < 60
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ClearingError::validation("invalid schedule fields"))
        }
    }

    /// First execution time for a payment created at `now`.
    pub fn initial_execution(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::OneTime { execute_at } => *execute_at,
            Schedule::Interval { interval_ms } => now + Duration::milliseconds(*interval_ms as i64),
            _ => self.next_occurrence(now).unwrap_or(now),
        }
    }

    /// Next execution strictly after an execution at `now`; `None` means
    /// the schedule is exhausted.
    pub fn next_after_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::OneTime { .. } => None,
            Schedule::Interval { interval_ms } => Some(now + Duration::milliseconds(*interval_ms as i64)),
            _ => self.next_occurrence(now),
        }
    }

    /// Next calendar occurrence strictly after `now`.
    fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now_naive = now.naive_utc();
        let naive = match self {
            Schedule::Daily { hour, minute } => {
                let mut candidate = now.date_naive().and_time(clock(*hour, *minute));
                if candidate <= now_naive {
                    candidate += Duration::days(1);
                }
                Some(candidate)
            }
            Schedule::Weekly { day_of_week, hour, minute } => {
                let current = now.weekday().num_days_from_sunday();
                let target = day_of_week % 7;
                let days_ahead = (target + 7 - current) % 7;
                let date = now.date_naive() + Duration::days(days_ahead as i64);
                let mut candidate = date.and_time(clock(*hour, *minute));
                if candidate <= now_naive {
                    candidate += Duration::days(7);
                }
                Some(candidate)
            }
            Schedule::Monthly { day_of_month, hour, minute } => {
                let time = clock(*hour, *minute);
                let candidate = month_occurrence(now.year(), now.month(), *day_of_month, time)?;
                if candidate > now_naive {
                    Some(candidate)
                } else {
                    let (year, month) = if now.month() == 12 {
                        (now.year() + 1, 1)
                    } else {
                        (now.year(), now.month() + 1)
                    };
                    month_occurrence(year, month, *day_of_month, time)
                }
            }
            _ => None,
        };
        naive.map(|n| Utc.from_utc_datetime(&n))
    }
}

/// Scheduled payment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Expired,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Active => "ACTIVE",
            PaymentStatus::Paused => "PAUSED",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentStatus> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "ACTIVE" => Some(PaymentStatus::Active),
            "PAUSED" => Some(PaymentStatus::Paused),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "EXPIRED" => Some(PaymentStatus::Expired),
            "FAILED" => Some(PaymentStatus::Failed),
            "CANCELLED" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Expired | PaymentStatus::Failed | PaymentStatus::Cancelled
        )
    }

    /// Transition table.
    pub fn can_transition(self, to: PaymentStatus) -> bool {
        if to == PaymentStatus::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (PaymentStatus::Pending, PaymentStatus::Active)
                | (PaymentStatus::Active, PaymentStatus::Paused)
                | (PaymentStatus::Active, PaymentStatus::Completed)
                | (PaymentStatus::Active, PaymentStatus::Expired)
                | (PaymentStatus::Active, PaymentStatus::Failed)
                | (PaymentStatus::Paused, PaymentStatus::Active)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurring or one-shot transfer template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPayment {
    pub payment_id: String,
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub tx_type: String,
    pub meta: serde_json::Value,
    pub schedule: Schedule,
    pub status: PaymentStatus,
    pub enabled: bool,
    pub execution_count: u32,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub next_execute_at: DateTime<Utc>,
    pub max_executions: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New payment parameters.
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub schedule: Schedule,
    pub tx_type: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub enabled: bool,
    pub max_executions: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreatePaymentRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: Amount, schedule: Schedule) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            schedule,
            tx_type: None,
            meta: None,
            enabled: true,
            max_executions: None,
            expires_at: None,
        }
    }
}

/// Callback that performs the actual transfer for a due payment.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, payment: &ScheduledPayment) -> Result<TransactionRecord, ClearingError>;
}

/// Executor that delegates to the ledger core.
pub struct LedgerExecutor {
    ledger: Arc<Ledger>,
    actor: Actor,
}

impl LedgerExecutor {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            actor: Actor::system(),
        }
    }
}

#[async_trait]
impl TransferExecutor for LedgerExecutor {
    async fn execute(&self, payment: &ScheduledPayment) -> Result<TransactionRecord, ClearingError> {
        let request = TransferRequest::new(&payment.from, &payment.to, payment.amount)
            .with_type(&payment.tx_type)
            .with_memo(format!("scheduled payment {}", payment.payment_id));
        self.ledger.transfer(&self.actor, request).await
    }
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: std::time::Duration,
    /// Consecutive failures before a payment is marked failed.
    pub max_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(60),
            max_failures: 3,
        }
    }
}

/// Handle to the running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop. Cancellation is synchronous; the timer task
    /// observes it at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        self.shutdown();
        let _ = self.task.await;
    }
}

/// The payment scheduler.
pub struct PaymentScheduler {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    executor: Arc<dyn TransferExecutor>,
    config: SchedulerConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl PaymentScheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        events: Arc<EventBus>,
        executor: Arc<dyn TransferExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            events,
            executor,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Register a new payment.
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<ScheduledPayment, ClearingError> {
        request.schedule.validate()?;
        if !request.amount.is_positive() {
            return Err(ClearingError::InvalidAmount {
                reason: "payment amount must be positive".into(),
            });
        }
        if request.from == request.to {
            return Err(ClearingError::SelfTransfer);
        }

        let now = Utc::now();
        let payment = ScheduledPayment {
            payment_id: new_payment_id(),
            from: request.from,
            to: request.to,
            amount: request.amount,
            tx_type: request.tx_type.unwrap_or_else(|| "SUBSCRIPTION".to_string()),
            meta: request.meta.unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            next_execute_at: request.schedule.initial_execution(now),
            schedule: request.schedule,
            status: if request.enabled {
                PaymentStatus::Active
            } else {
                PaymentStatus::Pending
            },
            enabled: request.enabled,
            execution_count: 0,
            failure_count: 0,
            last_error: None,
            max_executions: request.max_executions,
            expires_at: request.expires_at,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.storage.begin().await?;
        tx.insert_scheduled_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(payment_id = %payment.payment_id, "Scheduled payment created");
        Ok(payment)
    }

    async fn transition(&self, id: &str, to: PaymentStatus, enabled: Option<bool>) -> Result<ScheduledPayment, ClearingError> {
        let mut tx = self.storage.begin().await?;
        let result = async {
            let mut payment = tx
                .lock_scheduled_payment(id)
                .await?
                .ok_or_else(|| ClearingError::PaymentNotFound { id: id.to_string() })?;

            if !payment.status.can_transition(to) {
                return Err(ClearingError::InvalidStatus {
                    from: payment.status.to_string(),
                    to: to.to_string(),
                });
            }
            payment.status = to;
            if let Some(enabled) = enabled {
                payment.enabled = enabled;
            }
            payment.updated_at = Utc::now();
            tx.update_scheduled_payment(&payment).await?;
            Ok(payment)
        }
        .await;

        match result {
            Ok(payment) => {
                tx.commit().await?;
                Ok(payment)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Enable a pending or paused payment.
    pub async fn activate(&self, id: &str) -> Result<ScheduledPayment, ClearingError> {
        self.transition(id, PaymentStatus::Active, Some(true)).await
    }

    pub async fn pause(&self, id: &str) -> Result<ScheduledPayment, ClearingError> {
        self.transition(id, PaymentStatus::Paused, Some(false)).await
    }

    pub async fn cancel(&self, id: &str) -> Result<ScheduledPayment, ClearingError> {
        self.transition(id, PaymentStatus::Cancelled, Some(false)).await
    }

    /// One scheduler pass: execute every due payment. Returns how many
    /// executions were attempted.
    pub async fn tick(&self) -> Result<usize, ClearingError> {
        let now = Utc::now();
        let due = self.storage.list_due_payments(now).await?;
        let mut attempted = 0;

        for payment in due {
            attempted += 1;
            if let Err(e) = self.run_payment(&payment.payment_id, now, false).await {
                tracing::warn!(payment_id = %payment.payment_id, error = %e, "Scheduled payment failed");
            }
        }
        Ok(attempted)
    }

    /// Execute one payment out of band.
    pub async fn execute_now(&self, id: &str) -> Result<Option<TransactionRecord>, ClearingError> {
        self.run_payment(id, Utc::now(), true).await
    }

    async fn run_payment(
        &self,
        id: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Option<TransactionRecord>, ClearingError> {
        // At most one execution per payment in flight.
        if !self.in_flight.lock().insert(id.to_string()) {
            return Ok(None);
        }
        let result = self.run_payment_inner(id, now, force).await;
        self.in_flight.lock().remove(id);
        result
    }

    async fn run_payment_inner(
        &self,
        id: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Option<TransactionRecord>, ClearingError> {
        // Claim pass: validate the payment is still due under its row lock.
        let payment = {
            let mut tx = self.storage.begin().await?;
            let payment = tx
                .lock_scheduled_payment(id)
                .await?
                .ok_or_else(|| ClearingError::PaymentNotFound { id: id.to_string() })?;

            if let Some(expires_at) = payment.expires_at {
                if now >= expires_at && payment.status == PaymentStatus::Active {
                    let mut expired = payment;
                    expired.status = PaymentStatus::Expired;
                    expired.updated_at = now;
                    tx.update_scheduled_payment(&expired).await?;
                    tx.commit().await?;
                    tracing::info!(payment_id = %id, "Scheduled payment expired");
                    return Ok(None);
                }
            }

            if payment.status.is_terminal() {
                tx.rollback().await?;
                return if force {
                    Err(ClearingError::InvalidStatus {
                        from: payment.status.to_string(),
                        to: PaymentStatus::Active.to_string(),
                    })
                } else {
                    Ok(None)
                };
            }

            let due = payment.enabled
                && payment.status == PaymentStatus::Active
                && payment.next_execute_at <= now;
            if !force && !due {
                tx.rollback().await?;
                return Ok(None);
            }

            tx.rollback().await?;
            payment
        };

        // The executor opens its own ledger transaction; never call it
        // while holding a storage transaction.
        let execution = self.executor.execute(&payment).await;
        let executed_at = Utc::now();

        let mut tx = self.storage.begin().await?;
        let mut payment = tx
            .lock_scheduled_payment(id)
            .await?
            .ok_or_else(|| ClearingError::PaymentNotFound { id: id.to_string() })?;

        match execution {
            Ok(record) => {
                payment.failure_count = 0;
                payment.last_error = None;
                payment.execution_count += 1;
                payment.last_executed_at = Some(executed_at);

                let exhausted = payment
                    .max_executions
                    .map(|max| payment.execution_count >= max)
                    .unwrap_or(false);
                match payment.schedule.next_after_execution(executed_at) {
                    Some(next) if !exhausted => payment.next_execute_at = next,
                    _ => payment.status = PaymentStatus::Completed,
                }
                payment.updated_at = executed_at;
                tx.update_scheduled_payment(&payment).await?;
                tx.commit().await?;

                tracing::info!(
                    payment_id = %id,
                    transaction_id = %record.transaction_id,
                    execution = payment.execution_count,
                    "Scheduled payment executed"
                );
                self.events.emit(DomainEvent::new(
                    kinds::PAYMENT_EXECUTED,
                    serde_json::json!({
                        "payment_id": id,
                        "transaction_id": record.transaction_id,
                    }),
                ));
                Ok(Some(record))
            }
            Err(e) => {
                payment.failure_count += 1;
                payment.last_error = Some(e.to_string());
                if payment.failure_count >= self.config.max_failures {
                    payment.status = PaymentStatus::Failed;
                } else {
                    // Linear backoff: one minute per consecutive failure.
                    payment.next_execute_at = executed_at + Duration::seconds(60 * payment.failure_count as i64);
                }
                payment.updated_at = executed_at;
                tx.update_scheduled_payment(&payment).await?;
                tx.commit().await?;

                self.events.emit(DomainEvent::new(
                    kinds::PAYMENT_FAILED,
                    serde_json::json!({
                        "payment_id": id,
                        "failure_count": payment.failure_count,
                    }),
                ));
                Err(e)
            }
        }
    }

    /// Spawn the driver loop on its own timer task.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let scheduler = self.clone();
        let (shutdown, mut watcher) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = watcher.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            tracing::warn!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
        });

        SchedulerHandle { shutdown, task }
    }
}
