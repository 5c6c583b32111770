//! Batch Executor
//!
//! Runs an ordered list of transfer specs either atomically (one storage
//! transaction, any failure rolls everything back) or per-child (each
//! transfer in its own transaction, failures recorded without halting
//! the batch).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditAction, AuditLogEntry};
use crate::error::ClearingError;
use crate::events::{kinds, DomainEvent};
use crate::ledger::{Ledger, TransactionRecord, TransferRequest};
use crate::storage::{Storage, StorageTx};
use crate::types::{new_batch_id, Actor, Amount};

/// Default cap on batch size.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Pending,
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Partial => "PARTIAL",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "PENDING" => Some(BatchStatus::Pending),
            "COMPLETED" => Some(BatchStatus::Completed),
            "PARTIAL" => Some(BatchStatus::Partial),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Stored batch record with running counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTransfer {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_amount: Amount,
    pub success_count: u32,
    pub failed_count: u32,
    pub all_or_nothing: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchTransfer {
    fn new(all_or_nothing: bool) -> Self {
        Self {
            batch_id: new_batch_id(),
            status: BatchStatus::Pending,
            total_amount: Amount::ZERO,
            success_count: 0,
            failed_count: 0,
            all_or_nothing,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Per-child result, in client-supplied order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

/// Executed batch with its child results.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch: BatchTransfer,
    pub results: Vec<BatchItemResult>,
}

/// The batch executor.
pub struct BatchExecutor {
    ledger: Arc<Ledger>,
    max_batch_size: usize,
}

impl BatchExecutor {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Execute a batch of transfers.
    ///
    /// An optional batch idempotency key scopes the children's keys as
    /// `{key}:{index}`, making the whole batch deterministic across
    /// retries.
    pub async fn execute(
        &self,
        actor: &Actor,
        items: Vec<TransferRequest>,
        all_or_nothing: bool,
        idempotency_key: Option<String>,
    ) -> Result<BatchOutcome, ClearingError> {
        if items.is_empty() {
            return Err(ClearingError::validation("batch must contain at least one transfer"));
        }
        if items.len() > self.max_batch_size {
            return Err(ClearingError::validation(format!(
                "batch size {} exceeds maximum {}",
                items.len(),
                self.max_batch_size
            )));
        }

        let mut batch = BatchTransfer::new(all_or_nothing);
        let items: Vec<TransferRequest> = items
            .into_iter()
            .enumerate()
            .map(|(index, mut item)| {
                item.batch_id = Some(batch.batch_id.clone());
                if item.idempotency_key.is_none() {
                    if let Some(key) = &idempotency_key {
                        item.idempotency_key = Some(format!("{key}:{index}"));
                    }
                }
                item
            })
            .collect();

        // Record the batch before running any child.
        {
            let mut tx = self.ledger.storage().begin().await?;
            tx.insert_batch(&batch).await?;
            if self.ledger.config().enable_audit_log {
                tx.append_audit(
                    &AuditLogEntry::new(AuditAction::BatchCreated, "batch", &batch.batch_id).by(&actor.id),
                )
                .await?;
            }
            tx.commit().await?;
        }

        let outcome = if all_or_nothing {
            self.execute_atomic(actor, &mut batch, &items).await?
        } else {
            self.execute_per_child(actor, &mut batch, &items).await
        };

        batch.completed_at = Some(Utc::now());
        {
            let mut tx = self.ledger.storage().begin().await?;
            tx.update_batch(&batch).await?;
            if self.ledger.config().enable_audit_log {
                tx.append_audit(
                    &AuditLogEntry::new(AuditAction::BatchCompleted, "batch", &batch.batch_id)
                        .by(&actor.id)
                        .with_meta(serde_json::json!({
                            "status": batch.status.as_str(),
                            "success_count": batch.success_count,
                            "failed_count": batch.failed_count,
                        })),
                )
                .await?;
            }
            tx.commit().await?;
        }

        self.ledger.events().emit(DomainEvent::new(
            kinds::BATCH_COMPLETED,
            serde_json::json!({
                "batch_id": batch.batch_id,
                "status": batch.status.as_str(),
            }),
        ));

        Ok(BatchOutcome { batch, results: outcome })
    }

    /// One transaction for the whole batch. Any child failure rolls the
    /// entire batch back; success count is all-or-zero.
    async fn execute_atomic(
        &self,
        actor: &Actor,
        batch: &mut BatchTransfer,
        items: &[TransferRequest],
    ) -> Result<Vec<BatchItemResult>, ClearingError> {
        let mut tx = self.ledger.storage().begin().await?;
        let mut completed: Vec<(usize, TransactionRecord, bool)> = Vec::with_capacity(items.len());
        let mut failure: Option<(usize, ClearingError)> = None;

        for (index, item) in items.iter().enumerate() {
            match self.ledger.transfer_in_tx(&mut *tx, actor, item).await {
                Ok(outcome) => completed.push((index, outcome.record, outcome.replayed)),
                Err(e) => {
                    failure = Some((index, e));
                    break;
                }
            }
        }

        match failure {
            None => {
                tx.commit().await?;

                let mut results = Vec::with_capacity(items.len());
                let mut total = Amount::ZERO;
                for (index, record, replayed) in completed {
                    total = total.checked_add(record.amount).unwrap_or(total);
                    if !replayed {
                        self.ledger.emit_transfer_completed(&record);
                    }
                    results.push(BatchItemResult {
                        index,
                        transaction_id: Some(record.transaction_id),
                        error: None,
                    });
                }

                batch.status = BatchStatus::Completed;
                batch.success_count = results.len() as u32;
                batch.total_amount = total;
                Ok(results)
            }
            Some((failed_index, error)) => {
                let _ = tx.rollback().await;

                let results = items
                    .iter()
                    .enumerate()
                    .map(|(index, _)| BatchItemResult {
                        index,
                        transaction_id: None,
                        error: if index == failed_index {
                            Some(error.to_string())
                        } else {
                            Some("rolled back".to_string())
                        },
                    })
                    .collect();

                batch.status = BatchStatus::Failed;
                batch.failed_count = items.len() as u32;
                Ok(results)
            }
        }
    }

    /// Each child in its own transaction; failures are recorded and the
    /// batch keeps going.
    async fn execute_per_child(
        &self,
        actor: &Actor,
        batch: &mut BatchTransfer,
        items: &[TransferRequest],
    ) -> Vec<BatchItemResult> {
        let mut results = Vec::with_capacity(items.len());
        let mut total = Amount::ZERO;

        for (index, item) in items.iter().enumerate() {
            match self.ledger.transfer(actor, item.clone()).await {
                Ok(record) => {
                    total = total.checked_add(record.amount).unwrap_or(total);
                    batch.success_count += 1;
                    results.push(BatchItemResult {
                        index,
                        transaction_id: Some(record.transaction_id),
                        error: None,
                    });
                }
                Err(e) => {
                    batch.failed_count += 1;
                    results.push(BatchItemResult {
                        index,
                        transaction_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        batch.total_amount = total;
        batch.status = if batch.failed_count == 0 {
            BatchStatus::Completed
        } else if batch.success_count > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        };
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClearingConfig;
    use crate::events::EventBus;
    use crate::ledger::CreateAccountRequest;
    use crate::storage::{MemoryStorage, Storage};

    fn admin() -> Actor {
        Actor::system()
    }

    async fn setup() -> (Arc<Ledger>, BatchExecutor) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let ledger = Arc::new(Ledger::new(storage, Arc::new(EventBus::new()), ClearingConfig::default()));
        let executor = BatchExecutor::new(ledger.clone());
        (ledger, executor)
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
    async fn test_partial_batch_records_failures() {
        let (ledger, executor) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;
        let c = funded(&ledger, 0).await;
        let d = funded(&ledger, 0).await;

        let outcome = executor
            .execute(
                &admin(),
                vec![
                    TransferRequest::new(&a, &b, Amount::from_units(30)),
                    TransferRequest::new(&a, &c, Amount::from_units(60)),
                    TransferRequest::new(&a, &d, Amount::from_units(50)),
                ],
                false,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch.status, BatchStatus::Partial);
        assert_eq!(outcome.batch.success_count, 2);
        assert_eq!(outcome.batch.failed_count, 1);
        assert!(outcome.results[2].error.as_deref().unwrap().contains("Insufficient"));

        let a = ledger.get_account(&admin(), &a).await.unwrap();
        let b = ledger.get_account(&admin(), &b).await.unwrap();
        let c = ledger.get_account(&admin(), &c).await.unwrap();
        let d = ledger.get_account(&admin(), &d).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(10));
        assert_eq!(b.balance, Amount::from_units(30));
        assert_eq!(c.balance, Amount::from_units(60));
        assert!(d.balance.is_zero());
    }

    #[tokio::test]
    async fn test_atomic_batch_rolls_back_entirely() {
        let (ledger, executor) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;
        let c = funded(&ledger, 0).await;

        let outcome = executor
            .execute(
                &admin(),
                vec![
                    TransferRequest::new(&a, &b, Amount::from_units(30)),
                    TransferRequest::new(&a, &c, Amount::from_units(90)),
                ],
                true,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch.status, BatchStatus::Failed);
        assert_eq!(outcome.batch.success_count, 0);

        // Nothing moved, including the first child.
        let a = ledger.get_account(&admin(), &a).await.unwrap();
        let b = ledger.get_account(&admin(), &b).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(100));
        assert!(b.balance.is_zero());
    }

    #[tokio::test]
    async fn test_atomic_batch_commits_together() {
        let (ledger, executor) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;
        let c = funded(&ledger, 0).await;

        let outcome = executor
            .execute(
                &admin(),
                vec![
                    TransferRequest::new(&a, &b, Amount::from_units(30)),
                    TransferRequest::new(&a, &c, Amount::from_units(60)),
                ],
                true,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch.status, BatchStatus::Completed);
        assert_eq!(outcome.batch.success_count, 2);
        assert_eq!(outcome.batch.total_amount, Amount::from_units(90));

        let a = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(10));
    }

    #[tokio::test]
    async fn test_children_carry_batch_id() {
        let (ledger, executor) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;

        let outcome = executor
            .execute(
                &admin(),
                vec![TransferRequest::new(&a, &b, Amount::from_units(10))],
                false,
                None,
            )
            .await
            .unwrap();

        let child_id = outcome.results[0].transaction_id.clone().unwrap();
        let child = ledger.storage().get_transaction(&child_id).await.unwrap().unwrap();
        assert_eq!(child.batch_id.as_deref(), Some(outcome.batch.batch_id.as_str()));
    }

    #[tokio::test]
    async fn test_batch_idempotency_scopes_children() {
        let (ledger, executor) = setup().await;
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;

        let items = vec![
            TransferRequest::new(&a, &b, Amount::from_units(10)),
            TransferRequest::new(&a, &b, Amount::from_units(20)),
        ];

        let first = executor
            .execute(&admin(), items.clone(), false, Some("batch-1".into()))
            .await
            .unwrap();
        let second = executor
            .execute(&admin(), items, false, Some("batch-1".into()))
            .await
            .unwrap();

        // Retried children replay the stored transactions.
        assert_eq!(
            first.results[0].transaction_id,
            second.results[0].transaction_id
        );
        assert_eq!(
            first.results[1].transaction_id,
            second.results[1].transaction_id
        );

        let a = ledger.get_account(&admin(), &a).await.unwrap();
        assert_eq!(a.balance, Amount::from_units(70));
    }

    #[tokio::test]
    async fn test_batch_size_cap() {
        let (ledger, executor) = setup().await;
        let executor = executor.with_max_batch_size(2);
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;

        let items = vec![
            TransferRequest::new(&a, &b, Amount::from_units(1)),
            TransferRequest::new(&a, &b, Amount::from_units(1)),
            TransferRequest::new(&a, &b, Amount::from_units(1)),
        ];
        let err = executor.execute(&admin(), items, false, None).await.unwrap_err();
        assert!(matches!(err, ClearingError::Validation { .. }));
    }
}
