//! Robopay Clearing: Micropayment Ledger for Autonomous Agents
//!
//! The transactional core that moves value between robot accounts under
//! concurrent load.
//!
//! Features:
//! - Double-entry transfers with per-account locking and limits
//! - Escrow hold/release/refund with conditions and expiry
//! - Atomic and partial-failure batch execution
//! - Idempotent retries keyed by client-supplied tokens
//! - Recurring payments with bounded retries and linear backoff
//! - Pluggable storage: in-memory or Postgres behind one contract
//!
//! # Example
//!
//! ```rust,ignore
//! use robopay_clearing::{Ledger, TransferRequest, Amount};
//!
//! let record = ledger.transfer(
//!     &actor,
//!     TransferRequest::new("bot_a", "bot_b", Amount::from_units(250))
//!         .with_idempotency_key("order-12345"),
//! ).await?;
//! ```

pub mod account;
pub mod audit;
pub mod batch;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod middleware;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-exports
pub use account::{Account, AccountLimits, AccountStatus};
pub use audit::{AuditAction, AuditFilter, AuditLogEntry};
pub use batch::{BatchExecutor, BatchOutcome, BatchStatus, BatchTransfer};
pub use config::{ClearingConfig, StorageBackend, StorageConfig};
pub use error::ClearingError;
pub use escrow::{Escrow, EscrowEngine, EscrowStatus};
pub use events::{DomainEvent, EventBus};
pub use idempotency::IdempotencyRecord;
pub use ledger::{
    BalanceOperation, CreateAccountRequest, FeeCalculator, Ledger, TransactionRecord, TransactionStatus,
    TransferRequest, UpdateAccountRequest,
};
pub use middleware::{Middleware, OperationContext, Pipeline};
pub use scheduler::{
    CreatePaymentRequest, LedgerExecutor, PaymentScheduler, PaymentStatus, Schedule, ScheduledPayment,
    SchedulerConfig, TransferExecutor,
};
pub use storage::{MemoryStorage, PostgresOptions, PostgresStorage, Storage, StorageTx};
pub use types::{Actor, Amount, Role};
