//! Audit Log
//!
//! Append-only record of mutations. Entries are written inside the same
//! storage transaction as the primary mutation so the log never diverges
//! from the ledger on commit or rollback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AccountCreate,
    AccountUpdate,
    AccountDelete,
    BalanceCredit,
    BalanceDebit,
    TransferCreated,
    TransferCompleted,
    TransferFailed,
    EscrowCreated,
    EscrowReleased,
    EscrowRefunded,
    EscrowExpired,
    EscrowDisputed,
    ApiKeyRegenerate,
    BatchCreated,
    BatchCompleted,
    PaymentScheduled,
    PaymentExecuted,
    PaymentCancelled,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AccountCreate => "account.create",
            AuditAction::AccountUpdate => "account.update",
            AuditAction::AccountDelete => "account.delete",
            AuditAction::BalanceCredit => "balance.credit",
            AuditAction::BalanceDebit => "balance.debit",
            AuditAction::TransferCreated => "transfer.created",
            AuditAction::TransferCompleted => "transfer.completed",
            AuditAction::TransferFailed => "transfer.failed",
            AuditAction::EscrowCreated => "escrow.created",
            AuditAction::EscrowReleased => "escrow.released",
            AuditAction::EscrowRefunded => "escrow.refunded",
            AuditAction::EscrowExpired => "escrow.expired",
            AuditAction::EscrowDisputed => "escrow.disputed",
            AuditAction::ApiKeyRegenerate => "apiKey.regenerate",
            AuditAction::BatchCreated => "batch.created",
            AuditAction::BatchCompleted => "batch.completed",
            AuditAction::PaymentScheduled => "payment.scheduled",
            AuditAction::PaymentExecuted => "payment.executed",
            AuditAction::PaymentCancelled => "payment.cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        [
            AuditAction::AccountCreate,
            AuditAction::AccountUpdate,
            AuditAction::AccountDelete,
            AuditAction::BalanceCredit,
            AuditAction::BalanceDebit,
            AuditAction::TransferCreated,
            AuditAction::TransferCompleted,
            AuditAction::TransferFailed,
            AuditAction::EscrowCreated,
            AuditAction::EscrowReleased,
            AuditAction::EscrowRefunded,
            AuditAction::EscrowExpired,
            AuditAction::EscrowDisputed,
            AuditAction::ApiKeyRegenerate,
            AuditAction::BatchCreated,
            AuditAction::BatchCompleted,
            AuditAction::PaymentScheduled,
            AuditAction::PaymentExecuted,
            AuditAction::PaymentCancelled,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: Option<String>,
    /// Per-field before/after map.
    pub changes: serde_json::Value,
    pub meta: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor_id: None,
            changes: serde_json::Value::Object(Default::default()),
            meta: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn by(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_changes(mut self, changes: serde_json::Value) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Build a single-field before/after change map.
pub fn field_change(field: &str, before: serde_json::Value, after: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ field: { "before": before, "after": after } })
}

/// Query filter for the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_id: Option<String>,
    pub action: Option<AuditAction>,
    pub actor_id: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(ref entity_id) = self.entity_id {
            if &entry.entity_id != entity_id {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(ref actor_id) = self.actor_id {
            if entry.actor_id.as_deref() != Some(actor_id.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.after {
            if entry.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if entry.timestamp >= before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        assert_eq!(AuditAction::parse("account.create"), Some(AuditAction::AccountCreate));
        assert_eq!(AuditAction::parse("apiKey.regenerate"), Some(AuditAction::ApiKeyRegenerate));
        assert_eq!(AuditAction::parse("nothing.here"), None);
    }

    #[test]
    fn test_filter_matches() {
        let entry = AuditLogEntry::new(AuditAction::BalanceCredit, "account", "bot_1").by("admin-1");

        let by_entity = AuditFilter {
            entity_id: Some("bot_1".into()),
            ..Default::default()
        };
        assert!(by_entity.matches(&entry));

        let wrong_action = AuditFilter {
            action: Some(AuditAction::BalanceDebit),
            ..Default::default()
        };
        assert!(!wrong_action.matches(&entry));

        let by_actor = AuditFilter {
            actor_id: Some("admin-1".into()),
            ..Default::default()
        };
        assert!(by_actor.matches(&entry));
    }

    #[test]
    fn test_field_change_shape() {
        let changes = field_change("status", serde_json::json!("ACTIVE"), serde_json::json!("FROZEN"));
        assert_eq!(changes["status"]["before"], "ACTIVE");
        assert_eq!(changes["status"]["after"], "FROZEN");
    }
}
