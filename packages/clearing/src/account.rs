//! Account Model
//!
//! Robot accounts hold a spendable balance and a frozen balance backing
//! active escrows. The two together are the account's total economic
//! value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{new_account_id, new_api_key, Amount, Role};

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Frozen,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Suspended => "SUSPENDED",
            AccountStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<AccountStatus> {
        match s {
            "ACTIVE" => Some(AccountStatus::Active),
            "FROZEN" => Some(AccountStatus::Frozen),
            "SUSPENDED" => Some(AccountStatus::Suspended),
            "CLOSED" => Some(AccountStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-account transfer limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Maximum amount of a single transfer.
    pub max_transfer_amount: Option<Amount>,
    /// Maximum sum of outgoing transfers per calendar day (UTC).
    pub daily_transfer_limit: Option<Amount>,
    /// Balance floor after a debit.
    pub min_balance: Amount,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            max_transfer_amount: None,
            daily_transfer_limit: None,
            min_balance: Amount::ZERO,
        }
    }
}

/// A robot account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: Option<String>,
    pub owner_id: Option<String>,
    /// Opaque credential, unique across accounts.
    pub api_key: String,
    pub balance: Amount,
    /// Amount held in active escrows, never spendable directly.
    pub frozen_balance: Amount,
    pub roles: Vec<Role>,
    pub status: AccountStatus,
    pub limits: AccountLimits,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new active account with a fresh id and api key.
    pub fn new(name: Option<String>, owner_id: Option<String>, roles: Vec<Role>, limits: AccountLimits) -> Self {
        let now = Utc::now();
        Self {
            account_id: new_account_id(),
            name,
            owner_id,
            api_key: new_api_key(),
            balance: Amount::ZERO,
            frozen_balance: Amount::ZERO,
            roles,
            status: AccountStatus::Active,
            limits,
            metadata: serde_json::Value::Object(Default::default()),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Total economic value: spendable plus frozen.
    pub fn total_value(&self) -> Amount {
        self.balance.checked_add(self.frozen_balance).unwrap_or(self.balance)
    }

    /// Whether this account may initiate transfers. Non-active accounts
    /// only receive administrative balance adjustments.
    pub fn can_initiate(&self) -> bool {
        self.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_defaults() {
        let account = Account::new(Some("probe-7".into()), None, vec![Role::Consumer], AccountLimits::default());
        assert!(account.is_active());
        assert!(account.balance.is_zero());
        assert!(account.frozen_balance.is_zero());
        assert!(account.account_id.starts_with("bot_"));
        assert!(crate::types::is_valid_api_key(&account.api_key));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Frozen,
            AccountStatus::Suspended,
            AccountStatus::Closed,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AccountStatus::parse("DORMANT"), None);
    }

    #[test]
    fn test_total_value() {
        let mut account = Account::new(None, None, vec![], AccountLimits::default());
        account.balance = Amount::from_units(30);
        account.frozen_balance = Amount::from_units(12);
        assert_eq!(account.total_value(), Amount::from_units(42));
    }
}
