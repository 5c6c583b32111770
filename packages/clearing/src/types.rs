//! Core Types
//!
//! Fixed-point amounts, prefixed identifiers, and actor principals.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum fractional digits carried on the ledger path.
pub const AMOUNT_SCALE: u32 = 8;

/// Monetary amount with fixed-point precision.
///
/// Wraps a decimal normalized to at most eight fractional digits. Binary
/// floating point never touches ledger arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    /// Zero amount.
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Create from a decimal, rounding to the ledger scale.
    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp(AMOUNT_SCALE))
    }

    /// Create from whole units.
    pub fn from_units(units: i64) -> Self {
        Self(Decimal::from(units))
    }

    /// Parse from a decimal string.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<Decimal>().ok().map(Self::new)
    }

    /// Underlying decimal value.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Check if amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Check if amount is negative.
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Check if amount is strictly positive.
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Checked addition.
    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Self::new)
    }

    /// Checked subtraction.
    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Self::new)
    }

    /// Negated amount.
    pub fn neg(&self) -> Amount {
        Self(-self.0)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roles an actor may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Consumer,
    Provider,
    Admin,
    Operator,
    Auditor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Provider => "provider",
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Auditor => "auditor",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "consumer" => Some(Role::Consumer),
            "provider" => Some(Role::Provider),
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "auditor" => Some(Role::Auditor),
            _ => None,
        }
    }
}

/// Principal performing an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier (usually an account id).
    pub id: String,
    /// Roles held by this actor.
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self { id: id.into(), roles }
    }

    /// Internal system principal with full privileges.
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            roles: vec![Role::Admin],
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

fn random_hex(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        for byte in hasher.finalize() {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out.truncate(len);
    out
}

/// New account id: `bot_` + 16 hex chars.
pub fn new_account_id() -> String {
    format!("bot_{}", random_hex(16))
}

/// New transaction id: `tx_` + 24 hex chars.
pub fn new_transaction_id() -> String {
    format!("tx_{}", random_hex(24))
}

/// New escrow id: `esc_` + 20 hex chars.
pub fn new_escrow_id() -> String {
    format!("esc_{}", random_hex(20))
}

/// New batch id: `bat_` + 20 hex chars.
pub fn new_batch_id() -> String {
    format!("bat_{}", random_hex(20))
}

/// New scheduled payment id: `sp_` + 20 hex chars.
pub fn new_payment_id() -> String {
    format!("sp_{}", random_hex(20))
}

/// New balance operation id: `bop_` + 16 hex chars.
pub fn new_balance_op_id() -> String {
    format!("bop_{}", random_hex(16))
}

/// New api key: `rbx_` + 48 hex chars.
pub fn new_api_key() -> String {
    format!("rbx_{}", random_hex(48))
}

/// Validate an api key against `^rbx_[a-f0-9]{48}$`.
pub fn is_valid_api_key(key: &str) -> bool {
    let Some(hex) = key.strip_prefix("rbx_") else {
        return false;
    };
    hex.len() == 48 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    #[test]
    fn test_amount_arithmetic() {
        let a = amt("10.5");
        let b = amt("0.25");
        assert_eq!(a.checked_add(b).unwrap(), amt("10.75"));
        assert_eq!(a.checked_sub(b).unwrap(), amt("10.25"));
    }

    #[test]
    fn test_amount_scale_normalized() {
        let a = amt("1.123456789999");
        assert_eq!(a, amt("1.12345679"));
    }

    #[test]
    fn test_amount_sign_checks() {
        assert!(amt("0").is_zero());
        assert!(amt("-1").is_negative());
        assert!(amt("0.00000001").is_positive());
        assert!(!amt("0").is_negative());
    }

    #[test]
    fn test_id_formats() {
        assert_eq!(new_account_id().len(), "bot_".len() + 16);
        assert_eq!(new_transaction_id().len(), "tx_".len() + 24);
        assert_eq!(new_escrow_id().len(), "esc_".len() + 20);
    }

    #[test]
    fn test_api_key_validation() {
        let key = new_api_key();
        assert!(is_valid_api_key(&key));
        assert!(!is_valid_api_key("rbx_short"));
        assert!(!is_valid_api_key(&key.to_uppercase()));
        assert!(!is_valid_api_key(&key.replace("rbx_", "sk_")));
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(new_account_id(), new_account_id());
        assert_ne!(new_api_key(), new_api_key());
    }
}
