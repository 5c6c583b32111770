//! Idempotency Store Types
//!
//! Client retries are deduplicated by a client-supplied key. The stored
//! fingerprint is a stable hash over the request's semantic inputs, so a
//! replay with a different body is a conflict rather than a cache hit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Amount;

/// Stored record for one idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub transaction_id: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: impl Into<String>, transaction_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            transaction_id: transaction_id.into(),
            fingerprint: fingerprint.into(),
            created_at: Utc::now(),
        }
    }
}

/// Minimum retention for idempotency records. Adapters may age entries
/// out beyond this horizon.
pub fn retention() -> Duration {
    Duration::hours(24)
}

/// Stable fingerprint over the semantic inputs of a transfer request.
///
/// Fields are serialized in a fixed canonical order, so the hash is
/// independent of the order the caller supplied them in.
pub fn fingerprint(from: &str, to: &str, amount: Amount, tx_type: &str, memo: Option<&str>) -> String {
    let canonical = format!(
        "amount={}\nfrom={}\nmemo={}\nto={}\ntype={}",
        amount,
        from,
        memo.unwrap_or(""),
        to,
        tx_type
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("bot_a", "bot_b", Amount::from_units(50), "TRANSFER", Some("ride"));
        let b = fingerprint("bot_a", "bot_b", Amount::from_units(50), "TRANSFER", Some("ride"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_body() {
        let base = fingerprint("bot_a", "bot_b", Amount::from_units(50), "TRANSFER", None);
        assert_ne!(base, fingerprint("bot_a", "bot_b", Amount::from_units(51), "TRANSFER", None));
        assert_ne!(base, fingerprint("bot_a", "bot_c", Amount::from_units(50), "TRANSFER", None));
        assert_ne!(base, fingerprint("bot_a", "bot_b", Amount::from_units(50), "CREDIT", None));
        assert_ne!(base, fingerprint("bot_a", "bot_b", Amount::from_units(50), "TRANSFER", Some("m")));
    }

    #[test]
    fn test_retention_window() {
        assert_eq!(retention(), Duration::hours(24));
    }
}
