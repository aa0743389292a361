//! Validation keys - per-group shared secrets
//!
//! Only a SHA-256 hash of each key is kept. A raw key exists in memory just
//! long enough to be hashed, and is handed back to the caller exactly once
//! when it is generated.
//!
//! | record            | enabled | hash | outcome                 |
//! |-------------------|---------|------|-------------------------|
//! | none              | -       | -    | open                    |
//! | present           | false   | any  | open                    |
//! | present           | true    | yes  | key must match          |
//! | present (revoked) | true    | no   | every call is rejected  |

use crate::error::{HubError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

/// Shortest key `set` accepts
pub const MIN_KEY_LENGTH: usize = 8;

/// Length of keys produced by `generate`
pub const GENERATED_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone)]
struct ValidationKeyRecord {
    secret_hash: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_updated_at: DateTime<Utc>,
    enabled: bool,
}

/// What may be shown about a group's key: never the key or its hash
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStatus {
    pub group_id: String,
    pub enabled: bool,
    pub has_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Qualitative strength bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrength {
    Weak,
    Fair,
    Strong,
    VeryStrong,
}

/// Complexity metrics of a key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyComplexity {
    pub length: usize,
    pub character_classes: usize,
    pub estimated_entropy_bits: f64,
    pub strength: KeyStrength,
}

/// A freshly generated key. The only time the raw key leaves the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedKey {
    pub key: String,
    pub complexity: KeyComplexity,
    pub status: ValidationStatus,
}

/// Estimate entropy from the character classes present in `key`
pub fn analyze_key_complexity(key: &str) -> KeyComplexity {
    let has_lower = key.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = key.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = key.chars().any(|c| c.is_ascii_digit());
    let has_symbol = key.chars().any(|c| c.is_ascii_punctuation());
    let has_other = key.chars().any(|c| !c.is_ascii());

    let mut pool = 0u32;
    let mut classes = 0usize;
    for (present, size) in [
        (has_lower, 26),
        (has_upper, 26),
        (has_digit, 10),
        (has_symbol, 32),
        (has_other, 64),
    ] {
        if present {
            pool += size;
            classes += 1;
        }
    }

    let length = key.chars().count();
    let entropy = if pool == 0 {
        0.0
    } else {
        length as f64 * f64::from(pool).log2()
    };

    let strength = match entropy {
        e if e < 40.0 => KeyStrength::Weak,
        e if e < 64.0 => KeyStrength::Fair,
        e if e < 100.0 => KeyStrength::Strong,
        _ => KeyStrength::VeryStrong,
    };

    KeyComplexity {
        length,
        character_classes: classes,
        estimated_entropy_bits: (entropy * 10.0).round() / 10.0,
        strength,
    }
}

/// Hex SHA-256 of a key
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Per-group key records
#[derive(Default)]
pub struct ValidationKeyStore {
    records: RwLock<HashMap<String, ValidationKeyRecord>>,
}

impl ValidationKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the hash of `raw_key` for `group_id`
    pub fn set(&self, group_id: &str, raw_key: &str, enabled: bool) -> Result<ValidationStatus> {
        if raw_key.chars().count() < MIN_KEY_LENGTH {
            return Err(HubError::InvalidKey(format!(
                "key must be at least {} characters",
                MIN_KEY_LENGTH
            )));
        }
        let status = self.store_hash(group_id, hash_key(raw_key), enabled);
        info!(group_id = %group_id, enabled, "Validation key set");
        Ok(status)
    }

    /// Create a random key, store its hash (enabled) and return it once
    pub fn generate(&self, group_id: &str) -> Result<GeneratedKey> {
        let key: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(GENERATED_KEY_LENGTH)
            .map(char::from)
            .collect();

        let complexity = analyze_key_complexity(&key);
        let status = self.set(group_id, &key, true)?;
        Ok(GeneratedKey {
            key,
            complexity,
            status,
        })
    }

    /// Install an already-hashed key, e.g. from configuration
    pub fn seed_hash(&self, group_id: &str, key_hash: &str, enabled: bool) -> Result<ValidationStatus> {
        let key_hash = key_hash.trim().to_ascii_lowercase();
        if !is_sha256_hex(&key_hash) {
            return Err(HubError::InvalidKey(format!(
                "key hash for group '{}' is not a hex SHA-256 digest",
                group_id
            )));
        }
        Ok(self.store_hash(group_id, key_hash, enabled))
    }

    fn store_hash(&self, group_id: &str, secret_hash: String, enabled: bool) -> ValidationStatus {
        let now = Utc::now();
        let mut records = self.records.write();
        let record = records
            .entry(group_id.to_string())
            .or_insert_with(|| ValidationKeyRecord {
                secret_hash: None,
                created_at: None,
                last_updated_at: now,
                enabled,
            });
        if record.secret_hash.is_none() {
            record.created_at = Some(now);
        }
        record.secret_hash = Some(secret_hash);
        record.enabled = enabled;
        record.last_updated_at = now;
        status_of(group_id, Some(&*record))
    }

    /// Whether `supplied` grants access to `group_id`
    pub fn validate(&self, group_id: &str, supplied: Option<&str>) -> bool {
        let records = self.records.read();
        let Some(record) = records.get(group_id) else {
            return true;
        };
        if !record.enabled {
            return true;
        }
        match (&record.secret_hash, supplied) {
            (Some(expected), Some(key)) => {
                constant_time_eq(hash_key(key).as_bytes(), expected.as_bytes())
            }
            _ => {
                debug!(group_id = %group_id, "Validation key missing or revoked");
                false
            }
        }
    }

    /// Drop the key but keep the enabled flag. Returns whether a key existed.
    pub fn revoke(&self, group_id: &str) -> bool {
        let mut records = self.records.write();
        match records.get_mut(group_id) {
            Some(record) if record.secret_hash.is_some() => {
                record.secret_hash = None;
                record.created_at = None;
                record.last_updated_at = Utc::now();
                info!(group_id = %group_id, enabled = record.enabled, "Validation key revoked");
                true
            }
            _ => false,
        }
    }

    pub fn set_enabled(&self, group_id: &str, enabled: bool) -> ValidationStatus {
        let now = Utc::now();
        let mut records = self.records.write();
        let record = records
            .entry(group_id.to_string())
            .or_insert_with(|| ValidationKeyRecord {
                secret_hash: None,
                created_at: None,
                last_updated_at: now,
                enabled,
            });
        record.enabled = enabled;
        record.last_updated_at = now;
        info!(group_id = %group_id, enabled, "Validation toggled");
        status_of(group_id, Some(&*record))
    }

    /// Whether calls to `group_id` currently need a key
    pub fn is_enforced(&self, group_id: &str) -> bool {
        self.records
            .read()
            .get(group_id)
            .map_or(false, |r| r.enabled)
    }

    pub fn status(&self, group_id: &str) -> ValidationStatus {
        status_of(group_id, self.records.read().get(group_id))
    }

    /// Forget everything about `group_id`
    pub fn remove(&self, group_id: &str) -> bool {
        self.records.write().remove(group_id).is_some()
    }
}

fn status_of(group_id: &str, record: Option<&ValidationKeyRecord>) -> ValidationStatus {
    match record {
        Some(record) => ValidationStatus {
            group_id: group_id.to_string(),
            enabled: record.enabled,
            has_key: record.secret_hash.is_some(),
            created_at: record.created_at,
            last_updated_at: Some(record.last_updated_at),
        },
        None => ValidationStatus {
            group_id: group_id.to_string(),
            enabled: false,
            has_key: false,
            created_at: None,
            last_updated_at: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_without_record() {
        let store = ValidationKeyStore::new();
        assert!(store.validate("g1", None));
        assert!(!store.status("g1").has_key);
    }

    #[test]
    fn test_set_and_validate() {
        let store = ValidationKeyStore::new();
        store.set("g1", "correct-horse", true).unwrap();

        assert!(!store.validate("g1", None));
        assert!(!store.validate("g1", Some("wrong-horse")));
        assert!(store.validate("g1", Some("correct-horse")));
        assert!(store.is_enforced("g1"));
    }

    #[test]
    fn test_revoke_then_disable() {
        let store = ValidationKeyStore::new();
        store.set("g1", "correct-horse", true).unwrap();
        assert!(store.revoke("g1"));
        assert!(!store.revoke("g1"));

        // Still enabled: nothing gets in.
        assert!(!store.validate("g1", Some("correct-horse")));
        assert!(!store.validate("g1", None));

        store.set_enabled("g1", false);
        assert!(store.validate("g1", None));
        assert!(store.validate("g1", Some("anything")));
    }

    #[test]
    fn test_disabled_key_is_open() {
        let store = ValidationKeyStore::new();
        store.set("g1", "correct-horse", false).unwrap();
        assert!(store.validate("g1", None));
        assert!(store.status("g1").has_key);
    }

    #[test]
    fn test_short_key_rejected() {
        let store = ValidationKeyStore::new();
        assert!(matches!(store.set("g1", "short", true), Err(HubError::InvalidKey(_))));
    }

    #[test]
    fn test_generate_returns_usable_key() {
        let store = ValidationKeyStore::new();
        let generated = store.generate("g1").unwrap();

        assert_eq!(generated.key.len(), GENERATED_KEY_LENGTH);
        assert_eq!(generated.complexity.strength, KeyStrength::VeryStrong);
        assert!(generated.status.enabled && generated.status.has_key);
        assert!(store.validate("g1", Some(&generated.key)));
    }

    #[test]
    fn test_status_never_exposes_secret() {
        let store = ValidationKeyStore::new();
        store.set("g1", "correct-horse", true).unwrap();
        let text = serde_json::to_string(&store.status("g1")).unwrap();
        assert!(!text.contains("correct-horse"));
        assert!(!text.contains(&hash_key("correct-horse")));
    }

    #[test]
    fn test_seed_hash() {
        let store = ValidationKeyStore::new();
        store.seed_hash("g1", &hash_key("from-config"), true).unwrap();
        assert!(store.validate("g1", Some("from-config")));
        assert!(store.seed_hash("g1", "not-a-hash", true).is_err());
    }

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(analyze_key_complexity("abc").strength, KeyStrength::Weak);
        let mixed = analyze_key_complexity("Abcdefgh1234!");
        assert_eq!(mixed.character_classes, 4);
        assert!(mixed.strength >= KeyStrength::Strong);
        assert_eq!(analyze_key_complexity("").estimated_entropy_bits, 0.0);
    }
}
