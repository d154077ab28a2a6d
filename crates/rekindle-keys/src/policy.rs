use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::KeyError;

/// Tunable limits for the key lifecycle.
///
/// Loaded from JSON by the daemon; any field left out keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPolicy {
    /// Lifetime of a signed prekey from upload to `expires_at`.
    pub signed_prekey_lifetime_days: i64,
    /// How long an expired signed prekey is kept before cleanup deletes it.
    pub signed_prekey_grace_days: i64,
    /// A signed prekey expiring within this window should be rotated.
    pub rotation_window_hours: i64,
    /// Unused prekeys older than this are purged by the weekly job.
    pub old_prekey_age_days: i64,
    /// Hard cap on unused prekeys per device.
    pub max_unused_prekeys: usize,
    /// Largest batch accepted in a single prekey upload.
    pub max_batch_size: usize,
    /// Below this many unused prekeys a device should replenish.
    pub low_prekey_threshold: usize,
    /// Pool size a replenishment should bring the device back up to.
    pub target_prekey_count: usize,
    pub min_key_length: usize,
    pub max_key_length: usize,
    pub max_signature_length: usize,
    /// Daily cleanup deleting more than this many keys logs a warning.
    pub large_cleanup_warning: usize,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            signed_prekey_lifetime_days: 7,
            signed_prekey_grace_days: 30,
            rotation_window_hours: 24,
            old_prekey_age_days: 30,
            max_unused_prekeys: 200,
            max_batch_size: 200,
            low_prekey_threshold: 20,
            target_prekey_count: 100,
            min_key_length: 32,
            max_key_length: 100,
            max_signature_length: 200,
            large_cleanup_warning: 1000,
        }
    }
}

/// Upper bound for every day-based period: 100 years.
const MAX_DAYS: i64 = 36_500;
const MAX_HOURS: i64 = MAX_DAYS * 24;

impl KeyPolicy {
    /// Parse a policy from JSON, filling omitted fields with defaults, and
    /// reject it if any value is out of range.
    pub fn from_json(json: &str) -> Result<Self, KeyError> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| KeyError::Policy(format!("malformed key policy: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        let periods = [
            ("signed_prekey_lifetime_days", self.signed_prekey_lifetime_days, MAX_DAYS),
            ("signed_prekey_grace_days", self.signed_prekey_grace_days, MAX_DAYS),
            ("rotation_window_hours", self.rotation_window_hours, MAX_HOURS),
            ("old_prekey_age_days", self.old_prekey_age_days, MAX_DAYS),
        ];
        for (name, value, max) in periods {
            if !(1..=max).contains(&value) {
                return Err(KeyError::Policy(format!(
                    "{name} must be between 1 and {max}, got {value}"
                )));
            }
        }

        let limits = [
            ("max_unused_prekeys", self.max_unused_prekeys),
            ("max_batch_size", self.max_batch_size),
            ("min_key_length", self.min_key_length),
            ("max_signature_length", self.max_signature_length),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(KeyError::Policy(format!("{name} must be positive")));
        }

        if self.min_key_length > self.max_key_length {
            return Err(KeyError::Policy(format!(
                "min_key_length {} exceeds max_key_length {}",
                self.min_key_length, self.max_key_length
            )));
        }
        Ok(())
    }

    pub fn signed_prekey_lifetime(&self) -> TimeDelta {
        TimeDelta::try_days(self.signed_prekey_lifetime_days).unwrap_or(TimeDelta::MAX)
    }

    pub fn rotation_window(&self) -> TimeDelta {
        TimeDelta::try_hours(self.rotation_window_hours).unwrap_or(TimeDelta::MAX)
    }
}
