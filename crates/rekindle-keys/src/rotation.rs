//! Signed prekey rotation and one-time prekey replenishment policy.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{PreKeyDto, SignedPreKey, SignedPreKeyDto};
use crate::policy::KeyPolicy;
use crate::store::KeyStore;
use crate::validator::{self, KeyValidator};
use crate::KeyError;

/// What a device should upload next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecommendations {
    pub needs_pre_key_replenishment: bool,
    pub needs_signed_pre_key_rotation: bool,
    pub unused_pre_key_count: usize,
    /// Prekeys to upload to get back to the target pool size; 0 when the
    /// pool is not low.
    pub recommended_upload: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key_expires_at: Option<DateTime<Utc>>,
}

pub struct KeyRotationManager {
    store: Arc<dyn KeyStore>,
    validator: KeyValidator,
    policy: KeyPolicy,
}

impl KeyRotationManager {
    pub fn new(store: Arc<dyn KeyStore>, policy: KeyPolicy) -> Self {
        Self {
            store,
            validator: KeyValidator::new(policy.clone()),
            policy,
        }
    }

    /// Store a new signed prekey.
    ///
    /// The previous key is left in place: it stops being active once it
    /// expires or a newer key exists, and is only deleted by
    /// [`cleanup_expired_signed_prekeys`](Self::cleanup_expired_signed_prekeys)
    /// after the grace period.
    pub fn rotate_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        new_key: &SignedPreKeyDto,
    ) -> Result<SignedPreKey, KeyError> {
        let key = self.validator.validate_signed_prekey(new_key)?;
        validator::validate_signed_prekey_id_uniqueness(
            self.store.as_ref(),
            user_id,
            device_id,
            key.key_id,
        )?;

        let stored = self.store.create_signed_prekey(
            user_id,
            device_id,
            &key,
            self.policy.signed_prekey_lifetime(),
        )?;

        tracing::info!(
            user = %user_id,
            device = %device_id,
            key_id = stored.key_id,
            expires_at = %stored.expires_at,
            "signed prekey rotated"
        );
        Ok(stored)
    }

    /// Add one-time prekeys, refusing batches that would push the unused
    /// pool past the cap. Returns the number of keys stored.
    ///
    /// The early count only lets an oversized batch fail before per-key
    /// validation; the store re-checks the cap atomically with the insert.
    pub fn replenish_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        new_keys: &[PreKeyDto],
    ) -> Result<usize, KeyError> {
        let max = self.policy.max_unused_prekeys;
        let current = self.store.count_unused(user_id, device_id)?;
        if current.saturating_add(new_keys.len()) > max {
            let err = KeyError::Capacity {
                current,
                requested: new_keys.len(),
                max,
            };
            log_capacity_rejection(user_id, device_id, &err);
            return Err(err);
        }

        let keys = self.validator.validate_prekeys(new_keys)?;
        let stored = self
            .store
            .create_prekeys(user_id, device_id, &keys, max)
            .inspect_err(|e| log_capacity_rejection(user_id, device_id, e))?;

        tracing::info!(
            user = %user_id,
            device = %device_id,
            count = stored,
            "prekeys replenished"
        );
        Ok(stored)
    }

    pub fn needs_pre_key_replenishment(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, KeyError> {
        let unused = self.store.count_unused(user_id, device_id)?;
        Ok(unused < self.policy.low_prekey_threshold)
    }

    pub fn needs_signed_pre_key_rotation(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, KeyError> {
        let active = self.store.find_active_signed_prekey(user_id, device_id)?;
        Ok(self.rotation_due(active.as_ref()))
    }

    pub fn get_rotation_recommendations(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<RotationRecommendations, KeyError> {
        let unused = self.store.count_unused(user_id, device_id)?;
        let active = self.store.find_active_signed_prekey(user_id, device_id)?;
        let needs_replenishment = unused < self.policy.low_prekey_threshold;

        Ok(RotationRecommendations {
            needs_pre_key_replenishment: needs_replenishment,
            needs_signed_pre_key_rotation: self.rotation_due(active.as_ref()),
            unused_pre_key_count: unused,
            recommended_upload: if needs_replenishment {
                self.policy.target_prekey_count.saturating_sub(unused)
            } else {
                0
            },
            signed_pre_key_expires_at: active.map(|k| k.expires_at),
        })
    }

    /// Delete signed prekeys that expired more than `grace_period_days` ago.
    ///
    /// Keys that expired more recently are left alone so sessions built on
    /// them can still complete.
    pub fn cleanup_expired_signed_prekeys(
        &self,
        grace_period_days: i64,
    ) -> Result<usize, KeyError> {
        let cutoff = TimeDelta::try_days(grace_period_days)
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .ok_or_else(|| {
                KeyError::Policy(format!(
                    "grace period of {grace_period_days} days is out of range"
                ))
            })?;
        let expired = self.store.find_expired_signed_prekeys()?;

        let mut deleted = 0;
        for key in expired.iter().filter(|k| k.expires_at < cutoff) {
            if self.store.delete_expired_signed_prekey(key.id)? {
                deleted += 1;
            }
        }

        tracing::debug!(
            expired = expired.len(),
            deleted,
            grace_period_days,
            "expired signed prekey cleanup"
        );
        Ok(deleted)
    }

    fn rotation_due(&self, active: Option<&SignedPreKey>) -> bool {
        match active {
            Some(key) => Utc::now()
                .checked_add_signed(self.policy.rotation_window())
                .is_none_or(|deadline| key.expires_at <= deadline),
            None => true,
        }
    }
}

fn log_capacity_rejection(user_id: &str, device_id: &str, err: &KeyError) {
    if let KeyError::Capacity {
        current,
        requested,
        max,
    } = err
    {
        tracing::warn!(
            user = %user_id,
            device = %device_id,
            current,
            requested,
            max,
            "prekey upload rejected: pool cap exceeded"
        );
    }
}
