use std::collections::HashSet;

use chrono::Duration;

use super::{KeyStore, MemoryKeyStore};
use crate::entities::{
    DeletedKeys, DevicePoolLevel, IdentityKey, NewPreKey, NewSignedPreKey, PreKey, SignedPreKey,
};
use crate::KeyError;

/// Memory-backed store whose named methods fail with a storage error.
pub struct FailingStore {
    inner: MemoryKeyStore,
    failing: HashSet<&'static str>,
}

impl FailingStore {
    /// Every method fails.
    pub fn broken() -> Self {
        Self::failing(&[
            "upsert_identity_key",
            "find_identity_key",
            "create_signed_prekey",
            "signed_prekey_exists",
            "find_active_signed_prekey",
            "create_prekeys",
            "claim_unused_prekey",
            "count_unused",
            "devices_below_threshold",
            "delete_all_keys_for_device",
            "delete_all_keys_for_user",
            "find_expired_signed_prekeys",
            "delete_expired_signed_prekey",
            "find_old_unused_prekeys",
            "delete_old_unused_prekeys",
            "delete_used_prekeys",
        ])
    }

    /// Only `methods` fail; the rest go to a working memory store.
    pub fn failing(methods: &[&'static str]) -> Self {
        Self {
            inner: MemoryKeyStore::new(),
            failing: methods.iter().copied().collect(),
        }
    }

    pub fn inner(&self) -> &MemoryKeyStore {
        &self.inner
    }

    fn check(&self, method: &'static str) -> Result<(), KeyError> {
        if self.failing.contains(method) {
            return Err(KeyError::Storage("database is locked".into()));
        }
        Ok(())
    }
}

impl KeyStore for FailingStore {
    fn upsert_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
        public_key: &str,
    ) -> Result<IdentityKey, KeyError> {
        self.check("upsert_identity_key")?;
        self.inner.upsert_identity_key(user_id, device_id, public_key)
    }

    fn find_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<IdentityKey>, KeyError> {
        self.check("find_identity_key")?;
        self.inner.find_identity_key(user_id, device_id)
    }

    fn create_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        key: &NewSignedPreKey,
        lifetime: Duration,
    ) -> Result<SignedPreKey, KeyError> {
        self.check("create_signed_prekey")?;
        self.inner.create_signed_prekey(user_id, device_id, key, lifetime)
    }

    fn signed_prekey_exists(
        &self,
        user_id: &str,
        device_id: &str,
        key_id: u32,
    ) -> Result<bool, KeyError> {
        self.check("signed_prekey_exists")?;
        self.inner.signed_prekey_exists(user_id, device_id, key_id)
    }

    fn find_active_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<SignedPreKey>, KeyError> {
        self.check("find_active_signed_prekey")?;
        self.inner.find_active_signed_prekey(user_id, device_id)
    }

    fn create_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        keys: &[NewPreKey],
        max_unused: usize,
    ) -> Result<usize, KeyError> {
        self.check("create_prekeys")?;
        self.inner.create_prekeys(user_id, device_id, keys, max_unused)
    }

    fn claim_unused_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<PreKey>, KeyError> {
        self.check("claim_unused_prekey")?;
        self.inner.claim_unused_prekey(user_id, device_id)
    }

    fn count_unused(&self, user_id: &str, device_id: &str) -> Result<usize, KeyError> {
        self.check("count_unused")?;
        self.inner.count_unused(user_id, device_id)
    }

    fn devices_below_threshold(&self, threshold: usize) -> Result<Vec<DevicePoolLevel>, KeyError> {
        self.check("devices_below_threshold")?;
        self.inner.devices_below_threshold(threshold)
    }

    fn delete_all_keys_for_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<DeletedKeys, KeyError> {
        self.check("delete_all_keys_for_device")?;
        self.inner.delete_all_keys_for_device(user_id, device_id)
    }

    fn delete_all_keys_for_user(&self, user_id: &str) -> Result<DeletedKeys, KeyError> {
        self.check("delete_all_keys_for_user")?;
        self.inner.delete_all_keys_for_user(user_id)
    }

    fn find_expired_signed_prekeys(&self) -> Result<Vec<SignedPreKey>, KeyError> {
        self.check("find_expired_signed_prekeys")?;
        self.inner.find_expired_signed_prekeys()
    }

    fn delete_expired_signed_prekey(&self, id: i64) -> Result<bool, KeyError> {
        self.check("delete_expired_signed_prekey")?;
        self.inner.delete_expired_signed_prekey(id)
    }

    fn find_old_unused_prekeys(&self, age_days: i64) -> Result<Vec<PreKey>, KeyError> {
        self.check("find_old_unused_prekeys")?;
        self.inner.find_old_unused_prekeys(age_days)
    }

    fn delete_old_unused_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        self.check("delete_old_unused_prekeys")?;
        self.inner.delete_old_unused_prekeys(age_days)
    }

    fn delete_used_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        self.check("delete_used_prekeys")?;
        self.inner.delete_used_prekeys(age_days)
    }
}
