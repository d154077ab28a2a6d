//! In-memory [`KeyStore`].
//!
//! Suitable for tests and for embedding where persistence is not needed.
//! Data is lost on process exit. All three collections sit behind one lock,
//! so every operation is trivially atomic.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use super::{capacity_check, cutoff_days, expiry_after, KeyStore};
use crate::entities::{
    DeletedKeys, DeviceAddress, DevicePoolLevel, IdentityKey, NewPreKey, NewSignedPreKey, PreKey,
    SignedPreKey,
};
use crate::KeyError;

#[derive(Default)]
struct Tables {
    identity_keys: HashMap<DeviceAddress, IdentityKey>,
    signed_prekeys: Vec<SignedPreKey>,
    prekeys: Vec<PreKey>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryKeyStore {
    tables: Mutex<Tables>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the creation time of a device's prekeys into the past.
    #[cfg(test)]
    pub(crate) fn backdate_prekeys(&self, user_id: &str, device_id: &str, by: Duration) {
        let mut tables = self.tables.lock();
        for key in tables
            .prekeys
            .iter_mut()
            .filter(|k| k.user_id == user_id && k.device_id == device_id)
        {
            key.created_at -= by;
        }
    }
}

fn owned_by<'a>(user_id: &'a str, device_id: &'a str) -> impl Fn(&&PreKey) -> bool + 'a {
    move |k: &&PreKey| k.user_id == user_id && k.device_id == device_id
}

impl KeyStore for MemoryKeyStore {
    fn upsert_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
        public_key: &str,
    ) -> Result<IdentityKey, KeyError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let entry = tables
            .identity_keys
            .entry(DeviceAddress::new(user_id, device_id))
            .and_modify(|k| {
                k.public_key = public_key.to_string();
                k.updated_at = now;
            })
            .or_insert_with(|| IdentityKey {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                public_key: public_key.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(entry.clone())
    }

    fn find_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<IdentityKey>, KeyError> {
        Ok(self
            .tables
            .lock()
            .identity_keys
            .get(&DeviceAddress::new(user_id, device_id))
            .cloned())
    }

    fn create_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        key: &NewSignedPreKey,
        lifetime: Duration,
    ) -> Result<SignedPreKey, KeyError> {
        let mut tables = self.tables.lock();
        let taken = tables.signed_prekeys.iter().any(|k| {
            k.user_id == user_id && k.device_id == device_id && k.key_id == key.key_id
        });
        if taken {
            return Err(KeyError::Conflict(format!(
                "signed prekey id {} already exists for this device",
                key.key_id
            )));
        }

        let now = Utc::now();
        let expires_at = expiry_after(now, lifetime)?;
        let row = SignedPreKey {
            id: tables.next_id(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            key_id: key.key_id,
            public_key: key.public_key.clone(),
            signature: key.signature.clone(),
            created_at: now,
            expires_at,
        };
        tables.signed_prekeys.push(row.clone());
        Ok(row)
    }

    fn signed_prekey_exists(
        &self,
        user_id: &str,
        device_id: &str,
        key_id: u32,
    ) -> Result<bool, KeyError> {
        Ok(self.tables.lock().signed_prekeys.iter().any(|k| {
            k.user_id == user_id && k.device_id == device_id && k.key_id == key_id
        }))
    }

    fn find_active_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<SignedPreKey>, KeyError> {
        let now = Utc::now();
        Ok(self
            .tables
            .lock()
            .signed_prekeys
            .iter()
            .filter(|k| k.user_id == user_id && k.device_id == device_id && k.expires_at > now)
            .max_by_key(|k| (k.created_at, k.id))
            .cloned())
    }

    fn create_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        keys: &[NewPreKey],
        max_unused: usize,
    ) -> Result<usize, KeyError> {
        let mut tables = self.tables.lock();
        let current = tables
            .prekeys
            .iter()
            .filter(owned_by(user_id, device_id))
            .filter(|k| !k.is_used)
            .count();
        capacity_check(current, keys.len(), max_unused)?;

        // Check the whole batch first so a collision leaves nothing behind.
        for key in keys {
            let taken = tables
                .prekeys
                .iter()
                .filter(owned_by(user_id, device_id))
                .any(|k| k.key_id == key.key_id);
            let repeated = keys.iter().filter(|k| k.key_id == key.key_id).count() > 1;
            if taken || repeated {
                return Err(KeyError::Conflict(format!(
                    "prekey id {} already exists for this device",
                    key.key_id
                )));
            }
        }

        let now = Utc::now();
        for key in keys {
            let id = tables.next_id();
            tables.prekeys.push(PreKey {
                id,
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                key_id: key.key_id,
                public_key: key.public_key.clone(),
                is_one_time: true,
                is_used: false,
                created_at: now,
                used_at: None,
            });
        }
        Ok(keys.len())
    }

    fn claim_unused_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<PreKey>, KeyError> {
        let mut tables = self.tables.lock();
        let candidate = tables
            .prekeys
            .iter_mut()
            .filter(|k| k.user_id == user_id && k.device_id == device_id && !k.is_used)
            .choose(&mut rand::thread_rng());

        Ok(candidate.map(|key| {
            key.is_used = true;
            key.used_at = Some(Utc::now());
            key.clone()
        }))
    }

    fn count_unused(&self, user_id: &str, device_id: &str) -> Result<usize, KeyError> {
        Ok(self
            .tables
            .lock()
            .prekeys
            .iter()
            .filter(owned_by(user_id, device_id))
            .filter(|k| !k.is_used)
            .count())
    }

    fn devices_below_threshold(&self, threshold: usize) -> Result<Vec<DevicePoolLevel>, KeyError> {
        let tables = self.tables.lock();
        let mut levels: Vec<DevicePoolLevel> = tables
            .identity_keys
            .keys()
            .map(|device| DevicePoolLevel {
                device: device.clone(),
                unused_prekeys: tables
                    .prekeys
                    .iter()
                    .filter(owned_by(&device.user_id, &device.device_id))
                    .filter(|k| !k.is_used)
                    .count(),
            })
            .filter(|level| level.unused_prekeys < threshold)
            .collect();
        levels.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(levels)
    }

    fn delete_all_keys_for_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<DeletedKeys, KeyError> {
        let mut tables = self.tables.lock();
        let identity_keys = usize::from(
            tables
                .identity_keys
                .remove(&DeviceAddress::new(user_id, device_id))
                .is_some(),
        );

        let before = tables.signed_prekeys.len();
        tables
            .signed_prekeys
            .retain(|k| !(k.user_id == user_id && k.device_id == device_id));
        let signed_prekeys = before - tables.signed_prekeys.len();

        let before = tables.prekeys.len();
        tables
            .prekeys
            .retain(|k| !(k.user_id == user_id && k.device_id == device_id));
        let prekeys = before - tables.prekeys.len();

        Ok(DeletedKeys {
            identity_keys,
            signed_prekeys,
            prekeys,
        })
    }

    fn delete_all_keys_for_user(&self, user_id: &str) -> Result<DeletedKeys, KeyError> {
        let mut tables = self.tables.lock();

        let before = tables.identity_keys.len();
        tables.identity_keys.retain(|addr, _| addr.user_id != user_id);
        let identity_keys = before - tables.identity_keys.len();

        let before = tables.signed_prekeys.len();
        tables.signed_prekeys.retain(|k| k.user_id != user_id);
        let signed_prekeys = before - tables.signed_prekeys.len();

        let before = tables.prekeys.len();
        tables.prekeys.retain(|k| k.user_id != user_id);
        let prekeys = before - tables.prekeys.len();

        Ok(DeletedKeys {
            identity_keys,
            signed_prekeys,
            prekeys,
        })
    }

    fn find_expired_signed_prekeys(&self) -> Result<Vec<SignedPreKey>, KeyError> {
        let now = Utc::now();
        Ok(self
            .tables
            .lock()
            .signed_prekeys
            .iter()
            .filter(|k| k.is_expired_at(now))
            .cloned()
            .collect())
    }

    fn delete_expired_signed_prekey(&self, id: i64) -> Result<bool, KeyError> {
        let mut tables = self.tables.lock();
        let before = tables.signed_prekeys.len();
        tables.signed_prekeys.retain(|k| k.id != id);
        Ok(tables.signed_prekeys.len() < before)
    }

    fn find_old_unused_prekeys(&self, age_days: i64) -> Result<Vec<PreKey>, KeyError> {
        let cutoff = cutoff_days(age_days);
        Ok(self
            .tables
            .lock()
            .prekeys
            .iter()
            .filter(|k| !k.is_used && k.created_at < cutoff)
            .cloned()
            .collect())
    }

    fn delete_old_unused_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        let cutoff = cutoff_days(age_days);
        let mut tables = self.tables.lock();
        let before = tables.prekeys.len();
        tables
            .prekeys
            .retain(|k| k.is_used || k.created_at >= cutoff);
        Ok(before - tables.prekeys.len())
    }

    fn delete_used_prekeys(&self, age_days: i64) -> Result<usize, KeyError> {
        let cutoff = cutoff_days(age_days);
        let mut tables = self.tables.lock();
        let before = tables.prekeys.len();
        tables
            .prekeys
            .retain(|k| !matches!(k.used_at, Some(used_at) if k.is_used && used_at < cutoff));
        Ok(before - tables.prekeys.len())
    }
}
