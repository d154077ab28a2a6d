//! Persistence for identity keys, signed prekeys, and one-time prekeys.
//!
//! [`KeyStore`] is the seam the rotation, bundle, and maintenance layers are
//! built on. Two implementations ship with the crate:
//! [`SqliteKeyStore`] for the daemon and [`MemoryKeyStore`] for tests and
//! embedding.

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod test_stores;

use chrono::{DateTime, Duration, TimeDelta, Utc};

use crate::entities::{
    DeletedKeys, DevicePoolLevel, IdentityKey, NewPreKey, NewSignedPreKey, PreKey, SignedPreKey,
};
use crate::KeyError;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

/// Storage contract for the key lifecycle.
///
/// Implementations must enforce `(user, device, key_id)` uniqueness on both
/// prekey collections themselves and report a violation as
/// [`KeyError::Conflict`]. [`KeyStore::claim_unused_prekey`] must be a single
/// atomic step per device.
pub trait KeyStore: Send + Sync {
    /// Store or replace the identity key of a device.
    fn upsert_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
        public_key: &str,
    ) -> Result<IdentityKey, KeyError>;

    fn find_identity_key(&self, user_id: &str, device_id: &str)
        -> Result<Option<IdentityKey>, KeyError>;

    /// Insert a signed prekey expiring `lifetime` from now.
    fn create_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        key: &NewSignedPreKey,
        lifetime: Duration,
    ) -> Result<SignedPreKey, KeyError>;

    fn signed_prekey_exists(&self, user_id: &str, device_id: &str, key_id: u32)
        -> Result<bool, KeyError>;

    /// Most recently created signed prekey that has not expired yet.
    fn find_active_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<SignedPreKey>, KeyError>;

    /// Insert a batch of one-time prekeys. All or nothing.
    ///
    /// Fails with [`KeyError::Capacity`] when the device would end up with
    /// more than `max_unused` unused prekeys. Counting the pool and
    /// inserting happen in one atomic step, so concurrent uploads cannot
    /// both pass the cap.
    fn create_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        keys: &[NewPreKey],
        max_unused: usize,
    ) -> Result<usize, KeyError>;

    /// Pick one unused prekey and mark it used in the same atomic step.
    fn claim_unused_prekey(&self, user_id: &str, device_id: &str)
        -> Result<Option<PreKey>, KeyError>;

    fn count_unused(&self, user_id: &str, device_id: &str) -> Result<usize, KeyError>;

    /// Every device with an identity key whose unused pool is below
    /// `threshold`, including devices with no prekeys at all.
    fn devices_below_threshold(&self, threshold: usize) -> Result<Vec<DevicePoolLevel>, KeyError>;

    fn delete_all_keys_for_device(&self, user_id: &str, device_id: &str)
        -> Result<DeletedKeys, KeyError>;

    fn delete_all_keys_for_user(&self, user_id: &str) -> Result<DeletedKeys, KeyError>;

    /// Signed prekeys whose `expires_at` has passed.
    fn find_expired_signed_prekeys(&self) -> Result<Vec<SignedPreKey>, KeyError>;

    /// Delete one signed prekey by row id. Returns whether a row was removed.
    fn delete_expired_signed_prekey(&self, id: i64) -> Result<bool, KeyError>;

    /// Unused prekeys created more than `age_days` ago.
    fn find_old_unused_prekeys(&self, age_days: i64) -> Result<Vec<PreKey>, KeyError>;

    fn delete_old_unused_prekeys(&self, age_days: i64) -> Result<usize, KeyError>;

    /// Used prekeys handed out more than `age_days` ago.
    fn delete_used_prekeys(&self, age_days: i64) -> Result<usize, KeyError>;
}

/// `now - age_days`, clamped to the earliest representable time.
fn cutoff_days(age_days: i64) -> DateTime<Utc> {
    TimeDelta::try_days(age_days)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + lifetime`, or a policy error if that is not a valid time.
fn expiry_after(now: DateTime<Utc>, lifetime: Duration) -> Result<DateTime<Utc>, KeyError> {
    now.checked_add_signed(lifetime)
        .ok_or_else(|| KeyError::Policy("signed prekey lifetime out of range".into()))
}

fn capacity_check(current: usize, requested: usize, max: usize) -> Result<(), KeyError> {
    if current.saturating_add(requested) > max {
        return Err(KeyError::Capacity {
            current,
            requested,
            max,
        });
    }
    Ok(())
}
