//! The operations the key subsystem exposes to the rest of the server.
//!
//! Every method takes a `(user_id, device_id)` that the caller has already
//! authenticated. Bundle and status lookups may target any device; uploads
//! and deletions act on the caller's own keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bundle::{KeyBundle, KeyBundleAssembler, PreKeyStatus};
use crate::entities::{
    DeletedKeys, DeviceAddress, IdentityKey, PreKeyDto, SignedPreKey, SignedPreKeyDto,
};
use crate::policy::KeyPolicy;
use crate::rotation::{KeyRotationManager, RotationRecommendations};
use crate::scheduler::{
    HealthSnapshot, MaintenanceScheduler, ManualCleanupReport, SchedulerConfig,
};
use crate::store::KeyStore;
use crate::validator::KeyValidator;
use crate::KeyError;

pub struct KeyService {
    store: Arc<dyn KeyStore>,
    validator: KeyValidator,
    rotation: Arc<KeyRotationManager>,
    bundles: KeyBundleAssembler,
    scheduler: Arc<MaintenanceScheduler>,
}

impl KeyService {
    pub fn new(
        store: Arc<dyn KeyStore>,
        policy: KeyPolicy,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let rotation = Arc::new(KeyRotationManager::new(
            Arc::clone(&store),
            policy.clone(),
        ));
        let scheduler = Arc::new(MaintenanceScheduler::new(
            Arc::clone(&store),
            Arc::clone(&rotation),
            policy.clone(),
            scheduler_config,
        ));
        Self {
            validator: KeyValidator::new(policy.clone()),
            bundles: KeyBundleAssembler::new(Arc::clone(&store), policy),
            store,
            rotation,
            scheduler,
        }
    }

    /// The scheduler backing [`health_snapshot`](Self::health_snapshot), for
    /// spawning its background loops.
    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }

    /// Store the device's identity key, replacing any previous one.
    pub fn upload_identity_key(
        &self,
        user_id: &str,
        device_id: &str,
        public_key: &str,
    ) -> Result<IdentityKey, KeyError> {
        logged("upload_identity_key", user_id, device_id, || {
            self.validator.validate_public_key_format(public_key)?;

            let previous = self.store.find_identity_key(user_id, device_id)?;
            let stored = self
                .store
                .upsert_identity_key(user_id, device_id, public_key)?;
            match previous {
                Some(old) if old.public_key != stored.public_key => tracing::info!(
                    user = %user_id,
                    device = %device_id,
                    "identity key replaced"
                ),
                Some(_) => tracing::debug!(
                    user = %user_id,
                    device = %device_id,
                    "identity key re-uploaded"
                ),
                None => tracing::info!(
                    user = %user_id,
                    device = %device_id,
                    "identity key registered"
                ),
            }
            Ok(stored)
        })
    }

    pub fn upload_signed_prekey(
        &self,
        user_id: &str,
        device_id: &str,
        key: &SignedPreKeyDto,
    ) -> Result<SignedPreKey, KeyError> {
        logged("upload_signed_prekey", user_id, device_id, || {
            self.rotation.rotate_signed_prekey(user_id, device_id, key)
        })
    }

    pub fn upload_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        keys: &[PreKeyDto],
    ) -> Result<usize, KeyError> {
        logged("upload_prekeys", user_id, device_id, || {
            self.rotation.replenish_prekeys(user_id, device_id, keys)
        })
    }

    pub fn get_rotation_recommendations(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<RotationRecommendations, KeyError> {
        logged("get_rotation_recommendations", user_id, device_id, || {
            self.rotation.get_rotation_recommendations(user_id, device_id)
        })
    }

    /// Remove every key of one device. The caller must have confirmed that
    /// `user_id` owns `device_id` with the device registry first.
    pub fn delete_device_keys(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<DeletedKeys, KeyError> {
        logged("delete_device_keys", user_id, device_id, || {
            let deleted = self.store.delete_all_keys_for_device(user_id, device_id)?;
            tracing::info!(
                user = %user_id,
                device = %device_id,
                identity = deleted.identity_keys,
                signed = deleted.signed_prekeys,
                prekeys = deleted.prekeys,
                "device keys deleted"
            );
            Ok(deleted)
        })
    }

    pub fn delete_all_user_keys(&self, user_id: &str) -> Result<DeletedKeys, KeyError> {
        logged("delete_all_user_keys", user_id, "*", || {
            let deleted = self.store.delete_all_keys_for_user(user_id)?;
            tracing::info!(user = %user_id, total = deleted.total(), "all user keys deleted");
            Ok(deleted)
        })
    }

    pub fn get_key_bundle(
        &self,
        target_user_id: &str,
        target_device_id: &str,
    ) -> Result<KeyBundle, KeyError> {
        logged("get_key_bundle", target_user_id, target_device_id, || {
            self.bundles.get_bundle(target_user_id, target_device_id)
        })
    }

    pub fn get_key_bundles(&self, targets: &[DeviceAddress]) -> BTreeMap<DeviceAddress, KeyBundle> {
        self.bundles.get_bundles_for_devices(targets)
    }

    pub fn get_pre_key_status(
        &self,
        target_user_id: &str,
        target_device_id: &str,
    ) -> Result<PreKeyStatus, KeyError> {
        logged("get_pre_key_status", target_user_id, target_device_id, || {
            self.bundles
                .get_pre_key_status(target_user_id, target_device_id)
        })
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.scheduler.health_snapshot()
    }

    pub fn trigger_manual_cleanup(&self) -> ManualCleanupReport {
        self.scheduler.manual_cleanup()
    }
}

/// Run one operation and log it if it failed for a server-side reason.
/// Client errors (validation, conflict, capacity, not found) are the
/// caller's to report.
fn logged<T>(
    op: &'static str,
    user_id: &str,
    device_id: &str,
    f: impl FnOnce() -> Result<T, KeyError>,
) -> Result<T, KeyError> {
    f().inspect_err(|e| {
        if e.is_retryable() {
            tracing::error!(
                op,
                user = %user_id,
                device = %device_id,
                code = e.code(),
                error = %e,
                "key operation failed"
            );
        }
    })
}
