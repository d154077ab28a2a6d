//! Key bundle assembly for peers starting a session with a device.
//!
//! Fetching a bundle consumes one one-time prekey when any are left. An
//! exhausted pool still yields a bundle, just without the one-time key.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entities::DeviceAddress;
use crate::policy::KeyPolicy;
use crate::store::KeyStore;
use crate::KeyError;

/// Public keys a peer needs to run X3DH against a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub user_id: String,
    pub device_id: String,
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyPublic,
    /// Absent when the device's one-time prekey pool is exhausted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pre_key: Option<PreKeyPublic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyPublic {
    pub key_id: u32,
    pub public_key: String,
}

/// Pool health for a device, as seen by anyone about to fetch its bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyStatus {
    pub available_pre_keys: usize,
    pub is_low: bool,
    pub has_active_signed_pre_key: bool,
    pub recommended_upload: usize,
}

pub struct KeyBundleAssembler {
    store: Arc<dyn KeyStore>,
    policy: KeyPolicy,
}

impl KeyBundleAssembler {
    pub fn new(store: Arc<dyn KeyStore>, policy: KeyPolicy) -> Self {
        Self { store, policy }
    }

    /// Build a bundle for `(user_id, device_id)`, claiming one prekey.
    pub fn get_bundle(&self, user_id: &str, device_id: &str) -> Result<KeyBundle, KeyError> {
        let identity = self
            .store
            .find_identity_key(user_id, device_id)?
            .ok_or_else(|| {
                KeyError::NotFound("device never registered encryption keys".into())
            })?;

        let signed = self
            .store
            .find_active_signed_prekey(user_id, device_id)?
            .ok_or_else(|| {
                KeyError::NotFound("signed prekey expired or never rotated".into())
            })?;

        let pre_key = self.store.claim_unused_prekey(user_id, device_id)?;
        match &pre_key {
            Some(key) => tracing::debug!(
                user = %user_id,
                device = %device_id,
                key_id = key.key_id,
                "bundle assembled with one-time prekey"
            ),
            None => tracing::warn!(
                user = %user_id,
                device = %device_id,
                "prekey pool exhausted, serving bundle without one-time prekey"
            ),
        }

        Ok(KeyBundle {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            identity_key: identity.public_key,
            signed_pre_key: SignedPreKeyPublic {
                key_id: signed.key_id,
                public_key: signed.public_key,
                signature: signed.signature,
            },
            pre_key: pre_key.map(|k| PreKeyPublic {
                key_id: k.key_id,
                public_key: k.public_key,
            }),
        })
    }

    /// Fetch bundles for several devices. Devices whose bundle fails are
    /// left out of the result rather than failing the whole request.
    pub fn get_bundles_for_devices(
        &self,
        devices: &[DeviceAddress],
    ) -> BTreeMap<DeviceAddress, KeyBundle> {
        let mut bundles = BTreeMap::new();
        for device in devices {
            if bundles.contains_key(device) {
                continue;
            }
            match self.get_bundle(&device.user_id, &device.device_id) {
                Ok(bundle) => {
                    bundles.insert(device.clone(), bundle);
                }
                Err(e) => {
                    tracing::warn!(
                        device = %device,
                        code = e.code(),
                        error = %e,
                        "skipping device in bundle fan-out"
                    );
                }
            }
        }
        bundles
    }

    pub fn get_pre_key_status(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<PreKeyStatus, KeyError> {
        let available = self.store.count_unused(user_id, device_id)?;
        let has_active = self
            .store
            .find_active_signed_prekey(user_id, device_id)?
            .is_some();
        let is_low = available < self.policy.low_prekey_threshold;

        Ok(PreKeyStatus {
            available_pre_keys: available,
            is_low,
            has_active_signed_pre_key: has_active,
            recommended_upload: if is_low {
                self.policy.target_prekey_count.saturating_sub(available)
            } else {
                0
            },
        })
    }
}
