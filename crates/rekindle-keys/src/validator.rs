//! Format and business-rule checks for uploaded key material.
//!
//! Everything here except the uniqueness pre-checks is pure. The uniqueness
//! checks are advisory: the store's unique constraint is what actually
//! rejects a racing duplicate.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::entities::{NewPreKey, NewSignedPreKey, PreKeyDto, SignedPreKeyDto};
use crate::policy::KeyPolicy;
use crate::store::KeyStore;
use crate::KeyError;

#[derive(Debug, Clone, Default)]
pub struct KeyValidator {
    policy: KeyPolicy,
}

impl KeyValidator {
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy }
    }

    /// Check that `key` is a base64 string of acceptable length.
    pub fn validate_public_key_format(&self, key: &str) -> Result<(), KeyError> {
        if key.is_empty() {
            return Err(KeyError::Validation("public key is empty".into()));
        }
        if !is_base64_alphabet(key) {
            return Err(KeyError::Validation(
                "public key contains characters outside the base64 alphabet".into(),
            ));
        }
        let len = key.len();
        if len < self.policy.min_key_length || len > self.policy.max_key_length {
            return Err(KeyError::Validation(format!(
                "public key length {len} outside [{}, {}]",
                self.policy.min_key_length, self.policy.max_key_length
            )));
        }
        Ok(())
    }

    pub fn validate_signed_prekey(
        &self,
        dto: &SignedPreKeyDto,
    ) -> Result<NewSignedPreKey, KeyError> {
        let key_id = validate_key_id(dto.key_id)?;
        self.validate_public_key_format(&dto.public_key)?;
        self.validate_signature(&dto.signature)?;
        Ok(NewSignedPreKey {
            key_id,
            public_key: dto.public_key.clone(),
            signature: dto.signature.clone(),
        })
    }

    pub fn validate_prekey(&self, dto: &PreKeyDto) -> Result<NewPreKey, KeyError> {
        let key_id = validate_key_id(dto.key_id)?;
        self.validate_public_key_format(&dto.public_key)?;
        Ok(NewPreKey {
            key_id,
            public_key: dto.public_key.clone(),
        })
    }

    /// Validate a whole upload batch. Fails on the first bad key so nothing
    /// from a bad batch ever reaches the store.
    pub fn validate_prekeys(&self, dtos: &[PreKeyDto]) -> Result<Vec<NewPreKey>, KeyError> {
        if dtos.is_empty() {
            return Err(KeyError::Validation("prekey batch is empty".into()));
        }
        if dtos.len() > self.policy.max_batch_size {
            return Err(KeyError::Validation(format!(
                "prekey batch of {} exceeds the limit of {}",
                dtos.len(),
                self.policy.max_batch_size
            )));
        }

        let mut seen = HashSet::with_capacity(dtos.len());
        let mut keys = Vec::with_capacity(dtos.len());
        for dto in dtos {
            let key = self.validate_prekey(dto)?;
            if !seen.insert(key.key_id) {
                return Err(KeyError::Validation(format!(
                    "duplicate key id {} in batch",
                    key.key_id
                )));
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn validate_signature(&self, signature: &str) -> Result<(), KeyError> {
        if signature.is_empty() {
            return Err(KeyError::Validation("signature is missing".into()));
        }
        if signature.len() > self.policy.max_signature_length {
            return Err(KeyError::Validation(format!(
                "signature longer than {} characters",
                self.policy.max_signature_length
            )));
        }
        STANDARD
            .decode(signature)
            .map_err(|e| KeyError::Validation(format!("signature is not valid base64: {e}")))?;
        Ok(())
    }
}

/// Whether no signed prekey with this id exists yet for the device.
pub fn is_signed_prekey_id_unique(
    store: &dyn KeyStore,
    user_id: &str,
    device_id: &str,
    key_id: u32,
) -> Result<bool, KeyError> {
    Ok(!store.signed_prekey_exists(user_id, device_id, key_id)?)
}

pub fn validate_signed_prekey_id_uniqueness(
    store: &dyn KeyStore,
    user_id: &str,
    device_id: &str,
    key_id: u32,
) -> Result<(), KeyError> {
    if is_signed_prekey_id_unique(store, user_id, device_id, key_id)? {
        Ok(())
    } else {
        Err(KeyError::Conflict(format!(
            "signed prekey id {key_id} already exists for this device"
        )))
    }
}

pub fn is_signed_prekey_expired(expires_at: DateTime<Utc>) -> bool {
    expires_at <= Utc::now()
}

fn validate_key_id(key_id: i64) -> Result<u32, KeyError> {
    u32::try_from(key_id)
        .map_err(|_| {
            KeyError::Validation(format!(
                "key id {key_id} is not a non-negative 32-bit integer"
            ))
        })
}

/// Standard base64 characters with `=` allowed only as trailing padding.
fn is_base64_alphabet(s: &str) -> bool {
    let body = s.trim_end_matches('=');
    s.len() - body.len() <= 2
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}
