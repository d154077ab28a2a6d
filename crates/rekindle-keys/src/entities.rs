//! Stored key records and the upload shapes clients send.
//!
//! `publicKey` and `signature` values are opaque encoded strings; this crate
//! never decodes them into curve points.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `(user, device)` pair that owns a set of keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Long-term identity key of a device. One per `(user, device)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub user_id: String,
    pub device_id: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Medium-term signed prekey. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    /// Store-assigned row id.
    pub id: i64,
    pub user_id: String,
    pub device_id: String,
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedPreKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One-time prekey. `is_used` flips false -> true exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKey {
    /// Store-assigned row id.
    pub id: i64,
    pub user_id: String,
    pub device_id: String,
    pub key_id: u32,
    pub public_key: String,
    pub is_one_time: bool,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    /// Set when the key was handed out in a bundle.
    pub used_at: Option<DateTime<Utc>>,
}

/// Signed prekey as uploaded by a client, before validation.
///
/// `key_id` is kept signed so that negative ids surface as a validation
/// error instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyDto {
    pub key_id: i64,
    pub public_key: String,
    pub signature: String,
}

/// One-time prekey as uploaded by a client, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyDto {
    pub key_id: i64,
    pub public_key: String,
}

/// A validated signed prekey ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignedPreKey {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

/// A validated one-time prekey ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPreKey {
    pub key_id: u32,
    pub public_key: String,
}

/// Row counts removed by a device or user key deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedKeys {
    pub identity_keys: usize,
    pub signed_prekeys: usize,
    pub prekeys: usize,
}

impl DeletedKeys {
    pub fn total(&self) -> usize {
        self.identity_keys + self.signed_prekeys + self.prekeys
    }
}

/// A device whose unused prekey pool is below some threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePoolLevel {
    pub device: DeviceAddress,
    pub unused_prekeys: usize,
}
