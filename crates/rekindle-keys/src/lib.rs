//! Key lifecycle for Rekindle's asynchronous session setup.
//!
//! Devices upload a long-term identity key, a rotating signed prekey, and a
//! pool of one-time prekeys. Peers fetch a [`KeyBundle`] to start an X3DH
//! handshake with a device that may be offline; each bundle consumes one
//! one-time prekey. A [`MaintenanceScheduler`] keeps the pool bounded and
//! expired keys out of the store.

pub mod bundle;
pub mod entities;
pub mod error;
pub mod policy;
pub mod rotation;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod validator;

pub use bundle::{KeyBundle, KeyBundleAssembler, PreKeyStatus};
pub use entities::{DeviceAddress, IdentityKey, PreKey, PreKeyDto, SignedPreKey, SignedPreKeyDto};
pub use error::KeyError;
pub use policy::KeyPolicy;
pub use rotation::{KeyRotationManager, RotationRecommendations};
pub use scheduler::{HealthSnapshot, MaintenanceScheduler, ManualCleanupReport, SchedulerConfig};
pub use service::KeyService;
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore};
pub use validator::KeyValidator;
