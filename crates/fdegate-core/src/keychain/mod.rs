//! Keychain escrow of the recovery secret.

pub mod acl;
pub mod sync;

pub use acl::{AccessControlBuilder, DEFAULT_PARTITIONS};
pub use sync::{SecretEntry, SyncOutcome, TrustStoreSecretSync};
