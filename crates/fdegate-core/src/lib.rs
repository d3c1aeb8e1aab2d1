//! Core building blocks shared by fdegate binaries.
//!
//! Configuration, the login decision engine, enablement and recovery key
//! escrow live here so downstream crates only wire in system integrations
//! and operator surfaces.

pub mod config;
pub mod error;
pub mod executor;
pub mod keychain;
pub mod logging;
pub mod mechanism;
pub mod preferences;
pub mod recovery;
pub mod status;
pub mod workflow;

mod tool;

#[cfg(test)]
mod test_support;

pub use config::{ConfigFormat, FdegateConfig};
pub use error::{FdegateError, FdegateResult, TrustStoreOp};
pub use executor::{EnablementExecutor, EnablementSettings, RecoveryOutput};
pub use keychain::{AccessControlBuilder, SecretEntry, SyncOutcome, TrustStoreSecretSync};
pub use mechanism::{
    Credentials, Decision, EnablementDecisionEngine, LoginAttempt, Stage, StageOutcome,
};
pub use preferences::{FilePreferences, MemoryPreferences, PreferenceSource};
pub use recovery::{RecoveryStore, Stored};
pub use status::{EncryptionStatus, StatusProbe};
