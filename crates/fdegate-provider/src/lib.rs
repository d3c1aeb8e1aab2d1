#![forbid(unsafe_code)]

//! Boundary contracts shared across fdegate.
//!
//! The core crate expresses its decision and escrow logic against these
//! traits only; concrete integrations (processes, the keychain, the login
//! window host) live elsewhere so the logic stays testable.

pub mod command;
pub mod host;
pub mod trust;

pub use command::{CommandOutput, CommandRunner};
pub use host::{AuthorizationHost, AuthorizationResult, ContextKey};
pub use trust::{
    AccessPolicy, AclEntry, AclOperation, NewSecretItem, PrincipalResolver, TrustStore,
    TrustedPrincipal,
};
