//! Contract for the login authorization host.
//!
//! The host owns the per-attempt context and drives mechanisms stage by
//! stage. A mechanism reads credentials, exchanges hint values with later
//! stages of the same attempt, and either sets a result or returns without
//! one (the host then keeps waiting, e.g. for a restart).

use std::error::Error;

/// Context values the host exposes to mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Username,
    Password,
    Uid,
    Gid,
}

impl ContextKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKey::Username => "username",
            ContextKey::Password => "password",
            ContextKey::Uid => "uid",
            ContextKey::Gid => "gid",
        }
    }
}

/// Final verdict a mechanism hands back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationResult {
    Allow,
    Deny,
}

pub trait AuthorizationHost {
    type Error: Error + Send + Sync + 'static;

    /// Raw bytes for `key`, or `None` when the host has no value.
    fn context_value(&self, key: ContextKey) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Store a named hint visible to later stages of this attempt only.
    fn set_hint(&mut self, name: &str, value: &[u8]) -> Result<(), Self::Error>;

    fn hint(&self, name: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    fn set_result(&mut self, result: AuthorizationResult) -> Result<(), Self::Error>;

    fn allow(&mut self) -> Result<(), Self::Error> {
        self.set_result(AuthorizationResult::Allow)
    }

    fn deny(&mut self) -> Result<(), Self::Error> {
        self.set_result(AuthorizationResult::Deny)
    }
}
