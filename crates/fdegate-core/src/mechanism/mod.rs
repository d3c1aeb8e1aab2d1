//! Login-time mechanisms and the per-attempt decision engine.
//!
//! The host calls stages in order (`NoRootGate`, `Check`, `Enablement`) for a
//! single login attempt. `Check` leaves its verdict in the `needs-encryption`
//! hint for `Enablement`. Apart from the gate, every stage ends by allowing
//! login or by scheduling a restart; internal failures never deny.

mod attempt;
mod decision;
mod engine;

#[cfg(test)]
mod tests;

use crate::error::FdegateError;
use fdegate_provider::{AuthorizationHost, ContextKey};
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

pub use attempt::LoginAttempt;
pub use decision::{rotation_needed, AbstainReason, Decision};
pub use engine::EnablementDecisionEngine;

/// Hint carrying the Check verdict to the Enablement stage.
pub const NEEDS_ENCRYPTION_HINT: &str = "needs-encryption";

/// Named entry points the host invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    NoRootGate,
    Check,
    Enablement,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::NoRootGate, Stage::Check, Stage::Enablement];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NoRootGate => "NoRootGate",
            Stage::Check => "Check",
            Stage::Enablement => "Enablement",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = FdegateError;

    /// Accepts the bare name or the `plugin:Name` form used in policy rules.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.rsplit(':').next().unwrap_or(name);
        Stage::ORDER
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| FdegateError::UnknownStage(s.to_string()))
    }
}

/// How a stage handed control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Allowed,
    Denied,
    /// No result was set; the machine is about to restart.
    RestartScheduled,
}

/// Username and password read from the attempt context.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Both values, or `None` when either is unavailable.
    pub fn from_host<H: AuthorizationHost>(host: &H) -> Option<Self> {
        let username = context_string(host, ContextKey::Username)?;
        let password = context_string(host, ContextKey::Password)?;
        Some(Self {
            username: username.to_string(),
            password,
        })
    }
}

/// Context value as text with every NUL removed. Host errors read as absent.
pub(crate) fn context_string<H: AuthorizationHost>(
    host: &H,
    key: ContextKey,
) -> Option<Zeroizing<String>> {
    let raw = match host.context_value(key) {
        Ok(Some(raw)) => Zeroizing::new(raw),
        Ok(None) => {
            debug!("context value {} is not set", key.as_str());
            return None;
        }
        Err(err) => {
            warn!("failed to read context value {}: {err}", key.as_str());
            return None;
        }
    };
    match std::str::from_utf8(&raw) {
        Ok(text) => Some(Zeroizing::new(text.replace('\0', ""))),
        Err(_) => {
            warn!("context value {} is not UTF-8", key.as_str());
            None
        }
    }
}

pub(crate) fn encode_flag(value: bool) -> Vec<u8> {
    if value {
        b"true".to_vec()
    } else {
        b"false".to_vec()
    }
}

/// Decode a boolean hint. Missing or unreadable values are `false`.
pub(crate) fn read_flag<H: AuthorizationHost>(host: &H, name: &str) -> bool {
    match host.hint(name) {
        Ok(Some(bytes)) => serde_json::from_slice::<bool>(&bytes).unwrap_or_else(|err| {
            warn!("hint {name} is not a boolean: {err}");
            false
        }),
        Ok(None) => false,
        Err(err) => {
            warn!("failed to read hint {name}: {err}");
            false
        }
    }
}
