//! Error taxonomy shared by fdegate crates.

use std::fmt;
use thiserror::Error;

/// Trust-store operation that failed, carried by [`FdegateError::TrustStoreOperationFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStoreOp {
    Lookup,
    Add,
    Delete,
    BuildAccess,
}

impl fmt::Display for TrustStoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrustStoreOp::Lookup => "lookup",
            TrustStoreOp::Add => "add",
            TrustStoreOp::Delete => "delete",
            TrustStoreOp::BuildAccess => "build access",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum FdegateError {
    #[error("external tool exited with code {exit_code}: {stderr}")]
    ToolExecutionFailed { exit_code: i32, stderr: String },

    #[error("external tool produced no output")]
    ToolOutputEmpty,

    #[error("external tool output is malformed: {0}")]
    ToolOutputMalformed(String),

    #[error("trust store {op} failed: {message}")]
    TrustStoreOperationFailed { op: TrustStoreOp, message: String },

    #[error("configuration value missing: {0}")]
    ConfigurationValueMissing(String),

    #[error("login credentials are unavailable")]
    CredentialsUnavailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown mechanism stage: {0}")]
    UnknownStage(String),

    #[error("unknown ACL authorization: {0}")]
    UnknownAclOperation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("toml encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FdegateError {
    pub(crate) fn trust_store(op: TrustStoreOp, err: impl fmt::Display) -> Self {
        FdegateError::TrustStoreOperationFailed {
            op,
            message: err.to_string(),
        }
    }
}

pub type FdegateResult<T> = Result<T, FdegateError>;
