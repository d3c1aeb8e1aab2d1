use crate::config::FdegateConfig;
use std::fmt;

/// Why a pass left the machine alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstainReason {
    CredentialsUnavailable,
    Decrypting,
    RotationNotNeeded,
    AlreadyRotated,
    SkippedUser,
    NoEscrowEndpoint,
}

impl fmt::Display for AbstainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbstainReason::CredentialsUnavailable => "credentials unavailable",
            AbstainReason::Decrypting => "decryption in progress",
            AbstainReason::RotationNotNeeded => "encrypted, no rotation needed",
            AbstainReason::AlreadyRotated => "encrypted, key already rotated",
            AbstainReason::SkippedUser => "user is on the skip list",
            AbstainReason::NoEscrowEndpoint => "no escrow endpoint configured",
        };
        f.write_str(text)
    }
}

/// Verdict of the Check stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Abstain(AbstainReason),
    MarkPending,
    RotateNow,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Abstain(reason) => write!(f, "abstain ({reason})"),
            Decision::MarkPending => f.write_str("mark pending"),
            Decision::RotateNow => f.write_str("rotate now"),
        }
    }
}

/// Rotation trigger for an encrypted disk. `secret_missing` is only consulted
/// when the forced flag does not already decide.
pub fn rotation_needed(cfg: &FdegateConfig, secret_missing: impl FnOnce() -> bool) -> bool {
    let rotation = &cfg.rotation;
    rotation.generate_new_key
        || (rotation.rotate_used_key && !rotation.remove_plist && secret_missing())
}
