//! Disk encryption status queries.

use crate::error::FdegateResult;
use crate::tool::invoke;
use fdegate_provider::CommandRunner;
use log::{info, warn};
use std::path::PathBuf;

const ON_MARKER: &str = "FileVault is On.";
const OFF_MARKER: &str = "FileVault is Off.";
const DECRYPTING_MARKER: &str = "Decryption in progress";

/// Encryption posture as reported by the status subcommand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptionStatus {
    pub encrypted: bool,
    pub decrypting: bool,
}

impl EncryptionStatus {
    pub const OFF: Self = Self {
        encrypted: false,
        decrypting: false,
    };
    pub const ON: Self = Self {
        encrypted: true,
        decrypting: false,
    };
    pub const DECRYPTING: Self = Self {
        encrypted: true,
        decrypting: true,
    };
}

/// Classify status output. Unrecognised output counts as not encrypted.
///
/// A decryption in flight wins over every other marker, whatever else the
/// report says.
pub fn parse_status(output: &str) -> EncryptionStatus {
    if output.contains(DECRYPTING_MARKER) {
        EncryptionStatus::DECRYPTING
    } else if output.contains(ON_MARKER) {
        EncryptionStatus::ON
    } else if output.contains(OFF_MARKER) {
        EncryptionStatus::OFF
    } else {
        warn!("unrecognised status output, treating disk as unencrypted");
        EncryptionStatus::OFF
    }
}

/// Queries the encryption tool for the current status.
#[derive(Debug, Clone)]
pub struct StatusProbe<R> {
    runner: R,
    fdesetup: PathBuf,
}

impl<R: CommandRunner> StatusProbe<R> {
    pub fn new(runner: R, fdesetup: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            fdesetup: fdesetup.into(),
        }
    }

    /// Fresh status; never cached. Only a failure to run the tool is an error.
    pub fn status(&self) -> FdegateResult<EncryptionStatus> {
        let output = invoke(&self.runner, &self.fdesetup, &["status"], None)?;
        let status = parse_status(&output.stdout_lossy());
        match status {
            EncryptionStatus::OFF => info!("disk encryption is not enabled"),
            EncryptionStatus::DECRYPTING => warn!("disk decryption is in progress"),
            _ => info!("disk encryption is on"),
        }
        Ok(status)
    }
}
