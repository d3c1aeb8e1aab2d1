//! Keychain access through the `security(1)` command-line tool.
//!
//! The CLI can grant read access per application (`-T`) or to everyone
//! (`-A`). It cannot mark items invisible, restrict change-ACL rows or
//! attach a partition list, so those parts of an [`AccessPolicy`] are
//! logged and dropped.

use fdegate_core::error::{FdegateError, FdegateResult};
use fdegate_provider::{
    AccessPolicy, AclOperation, CommandOutput, CommandRunner, NewSecretItem, TrustStore,
};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Exit status `security` uses for "item could not be found".
pub const ITEM_NOT_FOUND: i32 = 44;

#[derive(Debug, Clone)]
pub struct SecurityToolTrustStore<R> {
    runner: R,
    security: PathBuf,
}

impl<R: CommandRunner> SecurityToolTrustStore<R> {
    pub fn new(runner: R, security: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            security: security.into(),
        }
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> FdegateResult<CommandOutput> {
        self.runner
            .run(&self.security, args, stdin)
            .map_err(|err| FdegateError::Provider(format!("{}: {err}", self.security.display())))
    }
}

impl<R: CommandRunner> TrustStore for SecurityToolTrustStore<R> {
    type Error = FdegateError;

    fn find_secret(&self, keychain: Option<&Path>, label: &str) -> FdegateResult<Option<String>> {
        let keychain = keychain.map(|path| path.to_string_lossy().into_owned());
        let mut args = vec!["find-generic-password", "-l", label, "-w"];
        if let Some(path) = keychain.as_deref() {
            args.push(path);
        }

        let out = self.run(&args, None)?;
        match out.status {
            0 => {
                let value = Zeroizing::new(out.stdout_lossy());
                Ok(Some(value.trim_end_matches(['\r', '\n']).to_string()))
            }
            ITEM_NOT_FOUND => Ok(None),
            code => Err(FdegateError::ToolExecutionFailed {
                exit_code: code,
                stderr: out.diagnostic(),
            }),
        }
    }

    fn delete_secret(&self, keychain: &Path, label: &str) -> FdegateResult<()> {
        let keychain = keychain.to_string_lossy();
        let out = self.run(&["delete-generic-password", "-l", label, &keychain], None)?;
        match out.status {
            0 => Ok(()),
            ITEM_NOT_FOUND => {
                debug!("[{label}] already absent from {keychain}");
                Ok(())
            }
            code => Err(FdegateError::ToolExecutionFailed {
                exit_code: code,
                stderr: out.diagnostic(),
            }),
        }
    }

    fn add_secret(&self, keychain: &Path, item: &NewSecretItem) -> FdegateResult<()> {
        let line = Zeroizing::new(add_command(keychain, item));
        let out = self.run(&["-i"], Some(line.as_bytes()))?;
        // Interactive mode exits 0 even when the command inside it fails,
        // reporting the failure on stderr only.
        if !out.success() || !out.stderr.iter().all(u8::is_ascii_whitespace) {
            return Err(FdegateError::ToolExecutionFailed {
                exit_code: out.status,
                stderr: out.diagnostic(),
            });
        }
        info!("added [{}] to {}", item.label, keychain.display());
        Ok(())
    }
}

/// One `add-generic-password` line for `security -i`, so the secret never
/// appears in the process table.
pub fn add_command(keychain: &Path, item: &NewSecretItem) -> String {
    let mut words = vec![
        "add-generic-password".to_string(),
        "-l".to_string(),
        quote(&item.label),
        "-s".to_string(),
        quote(&item.service),
        "-a".to_string(),
        quote(&item.account),
        "-j".to_string(),
        quote(&item.comment),
        "-D".to_string(),
        quote(&item.description),
        "-w".to_string(),
        quote(&item.value),
    ];

    if item.invisible {
        debug!("security(1) cannot mark [{}] invisible", item.label);
    }

    match item.access.as_ref() {
        Some(policy) => words.extend(trusted_app_flags(policy)),
        None => debug!("[{}] created with the default access object", item.label),
    }

    words.push(quote(&keychain.to_string_lossy()));
    let mut line = words.join(" ");
    line.push('\n');
    line
}

fn trusted_app_flags(policy: &AccessPolicy) -> Vec<String> {
    let dropped: Vec<&str> = policy
        .entries
        .iter()
        .filter(|entry| !entry.grants(AclOperation::Decrypt))
        .flat_map(|entry| entry.operations.iter().map(AclOperation::name))
        .collect();
    if !dropped.is_empty() {
        warn!(
            "security(1) cannot express ACL rows for {}; keeping read access only",
            dropped.join(", ")
        );
    }

    let Some(read) = policy.entries_for(AclOperation::Decrypt).next() else {
        return Vec::new();
    };
    match &read.principals {
        None => vec!["-A".to_string()],
        Some(principals) => principals
            .iter()
            .filter(|principal| !principal.path.is_empty())
            .flat_map(|principal| ["-T".to_string(), quote(&principal.path)])
            .collect(),
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}
