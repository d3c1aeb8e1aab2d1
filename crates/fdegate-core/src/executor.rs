//! Enablement and rotation through the encryption management tool.
//!
//! Credentials go in as an XML property list on stdin; the tool answers with a
//! property list holding at least the `RecoveryKey` string.

use crate::error::{FdegateError, FdegateResult};
use crate::tool::invoke;
use fdegate_provider::{CommandOutput, CommandRunner};
use log::{error, info, warn};
use plist::{Dictionary, Value};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const RECOVERY_KEY_FIELD: &str = "RecoveryKey";

/// Credentials handed to the tool. Never stored.
#[derive(Clone)]
pub struct EnablementSettings {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl EnablementSettings {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Serialise as the flat string map the tool reads from stdin.
    pub fn to_input_plist(&self) -> FdegateResult<Zeroizing<Vec<u8>>> {
        let mut dict = Dictionary::new();
        dict.insert("Username".into(), Value::String(self.username.clone()));
        dict.insert(
            "Password".into(),
            Value::String(self.password.as_str().to_owned()),
        );
        let mut buf = Zeroizing::new(Vec::new());
        Value::Dictionary(dict).to_writer_xml(&mut *buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for EnablementSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnablementSettings")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parsed output document of an enable or rotate run.
#[derive(Clone)]
pub struct RecoveryOutput {
    pub document: Dictionary,
    pub recovery_key: Zeroizing<String>,
    /// The tool was asked to perform the authenticated restart itself.
    pub auth_restart: bool,
}

impl fmt::Debug for RecoveryOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOutput")
            .field("fields", &self.document.keys().collect::<Vec<_>>())
            .field("auth_restart", &self.auth_restart)
            .finish()
    }
}

/// Parse the tool's output document (XML or binary property list).
pub fn parse_recovery_output(bytes: &[u8]) -> FdegateResult<RecoveryOutput> {
    if bytes.is_empty() {
        return Err(FdegateError::ToolOutputEmpty);
    }
    let value = Value::from_reader(Cursor::new(bytes))
        .map_err(|err| FdegateError::ToolOutputMalformed(err.to_string()))?;
    let document = value.into_dictionary().ok_or_else(|| {
        FdegateError::ToolOutputMalformed("output document is not a dictionary".into())
    })?;
    let recovery_key = document
        .get(RECOVERY_KEY_FIELD)
        .and_then(Value::as_string)
        .map(|key| Zeroizing::new(key.to_owned()))
        .ok_or_else(|| {
            FdegateError::ToolOutputMalformed(format!("missing {RECOVERY_KEY_FIELD} string"))
        })?;
    Ok(RecoveryOutput {
        document,
        recovery_key,
        auth_restart: false,
    })
}

/// Drives the enable / change-recovery subcommands.
#[derive(Debug, Clone)]
pub struct EnablementExecutor<R> {
    runner: R,
    fdesetup: PathBuf,
    institutional_keychain: PathBuf,
}

impl<R: CommandRunner> EnablementExecutor<R> {
    pub fn new(
        runner: R,
        fdesetup: impl Into<PathBuf>,
        institutional_keychain: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            fdesetup: fdesetup.into(),
            institutional_keychain: institutional_keychain.into(),
        }
    }

    /// Whether the platform can restart without asking for the password again.
    /// A failed query counts as unsupported.
    pub fn supports_auth_restart(&self) -> bool {
        match invoke(&self.runner, &self.fdesetup, &["supportsauthrestart"], None) {
            Ok(output) if output.stdout_lossy().contains("true") => {
                info!("authenticated restart is supported");
                true
            }
            Ok(_) => {
                info!("authenticated restart unsupported; falling back to a standard reboot");
                false
            }
            Err(err) => {
                warn!("authenticated restart query failed: {err}");
                false
            }
        }
    }

    /// Whether the disk was last unlocked with the recovery key.
    pub fn using_recovery_key(&self) -> FdegateResult<bool> {
        let output = invoke(&self.runner, &self.fdesetup, &["usingrecoverykey"], None)?;
        Ok(output.stdout_lossy().contains("true"))
    }

    /// Ask the tool whether `key` still unlocks the disk. The answer is read
    /// from stdout even when the exit status is non-zero.
    pub fn validate_recovery(&self, key: &str) -> FdegateResult<bool> {
        let mut dict = Dictionary::new();
        dict.insert("Password".into(), Value::String(key.to_owned()));
        let mut input = Zeroizing::new(Vec::new());
        Value::Dictionary(dict).to_writer_xml(&mut *input)?;

        let output = invoke(
            &self.runner,
            &self.fdesetup,
            &["validaterecovery", "-inputplist"],
            Some(&input),
        )?;
        match output.stdout_lossy().trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ if !output.success() => Err(FdegateError::ToolExecutionFailed {
                exit_code: output.status,
                stderr: output.diagnostic(),
            }),
            other => Err(FdegateError::ToolOutputMalformed(format!(
                "unexpected validaterecovery answer {other:?}"
            ))),
        }
    }

    fn institutional_key_present(&self) -> bool {
        let present = self.institutional_keychain.exists();
        info!(
            "institutional keychain {} {}",
            self.institutional_keychain.display(),
            if present { "present" } else { "absent" }
        );
        present
    }

    /// Arguments for `enable`, conditioned on host capabilities.
    pub fn enable_args(&self) -> (Vec<&'static str>, bool) {
        let mut args = vec!["enable"];
        let auth_restart = self.supports_auth_restart();
        if auth_restart {
            args.push("-authrestart");
        }
        args.extend(["-outputplist", "-inputplist"]);
        if self.institutional_key_present() {
            args.push("-keychain");
        }
        (args, auth_restart)
    }

    /// Turn on disk encryption and capture the recovery document.
    pub fn enable(&self, settings: &EnablementSettings) -> FdegateResult<RecoveryOutput> {
        info!("enabling disk encryption for {}", settings.username);
        let (args, auth_restart) = self.enable_args();
        let mut output = self.run_with_settings(&args, settings)?;
        output.auth_restart = auth_restart;
        Ok(output)
    }

    /// Replace the personal recovery key without disabling encryption.
    pub fn rotate(&self, settings: &EnablementSettings) -> FdegateResult<RecoveryOutput> {
        info!("rotating personal recovery key for {}", settings.username);
        self.run_with_settings(
            &["changerecovery", "-personal", "-outputplist", "-inputplist"],
            settings,
        )
    }

    fn run_with_settings(
        &self,
        args: &[&str],
        settings: &EnablementSettings,
    ) -> FdegateResult<RecoveryOutput> {
        let input = settings.to_input_plist()?;
        let output = invoke(&self.runner, &self.fdesetup, args, Some(&input))?;
        classify_output(&self.fdesetup, &output)
    }
}

fn classify_output(program: &Path, output: &CommandOutput) -> FdegateResult<RecoveryOutput> {
    if !output.success() {
        let stderr = output.diagnostic();
        error!(
            "{} exited with code {}: {}",
            program.display(),
            output.status,
            stderr
        );
        return Err(FdegateError::ToolExecutionFailed {
            exit_code: output.status,
            stderr,
        });
    }
    if output.stdout.is_empty() {
        error!("{} produced no output document", program.display());
        return Err(FdegateError::ToolOutputEmpty);
    }
    parse_recovery_output(&output.stdout)
}
