//! Configuration model and helpers used by fdegate mechanisms and tooling.

use crate::error::{FdegateError, FdegateResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fdegate.toml";
pub const CONFIG_ENV: &str = "FDEGATE_CONFIG";
const BOOTSTRAP_FILE_NAME: &str = "fdegate.toml";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "grahamgilbert";
const APP_NAME: &str = "fdegate";

/// Accounts that are never forced into encryption, whatever the skip list says.
pub const BUILTIN_SKIP_USERS: &[&str] = &["root", "_mbsetupuser"];

const BOOTSTRAP_TEMPLATE: &str = r#"# fdegate configuration bootstrap.
# Review every value before registering the login mechanisms.

[escrow]
# Presence of an escrow endpoint is what allows enforcement at login.
# server_url = "https://crypt.example.com"
skip_users = []
key_escrow_interval_hours = 1

[rotation]
rotate_used_key = true
validate_key = true
remove_plist = true
generate_new_key = false
key_rotated = false

[storage]
store_in_keychain = true
output_path = "/private/var/root/crypt_output.plist"
keychain_path = "/Library/Keychains/System.keychain"
label = "com.grahamgilbert.crypt.recovery"
service = "com.grahamgilbert.crypt"
account = "com.grahamgilbert.crypt"
invisible = false
prompt_description = "Crypt FileVault Recovery Key"
apps_allowed_to_read = ["/Library/Crypt/checkin"]
apps_allowed_to_change = []
partition_team_ids = []

[tool]
fdesetup_path = "/usr/bin/fdesetup"
security_path = "/usr/bin/security"
reboot_path = "/sbin/reboot"
institutional_keychain_path = "/Library/Keychains/FileVaultMaster.keychain"
restart_delay_secs = 3

[mechanism]
inline_enablement = false
"#;

pub fn bootstrap_template() -> &'static str {
    BOOTSTRAP_TEMPLATE
}

pub fn default_config_path() -> &'static str {
    DEFAULT_CONFIG_PATH
}

/// Where recovery keys go and who may enforce encryption.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EscrowCfg {
    /// Escrow endpoint. When absent, login never forces encryption.
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub skip_users: Vec<String>,

    /// Minimum hours between two escrow runs of the checkin client.
    #[serde(default = "default_escrow_interval")]
    pub key_escrow_interval_hours: u64,

    /// Unix seconds of the last escrow. Zero queues an escrow on the next run.
    #[serde(default)]
    pub last_escrow: Option<u64>,
}

fn default_escrow_interval() -> u64 {
    1
}

impl Default for EscrowCfg {
    fn default() -> Self {
        Self {
            server_url: None,
            skip_users: Vec::new(),
            key_escrow_interval_hours: default_escrow_interval(),
            last_escrow: None,
        }
    }
}

/// Recovery key rotation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RotationCfg {
    /// Rotate when the stored recovery secret has gone missing.
    #[serde(default = "default_true")]
    pub rotate_used_key: bool,

    /// Ask the encryption tool whether the stored key still unlocks the disk
    /// and rotate when it does not.
    #[serde(default = "default_true")]
    pub validate_key: bool,

    /// The escrow client deletes the output document after escrow, so a
    /// missing file is expected and must not trigger rotation.
    #[serde(default = "default_true")]
    pub remove_plist: bool,

    /// Force a new key on the next login, once.
    #[serde(default)]
    pub generate_new_key: bool,

    /// Set after a successful rotation; suppresses further rotations.
    #[serde(default)]
    pub key_rotated: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RotationCfg {
    fn default() -> Self {
        Self {
            rotate_used_key: true,
            validate_key: true,
            remove_plist: true,
            generate_new_key: false,
            key_rotated: false,
        }
    }
}

/// Recovery secret storage and keychain access control.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    /// Keychain mode when true, output document on disk otherwise.
    #[serde(default = "default_true")]
    pub store_in_keychain: bool,

    #[serde(default = "default_output_path")]
    pub output_path: String,

    #[serde(default = "default_keychain_path")]
    pub keychain_path: String,

    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default = "default_service")]
    pub account: String,

    #[serde(default)]
    pub invisible: bool,

    #[serde(default = "default_prompt_description")]
    pub prompt_description: String,

    #[serde(default = "default_readers")]
    pub apps_allowed_to_read: Vec<String>,

    #[serde(default)]
    pub apps_allowed_to_change: Vec<String>,

    /// Signing team identifiers merged into the partition list.
    #[serde(default)]
    pub partition_team_ids: Vec<String>,
}

fn default_output_path() -> String {
    "/private/var/root/crypt_output.plist".to_string()
}

fn default_keychain_path() -> String {
    "/Library/Keychains/System.keychain".to_string()
}

fn default_label() -> String {
    "com.grahamgilbert.crypt.recovery".to_string()
}

fn default_service() -> String {
    "com.grahamgilbert.crypt".to_string()
}

fn default_prompt_description() -> String {
    "Crypt FileVault Recovery Key".to_string()
}

fn default_readers() -> Vec<String> {
    vec!["/Library/Crypt/checkin".to_string()]
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            store_in_keychain: true,
            output_path: default_output_path(),
            keychain_path: default_keychain_path(),
            label: default_label(),
            service: default_service(),
            account: default_service(),
            invisible: false,
            prompt_description: default_prompt_description(),
            apps_allowed_to_read: default_readers(),
            apps_allowed_to_change: Vec::new(),
            partition_team_ids: Vec::new(),
        }
    }
}

/// Paths to the host tools and their execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolCfg {
    #[serde(default = "default_fdesetup_path")]
    pub fdesetup_path: String,

    #[serde(default = "default_security_path")]
    pub security_path: String,

    #[serde(default = "default_reboot_path")]
    pub reboot_path: String,

    #[serde(default = "default_institutional_keychain")]
    pub institutional_keychain_path: String,

    /// Upper bound for a single tool invocation. Unset waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

fn default_fdesetup_path() -> String {
    "/usr/bin/fdesetup".to_string()
}

fn default_security_path() -> String {
    "/usr/bin/security".to_string()
}

fn default_reboot_path() -> String {
    "/sbin/reboot".to_string()
}

fn default_institutional_keychain() -> String {
    "/Library/Keychains/FileVaultMaster.keychain".to_string()
}

fn default_restart_delay() -> u64 {
    3
}

impl Default for ToolCfg {
    fn default() -> Self {
        Self {
            fdesetup_path: default_fdesetup_path(),
            security_path: default_security_path(),
            reboot_path: default_reboot_path(),
            institutional_keychain_path: default_institutional_keychain(),
            timeout_secs: None,
            restart_delay_secs: default_restart_delay(),
        }
    }
}

/// Deployment mode for the Check stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MechanismCfg {
    /// Run enablement inside Check instead of deferring to the Enablement stage.
    #[serde(default)]
    pub inline_enablement: bool,
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FdegateConfig {
    #[serde(default)]
    pub escrow: EscrowCfg,

    #[serde(default)]
    pub rotation: RotationCfg,

    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default)]
    pub tool: ToolCfg,

    #[serde(default)]
    pub mechanism: MechanismCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so the state file matches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl FdegateConfig {
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the global default cannot be created (not running as root), a
    /// per-user copy is written to the platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> FdegateResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("fdegate config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(FdegateError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    FdegateError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/fdegate.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    FdegateError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!("fdegate config bootstrap created at {}", user_path.display());
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk and detect its format by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> FdegateResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = format_for(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;
        Ok(cfg)
    }

    /// True when an escrow endpoint is configured (non-blank).
    pub fn escrow_configured(&self) -> bool {
        self.escrow
            .server_url
            .as_deref()
            .map(str::trim)
            .map(|url| !url.is_empty())
            .unwrap_or(false)
    }

    /// Whether the checkin client is due to escrow at `now` (unix seconds).
    pub fn escrow_required(&self, now: u64) -> bool {
        match self.escrow.last_escrow {
            None | Some(0) => true,
            Some(last) => {
                now.saturating_sub(last) >= self.escrow.key_escrow_interval_hours.saturating_mul(3600)
            }
        }
    }

    /// True for built-in bootstrap accounts and configured skip-list entries.
    pub fn is_skipped_user(&self, username: &str) -> bool {
        if BUILTIN_SKIP_USERS.contains(&username) {
            return true;
        }
        self.escrow
            .skip_users
            .iter()
            .any(|user| user.trim() == username)
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.output_path)
    }

    pub fn keychain_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.keychain_path)
    }

    pub fn fdesetup_path(&self) -> PathBuf {
        PathBuf::from(&self.tool.fdesetup_path)
    }

    pub fn security_path(&self) -> PathBuf {
        PathBuf::from(&self.tool.security_path)
    }

    pub fn reboot_path(&self) -> PathBuf {
        PathBuf::from(&self.tool.reboot_path)
    }

    pub fn institutional_keychain_path(&self) -> PathBuf {
        PathBuf::from(&self.tool.institutional_keychain_path)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool.timeout_secs.map(Duration::from_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.tool.restart_delay_secs)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(url) = &self.escrow.server_url {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                issues.push("escrow.server_url is set but blank".to_string());
            } else if !trimmed.starts_with("https://") && !trimmed.starts_with("http://") {
                issues.push(format!("escrow.server_url is not an http(s) URL: {trimmed}"));
            }
        }

        if self.escrow.skip_users.iter().any(|u| u.trim().is_empty()) {
            issues.push("escrow.skip_users contains an empty entry".to_string());
        }

        if !self.storage.store_in_keychain && !Path::new(&self.storage.output_path).is_absolute()
        {
            issues.push("storage.output_path must be an absolute path".to_string());
        }

        if self.storage.store_in_keychain {
            if self.storage.label.trim().is_empty() {
                issues.push("storage.label must not be empty".to_string());
            }
            if !Path::new(&self.storage.keychain_path).is_absolute() {
                issues.push("storage.keychain_path must be an absolute path".to_string());
            }
        }

        for (key, paths) in [
            ("storage.apps_allowed_to_read", &self.storage.apps_allowed_to_read),
            ("storage.apps_allowed_to_change", &self.storage.apps_allowed_to_change),
        ] {
            for entry in paths {
                if !entry.is_empty() && !Path::new(entry).is_absolute() {
                    issues.push(format!("{key} contains a relative path: {entry}"));
                }
            }
        }

        if self
            .storage
            .partition_team_ids
            .iter()
            .any(|id| id.trim().is_empty())
        {
            issues.push("storage.partition_team_ids contains an empty entry".to_string());
        }

        if self.tool.timeout_secs == Some(0) {
            issues.push("tool.timeout_secs must be greater than 0 when set".to_string());
        }

        issues
    }
}

pub(crate) fn format_for(path: &Path) -> ConfigFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            ConfigFormat::Yaml
        }
        _ => ConfigFormat::Toml,
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(BOOTSTRAP_TEMPLATE.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o640 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
