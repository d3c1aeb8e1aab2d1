//! Storage of the recovery output: keychain entry or document on disk.
//!
//! Exactly one mode is active per snapshot. The keychain keeps only the key
//! string; file mode keeps the whole output document.

use crate::config::FdegateConfig;
use crate::error::{FdegateError, FdegateResult};
use crate::executor::{parse_recovery_output, RecoveryOutput};
use crate::keychain::{SecretEntry, SyncOutcome, TrustStoreSecretSync};
use fdegate_provider::{PrincipalResolver, TrustStore};
use log::{info, warn};
use plist::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Where the secret ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    Keychain(SyncOutcome),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RecoveryStore<S, P> {
    keychain: TrustStoreSecretSync<S, P>,
    entry: SecretEntry,
    output_path: PathBuf,
    use_keychain: bool,
}

impl<S, P> RecoveryStore<S, P>
where
    S: TrustStore,
    P: PrincipalResolver,
{
    pub fn from_config(cfg: &FdegateConfig, store: S, resolver: P) -> Self {
        Self {
            keychain: TrustStoreSecretSync::new(store, resolver, cfg.keychain_path()),
            entry: SecretEntry::from_config(cfg),
            output_path: cfg.output_path(),
            use_keychain: cfg.storage.store_in_keychain,
        }
    }

    pub fn uses_keychain(&self) -> bool {
        self.use_keychain
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn persist(&self, output: &RecoveryOutput) -> FdegateResult<Stored> {
        if self.use_keychain {
            let outcome = self
                .keychain
                .try_reconcile(&self.entry, output.recovery_key.as_str())?;
            Ok(Stored::Keychain(outcome))
        } else {
            write_recovery_document(&self.output_path, output)?;
            Ok(Stored::File(self.output_path.clone()))
        }
    }

    /// Key currently held in the keychain entry.
    pub fn stored_secret(&self) -> FdegateResult<Option<Zeroizing<String>>> {
        self.keychain.lookup(&self.entry.label)
    }

    /// Key held by the active storage mode, if any.
    pub fn current_key(&self) -> FdegateResult<Option<Zeroizing<String>>> {
        if self.use_keychain {
            return self.stored_secret();
        }
        if !self.output_path.exists() {
            return Ok(None);
        }
        Ok(Some(read_recovery_document(&self.output_path)?.recovery_key))
    }

    /// True when the configured storage holds no secret. A failed keychain
    /// lookup counts as missing.
    pub fn secret_missing(&self) -> bool {
        if !self.use_keychain {
            let missing = !self.output_path.exists();
            if missing {
                info!("recovery document {} is absent", self.output_path.display());
            }
            return missing;
        }
        match self.keychain.lookup(&self.entry.label) {
            Ok(Some(_)) => false,
            Ok(None) => {
                info!("no keychain entry labelled [{}]", self.entry.label);
                true
            }
            Err(err) => {
                warn!("treating recovery secret as missing: {err}");
                true
            }
        }
    }
}

/// Atomically write the output document as an XML property list, mode 0600.
pub fn write_recovery_document(path: &Path, output: &RecoveryOutput) -> FdegateResult<()> {
    let mut payload = Zeroizing::new(Vec::new());
    Value::Dictionary(output.document.clone()).to_writer_xml(&mut *payload)?;
    write_private(path, &payload)?;
    info!("recovery document written to {}", path.display());
    Ok(())
}

/// Replace `path` with `payload` through a sibling temp file, mode 0600.
pub(crate) fn write_private(path: &Path, payload: &[u8]) -> FdegateResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(payload)?;
    temp.as_file_mut().flush()?;
    #[cfg(unix)]
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    let _ = temp.as_file().sync_all();
    temp.persist(path)
        .map_err(|err| FdegateError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Load a previously written output document.
pub fn read_recovery_document(path: &Path) -> FdegateResult<RecoveryOutput> {
    let bytes = fs::read(path)?;
    parse_recovery_output(&bytes)
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
