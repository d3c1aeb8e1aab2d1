//! Idempotent reconciliation of the recovery secret in the trust store.

use super::acl::AccessControlBuilder;
use crate::config::FdegateConfig;
use crate::error::{FdegateError, FdegateResult, TrustStoreOp};
use fdegate_provider::{NewSecretItem, PrincipalResolver, TrustStore};
use log::{error, info};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const RECOVERY_COMMENT: &str = "FileVault recovery key generated by Crypt. Do NOT Delete!";
pub const RECOVERY_KIND: &str = "recovery key";

/// Desired attributes and access lists of the stored secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEntry {
    pub label: String,
    pub service: String,
    pub account: String,
    pub comment: String,
    pub kind: String,
    pub invisible: bool,
    /// Shown by the store when an untrusted application asks for the item.
    pub prompt_description: String,
    pub readers: Vec<String>,
    pub writers: Vec<String>,
    pub team_ids: Vec<String>,
}

impl SecretEntry {
    /// Entry described by the storage section. The calling binary is always
    /// added to both readers and writers.
    pub fn from_config(cfg: &FdegateConfig) -> Self {
        let storage = &cfg.storage;
        let mut readers = storage.apps_allowed_to_read.clone();
        readers.push(String::new());
        let mut writers = storage.apps_allowed_to_change.clone();
        writers.push(String::new());
        Self {
            label: storage.label.clone(),
            service: storage.service.clone(),
            account: storage.account.clone(),
            comment: RECOVERY_COMMENT.to_string(),
            kind: RECOVERY_KIND.to_string(),
            invisible: storage.invisible,
            prompt_description: storage.prompt_description.clone(),
            readers,
            writers,
            team_ids: storage.partition_team_ids.clone(),
        }
    }
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Unchanged,
    Replaced,
}

/// Keeps one named secret in a keychain file in line with the desired value.
#[derive(Debug, Clone)]
pub struct TrustStoreSecretSync<S, P> {
    store: S,
    access: AccessControlBuilder<P>,
    keychain: PathBuf,
}

impl<S, P> TrustStoreSecretSync<S, P>
where
    S: TrustStore,
    P: PrincipalResolver,
{
    pub fn new(store: S, resolver: P, keychain: impl Into<PathBuf>) -> Self {
        Self {
            store,
            access: AccessControlBuilder::new(resolver),
            keychain: keychain.into(),
        }
    }

    pub fn keychain(&self) -> &Path {
        &self.keychain
    }

    /// Current value stored under `label`, if any.
    pub fn lookup(&self, label: &str) -> FdegateResult<Option<Zeroizing<String>>> {
        self.store
            .find_secret(Some(&self.keychain), label)
            .map(|found| found.map(Zeroizing::new))
            .map_err(|err| FdegateError::trust_store(TrustStoreOp::Lookup, err))
    }

    /// Bring the stored entry in line with `value`.
    ///
    /// A differing entry is deleted and recreated; updating in place against a
    /// populated ACL makes the store prompt interactively.
    pub fn try_reconcile(&self, entry: &SecretEntry, value: &str) -> FdegateResult<SyncOutcome> {
        let existing = self.lookup(&entry.label)?;
        let outcome = match existing {
            Some(current) if current.as_str() == value => {
                info!("stored secret [{}] is already current", entry.label);
                return Ok(SyncOutcome::Unchanged);
            }
            Some(_) => {
                info!(
                    "stored secret [{}] differs; deleting before recreate",
                    entry.label
                );
                self.store
                    .delete_secret(&self.keychain, &entry.label)
                    .map_err(|err| FdegateError::trust_store(TrustStoreOp::Delete, err))?;
                SyncOutcome::Replaced
            }
            None => SyncOutcome::Created,
        };
        self.create(entry, value)?;
        Ok(outcome)
    }

    /// Boolean form used at the login boundary; failures are logged only.
    pub fn reconcile(&self, entry: &SecretEntry, value: &str) -> bool {
        match self.try_reconcile(entry, value) {
            Ok(outcome) => {
                info!("secret [{}] reconciled: {outcome:?}", entry.label);
                true
            }
            Err(err) => {
                error!("failed to reconcile secret [{}]: {err}", entry.label);
                false
            }
        }
    }

    fn create(&self, entry: &SecretEntry, value: &str) -> FdegateResult<()> {
        let access = self.access.recovery_access(
            &entry.readers,
            &entry.writers,
            &entry.team_ids,
            &entry.prompt_description,
        )?;
        let item = NewSecretItem {
            label: entry.label.clone(),
            value: value.to_string(),
            comment: entry.comment.clone(),
            description: entry.kind.clone(),
            invisible: entry.invisible,
            service: entry.service.clone(),
            account: entry.account.clone(),
            access: Some(access),
        };
        self.store
            .add_secret(&self.keychain, &item)
            .map_err(|err| FdegateError::trust_store(TrustStoreOp::Add, err))?;
        info!(
            "stored secret [{}] in {}",
            entry.label,
            self.keychain.display()
        );
        Ok(())
    }
}
