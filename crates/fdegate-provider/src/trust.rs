//! Trust-store contract and the access-control model attached to stored secrets.
//!
//! An [`AccessPolicy`] mirrors what the platform keeps on a keychain item: a
//! list of ACL rows, each granting one or more authorization operations to a
//! set of trusted principals (or to everyone when the set is absent).

use std::error::Error;
use std::fmt;
use std::path::Path;

/// Authorization operations an ACL row can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclOperation {
    Any,
    Login,
    GenKey,
    Delete,
    ExportWrapped,
    ExportClear,
    ImportWrapped,
    ImportClear,
    Sign,
    Encrypt,
    Decrypt,
    Mac,
    Derive,
    KeychainCreate,
    KeychainDelete,
    KeychainItemRead,
    KeychainItemInsert,
    KeychainItemModify,
    KeychainItemDelete,
    ChangeAcl,
    ChangeOwner,
    Integrity,
    PartitionId,
}

const AUTHORIZATION_TABLE: &[(&str, AclOperation)] = &[
    ("ACLAuthorizationAny", AclOperation::Any),
    ("ACLAuthorizationLogin", AclOperation::Login),
    ("ACLAuthorizationGenKey", AclOperation::GenKey),
    ("ACLAuthorizationDelete", AclOperation::Delete),
    ("ACLAuthorizationExportWrapped", AclOperation::ExportWrapped),
    ("ACLAuthorizationExportClear", AclOperation::ExportClear),
    ("ACLAuthorizationImportWrapped", AclOperation::ImportWrapped),
    ("ACLAuthorizationImportClear", AclOperation::ImportClear),
    ("ACLAuthorizationSign", AclOperation::Sign),
    ("ACLAuthorizationEncrypt", AclOperation::Encrypt),
    ("ACLAuthorizationDecrypt", AclOperation::Decrypt),
    ("ACLAuthorizationMAC", AclOperation::Mac),
    ("ACLAuthorizationDerive", AclOperation::Derive),
    ("ACLAuthorizationKeychainCreate", AclOperation::KeychainCreate),
    ("ACLAuthorizationKeychainDelete", AclOperation::KeychainDelete),
    ("ACLAuthorizationKeychainItemRead", AclOperation::KeychainItemRead),
    ("ACLAuthorizationKeychainItemInsert", AclOperation::KeychainItemInsert),
    ("ACLAuthorizationKeychainItemModify", AclOperation::KeychainItemModify),
    ("ACLAuthorizationKeychainItemDelete", AclOperation::KeychainItemDelete),
    ("ACLAuthorizationChangeACL", AclOperation::ChangeAcl),
    ("ACLAuthorizationChangeOwner", AclOperation::ChangeOwner),
    ("ACLAuthorizationIntegrity", AclOperation::Integrity),
    ("ACLAuthorizationPartitionID", AclOperation::PartitionId),
];

impl AclOperation {
    /// Platform name of the operation (`ACLAuthorization...`).
    pub fn name(&self) -> &'static str {
        AUTHORIZATION_TABLE
            .iter()
            .find(|(_, op)| op == self)
            .map(|(name, _)| *name)
            .unwrap_or("ACLAuthorizationAny")
    }

    /// Resolve an operation from its platform name. Both the constant form
    /// (`kSecACLAuthorizationChangeACL`) and the short form
    /// (`ACLAuthorizationChangeACL`) are accepted; anything else is `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        let short = trimmed.strip_prefix("kSec").unwrap_or(trimmed);
        AUTHORIZATION_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == short)
            .map(|(_, op)| *op)
    }

    pub fn all() -> impl Iterator<Item = AclOperation> {
        AUTHORIZATION_TABLE.iter().map(|(_, op)| *op)
    }
}

impl fmt::Display for AclOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An application the store trusts, identified by an opaque byte identity.
///
/// `path` is kept for display and for stores that address principals by
/// path; equality for merge purposes goes through `identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPrincipal {
    pub path: String,
    pub identity: Vec<u8>,
}

/// One ACL row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub operations: Vec<AclOperation>,
    /// `None` grants the operations to every application.
    pub principals: Option<Vec<TrustedPrincipal>>,
    /// Prompt text, or for the partition row the encoded partition list.
    pub description: String,
}

impl AclEntry {
    pub fn grants(&self, operation: AclOperation) -> bool {
        self.operations.contains(&operation)
    }
}

/// Access object attached to a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    pub description: String,
    pub entries: Vec<AclEntry>,
}

impl AccessPolicy {
    pub fn entries_for(&self, operation: AclOperation) -> impl Iterator<Item = &AclEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.grants(operation))
    }

    pub fn entries_for_mut(
        &mut self,
        operation: AclOperation,
    ) -> impl Iterator<Item = &mut AclEntry> {
        self.entries
            .iter_mut()
            .filter(move |entry| entry.grants(operation))
    }

    pub fn has_operation(&self, operation: AclOperation) -> bool {
        self.entries_for(operation).next().is_some()
    }
}

/// Attributes for a generic secret entry about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSecretItem {
    pub label: String,
    pub value: String,
    pub comment: String,
    pub description: String,
    pub invisible: bool,
    pub service: String,
    pub account: String,
    pub access: Option<AccessPolicy>,
}

/// Named generic-secret storage (keychain-equivalent).
pub trait TrustStore {
    type Error: Error + Send + Sync + 'static;

    /// Value of the entry with `label`, searching only `keychain` when given.
    fn find_secret(&self, keychain: Option<&Path>, label: &str)
        -> Result<Option<String>, Self::Error>;

    fn delete_secret(&self, keychain: &Path, label: &str) -> Result<(), Self::Error>;

    fn add_secret(&self, keychain: &Path, item: &NewSecretItem) -> Result<(), Self::Error>;
}

/// Turns an application path into a trusted principal.
///
/// An empty path names the calling binary itself.
pub trait PrincipalResolver {
    type Error: Error + Send + Sync + 'static;

    fn resolve(&self, path: &str) -> Result<TrustedPrincipal, Self::Error>;
}

impl<T: PrincipalResolver + ?Sized> PrincipalResolver for &T {
    type Error = T::Error;

    fn resolve(&self, path: &str) -> Result<TrustedPrincipal, Self::Error> {
        (**self).resolve(path)
    }
}

impl<T: TrustStore + ?Sized> TrustStore for &T {
    type Error = T::Error;

    fn find_secret(
        &self,
        keychain: Option<&Path>,
        label: &str,
    ) -> Result<Option<String>, Self::Error> {
        (**self).find_secret(keychain, label)
    }

    fn delete_secret(&self, keychain: &Path, label: &str) -> Result<(), Self::Error> {
        (**self).delete_secret(keychain, label)
    }

    fn add_secret(&self, keychain: &Path, item: &NewSecretItem) -> Result<(), Self::Error> {
        (**self).add_secret(keychain, item)
    }
}
