//! Access objects for stored recovery secrets.
//!
//! A fresh object has three rows: a read row restricted to the resolved
//! readers, an owner row (change-ACL) and the partition row whose description
//! is a hex-encoded property list `{ "Partitions": [..] }`. Merges only extend
//! rows that already exist.

use crate::error::{FdegateError, FdegateResult, TrustStoreOp};
use fdegate_provider::{AccessPolicy, AclEntry, AclOperation, PrincipalResolver, TrustedPrincipal};
use log::{debug, error, info, warn};
use plist::{Dictionary, Value};
use std::io::Cursor;

/// Operations granted to the readers of a new object.
pub const READ_OPERATIONS: &[AclOperation] = &[
    AclOperation::Decrypt,
    AclOperation::Derive,
    AclOperation::ExportClear,
    AclOperation::ExportWrapped,
    AclOperation::Mac,
    AclOperation::Sign,
];

pub const OWNER_OPERATIONS: &[AclOperation] = &[AclOperation::ChangeAcl, AclOperation::ChangeOwner];

/// Partition list every new object starts with.
pub const DEFAULT_PARTITIONS: &[&str] = &["apple-tool:", "apple:"];

const PARTITIONS_KEY: &str = "Partitions";

/// Resolve a platform authorization name, failing closed on unknown names.
pub fn operation_named(name: &str) -> FdegateResult<AclOperation> {
    AclOperation::from_name(name).ok_or_else(|| FdegateError::UnknownAclOperation(name.to_string()))
}

/// Hex-encode `{ "Partitions": ids }` as an XML property list.
pub fn encode_partitions<S: AsRef<str>>(ids: &[S]) -> FdegateResult<String> {
    let array = ids
        .iter()
        .map(|id| Value::String(id.as_ref().to_string()))
        .collect();
    let mut dict = Dictionary::new();
    dict.insert(PARTITIONS_KEY.into(), Value::Array(array));
    let mut buf = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut buf)?;
    Ok(hex::encode(buf))
}

/// Decode a partition row description back into its identifiers.
pub fn decode_partitions(description: &str) -> FdegateResult<Vec<String>> {
    let raw = hex::decode(description.trim()).map_err(|err| {
        FdegateError::trust_store(TrustStoreOp::BuildAccess, format!("partition list: {err}"))
    })?;
    let value = Value::from_reader(Cursor::new(raw))?;
    let partitions = value
        .as_dictionary()
        .and_then(|dict| dict.get(PARTITIONS_KEY))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            FdegateError::trust_store(
                TrustStoreOp::BuildAccess,
                "partition list has no Partitions array",
            )
        })?;
    partitions
        .iter()
        .map(|entry| {
            entry.as_string().map(str::to_string).ok_or_else(|| {
                FdegateError::trust_store(
                    TrustStoreOp::BuildAccess,
                    "partition list contains a non-string entry",
                )
            })
        })
        .collect()
}

/// Union `team_ids` into an encoded partition list. The original encoding is
/// returned untouched when nothing new was added.
pub fn merge_partitions<S: AsRef<str>>(description: &str, team_ids: &[S]) -> FdegateResult<String> {
    let mut partitions = decode_partitions(description)?;
    debug!("existing partitions: {partitions:?}");
    let mut added = false;
    for id in team_ids {
        let id = id.as_ref();
        if !partitions.iter().any(|existing| existing == id) {
            info!("adding team id {id} to partition list");
            partitions.push(id.to_string());
            added = true;
        }
    }
    if !added {
        return Ok(description.to_string());
    }
    encode_partitions(&partitions)
}

/// Union `additions` into `existing`, comparing opaque identities.
pub fn union_principals(
    existing: Option<Vec<TrustedPrincipal>>,
    additions: Vec<TrustedPrincipal>,
) -> Vec<TrustedPrincipal> {
    let mut merged = existing.unwrap_or_default();
    for principal in additions {
        if !merged.iter().any(|known| known.identity == principal.identity) {
            merged.push(principal);
        }
    }
    merged
}

/// Builds and extends access objects using a principal resolver.
#[derive(Debug, Clone)]
pub struct AccessControlBuilder<P> {
    resolver: P,
}

impl<P: PrincipalResolver> AccessControlBuilder<P> {
    pub fn new(resolver: P) -> Self {
        Self { resolver }
    }

    /// Resolve each path, skipping (and logging) the ones that fail.
    pub fn resolve_all<S: AsRef<str>>(&self, paths: &[S]) -> Vec<TrustedPrincipal> {
        paths
            .iter()
            .filter_map(|path| {
                let path = path.as_ref();
                match self.resolver.resolve(path) {
                    Ok(principal) => {
                        debug!("trusted application resolved for [{path}]");
                        Some(principal)
                    }
                    Err(err) => {
                        warn!("skipping trusted application [{path}]: {err}");
                        None
                    }
                }
            })
            .collect()
    }

    /// Base access object. An empty `paths` list leaves the read row open to
    /// every application.
    pub fn build<S: AsRef<str>>(&self, paths: &[S], description: &str) -> FdegateResult<AccessPolicy> {
        let readers = if paths.is_empty() {
            None
        } else {
            Some(self.resolve_all(paths))
        };
        Ok(AccessPolicy {
            description: description.to_string(),
            entries: vec![
                AclEntry {
                    operations: READ_OPERATIONS.to_vec(),
                    principals: readers,
                    description: description.to_string(),
                },
                AclEntry {
                    operations: OWNER_OPERATIONS.to_vec(),
                    principals: Some(Vec::new()),
                    description: description.to_string(),
                },
                AclEntry {
                    operations: vec![AclOperation::PartitionId],
                    principals: None,
                    description: encode_partitions(DEFAULT_PARTITIONS)?,
                },
            ],
        })
    }

    /// Extend every row granting `operation`.
    ///
    /// `principals == None` opens the row to every application. For the
    /// partition row the values are team identifiers merged into the encoded
    /// list and the principal array is left alone. Returns `None` when no row
    /// grants `operation` or a row cannot be rewritten.
    pub fn merge_operation<S: AsRef<str>>(
        &self,
        mut policy: AccessPolicy,
        operation: AclOperation,
        principals: Option<&[S]>,
        description: &str,
    ) -> Option<AccessPolicy> {
        if !policy.has_operation(operation) {
            error!("access object has no row granting {operation}");
            return None;
        }

        let resolved = match principals {
            Some(paths) if operation != AclOperation::PartitionId => Some(self.resolve_all(paths)),
            _ => None,
        };

        for entry in policy.entries_for_mut(operation) {
            match principals {
                Some(team_ids) if entry.grants(AclOperation::PartitionId) => {
                    match merge_partitions(&entry.description, team_ids) {
                        Ok(encoded) => entry.description = encoded,
                        Err(err) => {
                            error!("failed to update partition list: {err}");
                            return None;
                        }
                    }
                }
                Some(_) => {
                    let additions = resolved.clone().unwrap_or_default();
                    entry.principals = Some(union_principals(entry.principals.take(), additions));
                    entry.description = description.to_string();
                }
                None => {
                    entry.principals = None;
                    entry.description = description.to_string();
                }
            }
        }
        Some(policy)
    }

    /// Access object for the recovery secret: readers on the read row, owners
    /// on the change-ACL row, team identifiers in the partition list.
    pub fn recovery_access<S: AsRef<str>>(
        &self,
        readers: &[S],
        owners: &[S],
        team_ids: &[S],
        description: &str,
    ) -> FdegateResult<AccessPolicy> {
        info!("creating access object with description: {description}");
        let base = self.build(readers, description)?;
        let with_owners = self
            .merge_operation(base, AclOperation::ChangeAcl, Some(owners), description)
            .ok_or_else(|| {
                FdegateError::trust_store(TrustStoreOp::BuildAccess, "change-ACL row update failed")
            })?;
        if team_ids.is_empty() {
            return Ok(with_owners);
        }
        self.merge_operation(with_owners, AclOperation::PartitionId, Some(team_ids), description)
            .ok_or_else(|| {
                FdegateError::trust_store(TrustStoreOp::BuildAccess, "partition row update failed")
            })
    }
}
