use fdegate_core::error::{FdegateError, FdegateResult};
use fdegate_provider::{PrincipalResolver, TrustedPrincipal};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

/// Resolves application paths to principals identified by the SHA-256 of
/// the binary. The empty path names the running executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPrincipalResolver;

impl PrincipalResolver for SystemPrincipalResolver {
    type Error = FdegateError;

    fn resolve(&self, path: &str) -> FdegateResult<TrustedPrincipal> {
        let target = if path.is_empty() {
            std::env::current_exe()?
        } else {
            PathBuf::from(path)
        };
        let canonical = fs::canonicalize(&target).map_err(|err| {
            FdegateError::Provider(format!("cannot resolve {}: {err}", target.display()))
        })?;
        let contents = fs::read(&canonical)?;
        Ok(TrustedPrincipal {
            path: canonical.to_string_lossy().into_owned(),
            identity: Sha256::digest(&contents).to_vec(),
        })
    }
}
