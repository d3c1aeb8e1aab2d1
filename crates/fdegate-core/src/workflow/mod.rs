//! Operator workflows: status, dry-run decisions, drills, rotation and import.

use crate::error::FdegateResult;
use crate::mechanism::{
    Credentials, Decision, EnablementDecisionEngine, LoginAttempt, Stage, StageOutcome,
};
use crate::preferences::PreferenceSource;
use crate::recovery::{read_recovery_document, RecoveryStore, Stored};
use fdegate_provider::{CommandRunner, PrincipalResolver, TrustStore};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn has_errors(&self) -> bool {
        self.events
            .iter()
            .any(|event| event.level == WorkflowLevel::Error)
    }
}

pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Short SHA-256 fingerprint, safe to print.
pub fn fingerprint(secret: &str) -> String {
    let digest = hex::encode(Sha256::digest(secret.as_bytes()));
    digest[..16].to_string()
}

/// Encryption state, host capabilities and where the recovery secret lives.
pub fn status_report<R, S, P, C>(
    engine: &EnablementDecisionEngine<R, S, P, C>,
) -> FdegateResult<WorkflowReport>
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    let cfg = engine.preferences().snapshot()?;
    let mut events = Vec::new();

    let status = engine.status_probe(&cfg).status()?;
    events.push(match (status.encrypted, status.decrypting) {
        (_, true) => event(WorkflowLevel::Warn, "Disk decryption in progress"),
        (true, false) => event(WorkflowLevel::Success, "Disk encryption is on"),
        (false, _) => event(WorkflowLevel::Warn, "Disk encryption is off"),
    });

    let executor = engine.executor(&cfg);
    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Authenticated restart supported: {}",
            executor.supports_auth_restart()
        ),
    ));
    match executor.using_recovery_key() {
        Ok(true) => events.push(event(
            WorkflowLevel::Security,
            "Disk was unlocked with the recovery key",
        )),
        Ok(false) => events.push(event(
            WorkflowLevel::Info,
            "Disk was not unlocked with the recovery key",
        )),
        Err(err) => events.push(event(
            WorkflowLevel::Warn,
            format!("Recovery key usage unknown: {err}"),
        )),
    }

    let store = engine.recovery_store(&cfg);
    events.push(secret_event(&store, &cfg.storage.label));

    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Escrow endpoint configured: {}; key rotated flag: {}",
            cfg.escrow_configured(),
            cfg.rotation.key_rotated
        ),
    ));
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    events.push(match cfg.escrow.last_escrow {
        Some(0) => event(WorkflowLevel::Info, "Escrow of the current key is queued"),
        Some(at) if !cfg.escrow_required(now) => {
            event(WorkflowLevel::Info, format!("Last escrow at {at} (unix time)"))
        }
        _ => event(WorkflowLevel::Warn, "Escrow due"),
    });

    Ok(WorkflowReport {
        title: "fdegate status".to_string(),
        events,
    })
}

fn secret_event<S, P>(store: &RecoveryStore<S, P>, label: &str) -> WorkflowEvent
where
    S: TrustStore,
    P: PrincipalResolver,
{
    if store.uses_keychain() {
        match store.stored_secret() {
            Ok(Some(secret)) => event(
                WorkflowLevel::Success,
                format!(
                    "Recovery key [{label}] present in keychain (sha256 {})",
                    fingerprint(&secret)
                ),
            ),
            Ok(None) => event(
                WorkflowLevel::Warn,
                format!("Recovery key [{label}] missing from keychain"),
            ),
            Err(err) => event(
                WorkflowLevel::Error,
                format!("Keychain lookup failed: {err}"),
            ),
        }
    } else if store.secret_missing() {
        event(
            WorkflowLevel::Warn,
            format!(
                "Recovery document missing at {}",
                store.output_path().display()
            ),
        )
    } else {
        event(
            WorkflowLevel::Success,
            format!(
                "Recovery document present at {}",
                store.output_path().display()
            ),
        )
    }
}

/// What Check would decide for `username` right now. Reads only.
pub fn dry_run_decision<R, S, P, C>(
    engine: &EnablementDecisionEngine<R, S, P, C>,
    username: &str,
) -> FdegateResult<(Decision, WorkflowReport)>
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    let cfg = engine.preferences().snapshot()?;
    let credentials = Credentials {
        username: username.to_string(),
        password: Zeroizing::new(String::new()),
    };
    let decision = engine.decide(&cfg, Some(&credentials))?;
    let level = match decision {
        Decision::Abstain(_) => WorkflowLevel::Info,
        Decision::MarkPending => WorkflowLevel::Security,
        Decision::RotateNow => WorkflowLevel::Warn,
    };
    let report = WorkflowReport {
        title: format!("Check decision for {username}"),
        events: vec![event(level, decision.to_string())],
    };
    Ok((decision, report))
}

/// Drive every stage against an in-memory attempt, stopping at a deny or a
/// restart.
pub fn login_drill<R, S, P, C>(
    engine: &EnablementDecisionEngine<R, S, P, C>,
    attempt: &mut LoginAttempt,
) -> WorkflowReport
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    let mut events = Vec::new();
    for stage in Stage::ORDER {
        let outcome = engine.run_stage(stage, attempt);
        let result = attempt.take_result();
        let (level, message) = match outcome {
            StageOutcome::Allowed => (WorkflowLevel::Success, format!("{stage}: allowed")),
            StageOutcome::Denied => (WorkflowLevel::Error, format!("{stage}: denied")),
            StageOutcome::RestartScheduled => (
                WorkflowLevel::Security,
                format!("{stage}: restart scheduled"),
            ),
        };
        events.push(event(level, message));
        if result.is_none() && outcome != StageOutcome::RestartScheduled {
            events.push(event(
                WorkflowLevel::Warn,
                format!("{stage} returned without a result"),
            ));
        }
        if outcome != StageOutcome::Allowed {
            break;
        }
    }
    attempt.clear_password();
    WorkflowReport {
        title: "Login drill".to_string(),
        events,
    }
}

/// Rotate the recovery key now, regardless of the rotation flags.
pub fn rotate_recovery_key<R, S, P, C>(
    engine: &EnablementDecisionEngine<R, S, P, C>,
    credentials: &Credentials,
) -> FdegateResult<WorkflowReport>
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    let cfg = engine.preferences().snapshot()?;
    let stored = engine.rotate(&cfg, credentials)?;
    Ok(WorkflowReport {
        title: format!("Rotated recovery key for {}", credentials.username),
        events: vec![stored_event(&stored)],
    })
}

/// Reconcile an existing output document into the keychain.
pub fn import_recovery_document<R, S, P, C>(
    engine: &EnablementDecisionEngine<R, S, P, C>,
    path: &Path,
) -> FdegateResult<WorkflowReport>
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    let mut cfg = engine.preferences().snapshot()?;
    cfg.storage.store_in_keychain = true;
    let output = read_recovery_document(path)?;
    let stored = engine.recovery_store(&cfg).persist(&output)?;
    engine.after_persist(&stored);
    let events = vec![
        event(
            WorkflowLevel::Info,
            format!(
                "Read recovery document {} (sha256 {})",
                path.display(),
                fingerprint(&output.recovery_key)
            ),
        ),
        stored_event(&stored),
    ];
    Ok(WorkflowReport {
        title: "Imported recovery document".to_string(),
        events,
    })
}

/// Clear the rotation flag so the next qualifying login may rotate again.
pub fn reset_generation<C: PreferenceSource>(prefs: &C) -> FdegateResult<WorkflowReport> {
    prefs.reset_key_generated()?;
    Ok(WorkflowReport {
        title: "Reset rotation flag".to_string(),
        events: vec![event(
            WorkflowLevel::Success,
            "rotation.key_rotated cleared; the next qualifying login may rotate",
        )],
    })
}

fn stored_event(stored: &Stored) -> WorkflowEvent {
    match stored {
        Stored::Keychain(outcome) => event(
            WorkflowLevel::Security,
            format!("Recovery key reconciled in keychain ({outcome:?})"),
        ),
        Stored::File(path) => event(
            WorkflowLevel::Security,
            format!("Recovery document written to {}", path.display()),
        ),
    }
}

#[cfg(test)]
mod tests;
