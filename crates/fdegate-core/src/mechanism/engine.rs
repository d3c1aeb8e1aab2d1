use super::decision::{rotation_needed, AbstainReason, Decision};
use super::{encode_flag, read_flag, Credentials, Stage, StageOutcome, NEEDS_ENCRYPTION_HINT};
use crate::config::FdegateConfig;
use crate::error::{FdegateError, FdegateResult};
use crate::executor::{EnablementExecutor, EnablementSettings, RecoveryOutput};
use crate::preferences::PreferenceSource;
use crate::recovery::{RecoveryStore, Stored};
use crate::status::StatusProbe;
use crate::tool::invoke;
use fdegate_provider::{AuthorizationHost, CommandRunner, PrincipalResolver, TrustStore};
use log::{error, info, warn};
use std::thread;

/// Per-attempt state machine over the encryption tool, the recovery storage
/// and the preference source.
///
/// Collaborators are borrowed per pass; every pass reads one fresh snapshot.
#[derive(Debug, Clone)]
pub struct EnablementDecisionEngine<R, S, P, C> {
    runner: R,
    store: S,
    resolver: P,
    prefs: C,
}

impl<R, S, P, C> EnablementDecisionEngine<R, S, P, C>
where
    R: CommandRunner,
    S: TrustStore,
    P: PrincipalResolver,
    C: PreferenceSource,
{
    pub fn new(runner: R, store: S, resolver: P, prefs: C) -> Self {
        Self {
            runner,
            store,
            resolver,
            prefs,
        }
    }

    pub fn preferences(&self) -> &C {
        &self.prefs
    }

    pub fn status_probe(&self, cfg: &FdegateConfig) -> StatusProbe<&R> {
        StatusProbe::new(&self.runner, cfg.fdesetup_path())
    }

    pub fn executor(&self, cfg: &FdegateConfig) -> EnablementExecutor<&R> {
        EnablementExecutor::new(
            &self.runner,
            cfg.fdesetup_path(),
            cfg.institutional_keychain_path(),
        )
    }

    pub fn recovery_store(&self, cfg: &FdegateConfig) -> RecoveryStore<&S, &P> {
        RecoveryStore::from_config(cfg, &self.store, &self.resolver)
    }

    /// Run one named stage against `host`.
    pub fn run_stage<H: AuthorizationHost>(&self, stage: Stage, host: &mut H) -> StageOutcome {
        info!("mechanism stage {stage} invoked");
        let outcome = match stage {
            Stage::NoRootGate => self.no_root_gate(host),
            Stage::Check => self.check(host),
            Stage::Enablement => self.enablement(host),
        };
        info!("mechanism stage {stage} finished: {outcome:?}");
        outcome
    }

    /// Hard deny for the root account or an empty password.
    pub fn no_root_gate<H: AuthorizationHost>(&self, host: &mut H) -> StageOutcome {
        let username = super::context_string(host, fdegate_provider::ContextKey::Username);
        let password = super::context_string(host, fdegate_provider::ContextKey::Password);
        let is_root = username.as_deref().map(String::as_str) == Some("root");
        let empty_password = password.as_ref().map_or(true, |p| p.is_empty());
        if is_root || empty_password {
            warn!(
                "denying login: {}",
                if is_root { "root account" } else { "empty password" }
            );
            finish(host, StageOutcome::Denied)
        } else {
            finish(host, StageOutcome::Allowed)
        }
    }

    /// The decision for this attempt. Reads status and storage; no writes.
    pub fn decide(
        &self,
        cfg: &FdegateConfig,
        credentials: Option<&Credentials>,
    ) -> FdegateResult<Decision> {
        let Some(credentials) = credentials else {
            return Ok(Decision::Abstain(AbstainReason::CredentialsUnavailable));
        };

        let status = self.status_probe(cfg).status()?;
        if status.decrypting {
            return Ok(Decision::Abstain(AbstainReason::Decrypting));
        }

        if status.encrypted {
            let recovery = self.recovery_store(cfg);
            let stale = || {
                recovery.secret_missing()
                    || (cfg.rotation.validate_key && self.stored_key_rejected(cfg, &recovery))
            };
            if !rotation_needed(cfg, stale) {
                return Ok(Decision::Abstain(AbstainReason::RotationNotNeeded));
            }
            if cfg.rotation.key_rotated {
                return Ok(Decision::Abstain(AbstainReason::AlreadyRotated));
            }
            return Ok(Decision::RotateNow);
        }

        if cfg.is_skipped_user(&credentials.username) {
            return Ok(Decision::Abstain(AbstainReason::SkippedUser));
        }
        if !cfg.escrow_configured() {
            return Ok(Decision::Abstain(AbstainReason::NoEscrowEndpoint));
        }
        Ok(Decision::MarkPending)
    }

    /// True only when the tool answers that the stored key no longer unlocks
    /// the disk. Lookup or tool failures keep the key.
    fn stored_key_rejected(&self, cfg: &FdegateConfig, recovery: &RecoveryStore<&S, &P>) -> bool {
        let key = match recovery.current_key() {
            Ok(Some(key)) => key,
            Ok(None) => return false,
            Err(err) => {
                warn!("stored recovery key unreadable, skipping validation: {err}");
                return false;
            }
        };
        match self.executor(cfg).validate_recovery(&key) {
            Ok(true) => false,
            Ok(false) => {
                warn!("stored recovery key no longer unlocks the disk");
                true
            }
            Err(err) => {
                warn!("recovery key validation failed, keeping the stored key: {err}");
                false
            }
        }
    }

    /// Check stage. Writes the `needs-encryption` hint and allows login,
    /// unless inline enablement starts a restart.
    pub fn check<H: AuthorizationHost>(&self, host: &mut H) -> StageOutcome {
        match self.try_check(host) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("check failed, allowing login: {err}");
                set_needs_encryption(host, false);
                finish(host, StageOutcome::Allowed)
            }
        }
    }

    fn try_check<H: AuthorizationHost>(&self, host: &mut H) -> FdegateResult<StageOutcome> {
        let cfg = self.prefs.snapshot()?;
        let credentials = Credentials::from_host(host);
        let decision = self.decide(&cfg, credentials.as_ref())?;
        info!("check decision: {decision}");

        match (decision, credentials) {
            (Decision::MarkPending, Some(credentials)) => {
                set_needs_encryption(host, true);
                if !cfg.mechanism.inline_enablement {
                    return Ok(finish(host, StageOutcome::Allowed));
                }
                Ok(self.enable_or_allow(&cfg, &credentials, host))
            }
            (Decision::RotateNow, Some(credentials)) => {
                set_needs_encryption(host, false);
                if let Err(err) = self.rotate(&cfg, &credentials) {
                    error!("recovery key rotation failed: {err}");
                }
                Ok(finish(host, StageOutcome::Allowed))
            }
            _ => {
                set_needs_encryption(host, false);
                Ok(finish(host, StageOutcome::Allowed))
            }
        }
    }

    /// Enablement stage. Acts only when Check left the hint set.
    pub fn enablement<H: AuthorizationHost>(&self, host: &mut H) -> StageOutcome {
        if !read_flag(host, NEEDS_ENCRYPTION_HINT) {
            info!("encryption not requested for this attempt");
            return finish(host, StageOutcome::Allowed);
        }
        let Some(credentials) = Credentials::from_host(host) else {
            warn!("credentials unavailable at enablement, allowing login");
            return finish(host, StageOutcome::Allowed);
        };
        let cfg = match self.prefs.snapshot() {
            Ok(cfg) => cfg,
            Err(err) => {
                error!("configuration unavailable at enablement, allowing login: {err}");
                return finish(host, StageOutcome::Allowed);
            }
        };
        self.enable_or_allow(&cfg, &credentials, host)
    }

    fn enable_or_allow<H: AuthorizationHost>(
        &self,
        cfg: &FdegateConfig,
        credentials: &Credentials,
        host: &mut H,
    ) -> StageOutcome {
        match self.enable(cfg, credentials) {
            Ok(output) => match self.restart(cfg, &output) {
                Ok(()) => StageOutcome::RestartScheduled,
                Err(err) => {
                    error!("restart could not be started, allowing login: {err}");
                    set_needs_encryption(host, false);
                    finish(host, StageOutcome::Allowed)
                }
            },
            Err(err) => {
                error!("enabling disk encryption failed, allowing login: {err}");
                set_needs_encryption(host, false);
                finish(host, StageOutcome::Allowed)
            }
        }
    }

    /// Turn on encryption and store the recovery output. A storage failure is
    /// logged; the disk is already encrypting at that point.
    pub fn enable(
        &self,
        cfg: &FdegateConfig,
        credentials: &Credentials,
    ) -> FdegateResult<RecoveryOutput> {
        let settings = settings_for(credentials);
        let output = self.executor(cfg).enable(&settings)?;
        match self.recovery_store(cfg).persist(&output) {
            Ok(stored) => self.after_persist(&stored),
            Err(err) => error!("recovery key could not be stored: {err}"),
        }
        Ok(output)
    }

    /// Replace the recovery key, store it and record the rotation.
    pub fn rotate(&self, cfg: &FdegateConfig, credentials: &Credentials) -> FdegateResult<Stored> {
        let settings = settings_for(credentials);
        let output = self.executor(cfg).rotate(&settings)?;
        let stored = self.recovery_store(cfg).persist(&output)?;
        self.after_persist(&stored);
        self.prefs.mark_key_generated()?;
        info!("recovery key rotated; further rotations suppressed");
        Ok(stored)
    }

    /// A fresh key in the keychain queues an escrow on the next checkin run.
    pub(crate) fn after_persist(&self, stored: &Stored) {
        match stored {
            Stored::Keychain(outcome) => {
                info!("recovery key kept in keychain ({outcome:?})");
                if let Err(err) = self.prefs.record_last_escrow(0) {
                    warn!("failed to queue escrow of the new key: {err}");
                }
            }
            Stored::File(path) => info!("recovery document kept at {}", path.display()),
        }
    }

    /// With authenticated restart the tool restarts the machine itself.
    fn restart(&self, cfg: &FdegateConfig, output: &RecoveryOutput) -> FdegateResult<()> {
        if output.auth_restart {
            info!("authenticated restart requested from the encryption tool");
            return Ok(());
        }
        thread::sleep(cfg.restart_delay());
        info!("restarting after enabling encryption");
        let result = invoke(&self.runner, &cfg.reboot_path(), &[], None)?;
        if !result.success() {
            return Err(FdegateError::ToolExecutionFailed {
                exit_code: result.status,
                stderr: result.diagnostic(),
            });
        }
        Ok(())
    }
}

fn settings_for(credentials: &Credentials) -> EnablementSettings {
    EnablementSettings {
        username: credentials.username.clone(),
        password: credentials.password.clone(),
    }
}

fn set_needs_encryption<H: AuthorizationHost>(host: &mut H, value: bool) {
    if let Err(err) = host.set_hint(NEEDS_ENCRYPTION_HINT, &encode_flag(value)) {
        warn!("failed to set {NEEDS_ENCRYPTION_HINT} hint: {err}");
    }
}

/// Hand the verdict to the host. A restart leaves the result unset.
fn finish<H: AuthorizationHost>(host: &mut H, outcome: StageOutcome) -> StageOutcome {
    let result = match outcome {
        StageOutcome::Allowed => host.allow(),
        StageOutcome::Denied => host.deny(),
        StageOutcome::RestartScheduled => Ok(()),
    };
    if let Err(err) = result {
        error!("host rejected mechanism result {outcome:?}: {err}");
    }
    outcome
}
