#![forbid(unsafe_code)]

//! Host integrations for fdegate.
//!
//! - process execution for `fdesetup` and `reboot`
//! - the keychain via `security(1)`
//! - application principals resolved from binaries on disk

mod command;
mod keychain;
mod resolver;

pub use command::SystemCommandRunner;
pub use keychain::{add_command, SecurityToolTrustStore, ITEM_NOT_FOUND};
pub use resolver::SystemPrincipalResolver;

use fdegate_core::{EnablementDecisionEngine, FdegateResult, PreferenceSource};

/// Engine wired to the real host.
pub type SystemEngine<C> = EnablementDecisionEngine<
    SystemCommandRunner,
    SecurityToolTrustStore<SystemCommandRunner>,
    SystemPrincipalResolver,
    C,
>;

/// Build an engine from the current preference snapshot's tool settings.
pub fn system_engine<C: PreferenceSource>(prefs: C) -> FdegateResult<SystemEngine<C>> {
    let cfg = prefs.snapshot()?;
    let runner = SystemCommandRunner::new(cfg.tool_timeout());
    let store = SecurityToolTrustStore::new(runner.clone(), cfg.security_path());
    Ok(EnablementDecisionEngine::new(
        runner,
        store,
        SystemPrincipalResolver,
        prefs,
    ))
}
