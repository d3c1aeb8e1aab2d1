use super::*;
use crate::config::FdegateConfig;
use crate::mechanism::{AbstainReason, EnablementDecisionEngine};
use crate::preferences::MemoryPreferences;
use crate::test_support::{recovery_plist, MemoryStore, ScriptedRunner, StaticResolver};
use std::fs;
use tempfile::tempdir;

fn config_in(dir: &Path) -> FdegateConfig {
    let mut cfg = FdegateConfig::default();
    cfg.escrow.server_url = Some("https://crypt.example.com".into());
    cfg.storage.output_path = dir.join("crypt_output.plist").display().to_string();
    cfg.tool.institutional_keychain_path = dir.join("none.keychain").display().to_string();
    cfg.tool.restart_delay_secs = 0;
    cfg
}

#[test]
fn fingerprint_is_short_and_stable() {
    let first = fingerprint("AAAA-BBBB");
    assert_eq!(first.len(), 16);
    assert_eq!(first, fingerprint("AAAA-BBBB"));
    assert_ne!(first, fingerprint("AAAA-BBBC"));
}

#[test]
fn status_report_describes_keychain_secret() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.respond("status", 0, b"FileVault is On.\n");
    runner.respond("supportsauthrestart", 0, b"true\n");
    runner.respond("usingrecoverykey", 0, b"false\n");
    let store = MemoryStore::new();
    store.seed("com.grahamgilbert.crypt.recovery", "STORED");
    let prefs = MemoryPreferences::new(config_in(dir.path()));
    let engine = EnablementDecisionEngine::new(&runner, &store, StaticResolver::new(), &prefs);

    let report = status_report(&engine).unwrap();
    assert!(!report.has_errors());
    let text: Vec<_> = report.events.iter().map(|e| e.message.as_str()).collect();
    assert!(text.contains(&"Disk encryption is on"));
    assert!(text.contains(&"Authenticated restart supported: true"));
    assert!(text
        .iter()
        .any(|line| line.contains(&fingerprint("STORED"))));
    assert!(!text.iter().any(|line| line.contains("STORED")));
    assert!(text.contains(&"Escrow due"));

    prefs.record_last_escrow(0).unwrap();
    let report = status_report(&engine).unwrap();
    assert!(report
        .events
        .iter()
        .any(|e| e.message == "Escrow of the current key is queued"));
}

#[test]
fn dry_run_has_no_side_effects() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.respond("status", 0, b"FileVault is Off.\n");
    let store = MemoryStore::new();
    let prefs = MemoryPreferences::new(config_in(dir.path()));
    let engine = EnablementDecisionEngine::new(&runner, &store, StaticResolver::new(), &prefs);

    let (decision, report) = dry_run_decision(&engine, "_mbsetupuser").unwrap();
    assert_eq!(decision, Decision::Abstain(AbstainReason::SkippedUser));
    assert_eq!(report.events.len(), 1);
    let (decision, _) = dry_run_decision(&engine, "alice").unwrap();
    assert_eq!(decision, Decision::MarkPending);
    assert_eq!(runner.calls().len(), 2);
}

#[test]
fn drill_stops_at_the_gate_for_root() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let store = MemoryStore::new();
    let prefs = MemoryPreferences::new(config_in(dir.path()));
    let engine = EnablementDecisionEngine::new(&runner, &store, StaticResolver::new(), &prefs);

    let mut attempt = LoginAttempt::new("root", "pw");
    let report = login_drill(&engine, &mut attempt);
    assert_eq!(report.events.len(), 1);
    assert!(report.has_errors());
    assert!(runner.calls().is_empty());
}

#[test]
fn drill_runs_every_stage_and_restarts() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.respond("status", 0, b"FileVault is Off.\n");
    runner.respond("supportsauthrestart", 0, b"false\n");
    runner.respond("enable", 0, &recovery_plist("DRILL"));
    runner.respond("", 0, b"");
    let store = MemoryStore::new();
    let prefs = MemoryPreferences::new(config_in(dir.path()));
    let engine = EnablementDecisionEngine::new(&runner, &store, StaticResolver::new(), &prefs);

    let mut attempt = LoginAttempt::new("alice", "pw");
    let report = login_drill(&engine, &mut attempt);
    let levels: Vec<_> = report.events.iter().map(|e| e.level).collect();
    assert_eq!(
        levels,
        vec![
            WorkflowLevel::Success,
            WorkflowLevel::Success,
            WorkflowLevel::Security
        ]
    );
    assert_eq!(
        store.item("com.grahamgilbert.crypt.recovery").unwrap().value,
        "DRILL"
    );
}

#[test]
fn import_reconciles_document_into_keychain() {
    let dir = tempdir().unwrap();
    let document = dir.path().join("crypt_output.plist");
    fs::write(&document, recovery_plist("IMPORTED")).unwrap();
    let mut cfg = config_in(dir.path());
    cfg.storage.store_in_keychain = false;
    let runner = ScriptedRunner::new();
    let store = MemoryStore::new();
    let prefs = MemoryPreferences::new(cfg);
    let engine = EnablementDecisionEngine::new(&runner, &store, StaticResolver::new(), &prefs);

    let report = import_recovery_document(&engine, &document).unwrap();
    assert_eq!(report.events.len(), 2);
    assert_eq!(
        store.item("com.grahamgilbert.crypt.recovery").unwrap().value,
        "IMPORTED"
    );
    assert_eq!(prefs.snapshot().unwrap().escrow.last_escrow, Some(0));
    import_recovery_document(&engine, &document).unwrap();
    assert_eq!(store.state.lock().unwrap().adds, 1);
}

#[test]
fn reset_generation_clears_the_flag() {
    let mut cfg = FdegateConfig::default();
    cfg.rotation.key_rotated = true;
    let prefs = MemoryPreferences::new(cfg);
    reset_generation(&prefs).unwrap();
    assert!(!prefs.snapshot().unwrap().rotation.key_rotated);
}
