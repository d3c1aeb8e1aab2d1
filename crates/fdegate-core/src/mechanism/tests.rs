use super::*;
use crate::config::FdegateConfig;
use crate::preferences::{MemoryPreferences, PreferenceSource};
use crate::test_support::{
    recovery_plist, FailingRunner, MemoryStore, ScriptedRunner, StaticResolver,
};
use fdegate_provider::AuthorizationResult;
use std::path::Path;
use tempfile::{tempdir, TempDir};

const OFF: &[u8] = b"FileVault is Off.\n";
const ON: &[u8] = b"FileVault is On.\n";
const DECRYPTING: &[u8] = b"FileVault is On.\nDecryption in progress: Percent completed = 40.2\n";

type Engine<'a> =
    EnablementDecisionEngine<&'a ScriptedRunner, &'a MemoryStore, StaticResolver, &'a MemoryPreferences>;

struct Fixture {
    runner: ScriptedRunner,
    store: MemoryStore,
    prefs: MemoryPreferences,
    _dir: TempDir,
}

impl Fixture {
    fn new(configure: impl FnOnce(&mut FdegateConfig, &Path)) -> Self {
        let dir = tempdir().unwrap();
        let mut cfg = FdegateConfig::default();
        cfg.escrow.server_url = Some("https://crypt.example.com".into());
        cfg.storage.store_in_keychain = false;
        cfg.storage.output_path = dir.path().join("crypt_output.plist").display().to_string();
        cfg.tool.institutional_keychain_path = dir.path().join("absent.keychain").display().to_string();
        cfg.tool.restart_delay_secs = 0;
        configure(&mut cfg, dir.path());
        Self {
            runner: ScriptedRunner::new(),
            store: MemoryStore::new(),
            prefs: MemoryPreferences::new(cfg),
            _dir: dir,
        }
    }

    fn engine(&self) -> Engine<'_> {
        EnablementDecisionEngine::new(&self.runner, &self.store, StaticResolver::new(), &self.prefs)
    }

    fn config(&self) -> FdegateConfig {
        self.prefs.snapshot().unwrap()
    }

    fn output_path(&self) -> std::path::PathBuf {
        self.config().output_path()
    }
}

fn decide(fixture: &Fixture, username: &str) -> Decision {
    let credentials = Credentials {
        username: username.into(),
        password: zeroize::Zeroizing::new("pw".into()),
    };
    fixture
        .engine()
        .decide(&fixture.config(), Some(&credentials))
        .unwrap()
}

#[test]
fn stage_names_parse_with_or_without_plugin_prefix() {
    assert_eq!("Check".parse::<Stage>().unwrap(), Stage::Check);
    assert_eq!("Crypt:Enablement".parse::<Stage>().unwrap(), Stage::Enablement);
    assert_eq!("noRootGate".parse::<Stage>().unwrap(), Stage::NoRootGate);
    assert!(matches!(
        "Crypt:Prompt".parse::<Stage>(),
        Err(FdegateError::UnknownStage(_))
    ));
}

#[test]
fn gate_denies_root_and_empty_passwords() {
    let fixture = Fixture::new(|_, _| {});
    let engine = fixture.engine();

    let mut root = LoginAttempt::new("root", "secret");
    assert_eq!(engine.no_root_gate(&mut root), StageOutcome::Denied);
    assert_eq!(root.result(), Some(AuthorizationResult::Deny));

    let mut empty = LoginAttempt::new("alice", "");
    assert_eq!(engine.no_root_gate(&mut empty), StageOutcome::Denied);

    let mut missing = LoginAttempt::new("alice", "pw").without_password();
    assert_eq!(engine.no_root_gate(&mut missing), StageOutcome::Denied);

    let mut alice = LoginAttempt::new("alice", "pw");
    assert_eq!(engine.no_root_gate(&mut alice), StageOutcome::Allowed);
    assert_eq!(alice.result(), Some(AuthorizationResult::Allow));
    assert!(fixture.runner.calls().is_empty());
}

#[test]
fn missing_credentials_abstain_without_querying_status() {
    let fixture = Fixture::new(|_, _| {});
    let engine = fixture.engine();
    assert_eq!(
        engine.decide(&fixture.config(), None).unwrap(),
        Decision::Abstain(AbstainReason::CredentialsUnavailable)
    );

    let mut attempt = LoginAttempt::anonymous();
    assert_eq!(engine.check(&mut attempt), StageOutcome::Allowed);
    assert!(!fixture.runner.invoked("status"));
}

#[test]
fn decrypting_always_abstains() {
    let fixture = Fixture::new(|cfg, _| {
        cfg.rotation.generate_new_key = true;
        cfg.rotation.remove_plist = false;
    });
    fixture.runner.respond("status", 0, DECRYPTING);
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::Decrypting)
    );

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::Allowed);
    assert!(!fixture.runner.invoked("changerecovery"));
    assert!(!fixture.runner.invoked("enable"));
}

#[test]
fn decryption_reported_with_off_marker_abstains() {
    let fixture = Fixture::new(|_, _| {});
    fixture.runner.respond(
        "status",
        0,
        b"FileVault is Off.\nDecryption in progress: Percent completed = 40\n",
    );
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::Decrypting)
    );

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::Allowed);
    assert!(!read_flag(&attempt, NEEDS_ENCRYPTION_HINT));
    assert!(!fixture.runner.invoked("enable"));
}

#[test]
fn context_values_drop_embedded_nuls() {
    let attempt = LoginAttempt::new("al\0ice\0", "p\0w\0\0");
    let credentials = Credentials::from_host(&attempt).unwrap();
    assert_eq!(credentials.username, "alice");
    assert_eq!(credentials.password.as_str(), "pw");
}

#[test]
fn skip_list_users_abstain() {
    let fixture = Fixture::new(|cfg, _| cfg.escrow.skip_users = vec![" admin ".into()]);
    fixture.runner.respond("status", 0, OFF);
    for user in ["root", "_mbsetupuser", "admin"] {
        assert_eq!(
            decide(&fixture, user),
            Decision::Abstain(AbstainReason::SkippedUser),
            "{user}"
        );
    }
    assert_eq!(decide(&fixture, "alice"), Decision::MarkPending);
}

#[test]
fn no_escrow_endpoint_abstains() {
    let fixture = Fixture::new(|cfg, _| cfg.escrow.server_url = None);
    fixture.runner.respond("status", 0, OFF);
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::NoEscrowEndpoint)
    );
}

#[test]
fn status_failure_fails_open() {
    let fixture = Fixture::new(|_, _| {});
    let broken = EnablementDecisionEngine::new(
        FailingRunner,
        &fixture.store,
        StaticResolver::new(),
        &fixture.prefs,
    );
    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(broken.check(&mut attempt), StageOutcome::Allowed);
    assert_eq!(attempt.result(), Some(AuthorizationResult::Allow));
    assert!(!read_flag(&attempt, NEEDS_ENCRYPTION_HINT));
}

#[test]
fn pending_then_enablement_schedules_restart() {
    let fixture = Fixture::new(|_, _| {});
    fixture.runner.respond("status", 0, OFF);
    fixture.runner.respond("supportsauthrestart", 0, b"false\n");
    fixture.runner.respond("enable", 0, &recovery_plist("ENABLE-KEY"));
    fixture.runner.respond("", 0, b"");
    let engine = fixture.engine();

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(engine.run_stage(Stage::NoRootGate, &mut attempt), StageOutcome::Allowed);
    assert_eq!(engine.run_stage(Stage::Check, &mut attempt), StageOutcome::Allowed);
    assert_eq!(attempt.take_result(), Some(AuthorizationResult::Allow));
    assert!(read_flag(&attempt, NEEDS_ENCRYPTION_HINT));
    assert!(!fixture.runner.invoked("enable"));

    assert_eq!(
        engine.run_stage(Stage::Enablement, &mut attempt),
        StageOutcome::RestartScheduled
    );
    assert_eq!(attempt.take_result(), None);
    assert!(fixture.output_path().exists());

    let calls = fixture.runner.calls();
    let reboot = calls.last().unwrap();
    assert_eq!(reboot.program, Path::new("/sbin/reboot"));
}

#[test]
fn authenticated_restart_is_left_to_the_tool() {
    let fixture = Fixture::new(|cfg, _| cfg.mechanism.inline_enablement = true);
    fixture.runner.respond("status", 0, OFF);
    fixture.runner.respond("supportsauthrestart", 0, b"true\n");
    fixture.runner.respond("enable", 0, &recovery_plist("KEY"));

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::RestartScheduled);
    assert_eq!(attempt.result(), None);
    assert!(fixture
        .runner
        .calls()
        .iter()
        .all(|call| call.program != Path::new("/sbin/reboot")));
}

#[test]
fn enablement_failure_allows_login() {
    let fixture = Fixture::new(|_, _| {});
    fixture.runner.respond("supportsauthrestart", 0, b"false\n");
    fixture.runner.respond_with_stderr("enable", 1, b"", b"Error: user not allowed");

    let mut attempt = LoginAttempt::new("alice", "pw");
    attempt
        .set_hint(NEEDS_ENCRYPTION_HINT, &encode_flag(true))
        .unwrap();
    assert_eq!(fixture.engine().enablement(&mut attempt), StageOutcome::Allowed);
    assert_eq!(attempt.result(), Some(AuthorizationResult::Allow));
    assert!(!read_flag(&attempt, NEEDS_ENCRYPTION_HINT));
    assert!(!fixture.output_path().exists());
}

#[test]
fn failed_inline_enablement_is_not_retried_by_enablement() {
    let fixture = Fixture::new(|cfg, _| cfg.mechanism.inline_enablement = true);
    fixture.runner.respond("status", 0, OFF);
    fixture.runner.respond("supportsauthrestart", 0, b"false\n");
    fixture.runner.respond_with_stderr("enable", 1, b"", b"Error: user not allowed");
    let engine = fixture.engine();

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(engine.run_stage(Stage::Check, &mut attempt), StageOutcome::Allowed);
    assert!(!read_flag(&attempt, NEEDS_ENCRYPTION_HINT));
    assert_eq!(
        engine.run_stage(Stage::Enablement, &mut attempt),
        StageOutcome::Allowed
    );
    assert_eq!(attempt.result(), Some(AuthorizationResult::Allow));

    let enables = fixture
        .runner
        .calls()
        .iter()
        .filter(|call| call.args[0] == "enable")
        .count();
    assert_eq!(enables, 1);
}

#[test]
fn enablement_without_hint_allows_login() {
    let fixture = Fixture::new(|_, _| {});
    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().enablement(&mut attempt), StageOutcome::Allowed);
    assert!(fixture.runner.calls().is_empty());
}

#[test]
fn missing_secret_rotates_once() {
    let fixture = Fixture::new(|cfg, _| {
        cfg.rotation.remove_plist = false;
        cfg.rotation.rotate_used_key = true;
    });
    fixture.runner.respond("status", 0, ON);
    fixture.runner.respond("changerecovery", 0, &recovery_plist("ROTATED"));
    let engine = fixture.engine();

    assert_eq!(decide(&fixture, "alice"), Decision::RotateNow);
    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(engine.check(&mut attempt), StageOutcome::Allowed);
    assert!(fixture.config().rotation.key_rotated);
    assert!(fixture.output_path().exists());

    std::fs::remove_file(fixture.output_path()).unwrap();
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::AlreadyRotated)
    );
    let mut again = LoginAttempt::new("alice", "pw");
    assert_eq!(engine.check(&mut again), StageOutcome::Allowed);
    let rotations = fixture
        .runner
        .calls()
        .iter()
        .filter(|call| call.args[0] == "changerecovery")
        .count();
    assert_eq!(rotations, 1);
}

#[test]
fn forced_regeneration_rotates_into_keychain() {
    let fixture = Fixture::new(|cfg, _| {
        cfg.storage.store_in_keychain = true;
        cfg.rotation.generate_new_key = true;
    });
    fixture.store.seed("com.grahamgilbert.crypt.recovery", "OLD");
    fixture.runner.respond("status", 0, ON);
    fixture.runner.respond("changerecovery", 0, &recovery_plist("FRESH"));

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::Allowed);
    assert_eq!(
        fixture.store.item("com.grahamgilbert.crypt.recovery").unwrap().value,
        "FRESH"
    );
    let cfg = fixture.config();
    assert!(cfg.rotation.key_rotated);
    assert!(cfg.rotation.generate_new_key);
    assert_eq!(cfg.escrow.last_escrow, Some(0));

    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::AlreadyRotated)
    );
    let mut again = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut again), StageOutcome::Allowed);
    let rotations = fixture
        .runner
        .calls()
        .iter()
        .filter(|call| call.args[0] == "changerecovery")
        .count();
    assert_eq!(rotations, 1);
}

#[test]
fn rotation_failure_still_allows_login() {
    let fixture = Fixture::new(|cfg, _| cfg.rotation.generate_new_key = true);
    fixture.runner.respond("status", 0, ON);
    fixture.runner.respond("changerecovery", 0, b"");

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::Allowed);
    assert_eq!(attempt.result(), Some(AuthorizationResult::Allow));
    assert!(!fixture.config().rotation.key_rotated);
}

#[test]
fn encrypted_disk_with_stored_secret_abstains() {
    let fixture = Fixture::new(|cfg, _| cfg.rotation.remove_plist = false);
    std::fs::write(fixture.output_path(), recovery_plist("KEPT")).unwrap();
    fixture.runner.respond("status", 0, ON);
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::RotationNotNeeded)
    );
}

#[test]
fn rejected_stored_key_rotates() {
    let fixture = Fixture::new(|cfg, _| cfg.rotation.remove_plist = false);
    std::fs::write(fixture.output_path(), recovery_plist("STALE")).unwrap();
    fixture.runner.respond("status", 0, ON);
    fixture.runner.respond_with_stderr("validaterecovery", 1, b"false\n", b"");
    fixture.runner.respond("changerecovery", 0, &recovery_plist("REPLACED"));

    assert_eq!(decide(&fixture, "alice"), Decision::RotateNow);
    let validation = fixture
        .runner
        .calls()
        .into_iter()
        .find(|call| call.args[0] == "validaterecovery")
        .unwrap();
    let stdin = String::from_utf8(validation.stdin.unwrap()).unwrap();
    assert!(stdin.contains("<string>STALE</string>"));

    let mut attempt = LoginAttempt::new("alice", "pw");
    assert_eq!(fixture.engine().check(&mut attempt), StageOutcome::Allowed);
    let kept = crate::recovery::read_recovery_document(&fixture.output_path()).unwrap();
    assert_eq!(kept.recovery_key.as_str(), "REPLACED");
    assert!(fixture.config().rotation.key_rotated);
}

#[test]
fn accepted_or_unverifiable_stored_key_is_kept() {
    let fixture = Fixture::new(|cfg, _| cfg.rotation.remove_plist = false);
    std::fs::write(fixture.output_path(), recovery_plist("GOOD")).unwrap();
    fixture.runner.respond("status", 0, ON);
    fixture.runner.respond("validaterecovery", 0, b"true\n");
    fixture
        .runner
        .respond_with_stderr("validaterecovery", 5, b"", b"Error: no volume");
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::RotationNotNeeded)
    );
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::RotationNotNeeded)
    );
}

#[test]
fn validation_is_skipped_when_disabled_or_document_is_removed() {
    let fixture = Fixture::new(|cfg, _| {
        cfg.rotation.remove_plist = false;
        cfg.rotation.validate_key = false;
    });
    std::fs::write(fixture.output_path(), recovery_plist("KEPT")).unwrap();
    fixture.runner.respond("status", 0, ON);
    assert_eq!(
        decide(&fixture, "alice"),
        Decision::Abstain(AbstainReason::RotationNotNeeded)
    );

    let removed = Fixture::new(|_, _| {});
    removed.runner.respond("status", 0, ON);
    assert_eq!(
        decide(&removed, "alice"),
        Decision::Abstain(AbstainReason::RotationNotNeeded)
    );
    assert!(!fixture.runner.invoked("validaterecovery"));
    assert!(!removed.runner.invoked("validaterecovery"));
}

#[test]
fn keychain_enablement_queues_escrow() {
    let fixture = Fixture::new(|cfg, _| cfg.storage.store_in_keychain = true);
    fixture.runner.respond("supportsauthrestart", 0, b"true\n");
    fixture.runner.respond("enable", 0, &recovery_plist("KC-KEY"));
    let credentials = Credentials {
        username: "alice".into(),
        password: zeroize::Zeroizing::new("pw".into()),
    };
    fixture
        .engine()
        .enable(&fixture.config(), &credentials)
        .unwrap();
    assert_eq!(fixture.config().escrow.last_escrow, Some(0));

    let file = Fixture::new(|_, _| {});
    file.runner.respond("supportsauthrestart", 0, b"true\n");
    file.runner.respond("enable", 0, &recovery_plist("DOC-KEY"));
    file.engine().enable(&file.config(), &credentials).unwrap();
    assert_eq!(file.config().escrow.last_escrow, None);
}
