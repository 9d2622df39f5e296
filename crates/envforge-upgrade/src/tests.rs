use super::*;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use envforge_core::ReleaseVersion;

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "envforge-upgrade-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> SystemLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    SystemLayout::new(build_test_layout_path(nanos))
}

fn v(raw: &str) -> ReleaseVersion {
    ReleaseVersion::parse(raw).expect("valid release")
}

struct FakeDriver {
    layout: SystemLayout,
    version: ReleaseVersion,
    precondition_error: Option<String>,
    fail_hop: Option<ReleaseVersion>,
    /// Release the host's upgrade tool would move to, when it differs from the plan.
    offered: Option<ReleaseVersion>,
    hops: Vec<ReleaseVersion>,
    stages_during_hop: Vec<Option<UpgradeStage>>,
    resume_scheduled: usize,
    resume_cleared: usize,
}

impl FakeDriver {
    fn at(layout: &SystemLayout, version: &str) -> Self {
        Self {
            layout: layout.clone(),
            version: v(version),
            precondition_error: None,
            fail_hop: None,
            offered: None,
            hops: Vec::new(),
            stages_during_hop: Vec::new(),
            resume_scheduled: 0,
            resume_cleared: 0,
        }
    }
}

impl UpgradeDriver for FakeDriver {
    fn current_version(&mut self) -> Result<ReleaseVersion, UpgradeError> {
        Ok(self.version)
    }

    fn check_preconditions(&mut self) -> Result<(), UpgradeError> {
        match &self.precondition_error {
            Some(reason) => Err(UpgradeError::PreconditionFailed {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_hop(
        &mut self,
        from: ReleaseVersion,
        next: ReleaseVersion,
    ) -> Result<(), UpgradeError> {
        match self.offered {
            Some(offered) if offered != next => Err(UpgradeError::PreconditionFailed {
                reason: format!("release upgrade from {from} offers {offered}, expected {next}"),
            }),
            _ => Ok(()),
        }
    }

    fn upgrade_to(&mut self, next: ReleaseVersion) -> Result<HopResult, UpgradeError> {
        let stage = load_state(&self.layout)
            .expect("state must be readable mid-hop")
            .map(|state| state.stage);
        self.stages_during_hop.push(stage);
        if self.fail_hop == Some(next) {
            return Err(UpgradeError::HopFailed {
                from: self.version,
                to: next,
                message: "dpkg was interrupted".to_string(),
            });
        }
        self.hops.push(next);
        self.version = next;
        Ok(HopResult { needs_reboot: true })
    }

    fn schedule_resume(&mut self) -> Result<(), UpgradeError> {
        self.resume_scheduled += 1;
        Ok(())
    }

    fn clear_resume(&mut self) -> Result<(), UpgradeError> {
        self.resume_cleared += 1;
        Ok(())
    }

    fn reboot(&mut self) -> Result<(), UpgradeError> {
        Ok(())
    }
}

/// Catalog with interim releases, as a manifest `[upgrade] releases` would list them.
fn interim_catalog() -> Vec<ReleaseVersion> {
    ["22.04", "22.10", "23.04", "23.10", "24.04"]
        .into_iter()
        .map(v)
        .collect()
}

fn machine(layout: &SystemLayout, version: &str) -> UpgradeStateMachine<FakeDriver> {
    UpgradeStateMachine::new(
        layout.clone(),
        FakeDriver::at(layout, version),
        interim_catalog(),
    )
}

#[test]
fn hop_path_visits_every_release_without_skipping() {
    let hops = hop_path(&interim_catalog(), v("22.04"), v("24.04")).expect("must plan hops");
    assert_eq!(hops, vec![v("22.10"), v("23.04"), v("23.10"), v("24.04")]);

    assert!(hop_path(&interim_catalog(), v("24.04"), v("24.04"))
        .expect("must plan hops")
        .is_empty());
}

#[test]
fn default_catalog_follows_lts_upgrade_edges() {
    let hops = hop_path(&default_catalog(), v("22.04"), v("24.04")).expect("must plan hops");
    assert_eq!(hops, vec![v("24.04")]);

    let hops = hop_path(&default_catalog(), v("20.04"), v("24.04")).expect("must plan hops");
    assert_eq!(hops, vec![v("22.04"), v("24.04")]);

    assert!(default_catalog()
        .iter()
        .all(|release| release.major % 2 == 0 && release.minor == 4));

    let err = hop_path(&default_catalog(), v("22.04"), v("23.10")).expect_err("interim target");
    assert!(matches!(err, UpgradeError::UnknownTarget { .. }));
}

#[test]
fn mismatched_upgrade_offer_fails_before_anything_is_persisted() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    machine.driver_mut().offered = Some(v("24.04"));

    let err = machine.start(v("24.04"), None).expect_err("offer mismatch must fail");

    match &err {
        UpgradeError::PreconditionFailed { reason } => {
            assert!(reason.contains("offers 24.04, expected 22.10"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!layout.state_path().exists());
    assert!(machine.driver().hops.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn mismatched_upgrade_offer_on_resume_is_recorded_without_upgrading() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    machine.start(v("23.04"), None).expect("first hop must succeed");
    machine.driver_mut().offered = Some(v("23.10"));

    let err = machine.resume().expect_err("offer mismatch must fail");

    assert!(matches!(err, UpgradeError::PreconditionFailed { .. }));
    assert_eq!(machine.driver().hops, vec![v("22.10")]);
    let persisted = load_state(&layout)
        .expect("must load")
        .expect("state must remain");
    assert_eq!(persisted.current_version, v("22.10"));
    assert!(persisted
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("offers 23.10")));

    machine.driver_mut().offered = None;
    let outcome = machine.resume().expect("retry must succeed");
    assert!(matches!(outcome, UpgradeOutcome::AwaitingReboot(_)));
    assert_eq!(machine.driver().hops, vec![v("22.10"), v("23.04")]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn offered_release_is_read_from_upgrade_check_output() {
    let output = "Checking for a new Ubuntu release\n\
                  New release '24.04.1 LTS' available.\n\
                  Run 'do-release-upgrade' to upgrade to it.\n";
    assert_eq!(parse_offered_release(output), Some(v("24.04")));
    assert_eq!(
        parse_offered_release("New release '23.10' available.\n"),
        Some(v("23.10"))
    );
    assert_eq!(
        parse_offered_release("There is no development version of an LTS available.\n"),
        None
    );
}

#[test]
fn hop_path_rejects_targets_outside_the_catalog() {
    let err = hop_path(&default_catalog(), v("22.04"), v("24.05")).expect_err("must fail");
    assert!(matches!(err, UpgradeError::UnknownTarget { target } if target == v("24.05")));
}

#[test]
fn start_runs_one_hop_and_persists_awaiting_reboot() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");

    let request = InstallRequest {
        only: vec!["tag:agents".to_string()],
        ..InstallRequest::default()
    };
    let outcome = machine
        .start(v("23.04"), Some(request.clone()))
        .expect("start must succeed");

    let state = match outcome {
        UpgradeOutcome::AwaitingReboot(state) => state,
        other => panic!("expected awaiting reboot, got {other:?}"),
    };
    assert_eq!(state.completed_hops, vec![v("22.10")]);
    assert_eq!(state.current_version, v("22.10"));
    assert!(state.needs_reboot);

    let persisted = load_state(&layout)
        .expect("must load")
        .expect("state must be persisted");
    assert_eq!(persisted.stage, UpgradeStage::AwaitingReboot);
    assert_eq!(persisted.install_request, Some(request));
    assert_eq!(machine.driver().hops, vec![v("22.10")]);
    assert_eq!(
        machine.driver().stages_during_hop,
        vec![Some(UpgradeStage::Upgrading)]
    );
    assert_eq!(machine.driver().resume_scheduled, 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn precondition_failure_persists_nothing() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    machine.driver_mut().precondition_error = Some("insufficient disk space".to_string());

    let err = machine.start(v("24.04"), None).expect_err("must fail");

    assert!(matches!(err, UpgradeError::PreconditionFailed { .. }));
    assert!(!layout.state_path().exists());
    assert!(machine.driver().hops.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn start_at_target_does_nothing() {
    let layout = test_layout();
    let mut machine = machine(&layout, "24.04");

    let outcome = machine.start(v("24.04"), None).expect("must succeed");

    assert_eq!(
        outcome,
        UpgradeOutcome::AlreadyAtTarget {
            current: v("24.04")
        }
    );
    assert!(!layout.state_path().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn start_refuses_while_an_upgrade_is_unfinished() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    machine.start(v("24.04"), None).expect("first start must succeed");

    let err = machine.start(v("24.04"), None).expect_err("second start must fail");

    match err {
        UpgradeError::UpgradeInProgress {
            stage,
            current,
            target,
        } => {
            assert_eq!(stage, UpgradeStage::AwaitingReboot);
            assert_eq!(current, v("22.10"));
            assert_eq!(target, v("24.04"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn resume_after_first_hop_targets_the_next_release_only() {
    let layout = test_layout();
    let catalog = vec![v("20.04"), v("21.04"), v("22.04"), v("23.04")];
    let mut state = UpgradeState::new(v("21.04"), v("23.04"), None);
    state.stage = UpgradeStage::AwaitingReboot;
    state.completed_hops = vec![v("21.04")];
    state.needs_reboot = true;
    persist_state(&layout, &mut state).expect("must persist");

    let mut machine =
        UpgradeStateMachine::new(layout.clone(), FakeDriver::at(&layout, "21.04"), catalog);
    let outcome = machine.resume().expect("resume must succeed");

    assert_eq!(machine.driver().hops, vec![v("22.04")]);
    assert_eq!(
        machine.driver().stages_during_hop,
        vec![Some(UpgradeStage::Upgrading)]
    );
    let state = match outcome {
        UpgradeOutcome::AwaitingReboot(state) => state,
        other => panic!("expected another reboot, got {other:?}"),
    };
    assert_eq!(state.completed_hops, vec![v("21.04"), v("22.04")]);
    assert_eq!(state.target_version, v("23.04"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn multi_hop_upgrade_completes_and_archives_state() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    let request = InstallRequest {
        skip: vec!["extras.games".to_string()],
        ..InstallRequest::default()
    };

    machine
        .start(v("23.04"), Some(request.clone()))
        .expect("start must succeed");
    machine.resume().expect("second hop must succeed");
    let outcome = machine.resume().expect("final resume must succeed");

    let (state, archived) = match outcome {
        UpgradeOutcome::Completed { state, archived } => (state, archived),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(state.stage, UpgradeStage::Completed);
    assert_eq!(state.completed_hops, vec![v("22.10"), v("23.04")]);
    assert_eq!(state.install_request, Some(request));
    assert!(archived.starts_with(layout.history_dir()));
    assert!(archived.exists());
    assert!(!layout.state_path().exists());
    assert_eq!(machine.driver().hops, vec![v("22.10"), v("23.04")]);
    assert_eq!(machine.driver().resume_cleared, 1);

    assert_eq!(
        machine.resume().expect("nothing left"),
        UpgradeOutcome::NothingToResume
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn resume_reports_stale_state_without_touching_it() {
    let layout = test_layout();
    let mut state = UpgradeState::new(v("22.10"), v("24.04"), None);
    state.stage = UpgradeStage::AwaitingReboot;
    state.completed_hops = vec![v("22.10")];
    persist_state(&layout, &mut state).expect("must persist");
    let before = fs::read_to_string(layout.state_path()).expect("must read");

    let mut machine = machine(&layout, "23.04");
    let err = machine.resume().expect_err("must detect stale state");

    match err {
        UpgradeError::StaleState { expected, actual } => {
            assert_eq!(expected, v("22.10"));
            assert_eq!(actual, v("23.04"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let after = fs::read_to_string(layout.state_path()).expect("must read");
    assert_eq!(before, after);
    assert!(machine.driver().hops.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_hop_is_recorded_and_retried_on_resume() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    machine.driver_mut().fail_hop = Some(v("22.10"));

    let err = machine.start(v("22.10"), None).expect_err("hop must fail");
    assert!(matches!(err, UpgradeError::HopFailed { .. }));
    let persisted = load_state(&layout)
        .expect("must load")
        .expect("state must exist");
    assert_eq!(persisted.stage, UpgradeStage::Upgrading);
    assert!(persisted
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("dpkg was interrupted")));

    machine.driver_mut().fail_hop = None;
    let outcome = machine.resume().expect("retry must succeed");
    assert!(matches!(outcome, UpgradeOutcome::AwaitingReboot(_)));
    assert_eq!(machine.driver().hops, vec![v("22.10")]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn resume_without_state_is_a_no_op() {
    let layout = test_layout();
    let mut machine = machine(&layout, "22.04");
    assert_eq!(
        machine.resume().expect("must succeed"),
        UpgradeOutcome::NothingToResume
    );
    assert!(machine.driver().hops.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn held_lock_is_a_conflict_naming_the_holder() {
    let layout = test_layout();
    let held = UpgradeLock::acquire(&layout.lock_path()).expect("first acquire must succeed");
    assert!(held.is_held());

    let mut machine = machine(&layout, "22.04");
    let err = machine.start(v("24.04"), None).expect_err("must conflict");
    assert!(err
        .to_string()
        .contains(&format!("pid={}", std::process::id())));
    match err {
        UpgradeError::LockConflict { pid } => assert_eq!(pid, Some(std::process::id())),
        other => panic!("unexpected error: {other:?}"),
    }

    drop(held);
    machine
        .start(v("22.10"), None)
        .expect("start must succeed once the lock is released");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn stale_lock_file_is_reclaimed() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    fs::write(layout.lock_path(), "4194302\n").expect("must write stale lock");

    let lock = UpgradeLock::acquire(&layout.lock_path()).expect("stale lock must be reclaimed");
    assert_eq!(lock_holder(lock.path()), Some(std::process::id()));

    drop(lock);
    assert_eq!(lock_holder(&layout.lock_path()), None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn older_state_files_without_new_fields_still_load() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    fs::write(
        layout.state_path(),
        r#"{"schema_version":1,"stage":"awaiting_reboot","current_version":"22.10","target_version":"24.04"}"#,
    )
    .expect("must write state");

    let state = load_state(&layout)
        .expect("must load")
        .expect("state must exist");
    assert_eq!(state.stage, UpgradeStage::AwaitingReboot);
    assert!(state.completed_hops.is_empty());
    assert!(state.last_error.is_none());
    assert!(state.install_request.is_none());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn newer_state_schema_is_rejected() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    fs::write(
        layout.state_path(),
        r#"{"schema_version":7,"stage":"upgrading","current_version":"22.10","target_version":"24.04"}"#,
    )
    .expect("must write state");

    let err = load_state(&layout).expect_err("must reject newer schema");
    assert!(matches!(err, UpgradeError::UnsupportedSchema { found: 7, .. }));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn os_release_version_is_parsed_from_version_id() {
    let raw = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\n";
    assert_eq!(parse_os_release_version(raw), Some(v("22.04")));
    assert_eq!(parse_os_release_version("ID=ubuntu\n"), None);
}

#[test]
fn resume_unit_invokes_the_resume_entry_point() {
    let driver = SystemDriver::new("/usr/local/bin/envforge");
    let unit = driver.resume_unit();
    assert!(unit.contains("ExecStart=/usr/local/bin/envforge resume"));
    assert!(unit.contains("Type=oneshot"));
    assert!(driver.unit_path().ends_with(RESUME_UNIT_NAME));
    assert!(!unit.contains("Environment="));
}

#[test]
fn resume_unit_carries_the_recorded_environment() {
    let driver = SystemDriver::new("/usr/local/bin/envforge")
        .with_resume_env("ENVFORGE_SYSTEM_DIR", "/srv/envforge state")
        .with_resume_env("ENVFORGE_HOME", "/root/.envforge");
    let unit = driver.resume_unit();

    assert!(unit.contains("Environment=\"ENVFORGE_SYSTEM_DIR=/srv/envforge state\"\n"));
    assert!(unit.contains("Environment=\"ENVFORGE_HOME=/root/.envforge\"\n"));
    let environment = unit.find("Environment=").expect("must have environment");
    let exec = unit.find("ExecStart=").expect("must have exec");
    assert!(environment < exec);
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    assert_ne!(build_test_layout_path(42), build_test_layout_path(42));
}
