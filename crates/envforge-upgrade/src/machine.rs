use std::path::PathBuf;

use envforge_core::ReleaseVersion;
use log::info;

use crate::driver::UpgradeDriver;
use crate::error::UpgradeError;
use crate::layout::SystemLayout;
use crate::lock::UpgradeLock;
use crate::path::hop_path;
use crate::state::{
    archive_state, load_state, persist_state, InstallRequest, UpgradeStage, UpgradeState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    AlreadyAtTarget { current: ReleaseVersion },
    /// One hop finished; the host has to reboot before the next step.
    AwaitingReboot(UpgradeState),
    Completed {
        state: UpgradeState,
        archived: PathBuf,
    },
    NothingToResume,
}

pub struct UpgradeStateMachine<D> {
    layout: SystemLayout,
    driver: D,
    catalog: Vec<ReleaseVersion>,
}

impl<D: UpgradeDriver> UpgradeStateMachine<D> {
    pub fn new(layout: SystemLayout, driver: D, catalog: Vec<ReleaseVersion>) -> Self {
        Self {
            layout,
            driver,
            catalog,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn status(&self) -> Result<Option<UpgradeState>, UpgradeError> {
        load_state(&self.layout)
    }

    pub fn start(
        &mut self,
        target: ReleaseVersion,
        install_request: Option<InstallRequest>,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let _lock = UpgradeLock::acquire(&self.layout.lock_path())?;

        if let Some(existing) = load_state(&self.layout)? {
            if !existing.is_finished() {
                return Err(UpgradeError::UpgradeInProgress {
                    stage: existing.stage,
                    current: existing.current_version,
                    target: existing.target_version,
                });
            }
        }

        let current = self.driver.current_version()?;
        if current >= target {
            info!("system already at {current}; no upgrade needed");
            return Ok(UpgradeOutcome::AlreadyAtTarget { current });
        }
        let hops = hop_path(&self.catalog, current, target)?;

        // Preparing lives in memory only; a failed check leaves no state file.
        let mut state = UpgradeState::new(current, target, install_request);
        state.stage = UpgradeStage::Preparing;
        info!("upgrade stage={} current={current} target={target}", state.stage);
        self.driver.check_preconditions()?;

        match hops.first() {
            Some(&next) => {
                self.driver.check_hop(current, next)?;
                self.run_hop(&mut state, next)
            }
            None => self.complete(state),
        }
    }

    pub fn resume(&mut self) -> Result<UpgradeOutcome, UpgradeError> {
        let _lock = UpgradeLock::acquire(&self.layout.lock_path())?;

        let Some(mut state) = load_state(&self.layout)? else {
            return Ok(UpgradeOutcome::NothingToResume);
        };
        if state.is_finished() {
            return self.complete(state);
        }

        let actual = self.driver.current_version()?;
        if actual != state.current_version {
            return Err(UpgradeError::StaleState {
                expected: state.current_version,
                actual,
            });
        }

        state.stage = UpgradeStage::Resuming;
        state.needs_reboot = false;
        persist_state(&self.layout, &mut state)?;
        info!(
            "upgrade stage=resuming current={} target={}",
            state.current_version, state.target_version
        );

        let remaining = hop_path(&self.catalog, state.current_version, state.target_version)?;
        if let Some(&next) = remaining.first() {
            if let Err(err) = self.driver.check_hop(state.current_version, next) {
                state.last_error = Some(err.to_string());
                persist_state(&self.layout, &mut state)?;
                return Err(err);
            }
        }
        match remaining.first() {
            Some(&next) => self.run_hop(&mut state, next),
            None => self.complete(state),
        }
    }

    fn run_hop(
        &mut self,
        state: &mut UpgradeState,
        next: ReleaseVersion,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        state.stage = UpgradeStage::Upgrading;
        state.last_error = None;
        persist_state(&self.layout, state)?;
        info!("upgrade stage=upgrading hop={} -> {next}", state.current_version);

        let hop = match self.driver.upgrade_to(next) {
            Ok(hop) => hop,
            Err(err) => {
                state.last_error = Some(err.to_string());
                persist_state(&self.layout, state)?;
                return Err(err);
            }
        };

        state.completed_hops.push(next);
        state.current_version = next;
        state.needs_reboot = hop.needs_reboot;
        state.stage = UpgradeStage::AwaitingReboot;
        persist_state(&self.layout, state)?;
        self.driver.schedule_resume()?;
        info!(
            "upgrade stage=awaiting_reboot current={} needs_reboot={}",
            state.current_version, state.needs_reboot
        );
        Ok(UpgradeOutcome::AwaitingReboot(state.clone()))
    }

    fn complete(&mut self, mut state: UpgradeState) -> Result<UpgradeOutcome, UpgradeError> {
        state.stage = UpgradeStage::Completed;
        state.needs_reboot = false;
        persist_state(&self.layout, &mut state)?;
        self.driver.clear_resume()?;
        let archived = archive_state(&self.layout, &state)?;
        info!(
            "upgrade stage=completed version={} archived={}",
            state.current_version,
            archived.display()
        );
        Ok(UpgradeOutcome::Completed { state, archived })
    }
}
