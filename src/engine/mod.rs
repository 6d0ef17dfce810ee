use std::fmt;

use log::{debug, error, info, warn};

use hawser_api::{
    constants::STATE_DATA_VERSION,
    deployment::{DeploymentStatus, StateData, StateId, UpdateInfo},
    error::UpdateError,
};

use crate::{
    client::FetchResult,
    datastore::{self, StateDataError},
    ExitKind,
};

mod context;
mod states;
mod transitions;

pub use context::{DeploymentTracker, GateVerdict, StateContext, WaitOutcome, WaitSignal};
pub use transitions::Transition;

/// The update state machine, a closed set of states. Update-flow states own
/// the deployment record and move it along; retry states additionally carry
/// their attempt counts so resume stays deterministic.
pub enum State {
    Init,
    Idle,
    Authorize,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    Final,
    UpdateFetch {
        update: Box<UpdateInfo>,
        retries: u32,
    },
    FetchStoreRetry {
        update: Box<UpdateInfo>,
        attempts: u32,
    },
    UpdateStore {
        update: Box<UpdateInfo>,
        fetch: FetchResult,
        retries: u32,
    },
    UpdateAfterStore {
        update: Box<UpdateInfo>,
    },
    UpdateInstall {
        update: Box<UpdateInfo>,
    },
    UpdateReboot {
        update: Box<UpdateInfo>,
    },
    UpdateVerifyReboot {
        update: Box<UpdateInfo>,
    },
    UpdateAfterReboot {
        update: Box<UpdateInfo>,
    },
    UpdateCommit {
        update: Box<UpdateInfo>,
        report_attempts: u32,
    },
    UpdatePreCommitStatusReportRetry {
        update: Box<UpdateInfo>,
        attempts: u32,
    },
    UpdateAfterFirstCommit {
        update: Box<UpdateInfo>,
    },
    UpdateAfterCommit {
        update: Box<UpdateInfo>,
    },
    UpdateRollback {
        update: Box<UpdateInfo>,
    },
    UpdateRollbackReboot {
        update: Box<UpdateInfo>,
    },
    UpdateVerifyRollbackReboot {
        update: Box<UpdateInfo>,
    },
    UpdateAfterRollbackReboot {
        update: Box<UpdateInfo>,
    },
    UpdateError {
        update: Box<UpdateInfo>,
        reason: String,
    },
    UpdateCleanup {
        update: Box<UpdateInfo>,
        status: DeploymentStatus,
    },
    UpdateStatusReport {
        update: Box<UpdateInfo>,
        status: DeploymentStatus,
        report_sent: bool,
        attempts: u32,
    },
    UpdateStatusReportRetry {
        update: Box<UpdateInfo>,
        status: DeploymentStatus,
        report_sent: bool,
        attempts: u32,
    },
    ReportError {
        update: Box<UpdateInfo>,
        status: DeploymentStatus,
        /// The reporting ended because the server aborted the deployment,
        /// not because the retry budget ran out.
        aborted: bool,
    },
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl State {
    pub fn id(&self) -> StateId {
        match self {
            State::Init => StateId::Init,
            State::Idle => StateId::Idle,
            State::Authorize => StateId::Authorize,
            State::AuthorizeWait => StateId::AuthorizeWait,
            State::InventoryUpdate => StateId::InventoryUpdate,
            State::CheckWait => StateId::CheckWait,
            State::UpdateCheck => StateId::UpdateCheck,
            State::Final => StateId::Final,
            State::UpdateFetch { .. } => StateId::UpdateFetch,
            State::FetchStoreRetry { .. } => StateId::FetchStoreRetry,
            State::UpdateStore { .. } => StateId::UpdateStore,
            State::UpdateAfterStore { .. } => StateId::UpdateAfterStore,
            State::UpdateInstall { .. } => StateId::UpdateInstall,
            State::UpdateReboot { .. } => StateId::UpdateReboot,
            State::UpdateVerifyReboot { .. } => StateId::UpdateVerifyReboot,
            State::UpdateAfterReboot { .. } => StateId::UpdateAfterReboot,
            State::UpdateCommit { .. } => StateId::UpdateCommit,
            State::UpdatePreCommitStatusReportRetry { .. } => {
                StateId::UpdatePreCommitStatusReportRetry
            }
            State::UpdateAfterFirstCommit { .. } => StateId::UpdateAfterFirstCommit,
            State::UpdateAfterCommit { .. } => StateId::UpdateAfterCommit,
            State::UpdateRollback { .. } => StateId::UpdateRollback,
            State::UpdateRollbackReboot { .. } => StateId::UpdateRollbackReboot,
            State::UpdateVerifyRollbackReboot { .. } => StateId::UpdateVerifyRollbackReboot,
            State::UpdateAfterRollbackReboot { .. } => StateId::UpdateAfterRollbackReboot,
            State::UpdateError { .. } => StateId::UpdateError,
            State::UpdateCleanup { .. } => StateId::UpdateCleanup,
            State::UpdateStatusReport { .. } => StateId::UpdateStatusReport,
            State::UpdateStatusReportRetry { .. } => StateId::UpdateStatusReportRetry,
            State::ReportError { .. } => StateId::ReportError,
        }
    }

    /// The transition whose scripts bracket this state.
    pub fn transition(&self) -> Transition {
        match self {
            State::Init | State::Final => Transition::None,
            State::Idle | State::AuthorizeWait | State::CheckWait => Transition::Idle,
            State::Authorize | State::InventoryUpdate | State::UpdateCheck => Transition::Sync,
            State::UpdateFetch { .. }
            | State::FetchStoreRetry { .. }
            | State::UpdateStore { .. } => Transition::DownloadEnter,
            State::UpdateAfterStore { .. } => Transition::DownloadLeave,
            State::UpdateInstall { .. } => Transition::ArtifactInstall,
            State::UpdateReboot { .. } => Transition::ArtifactRebootEnter,
            State::UpdateVerifyReboot { .. } | State::UpdateAfterReboot { .. } => {
                Transition::ArtifactRebootLeave
            }
            State::UpdateCommit { .. } | State::UpdatePreCommitStatusReportRetry { .. } => {
                Transition::ArtifactCommitEnter
            }
            State::UpdateAfterFirstCommit { .. } => Transition::None,
            State::UpdateAfterCommit { .. } => Transition::ArtifactCommitLeave,
            State::UpdateRollback { .. } => Transition::ArtifactRollback,
            State::UpdateRollbackReboot { .. } => Transition::ArtifactRollbackRebootEnter,
            State::UpdateVerifyRollbackReboot { .. }
            | State::UpdateAfterRollbackReboot { .. } => Transition::ArtifactRollbackRebootLeave,
            State::UpdateError { .. } => Transition::ArtifactFailure,
            State::UpdateCleanup { .. }
            | State::UpdateStatusReport { .. }
            | State::UpdateStatusReportRetry { .. }
            | State::ReportError { .. } => Transition::None,
        }
    }

    /// Wait and retry states may be re-entered arbitrarily often; entering
    /// one (or bouncing off one) does not count against the store bound.
    pub fn permits_looping(&self) -> bool {
        matches!(
            self,
            State::CheckWait
                | State::AuthorizeWait
                | State::FetchStoreRetry { .. }
                | State::UpdatePreCommitStatusReportRetry { .. }
                | State::UpdateStatusReportRetry { .. }
        )
    }

    /// States already on the failure path tolerate a store-count overflow,
    /// so a broken loop can still report its failure.
    fn on_failure_path(&self) -> bool {
        matches!(
            self,
            State::UpdateError { .. }
                | State::UpdateCleanup { .. }
                | State::UpdateStatusReport { .. }
                | State::UpdateStatusReportRetry { .. }
                | State::ReportError { .. }
        )
    }

    pub fn update_info(&self) -> Option<&UpdateInfo> {
        match self {
            State::UpdateFetch { update, .. }
            | State::FetchStoreRetry { update, .. }
            | State::UpdateStore { update, .. }
            | State::UpdateAfterStore { update }
            | State::UpdateInstall { update }
            | State::UpdateReboot { update }
            | State::UpdateVerifyReboot { update }
            | State::UpdateAfterReboot { update }
            | State::UpdateCommit { update, .. }
            | State::UpdatePreCommitStatusReportRetry { update, .. }
            | State::UpdateAfterFirstCommit { update }
            | State::UpdateAfterCommit { update }
            | State::UpdateRollback { update }
            | State::UpdateRollbackReboot { update }
            | State::UpdateVerifyRollbackReboot { update }
            | State::UpdateAfterRollbackReboot { update }
            | State::UpdateError { update, .. }
            | State::UpdateCleanup { update, .. }
            | State::UpdateStatusReport { update, .. }
            | State::UpdateStatusReportRetry { update, .. }
            | State::ReportError { update, .. } => Some(update),
            _ => None,
        }
    }

    fn update_info_mut(&mut self) -> Option<&mut UpdateInfo> {
        match self {
            State::UpdateFetch { update, .. }
            | State::FetchStoreRetry { update, .. }
            | State::UpdateStore { update, .. }
            | State::UpdateAfterStore { update }
            | State::UpdateInstall { update }
            | State::UpdateReboot { update }
            | State::UpdateVerifyReboot { update }
            | State::UpdateAfterReboot { update }
            | State::UpdateCommit { update, .. }
            | State::UpdatePreCommitStatusReportRetry { update, .. }
            | State::UpdateAfterFirstCommit { update }
            | State::UpdateAfterCommit { update }
            | State::UpdateRollback { update }
            | State::UpdateRollbackReboot { update }
            | State::UpdateVerifyRollbackReboot { update }
            | State::UpdateAfterRollbackReboot { update }
            | State::UpdateError { update, .. }
            | State::UpdateCleanup { update, .. }
            | State::UpdateStatusReport { update, .. }
            | State::UpdateStatusReportRetry { update, .. }
            | State::ReportError { update, .. } => Some(update),
            _ => None,
        }
    }

    fn into_update(self) -> Option<Box<UpdateInfo>> {
        match self {
            State::UpdateFetch { update, .. }
            | State::FetchStoreRetry { update, .. }
            | State::UpdateStore { update, .. }
            | State::UpdateAfterStore { update }
            | State::UpdateInstall { update }
            | State::UpdateReboot { update }
            | State::UpdateVerifyReboot { update }
            | State::UpdateAfterReboot { update }
            | State::UpdateCommit { update, .. }
            | State::UpdatePreCommitStatusReportRetry { update, .. }
            | State::UpdateAfterFirstCommit { update }
            | State::UpdateAfterCommit { update }
            | State::UpdateRollback { update }
            | State::UpdateRollbackReboot { update }
            | State::UpdateVerifyRollbackReboot { update }
            | State::UpdateAfterRollbackReboot { update }
            | State::UpdateError { update, .. }
            | State::UpdateCleanup { update, .. }
            | State::UpdateStatusReport { update, .. }
            | State::UpdateStatusReportRetry { update, .. }
            | State::ReportError { update, .. } => Some(update),
            _ => None,
        }
    }

    /// The status a report-phase state is carrying, persisted so resume can
    /// finish the reporting.
    fn report_status_hint(&self) -> Option<DeploymentStatus> {
        match self {
            State::UpdateCleanup { status, .. }
            | State::UpdateStatusReport { status, .. }
            | State::UpdateStatusReportRetry { status, .. }
            | State::ReportError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The single cooperative driver. Owns the context and walks the FSM one
/// transition at a time; `step` is public so integration tests can stop the
/// machine at any state boundary and relaunch against the same store.
pub struct Daemon {
    pub ctx: StateContext,
    from_transition: Transition,
    from_loops: bool,
}

impl Daemon {
    pub fn new(ctx: StateContext) -> Self {
        Self {
            ctx,
            from_transition: Transition::None,
            from_loops: true,
        }
    }

    /// Performs one full transition into `to`: scripts out of the previous
    /// transition, recovery-data write, scripts into the new transition,
    /// then the state's `handle`.
    pub fn step(&mut self, to: State) -> (State, bool) {
        let to_transition = to.transition();
        let to_loops = to.permits_looping();

        // Scripts on the way out of the previous transition. Falling into
        // an error transition runs the Error action instead of Leave.
        if self.from_transition != to_transition {
            if to_transition.is_error() && !self.from_transition.is_error() {
                self.from_transition.error(&self.ctx.scripts);
            } else if let Err(e) = self.from_transition.leave(&self.ctx.scripts) {
                warn!("Leave scripts failed: {e:#}");
                self.from_transition = to_transition;
                self.from_loops = to_loops;
                return to.handle_error(&mut self.ctx, UpdateError::transient(e));
            }
        }

        // Recovery data is written before the new state runs, so a crash
        // from here on resumes into `to`.
        let id = to.id();
        let mut to = to;
        let status_hint = to
            .report_status_hint()
            .or(self.ctx.tracker.last_reported);
        if let Some(update) = to.update_info_mut() {
            if !(self.from_loops || to_loops) {
                update.state_data_store_count += 1;
            }
            let snapshot = StateData {
                version: STATE_DATA_VERSION,
                name: id,
                update_info: update.clone(),
                update_status: status_hint,
            };

            match datastore::store_state_data(
                &self.ctx.store,
                &snapshot,
                self.ctx.config.max_state_data_store_count,
            ) {
                Ok(()) => {}
                Err(StateDataError::StoreCountExceeded) if to.on_failure_path() => {
                    debug!("Store count exceeded on the failure path, proceeding");
                }
                Err(e @ StateDataError::StoreCountExceeded) => {
                    error!("State loop detected: {e}");
                    self.from_transition = to_transition;
                    self.from_loops = to_loops;
                    let update = to.into_update().expect("update state carries a deployment");
                    return (
                        State::UpdateError {
                            update,
                            reason: "update interrupted too many times".into(),
                        },
                        false,
                    );
                }
                Err(e) => {
                    error!("Failed to store recovery data: {e}");
                    self.from_transition = to_transition;
                    self.from_loops = to_loops;
                    return to.handle_error(&mut self.ctx, UpdateError::fatal(e));
                }
            }
        }

        // Scripts on the way in.
        if self.from_transition != to_transition {
            if let Err(e) = to_transition.enter(&self.ctx.scripts) {
                warn!("Enter scripts failed: {e:#}");
                self.from_transition = to_transition;
                self.from_loops = to_loops;
                return to.handle_error(&mut self.ctx, UpdateError::transient(e));
            }
        }

        self.from_transition = to_transition;
        self.from_loops = to_loops;

        debug!("Handling state '{id}'");
        to.handle(&mut self.ctx)
    }

    /// Runs the machine until clean shutdown. `Final` is terminal and never
    /// handled; reaching its `handle` would be a driver bug.
    pub fn run(&mut self) -> ExitKind {
        let mut to = State::Init;
        loop {
            let (next, cancelled) = self.step(to);
            if cancelled && self.ctx.wait.is_shutdown() {
                info!("Shutting down");
                return ExitKind::Done;
            }
            if next.id() == StateId::Final {
                return ExitKind::Done;
            }
            to = next;
        }
    }
}
