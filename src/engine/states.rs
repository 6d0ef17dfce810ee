use std::process::Command;

use log::{debug, error, info, warn};

use hawser_api::{
    constants::BROKEN_ARTIFACT_SUFFIX,
    deployment::{DeploymentStatus, InstallOutcome, RebootRequested, StateId, UpdateInfo},
    error::UpdateError,
};
use osutils::exe::CommandCheckExt;

use crate::{
    client::{self, ApiError},
    datastore::{self, StateDataError},
    installer::{self, StagingSink},
};

use super::{context::GateVerdict, State, StateContext, WaitOutcome};

impl State {
    /// Executes the state's work and names the state to go to next. The
    /// boolean is the cancellation flag: `(same-state, true)` hands control
    /// back to the driver without progress.
    pub(super) fn handle(self, ctx: &mut StateContext) -> (State, bool) {
        match self {
            State::Init => init(ctx),
            State::Idle => idle(ctx),
            State::Authorize => authorize(ctx),
            State::AuthorizeWait => authorize_wait(ctx),
            State::InventoryUpdate => inventory_update(ctx),
            State::CheckWait => check_wait(ctx),
            State::UpdateCheck => update_check(ctx),
            State::Final => panic!("the Final state must never be handled"),
            State::UpdateFetch { update, retries } => update_fetch(ctx, update, retries),
            State::FetchStoreRetry { update, attempts } => {
                fetch_store_retry(ctx, update, attempts)
            }
            State::UpdateStore {
                update,
                fetch,
                retries,
            } => update_store(ctx, update, fetch, retries),
            State::UpdateAfterStore { update } => (State::UpdateInstall { update }, false),
            State::UpdateInstall { update } => update_install(ctx, update),
            State::UpdateReboot { update } => update_reboot(ctx, update),
            State::UpdateVerifyReboot { update } => update_verify_reboot(ctx, update),
            State::UpdateAfterReboot { update } => (
                State::UpdateCommit {
                    update,
                    report_attempts: 0,
                },
                false,
            ),
            State::UpdateCommit {
                update,
                report_attempts,
            } => update_commit(ctx, update, report_attempts),
            State::UpdatePreCommitStatusReportRetry { update, attempts } => {
                pre_commit_report_retry(ctx, update, attempts)
            }
            State::UpdateAfterFirstCommit { update } => update_after_first_commit(ctx, update),
            State::UpdateAfterCommit { update } => (
                State::UpdateCleanup {
                    update,
                    status: DeploymentStatus::Success,
                },
                false,
            ),
            State::UpdateRollback { update } => update_rollback(ctx, update),
            State::UpdateRollbackReboot { update } => update_rollback_reboot(ctx, update),
            State::UpdateVerifyRollbackReboot { update } => {
                update_verify_rollback_reboot(ctx, update)
            }
            State::UpdateAfterRollbackReboot { update } => {
                ctx.tracker.rollback_succeeded = true;
                (
                    State::UpdateError {
                        update,
                        reason: "update failed and was rolled back".into(),
                    },
                    false,
                )
            }
            State::UpdateError { update, reason } => update_error(ctx, update, reason),
            State::UpdateCleanup { update, status } => update_cleanup(ctx, update, status),
            State::UpdateStatusReport {
                update,
                status,
                report_sent,
                attempts,
            } => update_status_report(ctx, update, status, report_sent, attempts),
            State::UpdateStatusReportRetry {
                update,
                status,
                report_sent,
                attempts,
            } => status_report_retry(ctx, update, status, report_sent, attempts),
            State::ReportError {
                update,
                status,
                aborted,
            } => report_error(ctx, update, status, aborted),
        }
    }

    /// Decides where a failure inside (or on the way into) this state leads.
    /// Errors never unwind past a state boundary.
    pub(super) fn handle_error(self, ctx: &mut StateContext, err: UpdateError) -> (State, bool) {
        let id = self.id();
        warn!("State '{id}' failed: {err}");
        ctx.deplog
            .record(log::Level::Error, format!("State '{id}' failed: {err}"));

        match self {
            // Housekeeping states retreat to Idle and let the poll cycle
            // try again.
            State::Init
            | State::Idle
            | State::Authorize
            | State::AuthorizeWait
            | State::InventoryUpdate
            | State::CheckWait
            | State::UpdateCheck
            | State::Final => (State::Idle, false),

            // Nothing irreversible has happened before the payloads are
            // stored; fail the deployment without touching the system.
            State::UpdateFetch { update, .. }
            | State::FetchStoreRetry { update, .. }
            | State::UpdateStore { update, .. }
            | State::UpdateAfterStore { update } => (
                State::UpdateCleanup {
                    update,
                    status: DeploymentStatus::Failure,
                },
                false,
            ),

            // The install/verify/commit window rolls back when it can.
            State::UpdateInstall { update }
            | State::UpdateReboot { update }
            | State::UpdateVerifyReboot { update }
            | State::UpdateAfterReboot { update }
            | State::UpdateCommit { update, .. } => rollback_or_error(ctx, update, &err),

            State::UpdatePreCommitStatusReportRetry { update, .. } => (
                State::ReportError {
                    update,
                    status: DeploymentStatus::Installing,
                    aborted: err.is_aborted(),
                },
                false,
            ),

            // Once a payload committed there is no going back.
            State::UpdateAfterFirstCommit { update } | State::UpdateAfterCommit { update } => (
                State::UpdateError {
                    update,
                    reason: format!("{err}"),
                },
                false,
            ),

            State::UpdateRollback { update } => (
                State::UpdateError {
                    update,
                    reason: format!("rollback failed: {err}"),
                },
                false,
            ),

            // The rollback-reboot pair keeps trying until the store counter
            // breaks the loop.
            State::UpdateRollbackReboot { update } => {
                (State::UpdateVerifyRollbackReboot { update }, false)
            }
            State::UpdateVerifyRollbackReboot { update } => {
                (State::UpdateRollbackReboot { update }, false)
            }

            State::UpdateAfterRollbackReboot { update } => (
                State::UpdateError {
                    update,
                    reason: format!("{err}"),
                },
                false,
            ),

            State::UpdateError { update, .. } => (
                State::UpdateCleanup {
                    update,
                    status: DeploymentStatus::Failure,
                },
                false,
            ),

            // Cleanup trouble must not stop the terminal report.
            State::UpdateCleanup { update, status } => (
                State::UpdateStatusReport {
                    update,
                    status,
                    report_sent: false,
                    attempts: 0,
                },
                false,
            ),

            // A 409 from the server is not a delivery problem to retry
            // around: the deployment is dead, and that always means the
            // rollback path, never a quiet retreat to Idle.
            State::UpdateStatusReport { update, status, .. }
            | State::UpdateStatusReportRetry { update, status, .. } => {
                if err.is_aborted() {
                    abort_deployment(ctx, update)
                } else {
                    (
                        State::ReportError {
                            update,
                            status,
                            aborted: false,
                        },
                        false,
                    )
                }
            }

            State::ReportError { update, .. } => {
                forget_deployment(ctx, &update);
                (State::Idle, false)
            }
        }
    }
}

/// Rollback is only an option while it is supported and not yet attempted;
/// everything else lands in the failure chain.
fn rollback_or_error(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    err: &UpdateError,
) -> (State, bool) {
    if update.rollback_supported() && !ctx.tracker.rollback_attempted {
        info!("Attempting rollback: {err}");
        (State::UpdateRollback { update }, false)
    } else {
        (
            State::UpdateError {
                update,
                reason: format!("{err}"),
            },
            false,
        )
    }
}

/// Ends a deployment the server aborted. An abort is unconditionally
/// fatal: the old software comes back through rollback while that is still
/// possible. Once rollback ran (or was never supported) the deployment is
/// dropped outright — the server answers every further report for it with
/// the same abort, so the failure chain would never terminate.
fn abort_deployment(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    if update.rollback_supported() && !ctx.tracker.rollback_attempted {
        info!(
            "Deployment '{}' was aborted on the server, rolling back",
            update.id
        );
        (State::UpdateRollback { update }, false)
    } else {
        warn!(
            "Deployment '{}' was aborted on the server, discarding it",
            update.id
        );
        forget_deployment(ctx, &update);
        (State::Idle, false)
    }
}

/// Drops every trace of a deployment: recovery data, control maps, and the
/// deployment-scoped logger.
fn forget_deployment(ctx: &mut StateContext, update: &UpdateInfo) {
    if let Err(e) = datastore::remove_state_data(&ctx.store) {
        error!("Failed to remove state data: {e:#}");
    }
    ctx.control_maps.delete_all_priorities(&update.id);
    ctx.deplog.disable();
}

fn init(ctx: &mut StateContext) -> (State, bool) {
    match datastore::load_state_data(&ctx.store) {
        Ok(None) => (State::Idle, false),
        Ok(Some(snapshot)) => resume(ctx, snapshot.name, snapshot.update_info, snapshot.update_status),
        Err(StateDataError::SchemaMigration {
            version,
            update_info: Some(update),
        }) => {
            error!("Cannot migrate state data (version {version}), failing the deployment");
            prepare_resumed_deployment(ctx, &update);
            (
                State::UpdateError {
                    update,
                    reason: format!("state data version {version} cannot be migrated"),
                },
                false,
            )
        }
        Err(e) => {
            // Unreadable recovery data with no deployment to fail: all that
            // is left is to clear it and start over.
            error!("Discarding unusable state data: {e}");
            if let Err(e) = datastore::remove_state_data(&ctx.store) {
                error!("Failed to remove state data: {e:#}");
            }
            (State::Idle, false)
        }
    }
}

/// Re-attaches the per-deployment resources after a process restart.
fn prepare_resumed_deployment(ctx: &mut StateContext, update: &UpdateInfo) {
    if let Err(e) = ctx.deplog.enable(&update.id) {
        warn!("Failed to resume deployment log: {e:#}");
    }
    match installer::restore(&ctx.config, &update.artifact.payload_types) {
        Ok(installers) => ctx.installers = installers,
        Err(e) => {
            warn!("Failed to restore installers: {e:#}");
            ctx.installers = Vec::new();
        }
    }
}

fn resume(
    ctx: &mut StateContext,
    name: StateId,
    update: UpdateInfo,
    update_status: Option<DeploymentStatus>,
) -> (State, bool) {
    let update = Box::new(update);
    info!(
        "Resuming deployment '{}' from state '{name}'",
        update.id
    );
    prepare_resumed_deployment(ctx, &update);

    // Reconstruct what the persisted state name tells us about progress.
    ctx.tracker = Default::default();
    ctx.tracker.install_started = matches!(
        name,
        StateId::UpdateInstall
            | StateId::UpdateReboot
            | StateId::UpdateVerifyReboot
            | StateId::UpdateAfterReboot
            | StateId::UpdateCommit
            | StateId::UpdatePreCommitStatusReportRetry
            | StateId::UpdateAfterFirstCommit
            | StateId::UpdateAfterCommit
            | StateId::UpdateRollback
            | StateId::UpdateRollbackReboot
            | StateId::UpdateVerifyRollbackReboot
            | StateId::UpdateAfterRollbackReboot
            | StateId::UpdateError
    );
    ctx.tracker.rollback_attempted = matches!(
        name,
        StateId::UpdateRollback
            | StateId::UpdateRollbackReboot
            | StateId::UpdateVerifyRollbackReboot
            | StateId::UpdateAfterRollbackReboot
    );
    ctx.tracker.rollback_succeeded = name == StateId::UpdateAfterRollbackReboot;

    // An update that has been interrupted more often than the bound is
    // stuck; stop retrying it.
    if update.state_data_store_count > ctx.config.max_state_data_store_count {
        error!("Update interrupted too many times, giving up");
        return if update.rollback_supported() {
            (State::UpdateRollback { update }, false)
        } else {
            (
                State::UpdateError {
                    update,
                    reason: "update interrupted too many times".into(),
                },
                false,
            )
        };
    }

    let status = update_status.unwrap_or(DeploymentStatus::Failure);
    let next = match name {
        // Download progress is not worth trusting; start the fetch over.
        StateId::UpdateFetch | StateId::UpdateStore | StateId::FetchStoreRetry => {
            State::UpdateFetch { update, retries: 0 }
        }
        StateId::UpdateAfterStore => State::UpdateAfterStore { update },
        StateId::UpdateInstall => State::UpdateInstall { update },

        // Reboot-protected states re-enter through verification so the
        // Leave scripts of the reboot transition run on the new boot and
        // the partition switch is actually checked.
        StateId::UpdateReboot | StateId::UpdateVerifyReboot => {
            State::UpdateVerifyReboot { update }
        }
        StateId::UpdateAfterReboot => State::UpdateAfterReboot { update },
        StateId::UpdateRollbackReboot | StateId::UpdateVerifyRollbackReboot => {
            State::UpdateVerifyRollbackReboot { update }
        }
        StateId::UpdateAfterRollbackReboot => State::UpdateAfterRollbackReboot { update },

        StateId::UpdateCommit => {
            // If the running system already identifies as the new artifact,
            // the commit went through and only the aftermath is missing.
            let running = osutils::manifest::load_key(
                &ctx.config.artifact_info_path,
                "artifact_name",
            )
            .ok();
            if running.as_deref() == Some(update.artifact.name.as_str()) {
                State::UpdateAfterFirstCommit { update }
            } else {
                State::UpdateCommit {
                    update,
                    report_attempts: 0,
                }
            }
        }
        StateId::UpdatePreCommitStatusReportRetry => State::UpdateCommit {
            update,
            report_attempts: 0,
        },
        StateId::UpdateAfterFirstCommit => State::UpdateAfterFirstCommit { update },
        StateId::UpdateAfterCommit => State::UpdateAfterCommit { update },

        StateId::UpdateRollback => State::UpdateRollback { update },
        StateId::UpdateError => State::UpdateError {
            update,
            reason: "update interrupted".into(),
        },
        StateId::UpdateCleanup => State::UpdateCleanup { update, status },
        StateId::UpdateStatusReport | StateId::UpdateStatusReportRetry => {
            State::UpdateStatusReport {
                update,
                status,
                report_sent: false,
                attempts: 0,
            }
        }
        // Whether an abort triggered the report error does not survive a
        // restart; the status-based routing is the safe reading.
        StateId::ReportError => State::ReportError {
            update,
            status,
            aborted: false,
        },

        // A housekeeping state has no business being persisted.
        other => {
            error!("State data names non-resumable state '{other}'");
            State::UpdateError {
                update,
                reason: format!("cannot resume into state '{other}'"),
            }
        }
    };
    (next, false)
}

fn idle(ctx: &mut StateContext) -> (State, bool) {
    ctx.deplog.disable();
    ctx.installers.clear();

    if ctx.api.has_token() {
        (State::CheckWait, false)
    } else {
        (State::Authorize, false)
    }
}

fn authorize(ctx: &mut StateContext) -> (State, bool) {
    let cached = ctx.auth.get_token().ok().flatten();
    let token = match cached {
        Some(token) => token,
        None => match ctx.auth.fetch_token() {
            Ok(token) => token,
            Err(e) => {
                warn!("Authorization failed: {e:#}");
                return (State::AuthorizeWait, false);
            }
        },
    };

    ctx.api.set_token(Some(token));
    (State::InventoryUpdate, false)
}

fn authorize_wait(ctx: &mut StateContext) -> (State, bool) {
    debug!(
        "Waiting {:?} before re-authorizing",
        ctx.config.retry_poll_interval()
    );
    match ctx.wait.wait(ctx.config.retry_poll_interval()) {
        WaitOutcome::Cancelled => (State::AuthorizeWait, true),
        _ => (State::Authorize, false),
    }
}

fn inventory_update(ctx: &mut StateContext) -> (State, bool) {
    let device_type = ctx.device.device_type().unwrap_or_default();
    let artifact_name = ctx
        .device
        .artifact_name(&ctx.store)
        .unwrap_or_else(|_| "unknown".into());

    let attributes = client::inventory::gather_attributes(&device_type, &artifact_name);
    if let Err(e) = ctx.api.submit_inventory(&attributes) {
        // Inventory is best effort and must never hold up updates.
        warn!("Inventory submission failed: {e}");
    }
    (State::CheckWait, false)
}

fn check_wait(ctx: &mut StateContext) -> (State, bool) {
    debug!(
        "Waiting {:?} until the next update check",
        ctx.config.update_poll_interval()
    );
    match ctx.wait.wait(ctx.config.update_poll_interval()) {
        WaitOutcome::Cancelled => (State::CheckWait, true),
        _ => (State::UpdateCheck, false),
    }
}

fn update_check(ctx: &mut StateContext) -> (State, bool) {
    let device_type = match ctx.device.device_type() {
        Ok(device_type) => device_type,
        Err(e) => {
            error!("{e:#}");
            return (State::Idle, false);
        }
    };
    let artifact_name = match ctx.device.artifact_name(&ctx.store) {
        Ok(name) => name,
        Err(e) => {
            error!("{e:#}");
            return (State::Idle, false);
        }
    };

    let response = match ctx.api.check_update(&device_type, &artifact_name) {
        Ok(None) => {
            debug!("No deployment pending");
            return (State::Idle, false);
        }
        Ok(Some(response)) => response,
        Err(ApiError::Unauthorized) => {
            info!("Update check rejected, re-authorizing");
            ctx.api.set_token(None);
            return (State::Authorize, false);
        }
        Err(e) => {
            warn!("Update check failed: {e}");
            return (State::Idle, false);
        }
    };

    let update = Box::new(response.update);
    info!(
        "Deployment '{}' offers artifact '{}'",
        update.id, update.artifact.name
    );

    // A fresh deployment gets fresh bookkeeping and its own log.
    ctx.tracker = Default::default();
    if let Err(e) = ctx.deplog.enable(&update.id) {
        warn!("Failed to enable deployment log: {e:#}");
    }

    if update.artifact.name == artifact_name {
        info!("Artifact '{artifact_name}' is already installed");
        return (
            State::UpdateStatusReport {
                update,
                status: DeploymentStatus::AlreadyInstalled,
                report_sent: false,
                attempts: 0,
            },
            false,
        );
    }

    if !update.artifact.compatible_devices.is_empty()
        && !update.artifact.supports_device(&device_type)
    {
        warn!("Offered artifact does not support device type '{device_type}'");
        return fail_deployment(ctx, update, "artifact is not compatible with this device");
    }

    let provides = match ctx.device.provides(&ctx.store) {
        Ok(provides) => provides,
        Err(e) => return fail_deployment(ctx, update, &format!("{e:#}")),
    };
    if let Err(e) = update.artifact.check_depends(&device_type, &provides) {
        warn!("Dependency check failed: {e}");
        return fail_deployment(ctx, update, &format!("{e}"));
    }

    if let Some(map) = response.control_map {
        if let Err(e) = ctx
            .control_maps
            .insert_replace_all_priorities(&update.id, map)
        {
            error!("Rejecting deployment: {e:#}");
            return fail_deployment(ctx, update, "control map does not match the deployment");
        }
    }

    (State::UpdateFetch { update, retries: 0 }, false)
}

/// Routes a deployment that failed before any payload bytes were consumed:
/// the server still gets its failure status, and cleanup still runs.
fn fail_deployment(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    reason: &str,
) -> (State, bool) {
    if let Err(e) = ctx.deplog.enable(&update.id) {
        warn!("Failed to enable deployment log: {e:#}");
    }
    ctx.deplog.record(log::Level::Error, reason);
    (
        State::UpdateCleanup {
            update,
            status: DeploymentStatus::Failure,
        },
        false,
    )
}

fn update_fetch(ctx: &mut StateContext, update: Box<UpdateInfo>, retries: u32) -> (State, bool) {
    if let Err(e) = ctx.deplog.enable(&update.id) {
        warn!("Failed to enable deployment log: {e:#}");
    }
    ctx.deplog
        .record(log::Level::Info, format!("Fetching artifact from {}", update.uri));

    if let Err(e) = ctx.report_status(&update, DeploymentStatus::Downloading) {
        if e.is_fatal() {
            return fail_deployment(ctx, update, &format!("{e}"));
        }
        // A missed progress report is not worth failing the download over.
        warn!("Could not report 'downloading': {e}");
    }

    match ctx.api.fetch_update(&update.uri, 0) {
        Ok(fetch) => (
            State::UpdateStore {
                update,
                fetch,
                retries,
            },
            false,
        ),
        Err(e) if e.is_transient() => {
            warn!("Fetch failed: {e}");
            (
                State::FetchStoreRetry {
                    update,
                    attempts: retries,
                },
                false,
            )
        }
        Err(e) => fail_deployment(ctx, update, &format!("fetch failed: {e}")),
    }
}

fn fetch_store_retry(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    attempts: u32,
) -> (State, bool) {
    if attempts >= client::sending_attempts(&ctx.config) {
        return fail_deployment(ctx, update, "artifact download attempts exhausted");
    }

    let delay = client::retry_backoff(attempts, ctx.config.retry_poll_interval());
    info!(
        "Retrying artifact download in {delay:?} (attempt {})",
        attempts + 1
    );
    match ctx.wait.wait(delay) {
        WaitOutcome::Cancelled => (State::FetchStoreRetry { update, attempts }, true),
        _ => (
            State::UpdateFetch {
                update,
                retries: attempts + 1,
            },
            false,
        ),
    }
}

fn update_store(
    ctx: &mut StateContext,
    mut update: Box<UpdateInfo>,
    fetch: crate::client::FetchResult,
    retries: u32,
) -> (State, bool) {
    ctx.deplog
        .record(log::Level::Info, "Storing artifact payloads");

    let device_type = match ctx.device.device_type() {
        Ok(device_type) => device_type,
        Err(e) => return fail_deployment(ctx, update, &format!("{e:#}")),
    };
    let provides = match ctx.device.provides(&ctx.store) {
        Ok(provides) => provides,
        Err(e) => return fail_deployment(ctx, update, &format!("{e:#}")),
    };

    let verify_key = ctx.config.artifact_verify_key.clone();
    let result = {
        let mut sink = StagingSink {
            config: &ctx.config,
            scripts: &ctx.scripts,
            device_type: &device_type,
            provides: &provides,
            expected_name: Some(&update.artifact.name),
            installers: &mut ctx.installers,
        };
        crate::artifact::stream(fetch.reader, verify_key.as_deref(), &mut sink)
    };

    let header = match result {
        Ok(header) => header,
        Err(e) => {
            // A torn stream is retried; a bad artifact is final.
            let transient = e
                .chain()
                .any(|c| c.is::<std::io::Error>() || c.is::<reqwest::Error>());
            ctx.deplog
                .record(log::Level::Error, format!("Storing artifact failed: {e:#}"));
            return if transient {
                warn!("Artifact stream broke: {e:#}");
                (
                    State::FetchStoreRetry {
                        update,
                        attempts: retries,
                    },
                    false,
                )
            } else {
                error!("Artifact rejected: {e:#}");
                fail_deployment(ctx, update, &format!("artifact rejected: {e:#}"))
            };
        }
    };

    // The header is authoritative from here on; the server's announcement
    // was only a preview.
    update.artifact = header.artifact;

    match installer::probe_supports_rollback(&mut ctx.installers) {
        Ok(supported) => update.supports_rollback.record(supported),
        Err(e) => return fail_deployment(ctx, update, &format!("{e:#}")),
    }

    (State::UpdateAfterStore { update }, false)
}

fn update_install(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    ctx.tracker.install_started = true;

    if let Err(e) = ctx.report_status(&update, DeploymentStatus::Installing) {
        if e.is_fatal() {
            return State::UpdateInstall { update }.handle_error(ctx, e);
        }
        warn!("Could not report 'installing': {e}");
    }

    match ctx.gate(&update, "ArtifactInstall_Enter") {
        GateVerdict::Proceed => {}
        GateVerdict::Cancelled => return (State::UpdateInstall { update }, true),
        GateVerdict::Fail => {
            let err = UpdateError::fatal(anyhow::anyhow!(
                "deployment failed by its control map before install"
            ));
            return State::UpdateInstall { update }.handle_error(ctx, err);
        }
    }

    for i in 0..ctx.installers.len() {
        if let Err(e) = ctx.installers[i].install_update() {
            ctx.deplog
                .record(log::Level::Error, format!("Installation failed: {e:#}"));
            return State::UpdateInstall { update }.handle_error(ctx, UpdateError::fatal(e));
        }
    }

    let mut update = update;
    let mut requested = Vec::with_capacity(ctx.installers.len());
    for i in 0..ctx.installers.len() {
        match ctx.installers[i].needs_reboot() {
            Ok(reboot) => requested.push(reboot),
            Err(e) => {
                return State::UpdateInstall { update }
                    .handle_error(ctx, UpdateError::fatal(e))
            }
        }
    }
    update.reboot_requested = requested;
    update.needs_reboot = RebootRequested::No;
    for reboot in &update.reboot_requested {
        update.needs_reboot.merge(*reboot);
    }

    if update.needs_reboot.needs_reboot() {
        (State::UpdateReboot { update }, false)
    } else {
        (
            State::UpdateCommit {
                update,
                report_attempts: 0,
            },
            false,
        )
    }
}

fn update_reboot(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    if let Err(e) = ctx.report_status(&update, DeploymentStatus::Rebooting) {
        if e.is_fatal() {
            return State::UpdateReboot { update }.handle_error(ctx, e);
        }
        warn!("Could not report 'rebooting': {e}");
    }

    match ctx.gate(&update, "ArtifactReboot_Enter") {
        GateVerdict::Proceed => {}
        GateVerdict::Cancelled => return (State::UpdateReboot { update }, true),
        GateVerdict::Fail => {
            let err = UpdateError::fatal(anyhow::anyhow!(
                "deployment failed by its control map before reboot"
            ));
            return State::UpdateReboot { update }.handle_error(ctx, err);
        }
    }

    for i in 0..ctx.installers.len() {
        if update.reboot_requested.get(i) == Some(&RebootRequested::Yes) {
            if let Err(e) = ctx.installers[i].reboot() {
                return State::UpdateReboot { update }.handle_error(ctx, UpdateError::fatal(e));
            }
        }
    }

    if update
        .reboot_requested
        .contains(&RebootRequested::Automatic)
    {
        info!("Rebooting to finish the update");
        // On a real device this call does not return; the next state is
        // reached through state data on the following boot.
        if let Err(e) = Command::new(&ctx.config.reboot_command).run_and_check() {
            return State::UpdateReboot { update }.handle_error(ctx, UpdateError::fatal(e));
        }
    }

    (State::UpdateVerifyReboot { update }, false)
}

fn update_verify_reboot(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    for i in 0..ctx.installers.len() {
        if let Err(e) = ctx.installers[i].verify_reboot() {
            ctx.deplog
                .record(log::Level::Error, format!("Reboot verification failed: {e:#}"));
            return State::UpdateVerifyReboot { update }
                .handle_error(ctx, UpdateError::fatal(e));
        }
    }
    (State::UpdateAfterReboot { update }, false)
}

fn update_commit(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    report_attempts: u32,
) -> (State, bool) {
    // The pre-commit status must reach the server: it is the last moment
    // the deployment can still be abandoned cleanly.
    if let Err(e) = ctx.report_status(&update, DeploymentStatus::Installing) {
        if e.is_fatal() {
            return State::UpdateCommit {
                update,
                report_attempts,
            }
            .handle_error(ctx, e);
        }
        warn!("Could not report pre-commit status: {e}");
        return (
            State::UpdatePreCommitStatusReportRetry {
                update,
                attempts: report_attempts,
            },
            false,
        );
    }

    match ctx.gate(&update, "ArtifactCommit_Enter") {
        GateVerdict::Proceed => {}
        GateVerdict::Cancelled => {
            return (
                State::UpdateCommit {
                    update,
                    report_attempts,
                },
                true,
            )
        }
        GateVerdict::Fail => {
            let err = UpdateError::fatal(anyhow::anyhow!(
                "deployment failed by its control map before commit"
            ));
            return State::UpdateCommit {
                update,
                report_attempts,
            }
            .handle_error(ctx, err);
        }
    }

    for i in 0..ctx.installers.len() {
        if let Err(e) = ctx.installers[i].commit_update() {
            ctx.deplog
                .record(log::Level::Error, format!("Commit failed: {e:#}"));
            return State::UpdateCommit {
                update,
                report_attempts,
            }
            .handle_error(ctx, UpdateError::fatal(e));
        }
    }

    info!("Update committed");
    (State::UpdateAfterFirstCommit { update }, false)
}

fn pre_commit_report_retry(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    attempts: u32,
) -> (State, bool) {
    if attempts + 1 >= client::sending_attempts(&ctx.config) {
        return (
            State::ReportError {
                update,
                status: DeploymentStatus::Installing,
                aborted: false,
            },
            false,
        );
    }

    match ctx.wait.wait(ctx.config.retry_poll_interval()) {
        WaitOutcome::Cancelled => (
            State::UpdatePreCommitStatusReportRetry { update, attempts },
            true,
        ),
        _ => (
            State::UpdateCommit {
                update,
                report_attempts: attempts + 1,
            },
            false,
        ),
    }
}

fn update_after_first_commit(
    ctx: &mut StateContext,
    mut update: Box<UpdateInfo>,
) -> (State, bool) {
    // The device now runs the new artifact: record its identity and
    // provides, and finish any pending schema migration with it.
    let result = datastore::commit_artifact_data(
        &ctx.store,
        &update.artifact.name,
        update.artifact.group.as_deref(),
        &update.artifact.provides,
        &update.artifact.clears_provides,
    );
    if let Err(e) = result {
        return State::UpdateAfterFirstCommit { update }
            .handle_error(ctx, UpdateError::fatal(e));
    }

    update.has_db_schema_update = false;
    (State::UpdateAfterCommit { update }, false)
}

fn update_rollback(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    ctx.tracker.rollback_attempted = true;
    ctx.deplog.record(log::Level::Info, "Rolling back");

    for i in 0..ctx.installers.len() {
        if let Err(e) = ctx.installers[i].rollback() {
            return State::UpdateRollback { update }.handle_error(ctx, UpdateError::fatal(e));
        }
    }

    if update
        .reboot_requested
        .iter()
        .any(|reboot| reboot.needs_reboot())
    {
        (State::UpdateRollbackReboot { update }, false)
    } else {
        ctx.tracker.rollback_succeeded = true;
        (
            State::UpdateError {
                update,
                reason: "update failed and was rolled back".into(),
            },
            false,
        )
    }
}

fn update_rollback_reboot(ctx: &mut StateContext, update: Box<UpdateInfo>) -> (State, bool) {
    for (installer, requested) in ctx
        .installers
        .iter_mut()
        .zip(update.reboot_requested.iter())
    {
        if *requested == RebootRequested::Yes {
            if let Err(e) = installer.rollback_reboot() {
                // Verification decides whether the reboot worked out.
                warn!("Rollback reboot failed: {e:#}");
            }
        }
    }

    if update
        .reboot_requested
        .contains(&RebootRequested::Automatic)
    {
        info!("Rebooting into the old software");
        if let Err(e) = Command::new(&ctx.config.reboot_command).run_and_check() {
            warn!("Rollback reboot failed: {e:#}");
        }
    }

    (State::UpdateVerifyRollbackReboot { update }, false)
}

fn update_verify_rollback_reboot(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
) -> (State, bool) {
    for i in 0..ctx.installers.len() {
        if let Err(e) = ctx.installers[i].verify_rollback_reboot() {
            return State::UpdateVerifyRollbackReboot { update }
                .handle_error(ctx, UpdateError::fatal(e));
        }
    }
    ctx.tracker.rollback_succeeded = true;
    (State::UpdateAfterRollbackReboot { update }, false)
}

fn update_error(ctx: &mut StateContext, update: Box<UpdateInfo>, reason: String) -> (State, bool) {
    error!("Deployment '{}' failed: {reason}", update.id);
    ctx.deplog.record(log::Level::Error, &reason);

    for installer in ctx.installers.iter_mut() {
        if let Err(e) = installer.failure() {
            warn!("Failure callout failed: {e:#}");
        }
    }

    (
        State::UpdateCleanup {
            update,
            status: DeploymentStatus::Failure,
        },
        false,
    )
}

fn update_cleanup(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    status: DeploymentStatus,
) -> (State, bool) {
    for installer in ctx.installers.iter_mut() {
        if let Err(e) = installer.cleanup() {
            warn!("Cleanup callout failed: {e:#}");
        }
    }

    let outcome = match status {
        DeploymentStatus::Success => InstallOutcome::SuccessfulInstall,
        _ if ctx.tracker.rollback_succeeded => InstallOutcome::SuccessfulRollback,
        _ => InstallOutcome::UnsuccessfulInstall,
    };

    // A failure after installation began, with no verified rollback, leaves
    // the device in a state no artifact name describes truthfully.
    if outcome == InstallOutcome::UnsuccessfulInstall && ctx.tracker.install_started {
        let broken = format!("{}{}", update.artifact.name, BROKEN_ARTIFACT_SUFFIX);
        if let Err(e) = datastore::write_artifact_name(&ctx.store, &broken) {
            error!("Failed to record artifact name '{broken}': {e:#}");
        }
    }

    ctx.tracker.outcome = Some(outcome);
    info!(
        "Deployment '{}' finished: {outcome}",
        update.id
    );

    (
        State::UpdateStatusReport {
            update,
            status,
            report_sent: false,
            attempts: 0,
        },
        false,
    )
}

fn update_status_report(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    status: DeploymentStatus,
    report_sent: bool,
    attempts: u32,
) -> (State, bool) {
    let mut report_sent = report_sent;

    if !report_sent {
        match ctx.report_status(&update, status) {
            Ok(()) => report_sent = true,
            Err(e) if e.is_fatal() => {
                return State::UpdateStatusReport {
                    update,
                    status,
                    report_sent,
                    attempts,
                }
                .handle_error(ctx, e)
            }
            Err(e) => {
                warn!("Could not report '{status}': {e}");
                return (
                    State::UpdateStatusReportRetry {
                        update,
                        status,
                        report_sent,
                        attempts,
                    },
                    false,
                );
            }
        }
    }

    // A failed deployment also ships its log, so the server can tell why.
    if status == DeploymentStatus::Failure {
        let messages = ctx.deplog.entries(&update.id).unwrap_or_default();
        if let Err(e) = ctx.api.upload_log(&update.id, &messages) {
            if !e.is_transient() {
                return State::UpdateStatusReport {
                    update,
                    status,
                    report_sent,
                    attempts,
                }
                .handle_error(ctx, e.into());
            }
            warn!("Could not upload the deployment log: {e}");
            return (
                State::UpdateStatusReportRetry {
                    update,
                    status,
                    report_sent,
                    attempts,
                },
                false,
            );
        }
    }

    // The server has its terminal answer; the deployment is over.
    forget_deployment(ctx, &update);
    (State::Idle, false)
}

fn status_report_retry(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    status: DeploymentStatus,
    report_sent: bool,
    attempts: u32,
) -> (State, bool) {
    if attempts + 1 >= client::sending_attempts(&ctx.config) {
        return (
            State::ReportError {
                update,
                status,
                aborted: false,
            },
            false,
        );
    }

    match ctx.wait.wait(ctx.config.retry_poll_interval()) {
        WaitOutcome::Cancelled => (
            State::UpdateStatusReportRetry {
                update,
                status,
                report_sent,
                attempts,
            },
            true,
        ),
        _ => (
            State::UpdateStatusReport {
                update,
                status,
                report_sent,
                attempts: attempts + 1,
            },
            false,
        ),
    }
}

fn report_error(
    ctx: &mut StateContext,
    update: Box<UpdateInfo>,
    status: DeploymentStatus,
    aborted: bool,
) -> (State, bool) {
    error!(
        "Giving up on reporting status '{status}' for deployment '{}'",
        update.id
    );

    // A server abort outranks whatever status happened to be in flight
    // when it arrived: the deployment ends through rollback.
    if aborted {
        return abort_deployment(ctx, update);
    }

    match status {
        // A success (or pre-commit) the server never heard of is not a
        // success: fall back to the old software where possible.
        DeploymentStatus::Success | DeploymentStatus::Installing => {
            let err = UpdateError::fatal(anyhow::anyhow!(
                "terminal status could not be delivered"
            ));
            rollback_or_error(ctx, update, &err)
        }
        _ => {
            forget_deployment(ctx, &update);
            (State::Idle, false)
        }
    }
}
