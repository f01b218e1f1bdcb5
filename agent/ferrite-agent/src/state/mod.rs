//! The update-agent state machine.
//!
//! One cooperative task drives the agent through the deployment
//! lifecycle. Each state runs to completion and names its successor;
//! states that must survive a power cut checkpoint their entry to the
//! store and the [`Authorized`] state reconciles the persisted intent
//! with what the device actually looks like after a reboot.
//!
//! ```text
//!  Init ─► Bootstrapped ─► Authorized ─► InventoryUpdate ─► CheckWait
//!                │              │                               │
//!          AuthorizeWait   (checkpoint replay)             UpdateCheck
//!                                                               │
//!            UpdateFetch ─► UpdateInstall ─► Reboot ─► (device restarts)
//!                 ▲   │            │
//!                 └── FetchInstallRetry
//!
//!  after reboot:  Authorized ─► UpdateVerify ─► UpdateCommit ─► UpdateStatusReport
//!                                     │              │                │
//!                                  Reboot        Rollback      ReportStatusError
//! ```
//!
//! [`Authorized`]: State::Authorized

pub mod data;
pub mod retry;
pub mod waiter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::controller::{
    ArtifactStream, CheckOutcome, Controller, ReportStatus, UpdateDescriptor,
};
use crate::deployment_log::DeploymentLogManager;
use crate::error::AgentError;
use crate::store::Store;

use data::{
    load_state_data, remove_state_data, store_state_data, StateData, StateDataError, StateId,
};
use retry::{fetch_install_retry_interval, max_sending_attempts};
use waiter::Waiter;

/// Ephemeral per-run context shared by every state transition.
pub struct RunContext {
    /// Persistent store holding the checkpoint record.
    pub store: Arc<dyn Store>,
    /// Per-deployment error log capture.
    pub deployment_log: DeploymentLogManager,
    /// Cancellation point for every timed wait.
    pub waiter: Arc<Waiter>,
    /// When the server was last polled for a deployment.
    pub last_update_check: Option<Instant>,
    /// When inventory was last pushed.
    pub last_inventory_update: Option<Instant>,
    /// Fetch/install attempts consumed for the deployment in flight.
    pub fetch_install_attempts: u32,
}

impl RunContext {
    pub fn new(
        store: Arc<dyn Store>,
        deployment_log: DeploymentLogManager,
        waiter: Arc<Waiter>,
    ) -> Self {
        Self {
            store,
            deployment_log,
            waiter,
            last_update_check: None,
            last_inventory_update: None,
            fetch_install_attempts: 0,
        }
    }
}

/// A state of the update agent, carrying the data it acts on.
pub enum State {
    Init,
    Bootstrapped,
    AuthorizeWait,
    Authorized,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch {
        update: UpdateDescriptor,
    },
    FetchInstallRetry {
        update: UpdateDescriptor,
    },
    UpdateInstall {
        update: UpdateDescriptor,
        stream: ArtifactStream,
        size: u64,
    },
    Reboot {
        update: UpdateDescriptor,
    },
    UpdateVerify {
        update: UpdateDescriptor,
    },
    UpdateCommit {
        update: UpdateDescriptor,
    },
    UpdateStatusReport {
        update: UpdateDescriptor,
        status: ReportStatus,
        tries_sending: u32,
    },
    ReportStatusError {
        update: UpdateDescriptor,
        status: ReportStatus,
    },
    Rollback {
        update: UpdateDescriptor,
    },
    Error {
        cause: AgentError,
    },
    UpdateError {
        cause: AgentError,
        update: UpdateDescriptor,
    },
    Final,
}

impl State {
    /// Begin reporting `status` for `update` from a clean slate.
    pub fn update_status_report(update: UpdateDescriptor, status: ReportStatus) -> Self {
        State::UpdateStatusReport {
            update,
            status,
            tries_sending: 0,
        }
    }

    /// Stable identifier of this state.
    pub fn id(&self) -> StateId {
        match self {
            State::Init => StateId::Init,
            State::Bootstrapped => StateId::Bootstrapped,
            State::AuthorizeWait => StateId::AuthorizeWait,
            State::Authorized => StateId::Authorized,
            State::InventoryUpdate => StateId::InventoryUpdate,
            State::CheckWait => StateId::CheckWait,
            State::UpdateCheck => StateId::UpdateCheck,
            State::UpdateFetch { .. } => StateId::UpdateFetch,
            State::FetchInstallRetry { .. } => StateId::FetchInstallRetry,
            State::UpdateInstall { .. } => StateId::UpdateInstall,
            State::Reboot { .. } => StateId::Reboot,
            State::UpdateVerify { .. } => StateId::UpdateVerify,
            State::UpdateCommit { .. } => StateId::UpdateCommit,
            State::UpdateStatusReport { .. } => StateId::UpdateStatusReport,
            State::ReportStatusError { .. } => StateId::ReportStatusError,
            State::Rollback { .. } => StateId::Rollback,
            State::Error { .. } => StateId::Error,
            State::UpdateError { .. } => StateId::UpdateError,
            State::Final => StateId::Final,
        }
    }

    /// Execute this state and produce its successor.
    ///
    /// The flag reports whether the state exited because its wait was
    /// cancelled rather than by natural completion.
    pub async fn handle(self, ctx: &mut RunContext, controller: &dyn Controller) -> (State, bool) {
        match self {
            State::Init => handle_init(controller).await,
            State::Bootstrapped => handle_bootstrapped(controller).await,
            State::AuthorizeWait => handle_authorize_wait(ctx, controller).await,
            State::Authorized => handle_authorized(ctx, controller).await,
            State::InventoryUpdate => handle_inventory_update(ctx, controller).await,
            State::CheckWait => handle_check_wait(ctx, controller).await,
            State::UpdateCheck => handle_update_check(ctx, controller).await,
            State::UpdateFetch { update } => handle_update_fetch(ctx, controller, update).await,
            State::FetchInstallRetry { update } => {
                handle_fetch_install_retry(ctx, controller, update).await
            }
            State::UpdateInstall {
                update,
                stream,
                size,
            } => handle_update_install(ctx, controller, update, stream, size).await,
            State::Reboot { update } => handle_reboot(ctx, controller, update).await,
            State::UpdateVerify { update } => handle_update_verify(ctx, controller, update).await,
            State::UpdateCommit { update } => handle_update_commit(ctx, controller, update).await,
            State::UpdateStatusReport {
                update,
                status,
                tries_sending,
            } => handle_update_status_report(ctx, controller, update, status, tries_sending).await,
            State::ReportStatusError { update, status } => {
                handle_report_status_error(ctx, update, status).await
            }
            State::Rollback { update } => handle_rollback(controller, update).await,
            State::Error { cause } => handle_error(ctx, cause).await,
            State::UpdateError { cause, update } => {
                handle_update_error(ctx, cause, update).await
            }
            State::Final => panic!("the final state must never be executed"),
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id().as_str())
    }
}

/// Run a cancellable wait, returning `next` on natural expiry and
/// `same` with the cancelled flag when interrupted.
async fn state_after_wait(
    ctx: &RunContext,
    next: State,
    same: State,
    duration: Duration,
) -> (State, bool) {
    if ctx.waiter.wait(duration).await {
        (next, false)
    } else {
        (same, true)
    }
}

async fn handle_init(controller: &dyn Controller) -> (State, bool) {
    if let Err(err) = controller.bootstrap().await {
        error!(error = %err, "Bootstrap failed");
        return (State::Error { cause: err }, false);
    }
    (State::Bootstrapped, false)
}

async fn handle_bootstrapped(controller: &dyn Controller) -> (State, bool) {
    match controller.authorize().await {
        Ok(()) => (State::Authorized, false),
        Err(err) if err.is_fatal() => {
            error!(error = %err, "Authorization failed");
            (State::Error { cause: err }, false)
        }
        Err(err) => {
            warn!(error = %err, "Authorization failed, retrying later");
            (State::AuthorizeWait, false)
        }
    }
}

async fn handle_authorize_wait(ctx: &RunContext, controller: &dyn Controller) -> (State, bool) {
    let interval = controller.retry_poll_interval();
    debug!(seconds = interval.as_secs(), "Waiting before the next authorization attempt");
    state_after_wait(ctx, State::Bootstrapped, State::AuthorizeWait, interval).await
}

/// Reconcile persisted intent with the device state after a (re)start.
async fn handle_authorized(ctx: &mut RunContext, _controller: &dyn Controller) -> (State, bool) {
    let data = match load_state_data(ctx.store.as_ref()) {
        Ok(data) => data,
        Err(StateDataError::NotFound) => return (State::InventoryUpdate, false),
        Err(err) => {
            error!(error = %err, "Failed to restore the checkpoint record");
            return (
                State::UpdateError {
                    cause: AgentError::fatal(err),
                    update: UpdateDescriptor::default(),
                },
                false,
            );
        }
    };

    info!(name = %data.name, "Resuming from a checkpoint record");

    let Some(update) = data.update else {
        error!("Checkpoint record carries no deployment");
        return (
            State::UpdateError {
                cause: AgentError::fatal("checkpoint record carries no deployment"),
                update: UpdateDescriptor::default(),
            },
            false,
        );
    };

    match data.name {
        StateId::UpdateStatusReport => {
            // A failure is assumed when the outcome never made it to
            // the checkpoint.
            let status = data.status.unwrap_or(ReportStatus::Failure);
            (State::update_status_report(update, status), false)
        }
        StateId::Reboot | StateId::UpdateVerify => (State::UpdateVerify { update }, false),
        name => {
            // Interrupted before the reboot was reached, or a name that
            // is never checkpointed. The deployment is failed either
            // way and the server is still owed a report.
            error!(name = %name, "Deployment was interrupted mid-flight");
            (
                State::UpdateError {
                    cause: AgentError::fatal("deployment interrupted before reboot"),
                    update,
                },
                false,
            )
        }
    }
}

async fn handle_inventory_update(
    ctx: &mut RunContext,
    controller: &dyn Controller,
) -> (State, bool) {
    ctx.last_inventory_update = Some(Instant::now());
    if let Err(err) = controller.inventory_refresh().await {
        // Inventory is best-effort and never blocks updates.
        warn!(error = %err, "Inventory refresh failed");
    }
    (State::CheckWait, false)
}

async fn handle_check_wait(ctx: &mut RunContext, controller: &dyn Controller) -> (State, bool) {
    let now = Instant::now();
    let update_due = ctx
        .last_update_check
        .map_or(now, |last| last + controller.update_poll_interval());
    let inventory_due = ctx
        .last_inventory_update
        .map_or(now, |last| last + controller.inventory_poll_interval());

    // The action with the earlier deadline wins; ties go to the
    // update check.
    let (next, due) = if inventory_due < update_due {
        (State::InventoryUpdate, inventory_due)
    } else {
        (State::UpdateCheck, update_due)
    };

    let wait = due.saturating_duration_since(now);
    if wait.is_zero() {
        debug!(next = %next.id(), "Next action is already due");
        return (next, false);
    }

    debug!(next = %next.id(), seconds = wait.as_secs(), "Waiting until the next poll");
    state_after_wait(ctx, next, State::CheckWait, wait).await
}

async fn handle_update_check(ctx: &mut RunContext, controller: &dyn Controller) -> (State, bool) {
    ctx.last_update_check = Some(Instant::now());

    match controller.check_update().await {
        Ok(CheckOutcome::NoUpdate) => (State::CheckWait, false),
        Ok(CheckOutcome::Update(update)) => {
            info!(
                deployment_id = %update.deployment_id,
                artifact = %update.artifact_name,
                "Deployment assigned to this device"
            );
            ctx.fetch_install_attempts = 0;
            (State::UpdateFetch { update }, false)
        }
        Ok(CheckOutcome::AlreadyInstalled(update)) => {
            info!(
                deployment_id = %update.deployment_id,
                "Offered artifact is already installed"
            );
            (
                State::update_status_report(update, ReportStatus::AlreadyInstalled),
                false,
            )
        }
        Err(err) => {
            error!(error = %err, "Update check failed");
            (State::Error { cause: err }, false)
        }
    }
}

async fn handle_update_fetch(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    if let Err(err) = ctx.deployment_log.enable(&update.deployment_id) {
        warn!(error = %err, "Failed to enable deployment logging");
    }

    info!(deployment_id = %update.deployment_id, uri = %update.uri, "Fetching the update artifact");

    if let Err(err) = store_state_data(
        ctx.store.as_ref(),
        StateData {
            name: StateId::UpdateFetch,
            update: Some(update.clone()),
            ..Default::default()
        },
    ) {
        error!(error = %err, "Failed to checkpoint the fetch state");
        ctx.deployment_log
            .log_error(&format!("failed to checkpoint the fetch state: {err}"));
        return (
            State::UpdateError {
                cause: AgentError::fatal(err),
                update,
            },
            false,
        );
    }

    if let Err(err) = controller
        .report_update_status(&update, ReportStatus::Downloading)
        .await
    {
        if err.is_fatal() {
            // The backend pulled the deployment; the device is still
            // consistent, so the failure itself is not fatal.
            return (
                State::UpdateError {
                    cause: AgentError::transient(err),
                    update,
                },
                false,
            );
        }
        warn!(error = %err, "Failed to report the download status");
    }

    match controller
        .fetch_update(&update.uri, update.sha256.as_deref())
        .await
    {
        Ok((stream, size)) => (
            State::UpdateInstall {
                update,
                stream,
                size,
            },
            false,
        ),
        Err(err) => {
            warn!(error = %err, "Fetching the update failed");
            ctx.deployment_log
                .log_error(&format!("fetching the update failed: {err}"));
            (State::FetchInstallRetry { update }, false)
        }
    }
}

async fn handle_fetch_install_retry(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    let Some(interval) =
        fetch_install_retry_interval(ctx.fetch_install_attempts, controller.update_poll_interval())
    else {
        error!(
            attempts = ctx.fetch_install_attempts,
            "Giving up on the deployment, retry attempts exhausted"
        );
        ctx.deployment_log
            .log_error("fetch/install retry attempts exhausted");
        return (
            State::Error {
                cause: AgentError::transient("fetch/install retry attempts exhausted"),
            },
            false,
        );
    };

    ctx.fetch_install_attempts += 1;
    info!(
        attempt = ctx.fetch_install_attempts,
        seconds = interval.as_secs(),
        "Waiting before the next fetch attempt"
    );
    state_after_wait(
        ctx,
        State::UpdateFetch {
            update: update.clone(),
        },
        State::FetchInstallRetry { update },
        interval,
    )
    .await
}

async fn handle_update_install(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
    stream: ArtifactStream,
    size: u64,
) -> (State, bool) {
    if let Err(err) = store_state_data(
        ctx.store.as_ref(),
        StateData {
            name: StateId::UpdateInstall,
            update: Some(update.clone()),
            ..Default::default()
        },
    ) {
        error!(error = %err, "Failed to checkpoint the install state");
        ctx.deployment_log
            .log_error(&format!("failed to checkpoint the install state: {err}"));
        return (
            State::UpdateError {
                cause: AgentError::fatal(err),
                update,
            },
            false,
        );
    }

    if let Err(err) = controller
        .report_update_status(&update, ReportStatus::Installing)
        .await
    {
        if err.is_fatal() {
            return (
                State::UpdateError {
                    cause: AgentError::transient(err),
                    update,
                },
                false,
            );
        }
        warn!(error = %err, "Failed to report the install status");
    }

    info!(deployment_id = %update.deployment_id, size, "Installing the update");

    match controller.install_update(stream, size).await {
        Ok(()) => (State::Reboot { update }, false),
        Err(err) => {
            error!(error = %err, "Installing the update failed");
            ctx.deployment_log
                .log_error(&format!("installing the update failed: {err}"));
            (State::FetchInstallRetry { update }, false)
        }
    }
}

async fn handle_reboot(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    // The device reboots either way; recovery on the next boot covers
    // a missing checkpoint.
    if let Err(err) = store_state_data(
        ctx.store.as_ref(),
        StateData {
            name: StateId::Reboot,
            update: Some(update.clone()),
            ..Default::default()
        },
    ) {
        error!(error = %err, "Failed to checkpoint the reboot state");
    }

    if let Err(err) = controller
        .report_update_status(&update, ReportStatus::Rebooting)
        .await
    {
        if err.is_fatal() {
            return (
                State::UpdateError {
                    cause: AgentError::transient(err),
                    update,
                },
                false,
            );
        }
        warn!(error = %err, "Failed to report the reboot status");
    }

    info!("Rebooting the device to activate the new image");

    if let Err(err) = controller.reboot().await {
        error!(error = %err, "Reboot failed");
        ctx.deployment_log
            .log_error(&format!("rebooting the device failed: {err}"));
        return (
            State::Error {
                cause: AgentError::fatal(err),
            },
            false,
        );
    }

    (State::Final, false)
}

async fn handle_update_verify(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    if let Err(err) = ctx.deployment_log.enable(&update.deployment_id) {
        warn!(error = %err, "Failed to enable deployment logging");
    }

    let has_upgrade = match controller.has_upgrade().await {
        Ok(has_upgrade) => has_upgrade,
        Err(err) => {
            error!(error = %err, "Failed to read the upgrade flag");
            ctx.deployment_log
                .log_error(&format!("failed to read the upgrade flag: {err}"));
            return (State::UpdateError { cause: err, update }, false);
        }
    };

    if !has_upgrade {
        // The bootloader fell back to the previous image on its own.
        info!("Upgrade flag is not set, reporting a failed update");
        ctx.deployment_log
            .log_error("update failed, the bootloader rolled back to the previous image");
        return (
            State::update_status_report(update, ReportStatus::Failure),
            false,
        );
    }

    let running = controller.current_artifact_name();
    if running == update.artifact_name {
        info!(artifact = %running, "New image is running, committing");
        (State::UpdateCommit { update }, false)
    } else {
        // The new partition booted with an unexpected artifact. Reboot
        // once more to shake the bootloader out of the inconsistent
        // setup rather than rolling back outright.
        error!(
            expected = %update.artifact_name,
            running = %running,
            "Running artifact does not match the deployment"
        );
        (State::Reboot { update }, false)
    }
}

async fn handle_update_commit(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    match controller.commit_update().await {
        Ok(()) => {
            info!(deployment_id = %update.deployment_id, "Update committed");
            (
                State::update_status_report(update, ReportStatus::Success),
                false,
            )
        }
        Err(err) => {
            error!(error = %err, "Committing the update failed, rolling back");
            ctx.deployment_log
                .log_error(&format!("committing the update failed: {err}"));
            (State::Rollback { update }, false)
        }
    }
}

async fn handle_update_status_report(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: UpdateDescriptor,
    status: ReportStatus,
    mut tries_sending: u32,
) -> (State, bool) {
    if let Err(err) = ctx.deployment_log.enable(&update.deployment_id) {
        warn!(error = %err, "Failed to enable deployment logging");
    }

    // Reporting still has value when the checkpoint cannot be written;
    // recovery falls back to a failure report.
    if let Err(err) = store_state_data(
        ctx.store.as_ref(),
        StateData {
            name: StateId::UpdateStatusReport,
            update: Some(update.clone()),
            status: Some(status),
            ..Default::default()
        },
    ) {
        error!(error = %err, "Failed to checkpoint the report state");
    }

    let max_attempts = max_sending_attempts(
        controller.update_poll_interval(),
        controller.retry_poll_interval(),
    );
    let retry_interval = controller.retry_poll_interval();

    loop {
        if tries_sending >= max_attempts {
            error!(attempts = tries_sending, "Reporting the deployment status failed too many times");
            return (State::ReportStatusError { update, status }, false);
        }
        tries_sending += 1;

        match send_report(ctx, controller, &update, status).await {
            Ok(()) => break,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Reporting the deployment status failed");
                return (State::ReportStatusError { update, status }, false);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    attempt = tries_sending,
                    "Reporting the deployment status failed, retrying"
                );
                if !ctx.waiter.wait(retry_interval).await {
                    // Resume where we left off once the cancellation
                    // has been handled; the checkpoint stays put.
                    return (
                        State::UpdateStatusReport {
                            update,
                            status,
                            tries_sending,
                        },
                        false,
                    );
                }
            }
        }
    }

    info!(
        deployment_id = %update.deployment_id,
        status = %status,
        "Deployment status reported"
    );
    ctx.deployment_log.disable();

    if let Err(err) = remove_state_data(ctx.store.as_ref()) {
        error!(error = %err, "Failed to clear the checkpoint record");
    }

    (State::Init, false)
}

/// Upload the deployment log (failures only), then report the status.
async fn send_report(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    update: &UpdateDescriptor,
    status: ReportStatus,
) -> Result<(), AgentError> {
    if status == ReportStatus::Failure {
        match ctx.deployment_log.get_logs(&update.deployment_id) {
            Ok(logs) => controller.upload_log(update, &logs).await?,
            // A missing or unreadable local log never blocks the report.
            Err(err) => warn!(error = %err, "Failed to collect the deployment log"),
        }
    }
    controller.report_update_status(update, status).await
}

async fn handle_report_status_error(
    ctx: &mut RunContext,
    update: UpdateDescriptor,
    status: ReportStatus,
) -> (State, bool) {
    match status {
        ReportStatus::Success => {
            // The device runs the new image but the server never heard
            // about it. Restore the previous image so the fleet view
            // stays truthful.
            error!(
                deployment_id = %update.deployment_id,
                "Reporting success failed for good, rolling back"
            );
            (State::Rollback { update }, false)
        }
        ReportStatus::Failure | ReportStatus::AlreadyInstalled => {
            if let Err(err) = remove_state_data(ctx.store.as_ref()) {
                error!(error = %err, "Failed to clear the checkpoint record");
            }
            (State::Init, false)
        }
        status => {
            error!(status = %status, "Unexpected status in the report error state");
            (
                State::Error {
                    cause: AgentError::fatal(format!(
                        "unexpected deployment status: {status}"
                    )),
                },
                false,
            )
        }
    }
}

async fn handle_rollback(controller: &dyn Controller, update: UpdateDescriptor) -> (State, bool) {
    info!(deployment_id = %update.deployment_id, "Rolling back to the previous image");
    match controller.rollback().await {
        Ok(()) => (State::Final, false),
        Err(err) => {
            error!(error = %err, "Rollback failed");
            (
                State::Error {
                    cause: AgentError::fatal(err),
                },
                false,
            )
        }
    }
}

async fn handle_error(ctx: &mut RunContext, cause: AgentError) -> (State, bool) {
    info!(error = %cause, "Handling an error state");
    ctx.deployment_log.disable();
    if cause.is_fatal() {
        return (State::Final, false);
    }
    // Transient errors act as a soft reset of the whole cycle.
    (State::Init, false)
}

async fn handle_update_error(
    ctx: &mut RunContext,
    cause: AgentError,
    update: UpdateDescriptor,
) -> (State, bool) {
    error!(
        deployment_id = %update.deployment_id,
        error = %cause,
        "Deployment failed"
    );
    if let Err(err) = ctx.deployment_log.enable(&update.deployment_id) {
        warn!(error = %err, "Failed to enable deployment logging");
    }
    ctx.deployment_log
        .log_error(&format!("deployment failed: {cause}"));
    (
        State::update_status_report(update, ReportStatus::Failure),
        false,
    )
}
