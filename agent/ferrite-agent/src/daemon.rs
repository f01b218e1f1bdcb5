//! Daemon runner: drives the state machine and wires OS signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

use crate::agent::DeviceAgent;
use crate::config::{Config, DeviceBackend};
use crate::controller::Controller;
use crate::deployment_log::DeploymentLogManager;
use crate::device::{BlockDevice, DeviceOps, MockDevice};
use crate::server::ServerClient;
use crate::state::waiter::Waiter;
use crate::state::{RunContext, State};
use crate::store::{DirStore, MemStore, Store};

/// Build the agent from the configuration and drive it until it
/// reaches its final state or a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let (store, device): (Arc<dyn Store>, Box<dyn DeviceOps>) = match config.device.backend {
        DeviceBackend::Mock => (Arc::new(MemStore::new()), Box::new(MockDevice::new())),
        DeviceBackend::Block => (
            Arc::new(DirStore::new(&config.paths.state_dir)),
            Box::new(BlockDevice::new(&config.device)),
        ),
    };

    let server = ServerClient::new(&config.server);
    let agent = DeviceAgent::new(&config, server, device, store.clone());

    let waiter = Arc::new(Waiter::new());
    let stop = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(waiter.clone(), stop.clone());

    let ctx = RunContext::new(
        store,
        DeploymentLogManager::new(&config.paths.deployment_log_dir),
        waiter,
    );

    run_loop(ctx, &agent, &stop).await;
    Ok(())
}

/// Execute states until the machine reaches its final state or the
/// stop flag is raised.
///
/// The final state terminates the loop without being executed.
pub async fn run_loop(mut ctx: RunContext, controller: &dyn Controller, stop: &AtomicBool) {
    let mut state = State::Init;
    loop {
        debug!(state = %state.id(), "Entering state");
        let (next, cancelled) = state.handle(&mut ctx, controller).await;
        if cancelled {
            info!(state = %next.id(), "State execution was cancelled");
        }
        if stop.load(Ordering::SeqCst) {
            info!("Shutdown requested, update agent stopping");
            return;
        }
        if matches!(next, State::Final) {
            info!("Update agent reached its final state");
            return;
        }
        state = next;
    }
}

/// Translate SIGTERM/SIGINT into a latched stop plus a cancel of the
/// wait in flight.
fn spawn_signal_listener(waiter: Arc<Waiter>, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "Failed to install the SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(err) => {
                error!(error = %err, "Failed to install the SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }

        info!("Shutdown signal received");
        stop.store(true, Ordering::SeqCst);
        waiter.cancel();
    });
}
