//! Installs a signal handler which terminates the platform on CTRL+C, SIGTERM or SIGHUP.
//!
//! Forks an async task which waits for one of the shutdown signals and then invokes
//! [Platform::terminate](crate::platform::Platform::terminate) on the given platform. The
//! server loop and all connection tasks observe the toggled flag and wind down, which
//! lets the process exit cleanly (exit code 0) - the termination path a supervisor like
//! docker or systemd takes.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::platform::Platform;

/// Installs a signal handler for the given platform.
///
/// Note that this is automatically called by the [Builder](crate::builder::Builder)
/// unless it is disabled.
pub fn install(platform: Arc<Platform>) {
    let _ = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate()).unwrap();
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup()).unwrap();

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
            },
            _ = sig_term.recv() => {
                log::info!("Received SIGTERM. Shutting down...");
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down...");
            }
        }

        platform.terminate();
    });
}
