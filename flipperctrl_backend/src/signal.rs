//! Process signals as a shutdown request.
//!
//! SIGINT and SIGTERM (Ctrl+C on Windows) are caught on a dedicated thread running a
//! single-threaded tokio runtime and forwarded by name on a crossbeam channel. Once the handlers
//! are installed these signals no longer terminate the process: the receiver of the channel is
//! expected to run the normal shutdown path, which zeroes every output.

use std::thread;

use crossbeam::channel::{self, Receiver};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::error::CtrlResult;

fn signal_runtime() -> CtrlResult<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// Installs the shutdown signal handlers.
///
/// # Returns
///
/// A channel receiving the name of the first shutdown signal delivered to the process.
///
/// # Errors
///
/// Fails if the runtime cannot be built or a handler cannot be registered; in that case the
/// default signal disposition is left in place.
#[cfg(unix)]
pub fn watch_shutdown_signals() -> CtrlResult<Receiver<&'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let rt = signal_runtime()?;
    let (mut sigint, mut sigterm) = {
        let _guard = rt.enter();
        (signal(SignalKind::interrupt())?, signal(SignalKind::terminate())?)
    };
    let (tx, rx) = channel::bounded(1);
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            let name = rt.block_on(async {
                tokio::select! {
                    _ = sigint.recv() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            });
            warn!("Received {}, shutting down", name);
            let _ = tx.send(name);
        })?;
    info!("SIGINT and SIGTERM handlers installed");
    Ok(rx)
}

#[cfg(not(unix))]
pub fn watch_shutdown_signals() -> CtrlResult<Receiver<&'static str>> {
    let rt = signal_runtime()?;
    let (tx, rx) = channel::bounded(1);
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || match rt.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                warn!("Received Ctrl+C, shutting down");
                let _ = tx.send("Ctrl+C");
            }
            Err(err) => tracing::error!("Ctrl+C handler failed: {}", err),
        })?;
    info!("Ctrl+C handler installed");
    Ok(rx)
}
