//! The long-running daemon.
//!
//! Builds the source list, initializes every driver, supervises their
//! background loops and serves CLI requests until Ctrl-C or a `stop`
//! request cancels the root context.

mod socket;

pub use socket::socket_path;
use socket::SocketServerHandle;

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use thiserror::Error;

use crate::cancel::Context;
use crate::config::{Config, ConfigError};
use crate::driver::builtins;
use crate::source::{SourceError, SourceList};

/// How long shutdown waits for driver loops to return.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether something is answering on the daemon socket.
pub fn is_daemon_running() -> bool {
    UnixStream::connect(socket_path()).is_ok()
}

/// Run the daemon in the foreground until it is told to stop.
pub fn start(config_path: Option<&Path>) -> Result<(), DaemonError> {
    if is_daemon_running() {
        return Err(DaemonError::AlreadyRunning);
    }

    let config = Config::load(config_path)?;
    let sources = Arc::new(SourceList::from_config(&builtins(), &config)?);
    log::info!("Configured {} sources", sources.len());

    let root = Context::background();
    {
        let root = root.clone();
        ctrlc::set_handler(move || {
            log::info!("Interrupted, shutting down");
            root.cancel();
        })?;
    }

    sources.init_all(&root)?;

    let (done_tx, done_rx) = bounded(1);
    let runner = {
        let sources = Arc::clone(&sources);
        let root = root.clone();
        thread::Builder::new()
            .name("srcget-run".to_string())
            .spawn(move || {
                let result = sources.run_all(&root);
                if let Err(e) = &result {
                    log::error!("{}", e);
                    root.cancel();
                }
                let _ = done_tx.send(result);
            })?
    };

    let mut server = SocketServerHandle::spawn(Arc::clone(&sources), root.clone())?;
    log::info!("Daemon ready");

    root.wait();
    log::info!("Shutting down");
    server.shutdown();

    match done_rx.recv_timeout(SHUTDOWN_GRACE) {
        Ok(result) => {
            let _ = runner.join();
            result?;
        }
        Err(_) => log::warn!(
            "Background tasks did not stop within {}s, exiting anyway",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    log::info!("Daemon stopped");
    Ok(())
}
