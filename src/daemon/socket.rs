//! Unix socket server for handling JSON-RPC requests from the CLI.

use std::io::{self, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cancel::Context;
use crate::cloner;
use crate::protocol::{
    CloneResult, Notification, Request, ResolveResult, Response, RpcError, RpcErrorResponse,
    RpcNotification, RpcResponse, SourcesResult, VersionResult, read_request, write_message,
};
use crate::resolver;
use crate::source::SourceList;

/// Get the socket path for the daemon.
///
/// Uses `$XDG_RUNTIME_DIR/srcget.sock` on Linux.
/// Falls back to `/tmp/srcget-$UID.sock`.
pub fn socket_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("srcget.sock");
    }

    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/srcget-{}.sock", uid))
}

/// State shared by request handlers.
struct Shared {
    sources: Arc<SourceList>,
    /// Cancelled to stop the daemon.
    root: Context,
}

/// Writes notifications for one in-flight request.
struct Notifier<'a> {
    writer: Mutex<&'a UnixStream>,
}

impl Notifier<'_> {
    fn send(&self, notification: Notification) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *writer, &RpcNotification::new(notification))
    }
}

/// Handle a single JSON-RPC request.
fn handle_request(
    shared: &Shared,
    ctx: &Context,
    request: Request,
    notifier: &Notifier<'_>,
) -> Result<Response, RpcError> {
    match request {
        Request::Sources => Ok(Response::Sources(SourcesResult {
            sources: shared.sources.statuses(ctx),
        })),

        Request::Resolve { query } => {
            let mut count = 0;
            let stream = resolver::resolve(ctx, Arc::clone(&shared.sources), &query)
                .map_err(|e| RpcError::internal(format!("unable to start resolution: {}", e)))?;
            for item in stream {
                let resolved = item.map_err(|e| RpcError::operation_failed(e.to_string()))?;
                notifier
                    .send(Notification::Repo {
                        source: resolved.source,
                        repo: resolved.repo,
                    })
                    .map_err(|e| RpcError::internal(format!("client went away: {}", e)))?;
                count += 1;
            }
            Ok(Response::Resolve(ResolveResult { count }))
        }

        Request::Clone { source, repo_id } => {
            let log = |line: &str| {
                let sent = notifier.send(Notification::Log {
                    line: line.to_string(),
                });
                if sent.is_err() {
                    // Nobody is listening any more.
                    ctx.cancel();
                }
            };
            let directory = cloner::clone_repo(ctx, &shared.sources, &source, &repo_id, &log)
                .map_err(|e| RpcError::operation_failed(e.to_string()))?;
            Ok(Response::Clone(CloneResult {
                directory: directory.display().to_string(),
            }))
        }

        Request::Version => Ok(Response::Version(VersionResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        })),

        Request::Stop => {
            log::info!("Stop requested");
            shared.root.cancel();
            Ok(Response::Ok(()))
        }
    }
}

/// Handle a connected client, reading requests and writing responses.
fn handle_client(shared: &Shared, stream: UnixStream) {
    let mut reader = BufReader::new(&stream);
    let mut writer = &stream;

    loop {
        let rpc_req = match read_request(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => break, // Client disconnected
            Err(e) => {
                log::warn!("Failed to read request: {}", e);
                break;
            }
        };

        let id = rpc_req.id.clone();
        let ctx = shared.root.child();
        let notifier = Notifier {
            writer: Mutex::new(&stream),
        };

        let result = handle_request(shared, &ctx, rpc_req.request, &notifier);
        ctx.cancel();

        match result {
            Ok(result) => {
                let response = RpcResponse::new(result, id);
                if let Err(e) = write_message(&mut writer, &response) {
                    log::warn!("Failed to write response: {}", e);
                    break;
                }
            }
            Err(error) => {
                let response = RpcErrorResponse::new(error, id);
                if let Err(e) = write_message(&mut writer, &response) {
                    log::warn!("Failed to write error response: {}", e);
                    break;
                }
            }
        }
    }
}

/// Handle for managing the socket server thread.
pub struct SocketServerHandle {
    thread: Option<JoinHandle<()>>,
    root: Context,
}

impl SocketServerHandle {
    /// Spawn the socket server thread. Cancelling `root` (or a `stop`
    /// request) stops accepting connections.
    pub fn spawn(sources: Arc<SourceList>, root: Context) -> io::Result<Self> {
        let path = socket_path();

        // Remove stale socket file
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        log::info!("Socket server listening on {}", path.display());

        let shared = Arc::new(Shared {
            sources,
            root: root.clone(),
        });

        let thread = thread::Builder::new()
            .name("srcget-socket".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if shared.root.is_cancelled() {
                        break;
                    }

                    match stream {
                        Ok(stream) => {
                            let shared = Arc::clone(&shared);
                            thread::spawn(move || handle_client(&shared, stream));
                        }
                        Err(e) => {
                            if shared.root.is_cancelled() {
                                break;
                            }
                            log::warn!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // Cleanup socket file
                let _ = std::fs::remove_file(socket_path());
                log::info!("Socket server stopped");
            })?;

        Ok(Self {
            thread: Some(thread),
            root,
        })
    }

    /// Signal shutdown and wait for thread to exit.
    pub fn shutdown(&mut self) {
        self.root.cancel();

        // Connect to the socket to unblock accept()
        let _ = UnixStream::connect(socket_path());

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
