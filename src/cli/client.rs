use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;

use thiserror::Error;

use crate::daemon::socket_path;
use crate::driver::RemoteRepo;
use crate::protocol::{
    CloneResult, Incoming, Notification, Request, ResolveResult, Response, RpcError, RpcRequest,
    SourcesResult, VersionResult, read_message, write_message,
};

/// Client for communicating with the daemon
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
    next_id: u64,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not connect to daemon
    #[error("daemon is not running")]
    NotRunning,
    #[error("IO error: {0}")]
    Io(std::io::Error),
    /// Error reported by the daemon
    #[error("{0}")]
    Rpc(RpcError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

fn is_not_running_io_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    ) || matches!(
        err.raw_os_error(),
        Some(libc::ECONNREFUSED)
            | Some(libc::ENOENT)
            | Some(libc::ECONNABORTED)
            | Some(libc::ECONNRESET)
            | Some(libc::EPIPE)
            | Some(libc::ENOTCONN)
    )
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        if is_not_running_io_error(&e) {
            ClientError::NotRunning
        } else {
            ClientError::Io(e)
        }
    }
}

impl Client {
    /// Connect to the daemon
    pub fn connect() -> Result<Self, ClientError> {
        let path = socket_path();
        let stream = UnixStream::connect(&path)?;

        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        Ok(Self {
            reader,
            writer,
            next_id: 1,
        })
    }

    /// Send a request and wait for its response, passing every notification
    /// received in the meantime to `on_notification`.
    pub fn call_streaming(
        &mut self,
        request: Request,
        mut on_notification: impl FnMut(Notification),
    ) -> Result<Response, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let rpc_request = RpcRequest::new(request, id);
        write_message(&mut self.writer, &rpc_request)?;
        self.writer.flush()?;

        loop {
            match read_message(&mut self.reader)? {
                Incoming::Notification(notification) => on_notification(notification),
                Incoming::Response(response) => return Ok(response.result),
                Incoming::Error(error) => return Err(ClientError::Rpc(error.error)),
            }
        }
    }

    /// Send a request and wait for response
    pub fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        self.call_streaming(request, |notification| {
            log::debug!("Ignoring notification {:?}", notification);
        })
    }

    /// Convenience: list sources
    pub fn sources(&mut self) -> Result<SourcesResult, ClientError> {
        match self.call(Request::Sources)? {
            Response::Sources(s) => Ok(s),
            other => Err(ClientError::InvalidResponse(format!("{:?}", other))),
        }
    }

    /// Convenience: resolve a query, calling `on_repo` for each candidate as
    /// it arrives
    pub fn resolve(
        &mut self,
        query: &str,
        mut on_repo: impl FnMut(String, RemoteRepo),
    ) -> Result<ResolveResult, ClientError> {
        let request = Request::Resolve {
            query: query.to_string(),
        };
        let response = self.call_streaming(request, |notification| match notification {
            Notification::Repo { source, repo } => on_repo(source, repo),
            other => log::debug!("Unexpected notification {:?}", other),
        })?;
        match response {
            Response::Resolve(r) => Ok(r),
            other => Err(ClientError::InvalidResponse(format!("{:?}", other))),
        }
    }

    /// Convenience: clone a repository, calling `on_log` with progress lines
    pub fn clone_repo(
        &mut self,
        source: &str,
        repo_id: &str,
        mut on_log: impl FnMut(&str),
    ) -> Result<CloneResult, ClientError> {
        let request = Request::Clone {
            source: source.to_string(),
            repo_id: repo_id.to_string(),
        };
        let response = self.call_streaming(request, |notification| match notification {
            Notification::Log { line } => on_log(&line),
            other => log::debug!("Unexpected notification {:?}", other),
        })?;
        match response {
            Response::Clone(c) => Ok(c),
            other => Err(ClientError::InvalidResponse(format!("{:?}", other))),
        }
    }

    /// Convenience: get version
    pub fn version(&mut self) -> Result<VersionResult, ClientError> {
        match self.call(Request::Version)? {
            Response::Version(v) => Ok(v),
            other => Err(ClientError::InvalidResponse(format!("{:?}", other))),
        }
    }

    /// Convenience: stop daemon
    pub fn stop(&mut self) -> Result<(), ClientError> {
        match self.call(Request::Stop)? {
            Response::Ok(()) => Ok(()),
            other => Err(ClientError::InvalidResponse(format!("{:?}", other))),
        }
    }
}
