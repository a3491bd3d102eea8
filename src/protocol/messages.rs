use serde::{Deserialize, Serialize};

use crate::driver::RemoteRepo;
use crate::source::SourceStatus;

/// All RPC methods supported by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// List configured sources and their health
    Sources,

    /// Resolve a query against every source; streams `repo` notifications
    Resolve { query: String },

    /// Clone a resolved repository; streams `log` notifications
    Clone { source: String, repo_id: String },

    /// Get daemon version
    Version,

    /// Stop the daemon
    Stop,
}

/// Sent by the daemon before the final response of a streaming request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Notification {
    Repo { source: String, repo: RemoteRepo },
    Log { line: String },
}

/// Sources response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesResult {
    pub sources: Vec<SourceStatus>,
}

/// Resolve response, sent after every `repo` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResult {
    pub count: usize,
}

/// Clone response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneResult {
    pub directory: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: String,
    pub pid: u32,
}

/// All possible success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Sources(SourcesResult),
    Resolve(ResolveResult),
    Clone(CloneResult),
    Version(VersionResult),
    Ok(()), // For stop - unit type serializes as null
}

/// RPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(-32602, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(-32603, msg)
    }

    /// A driver or clone operation failed.
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::new(-1, msg)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
