//! Transport selection and the libgit2-backed bound cloner.

mod git;

pub use git::{Auth, GitCloner};

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Protocol used to fetch repository content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ssh,
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::Http => write!(f, "http"),
        }
    }
}

/// Per-source transport preferences.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    pub prefer_http: bool,
    /// Explicit private key; when unset SSH relies on a running agent.
    pub private_key: Option<PathBuf>,
    pub private_key_passphrase: Option<String>,
}

impl Preferences {
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }
}

/// Why no transport could be chosen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("neither the SSH nor HTTP protocol is available")]
    NoProtocol,
    #[error(
        "SSH is the only available protocol but there is no SSH agent and no private key was provided"
    )]
    NoSshCredentials,
}

/// Errors from a repository transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Pick the transport for a clone.
///
/// Evaluated in order: no endpoint is an error; an HTTP preference wins
/// whenever HTTP exists; SSH is used when it exists and has a credential
/// (explicit key or agent); otherwise HTTP as a fallback; otherwise SSH
/// exists but cannot authenticate.
pub fn select_transport(
    has_ssh: bool,
    has_http: bool,
    prefs: &Preferences,
    ssh_agent: bool,
) -> Result<Transport, SelectError> {
    if !has_ssh && !has_http {
        return Err(SelectError::NoProtocol);
    }
    if has_http && prefs.prefer_http {
        return Ok(Transport::Http);
    }
    if has_ssh && (prefs.has_private_key() || ssh_agent) {
        return Ok(Transport::Ssh);
    }
    if has_http {
        return Ok(Transport::Http);
    }
    Err(SelectError::NoSshCredentials)
}

/// Whether an SSH agent socket is advertised and present.
pub fn ssh_agent_available() -> bool {
    std::env::var_os("SSH_AUTH_SOCK")
        .filter(|sock| !sock.is_empty())
        .map(|sock| std::path::Path::new(&sock).exists())
        .unwrap_or(false)
}
