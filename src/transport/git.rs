//! Clone a repository with libgit2.
//!
//! The cloner is bound to a single URL and credential when it is built by a
//! driver, and is consumed by [`BoundCloner::clone_into`]. Progress from the
//! remote (sideband messages and object counts) is forwarded to the caller's
//! log sink. Cancellation is checked from the progress callbacks, which makes
//! libgit2 abort the transfer.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use git2::build::RepoBuilder;
use git2::{Cred, CredentialType, FetchOptions, Progress, RemoteCallbacks};

use super::{Transport, TransferError};
use crate::cancel::Context;
use crate::driver::{BoundCloner, LogSink};

/// Username GitHub expects alongside a token for HTTPS transfers.
const TOKEN_USERNAME: &str = "x-access-token";

/// Credential handed to libgit2.
#[derive(Clone)]
pub enum Auth {
    /// Anonymous transfer (public repositories over HTTPS).
    None,
    Token(String),
    SshKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    SshAgent,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Token(_) => write!(f, "Token(..)"),
            Auth::SshKey { path, .. } => f.debug_struct("SshKey").field("path", path).finish(),
            Auth::SshAgent => write!(f, "SshAgent"),
        }
    }
}

impl Auth {
    fn credential(
        &self,
        username_from_url: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Cred, git2::Error> {
        let username = username_from_url.unwrap_or("git");
        match self {
            Auth::Token(token) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                Cred::userpass_plaintext(TOKEN_USERNAME, token)
            }
            Auth::SshKey { path, passphrase } if allowed.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key(username, None, path, passphrase.as_deref())
            }
            Auth::SshAgent if allowed.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key_from_agent(username)
            }
            _ if allowed.contains(CredentialType::USERNAME) => Cred::username(username),
            _ => Cred::default(),
        }
    }
}

/// A one-shot clone of `url` using `auth`.
#[derive(Debug)]
pub struct GitCloner {
    url: String,
    transport: Transport,
    auth: Auth,
}

impl GitCloner {
    pub fn new(url: impl Into<String>, transport: Transport, auth: Auth) -> Self {
        Self {
            url: url.into(),
            transport,
            auth,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

/// Split remote sideband output into printable lines.
fn sideband_lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn percent(done: usize, total: usize) -> usize {
    if total == 0 { 100 } else { done * 100 / total }
}

/// Format object/delta progress, or `None` if nothing changed enough to
/// be worth reporting since `last`.
fn progress_line(stats: &Progress<'_>, last: &Cell<Option<(usize, usize)>>) -> Option<String> {
    let total = stats.total_objects();
    let received = stats.received_objects();
    let deltas = stats.total_deltas();

    let (phase, pct) = if received < total || deltas == 0 {
        (0, percent(received, total))
    } else {
        (1, percent(stats.indexed_deltas(), deltas))
    };
    if last.get() == Some((phase, pct)) {
        return None;
    }
    last.set(Some((phase, pct)));

    Some(if phase == 0 {
        format!(
            "Receiving objects: {:>3}% ({}/{}), {} KiB",
            pct,
            received,
            total,
            stats.received_bytes() / 1024
        )
    } else {
        format!(
            "Resolving deltas: {:>3}% ({}/{})",
            pct,
            stats.indexed_deltas(),
            deltas
        )
    })
}

impl BoundCloner for GitCloner {
    fn clone_into(
        self: Box<Self>,
        ctx: &Context,
        target: &Path,
        log: &dyn LogSink,
    ) -> Result<(), TransferError> {
        log.log(&format!("Cloning {} over {}", self.url, self.transport));

        let attempts = Cell::new(0u32);
        let last = Cell::new(None);

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed| {
            // libgit2 keeps asking while credentials are rejected.
            attempts.set(attempts.get() + 1);
            if attempts.get() > 1 {
                return Err(git2::Error::from_str("authentication failed"));
            }
            self.auth.credential(username_from_url, allowed)
        });
        callbacks.sideband_progress(|data| {
            for line in sideband_lines(data) {
                log.log(&format!("remote: {line}"));
            }
            !ctx.is_cancelled()
        });
        callbacks.transfer_progress(|stats| {
            if let Some(line) = progress_line(&stats, &last) {
                log.log(&line);
            }
            !ctx.is_cancelled()
        });

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks);

        let result = RepoBuilder::new().fetch_options(fetch).clone(&self.url, target);
        match result {
            Ok(_) => Ok(()),
            Err(_) if ctx.is_cancelled() => Err(TransferError::Cancelled),
            Err(e) => Err(TransferError::Git(e)),
        }
    }
}
