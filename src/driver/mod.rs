//! Source drivers.
//!
//! A [`Driver`] backs one configured source and knows how to talk to a
//! single hosting provider. Every driver implements the whole capability
//! set: lifecycle (`init`, `run`), health (`status`), lookup (`resolve`) and
//! cloner construction (`new_cloner`). New providers are added by
//! implementing the trait and registering a constructor in the
//! [`registry`]; nothing else in the crate changes.

pub mod github;
pub mod registry;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::Context;
use crate::transport::{SelectError, TransferError};

pub use registry::{Constructor, DefaultSource, Registration, Registry, builtins};

/// A repository discovered by a driver. Its `id` only has meaning together
/// with the name of the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// Errors reported by drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("unknown repository ({0})")]
    UnknownRepository(String),
    #[error("invalid repository name ({0})")]
    InvalidRepository(String),
    #[error(transparent)]
    Transport(#[from] SelectError),
    #[error("remote request failed: {0}")]
    Remote(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DriverError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

/// Receives human-readable progress lines for one operation.
pub trait LogSink: Sync {
    fn log(&self, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Sync,
{
    fn log(&self, line: &str) {
        self(line)
    }
}

/// One-shot transfer of one repository into one directory.
///
/// Consumed by `clone_into`, so it cannot be reused for a second target.
/// On failure the partially written `target` is left for the caller.
pub trait BoundCloner: Send {
    fn clone_into(
        self: Box<Self>,
        ctx: &Context,
        target: &Path,
        log: &dyn LogSink,
    ) -> Result<(), TransferError>;
}

/// Provider-specific implementation behind a source.
pub trait Driver: Send + Sync {
    /// One-time setup, e.g. authenticating and pre-fetching a catalogue.
    /// An error here aborts startup.
    fn init(&self, ctx: &Context) -> Result<(), DriverError>;

    /// Background maintenance. Returns `Ok(())` or [`DriverError::Cancelled`]
    /// once `ctx` is cancelled; any other error is fatal.
    fn run(&self, ctx: &Context) -> Result<(), DriverError>;

    /// Cheap health summary; must not touch the network.
    fn status(&self, ctx: &Context) -> Result<String, DriverError>;

    /// Candidates for a free-form query. A query the driver cannot parse
    /// yields an empty list, never an error.
    fn resolve(&self, ctx: &Context, query: &str) -> Result<Vec<RemoteRepo>, DriverError>;

    /// Build a cloner for a repository id previously returned by `resolve`,
    /// plus a relative directory to clone into.
    fn new_cloner(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<(Box<dyn BoundCloner>, String), DriverError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory driver and cloner used across the crate's tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What a [`FakeCloner`] does when asked to transfer.
    #[derive(Clone)]
    pub enum FakeTransfer {
        /// Writes a README into the target.
        Succeed,
        /// Writes a partial file, then fails.
        Fail,
    }

    pub struct FakeCloner {
        pub transfer: FakeTransfer,
    }

    impl BoundCloner for FakeCloner {
        fn clone_into(
            self: Box<Self>,
            _ctx: &Context,
            target: &Path,
            log: &dyn LogSink,
        ) -> Result<(), TransferError> {
            log.log("fake transfer");
            std::fs::write(target.join("README"), "partial")?;
            match self.transfer {
                FakeTransfer::Succeed => Ok(()),
                FakeTransfer::Fail => Err(TransferError::Other("connection reset".into())),
            }
        }
    }

    /// Scriptable driver.
    pub struct FakeDriver {
        pub repos: Vec<RemoteRepo>,
        pub resolve_error: Option<String>,
        pub resolve_delay: Duration,
        pub init_error: Option<String>,
        pub run_error: Option<String>,
        pub transfer: FakeTransfer,
        pub hint: String,
        pub resolve_calls: AtomicUsize,
        pub cancelled_resolves: AtomicUsize,
        pub events: Mutex<Vec<&'static str>>,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            Self {
                repos: Vec::new(),
                resolve_error: None,
                resolve_delay: Duration::ZERO,
                init_error: None,
                run_error: None,
                transfer: FakeTransfer::Succeed,
                hint: "owner/repo".into(),
                resolve_calls: AtomicUsize::new(0),
                cancelled_resolves: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
            }
        }
    }

    pub fn repo(id: &str, name: &str) -> RemoteRepo {
        RemoteRepo {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            web_url: None,
        }
    }

    fn remote(message: &str) -> DriverError {
        DriverError::Remote(message.to_string().into())
    }

    impl Driver for FakeDriver {
        fn init(&self, _ctx: &Context) -> Result<(), DriverError> {
            self.events.lock().unwrap().push("init");
            match &self.init_error {
                Some(msg) => Err(remote(msg)),
                None => Ok(()),
            }
        }

        fn run(&self, ctx: &Context) -> Result<(), DriverError> {
            self.events.lock().unwrap().push("run");
            if let Some(msg) = &self.run_error {
                return Err(remote(msg));
            }
            ctx.wait();
            Err(DriverError::Cancelled)
        }

        fn status(&self, _ctx: &Context) -> Result<String, DriverError> {
            Ok(format!("{} repositories", self.repos.len()))
        }

        fn resolve(&self, ctx: &Context, _query: &str) -> Result<Vec<RemoteRepo>, DriverError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if !self.resolve_delay.is_zero() && !ctx.sleep(self.resolve_delay) {
                self.cancelled_resolves.fetch_add(1, Ordering::SeqCst);
                return Err(DriverError::Cancelled);
            }
            match &self.resolve_error {
                Some(msg) => Err(remote(msg)),
                None => Ok(self.repos.clone()),
            }
        }

        fn new_cloner(
            &self,
            _ctx: &Context,
            id: &str,
        ) -> Result<(Box<dyn BoundCloner>, String), DriverError> {
            if !self.repos.iter().any(|r| r.id == id) {
                return Err(DriverError::UnknownRepository(id.to_string()));
            }
            let cloner = FakeCloner {
                transfer: self.transfer.clone(),
            };
            Ok((Box::new(cloner), self.hint.clone()))
        }
    }
}
