//! Multi-source resolution.
//!
//! [`resolve`] queries every source concurrently and hands back a
//! [`ResolveStream`] that yields each repository as soon as its source
//! produces it. The first driver error cancels the remaining sources and is
//! yielded as the final item. Results already yielded stay with the caller.
//! Dropping the stream early cancels whatever is still running.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, unbounded};
use thiserror::Error;

use crate::cancel::{Context, fan_out};
use crate::driver::{DriverError, RemoteRepo};
use crate::source::SourceList;

/// A repository and the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub source: String,
    pub repo: RemoteRepo,
}

#[derive(Debug, Error)]
#[error("unable to resolve using source {source_name}: {error}")]
pub struct ResolveError {
    pub source_name: String,
    #[source]
    pub error: DriverError,
}

/// Live results of a [`resolve`] call.
pub struct ResolveStream {
    ctx: Context,
    rx: Receiver<Result<Resolved, ResolveError>>,
}

impl Iterator for ResolveStream {
    type Item = Result<Resolved, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for ResolveStream {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Start resolving `query` against every source in `sources`.
///
/// Fails only if the resolver thread cannot be started.
pub fn resolve(
    ctx: &Context,
    sources: Arc<SourceList>,
    query: &str,
) -> io::Result<ResolveStream> {
    let ctx = ctx.child();
    let (tx, rx) = unbounded();
    let query = query.to_string();

    let producer_ctx = ctx.clone();
    thread::Builder::new()
        .name("srcget-resolve".to_string())
        .spawn(move || {
            let result = fan_out(&producer_ctx, sources.iter(), |ctx, source| {
                let repos =
                    source
                        .driver
                        .resolve(ctx, &query)
                        .map_err(|error| ResolveError {
                            source_name: source.name.clone(),
                            error,
                        })?;

                // Once a sibling has failed nothing more is delivered.
                if ctx.is_cancelled() {
                    return Ok(());
                }
                for repo in repos {
                    let item = Resolved {
                        source: source.name.clone(),
                        repo,
                    };
                    if tx.send(Ok(item)).is_err() {
                        // Consumer is gone.
                        ctx.cancel();
                        break;
                    }
                }
                Ok(())
            });

            if let Err(err) = result {
                log::debug!("Resolution of {:?} failed: {}", query, err);
                let _ = tx.send(Err(err));
            }
        })?;

    Ok(ResolveStream { ctx, rx })
}
