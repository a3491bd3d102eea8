//! Cancellable execution contexts and fail-fast fan-out.
//!
//! A [`Context`] is a cheaply clonable cancellation token. Cancelling a
//! context cancels every context derived from it with [`Context::child`],
//! never the other way around. Blocking loops wait on [`Context::done`],
//! a channel that disconnects on cancellation, so they wake immediately
//! instead of polling a flag.
//!
//! [`fan_out`] runs one scoped thread per item against a shared child
//! context. The first error cancels that context for every sibling and is
//! returned once all threads have joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};

struct Inner {
    cancelled: AtomicBool,
    // Dropped on cancel, which disconnects `done_rx` for every waiter.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn new() -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.done_tx).take();

        let children = std::mem::take(&mut *lock(&self.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cancellation token shared by everything working on one operation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// A root context that is only cancelled explicitly.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Derive a context that is cancelled along with `self`, but can also
    /// be cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        let child = Self::background();

        let mut children = lock(&self.inner.children);
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        drop(children);

        // Cancellation may have raced with registration.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that never yields a value and disconnects once the context
    /// is cancelled. Meant for use in `select!`.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// Block until the context is cancelled.
    pub fn wait(&self) {
        let _ = self.inner.done_rx.recv();
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the context was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        select! {
            recv(self.inner.done_rx) -> _ => false,
            default(duration) => !self.is_cancelled(),
        }
    }
}

/// Run `task` once per item, each on its own thread, sharing a child of
/// `ctx`.
///
/// The first error cancels the shared context and is returned after every
/// thread has finished. Errors reported after the first are dropped.
pub fn fan_out<I, T, E, F>(ctx: &Context, items: I, task: F) -> Result<(), E>
where
    I: IntoIterator<Item = T>,
    T: Send,
    E: Send,
    F: Fn(&Context, T) -> Result<(), E> + Sync,
{
    let group = ctx.child();
    let first_error: Mutex<Option<E>> = Mutex::new(None);

    thread::scope(|scope| {
        for item in items {
            let group = &group;
            let task = &task;
            let first_error = &first_error;
            scope.spawn(move || {
                if let Err(err) = task(group, item) {
                    let mut slot = lock(first_error);
                    if slot.is_none() {
                        *slot = Some(err);
                        group.cancel();
                    }
                }
            });
        }
    });

    group.cancel();
    match first_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_context_starts_cancelled() {
        let parent = Context::background();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn done_disconnects_on_cancel() {
        let ctx = Context::background();
        let waiter = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.wait())
        };
        ctx.cancel();
        waiter.join().unwrap();
        assert!(ctx.done().recv().is_err());
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let ctx = Context::background();
        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };

        let start = Instant::now();
        assert!(!ctx.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn fan_out_runs_every_item() {
        let ctx = Context::background();
        let count = AtomicUsize::new(0);
        let result: Result<(), String> = fan_out(&ctx, 0..8, |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn fan_out_first_error_cancels_siblings() {
        let ctx = Context::background();
        let result = fan_out(&ctx, ["fail", "wait", "wait"], |group, item| {
            if item == "fail" {
                return Err("boom".to_string());
            }
            // Only returns once the failing sibling cancels the group.
            group.wait();
            Err(format!("cancelled {item}"))
        });

        assert_eq!(result, Err("boom".to_string()));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn fan_out_honours_parent_cancellation() {
        let ctx = Context::background();
        ctx.cancel();
        let result: Result<(), ()> = fan_out(&ctx, 0..3, |group, _| {
            assert!(group.is_cancelled());
            Ok(())
        });
        assert!(result.is_ok());
    }
}
