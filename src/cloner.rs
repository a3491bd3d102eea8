//! Cloning a resolved repository into its source's clone directory.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::cancel::Context;
use crate::driver::{DriverError, LogSink};
use crate::source::SourceList;
use crate::transport::TransferError;

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("unrecognized source ({0})")]
    UnrecognizedSource(String),

    #[error("unable to prepare for cloning: {0}")]
    Prepare(#[source] DriverError),

    #[error("unable to prepare for cloning: invalid directory name ({0})")]
    InvalidHint(String),

    #[error("clone directory ({0}) already exists")]
    AlreadyExists(PathBuf),

    #[error("unable to create clone directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to clone: {0}")]
    Transfer(#[source] TransferError),
}

/// Removes the clone directory on drop unless [`DirGuard::keep`] was called,
/// along with any parents it had to create that are left empty.
struct DirGuard {
    path: PathBuf,
    /// Deepest first.
    created_parents: Vec<PathBuf>,
    armed: bool,
}

impl DirGuard {
    fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::debug!("Removing incomplete clone at {}", self.path.display());
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to clean up incomplete clone at {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
        // Parents can be shared with concurrent clones; only empty ones go.
        for parent in &self.created_parents {
            if fs::remove_dir(parent).is_err() {
                break;
            }
        }
    }
}

/// Clone repository `repo_id` of source `source_name` and return the
/// directory it landed in.
///
/// Either the directory ends up fully cloned, or it is not there at all.
/// An existing directory is never touched.
pub fn clone_repo(
    ctx: &Context,
    sources: &SourceList,
    source_name: &str,
    repo_id: &str,
    log: &dyn LogSink,
) -> Result<PathBuf, CloneError> {
    let source = sources
        .by_name(source_name)
        .ok_or_else(|| CloneError::UnrecognizedSource(source_name.to_string()))?;

    let (cloner, hint) = source
        .driver
        .new_cloner(ctx, repo_id)
        .map_err(CloneError::Prepare)?;
    validate_hint(&hint)?;

    let target = source.clone_directory.join(&hint);
    let guard = create_target(&target)?;

    log::info!("Cloning {}:{} into {}", source.name, repo_id, target.display());
    cloner
        .clone_into(ctx, &target, log)
        .map_err(CloneError::Transfer)?;

    let target = guard.keep();
    log::info!("Cloned {}:{} into {}", source.name, repo_id, target.display());
    Ok(target)
}

/// A hint must stay inside the clone directory.
fn validate_hint(hint: &str) -> Result<(), CloneError> {
    let path = Path::new(hint);
    let mut components = path.components().peekable();
    if components.peek().is_none()
        || !components.all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(CloneError::InvalidHint(hint.to_string()));
    }
    Ok(())
}

fn create_target(target: &Path) -> Result<DirGuard, CloneError> {
    if target.exists() {
        return Err(CloneError::AlreadyExists(target.to_path_buf()));
    }

    let create_error = |source| CloneError::CreateDirectory {
        path: target.to_path_buf(),
        source,
    };
    let created_parents: Vec<PathBuf> = target
        .ancestors()
        .skip(1)
        .take_while(|dir| !dir.exists())
        .map(Path::to_path_buf)
        .collect();

    let mut retried = false;
    loop {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(create_error)?;
        }
        match fs::create_dir(target) {
            Ok(()) => {
                return Ok(DirGuard {
                    path: target.to_path_buf(),
                    created_parents,
                    armed: true,
                });
            }
            // Lost a race with a concurrent clone of the same repository.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CloneError::AlreadyExists(target.to_path_buf()));
            }
            // A failed clone next door pruned the parent in between.
            Err(e) if e.kind() == io::ErrorKind::NotFound && !retried => retried = true,
            Err(e) => return Err(create_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, FakeTransfer, repo};
    use crate::source::Source;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn sources(root: &Path, driver: FakeDriver) -> SourceList {
        SourceList::new(vec![Source::new("gh", "", root, Box::new(driver))]).unwrap()
    }

    fn known(transfer: FakeTransfer) -> FakeDriver {
        FakeDriver {
            repos: vec![repo("42", "owner/repo")],
            transfer,
            ..Default::default()
        }
    }

    fn discard(_: &str) {}

    #[test]
    fn clones_into_hint_under_source_directory() {
        let root = tempdir().unwrap();
        let list = sources(root.path(), known(FakeTransfer::Succeed));
        let lines = Mutex::new(Vec::new());
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());

        let dir = clone_repo(&Context::background(), &list, "GH", "42", &sink).unwrap();

        assert_eq!(dir, root.path().join("owner").join("repo"));
        assert!(dir.join("README").exists());
        assert_eq!(lines.into_inner().unwrap(), vec!["fake transfer"]);
    }

    #[test]
    fn unknown_source_touches_nothing() {
        let root = tempdir().unwrap();
        let list = sources(root.path(), known(FakeTransfer::Succeed));

        let err = clone_repo(&Context::background(), &list, "gitlab", "42", &discard).unwrap_err();

        assert_eq!(err.to_string(), "unrecognized source (gitlab)");
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_repository_fails_preparation() {
        let root = tempdir().unwrap();
        let list = sources(root.path(), known(FakeTransfer::Succeed));

        let err = clone_repo(&Context::background(), &list, "gh", "7", &discard).unwrap_err();

        assert!(matches!(err, CloneError::Prepare(_)));
        assert!(err.to_string().starts_with("unable to prepare for cloning: "));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn existing_directory_is_left_alone() {
        let root = tempdir().unwrap();
        let existing = root.path().join("owner").join("repo");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("mine"), "keep me").unwrap();
        let list = sources(root.path(), known(FakeTransfer::Succeed));

        let err = clone_repo(&Context::background(), &list, "gh", "42", &discard).unwrap_err();

        assert!(matches!(err, CloneError::AlreadyExists(_)));
        assert!(err.to_string().ends_with("already exists"));
        assert_eq!(fs::read_to_string(existing.join("mine")).unwrap(), "keep me");
        assert!(!existing.join("README").exists());
    }

    #[test]
    fn failed_transfer_leaves_no_directory() {
        let root = tempdir().unwrap();
        let list = sources(root.path(), known(FakeTransfer::Fail));

        let err = clone_repo(&Context::background(), &list, "gh", "42", &discard).unwrap_err();

        assert!(matches!(err, CloneError::Transfer(_)));
        assert_eq!(err.to_string(), "unable to clone: connection reset");
        // The owner directory was created for this clone, so it goes too.
        assert!(!root.path().join("owner").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn failed_transfer_keeps_existing_parent() {
        let root = tempdir().unwrap();
        let sibling = root.path().join("owner").join("other");
        fs::create_dir_all(&sibling).unwrap();
        let list = sources(root.path(), known(FakeTransfer::Fail));

        clone_repo(&Context::background(), &list, "gh", "42", &discard).unwrap_err();

        assert!(!root.path().join("owner").join("repo").exists());
        assert!(sibling.exists());
    }

    #[test]
    fn failed_transfer_prunes_every_created_parent() {
        let root = tempdir().unwrap();
        let clone_root = root.path().join("clones").join("gh");
        let list = sources(&clone_root, known(FakeTransfer::Fail));

        clone_repo(&Context::background(), &list, "gh", "42", &discard).unwrap_err();

        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn escaping_hints_are_rejected() {
        for hint in ["", "../escape", "/abs/path", "owner/../../x", "./repo"] {
            let root = tempdir().unwrap();
            let driver = FakeDriver {
                hint: hint.to_string(),
                ..known(FakeTransfer::Succeed)
            };
            let list = sources(root.path(), driver);

            let err = clone_repo(&Context::background(), &list, "gh", "42", &discard).unwrap_err();

            assert!(matches!(err, CloneError::InvalidHint(_)), "hint {hint:?}");
            assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
        }
    }
}
