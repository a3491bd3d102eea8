//! GitHub account and repository names.
//!
//! Both become path components under a clone directory, so besides the
//! character set GitHub accepts, anything that could climb out of that
//! directory (`/`, `\`, `.` and `..`) is refused.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Longest login GitHub hands out.
const MAX_OWNER_LEN: usize = 39;
const MAX_REPO_LEN: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("{kind} is longer than {max} characters")]
    TooLong { kind: &'static str, max: usize },
    #[error("{kind} cannot contain {found:?}")]
    Character { kind: &'static str, found: char },
    #[error("owner cannot begin or end with '-'")]
    HyphenEdge,
    #[error("repository name cannot begin with '.'")]
    Hidden,
    #[error("expected owner/name")]
    NotQualified,
}

fn check(kind: &'static str, s: &str, max: usize, also: &[char]) -> Result<(), NameError> {
    if s.is_empty() {
        return Err(NameError::Empty(kind));
    }
    if s.len() > max {
        return Err(NameError::TooLong { kind, max });
    }
    match s
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && !also.contains(c))
    {
        Some(found) => Err(NameError::Character { kind, found }),
        None => Ok(()),
    }
}

/// A user or organization login.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Owner {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check("owner", s, MAX_OWNER_LEN, &[])?;
        if s.starts_with('-') || s.ends_with('-') {
            return Err(NameError::HyphenEdge);
        }
        Ok(Owner(s.to_string()))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A repository name without its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo(String);

impl Repo {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Repo {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check("repository name", s, MAX_REPO_LEN, &['_', '.'])?;
        // Covers `.` and `..` too.
        if s.starts_with('.') {
            return Err(NameError::Hidden);
        }
        Ok(Repo(s.to_string()))
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    pub owner: Owner,
    pub repo: Repo,
}

impl RepoKey {
    pub fn new(owner: Owner, repo: Repo) -> Self {
        Self { owner, repo }
    }

    /// Lowercased `owner/name`. GitHub matches names case-insensitively, so
    /// this is what caches are keyed on.
    pub fn folded(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl FromStr for RepoKey {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, repo) = s.split_once('/').ok_or(NameError::NotQualified)?;
        Ok(RepoKey::new(owner.parse()?, repo.parse()?))
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}
