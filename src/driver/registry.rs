//! Driver registry.
//!
//! Maps a driver type name (as written in the `type` field of a source's
//! configuration) to its constructor and default sources. Registries can be
//! layered: lookups fall through to the parent. The built-in table is
//! assembled from an explicit list in [`builtins`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use super::{Driver, github};
use crate::config::ConfigError;

/// Builds a driver from its source-specific configuration.
pub type Constructor = fn(&serde_json::Value) -> Result<Box<dyn Driver>, ConfigError>;

/// A source created without any configuration, e.g. public github.com.
#[derive(Debug, Clone)]
pub struct DefaultSource {
    pub name: String,
    pub description: String,
    pub config: serde_json::Value,
}

/// Everything the crate knows about one driver type.
#[derive(Clone)]
pub struct Registration {
    pub description: &'static str,
    pub constructor: Constructor,
    pub defaults: Vec<DefaultSource>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("description", &self.description)
            .field("defaults", &self.defaults)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    parent: Option<Arc<Registry>>,
    entries: BTreeMap<String, Registration>,
}

impl Registry {
    /// Create a registry holding `entries`, falling back to `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `entries` names the same type twice.
    pub fn new<I, S>(parent: Option<Arc<Registry>>, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Registration)>,
        S: Into<String>,
    {
        let mut registry = Self {
            parent,
            entries: BTreeMap::new(),
        };
        for (type_name, registration) in entries {
            registry.register(type_name, registration);
        }
        registry
    }

    /// Add a driver type.
    ///
    /// # Panics
    ///
    /// Registering a name this registry already holds is a build-time
    /// mistake and panics. Shadowing a parent's entry is allowed.
    pub fn register(&mut self, type_name: impl Into<String>, registration: Registration) {
        let type_name = type_name.into();
        if self.entries.contains_key(&type_name) {
            panic!("driver type {type_name:?} registered twice");
        }
        self.entries.insert(type_name, registration);
    }

    pub fn lookup(&self, type_name: &str) -> Option<&Registration> {
        match self.entries.get(type_name) {
            Some(registration) => Some(registration),
            None => self.parent.as_ref()?.lookup(type_name),
        }
    }

    /// Every type name visible from this registry, sorted.
    pub fn all_type_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        let mut current = Some(self);
        while let Some(registry) = current {
            names.extend(registry.entries.keys().cloned());
            current = registry.parent.as_deref();
        }
        names.into_iter().collect()
    }

    /// Default sources of every visible registration, by type name.
    pub fn default_sources(&self) -> Vec<(String, DefaultSource)> {
        self.all_type_names()
            .into_iter()
            .filter_map(|name| {
                let registration = self.lookup(&name)?;
                Some((name, registration.defaults.clone()))
            })
            .flat_map(|(name, defaults)| defaults.into_iter().map(move |d| (name.clone(), d)))
            .collect()
    }
}

/// The process-wide table of drivers compiled into this binary.
pub fn builtins() -> Arc<Registry> {
    static BUILTINS: OnceLock<Arc<Registry>> = OnceLock::new();
    BUILTINS
        .get_or_init(|| {
            Arc::new(Registry::new(
                None,
                [(github::TYPE_NAME, github::registration())],
            ))
        })
        .clone()
}
