//! Configured sources and their drivers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{Context, fan_out};
use crate::config::{self, Config, ConfigError};
use crate::driver::{Driver, DriverError, Registry};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("duplicate source name ({0})")]
    DuplicateName(String),

    #[error("source {source_name} uses unknown driver type ({driver})")]
    UnknownDriver { source_name: String, driver: String },

    #[error("source {source_name}: {error}")]
    Config {
        source_name: String,
        #[source]
        error: ConfigError,
    },

    #[error("unable to initialize source {source_name}: {error}")]
    Init {
        source_name: String,
        #[source]
        error: DriverError,
    },

    #[error("background task for source {source_name} failed: {error}")]
    Run {
        source_name: String,
        #[source]
        error: DriverError,
    },
}

/// A named provider of repositories and the driver that serves it.
pub struct Source {
    pub name: String,
    pub description: String,
    pub clone_directory: PathBuf,
    pub driver: Box<dyn Driver>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        clone_directory: impl Into<PathBuf>,
        driver: Box<dyn Driver>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            clone_directory: clone_directory.into(),
            driver,
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("clone_directory", &self.clone_directory)
            .finish_non_exhaustive()
    }
}

/// Point-in-time health of one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub name: String,
    pub description: String,
    pub clone_directory: String,
    pub status: String,
}

/// Ordered sources with case-insensitively unique names.
#[derive(Debug, Default)]
pub struct SourceList {
    sources: Vec<Source>,
}

impl SourceList {
    pub fn new(sources: Vec<Source>) -> Result<Self, SourceError> {
        for (i, source) in sources.iter().enumerate() {
            if sources[..i]
                .iter()
                .any(|earlier| earlier.name.eq_ignore_ascii_case(&source.name))
            {
                return Err(SourceError::DuplicateName(source.name.clone()));
            }
        }
        Ok(Self { sources })
    }

    /// Build every enabled configured source, followed by the registry's
    /// default sources that the configuration does not mention.
    pub fn from_config(registry: &Registry, config: &Config) -> Result<Self, SourceError> {
        let mut sources = Vec::new();

        for entry in config.sources.iter().filter(|s| s.enabled) {
            let registration =
                registry
                    .lookup(&entry.driver)
                    .ok_or_else(|| SourceError::UnknownDriver {
                        source_name: entry.name.clone(),
                        driver: entry.driver.clone(),
                    })?;
            sources.push(build(
                &entry.name,
                &entry.description,
                entry.clone_directory.as_deref(),
                || (registration.constructor)(&entry.config),
            )?);
        }

        for (type_name, default) in registry.default_sources() {
            if config.mentions(&default.name) {
                continue;
            }
            let Some(registration) = registry.lookup(&type_name) else {
                continue;
            };
            sources.push(build(&default.name, &default.description, None, || {
                (registration.constructor)(&default.config)
            })?);
        }

        Self::new(sources)
    }

    /// Case-insensitive lookup.
    pub fn by_name(&self, name: &str) -> Option<&Source> {
        self.sources
            .iter()
            .find(|source| source.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Source> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Initialize every driver in parallel; the first failure cancels the
    /// rest and is returned.
    pub fn init_all(&self, ctx: &Context) -> Result<(), SourceError> {
        fan_out(ctx, self.iter(), |ctx, source| {
            log::info!("Initializing source {}", source.name);
            source.driver.init(ctx).map_err(|error| SourceError::Init {
                source_name: source.name.clone(),
                error,
            })?;
            log::info!("Source {} ready", source.name);
            Ok(())
        })
    }

    /// Run every driver's background loop until `ctx` is cancelled.
    ///
    /// Returning because of cancellation is not a failure. Any other error
    /// cancels the remaining loops and is returned.
    pub fn run_all(&self, ctx: &Context) -> Result<(), SourceError> {
        fan_out(ctx, self.iter(), |ctx, source| {
            match source.driver.run(ctx) {
                Ok(()) => Ok(()),
                Err(error) if error.is_cancelled() => {
                    log::debug!("Background task for {} stopped", source.name);
                    Ok(())
                }
                Err(error) => Err(SourceError::Run {
                    source_name: source.name.clone(),
                    error,
                }),
            }
        })
    }

    /// Health summary of every source, in order.
    pub fn statuses(&self, ctx: &Context) -> Vec<SourceStatus> {
        self.iter()
            .map(|source| SourceStatus {
                name: source.name.clone(),
                description: source.description.clone(),
                clone_directory: source.clone_directory.display().to_string(),
                status: match source.driver.status(ctx) {
                    Ok(status) => status,
                    Err(e) => format!("error: {e}"),
                },
            })
            .collect()
    }
}

fn build<F>(
    name: &str,
    description: &str,
    clone_directory: Option<&std::path::Path>,
    construct: F,
) -> Result<Source, SourceError>
where
    F: FnOnce() -> Result<Box<dyn Driver>, ConfigError>,
{
    let wrap = |error| SourceError::Config {
        source_name: name.to_string(),
        error,
    };
    let clone_directory = config::clone_directory(name, clone_directory).map_err(wrap)?;
    let driver = construct().map_err(wrap)?;
    Ok(Source::new(name, description, clone_directory, driver))
}
