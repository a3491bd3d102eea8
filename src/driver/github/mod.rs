//! GitHub (and GitHub Enterprise) driver.
//!
//! Keeps an in-memory catalogue of repositories, pre-fetched from the
//! configured owners at `init` and refreshed by `run`. Resolution answers
//! from the catalogue when it can and asks the API otherwise. Repositories
//! the API reported missing are remembered in a [`NegativeCache`].
//!
//! A rejected token is not fatal: the driver drops it, continues
//! unauthenticated and says so in its status.

mod api;
mod names;
mod negative;

use api::{ApiError, ApiRepo, GitHubApi, UreqApi};
use names::{Owner, Repo, RepoKey};
use negative::NegativeCache;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Deserialize;

use super::{BoundCloner, DefaultSource, Driver, DriverError, Registration, RemoteRepo};
use crate::cancel::Context;
use crate::config::{self, ConfigError};
use crate::transport::{self, Auth, GitCloner, Preferences, Transport};

pub const TYPE_NAME: &str = "github";

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

pub fn registration() -> Registration {
    Registration {
        description: "GitHub and GitHub Enterprise",
        constructor: construct,
        defaults: vec![DefaultSource {
            name: "github".to_string(),
            description: "github.com".to_string(),
            config: serde_json::Value::Null,
        }],
    }
}

fn construct(value: &serde_json::Value) -> Result<Box<dyn Driver>, ConfigError> {
    let config: GitHubConfig = config::driver_config(TYPE_NAME, value)?;
    Ok(Box::new(GitHubDriver::from_config(config)?))
}

/// Options under a github source's `config` key.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Literal token; takes precedence over `token_env`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Users and organizations whose repositories are pre-fetched.
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub prefer_http: bool,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

impl GitHubConfig {
    fn token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthState {
    /// `init` has not finished.
    Pending,
    Anonymous,
    Authenticated { login: String },
    InvalidToken,
}

#[derive(Default)]
struct Catalogue {
    repos: HashMap<u64, ApiRepo>,
    /// Case-folded `owner/name` to id.
    by_name: HashMap<String, u64>,
    /// Ids learned through single-repository lookups rather than an owner
    /// listing.
    looked_up: HashSet<u64>,
}

impl Catalogue {
    fn insert(&mut self, repo: ApiRepo) {
        self.by_name.insert(repo.full_name.to_ascii_lowercase(), repo.id);
        self.repos.insert(repo.id, repo);
    }

    fn remember(&mut self, repo: ApiRepo) {
        self.looked_up.insert(repo.id);
        self.insert(repo);
    }

    fn by_key(&self, key: &RepoKey) -> Option<&ApiRepo> {
        self.repos.get(self.by_name.get(&key.folded())?)
    }

    /// Every cached repository called `name`, under any owner.
    fn by_repo_name(&self, name: &Repo) -> Vec<&ApiRepo> {
        let mut found: Vec<_> = self
            .repos
            .values()
            .filter(|repo| repo.name.eq_ignore_ascii_case(name.as_str()))
            .collect();
        found.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        found
    }
}

/// What a query names.
#[derive(Debug, PartialEq, Eq)]
enum Query {
    Full(RepoKey),
    Bare(Repo),
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Parse `name`, `owner/name`, web URLs and clone URLs. Anything else is
/// `None`.
fn parse_query(query: &str) -> Option<Query> {
    let mut rest = query.trim();
    let mut scheme = None;

    for candidate in ["https://", "http://", "ssh://", "git://"] {
        if let Some(stripped) = strip_prefix_ignore_case(rest, candidate) {
            rest = stripped;
            scheme = Some(candidate);
            break;
        }
    }
    let scp_like = rest.starts_with("git@");
    if let Some(stripped) = rest.strip_prefix("git@") {
        rest = stripped;
    }

    if scheme.is_some() || scp_like {
        // Drop the host.
        let at = rest.find(['/', ':'])?;
        let separator = rest.as_bytes()[at];
        rest = &rest[at + 1..];
        if separator == b':' && scheme.is_some() {
            // ssh://host:port/owner/name
            let (port, path) = rest.split_once('/')?;
            if !port.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            rest = path;
        }
    } else if let Some(stripped) = strip_prefix_ignore_case(rest, "github.com/") {
        rest = stripped;
    }

    let mut segments = rest.split('/').filter(|segment| !segment.is_empty());
    let first = segments.next()?;
    let name = |s: &str| {
        let trimmed = s
            .len()
            .checked_sub(".git".len())
            .filter(|&cut| s.get(cut..).is_some_and(|tail| tail.eq_ignore_ascii_case(".git")))
            .map_or(s, |cut| &s[..cut]);
        trimmed.parse::<Repo>().ok()
    };

    match segments.next() {
        None if scheme.is_none() && !scp_like => name(first).map(Query::Bare),
        None => None,
        // Extra segments such as `/tree/main` are ignored.
        Some(second) => {
            let owner = first.parse::<Owner>().ok()?;
            Some(Query::Full(RepoKey::new(owner, name(second)?)))
        }
    }
}

fn to_remote(repo: &ApiRepo) -> RemoteRepo {
    RemoteRepo {
        id: repo.id.to_string(),
        name: repo.full_name.clone(),
        description: repo.description.clone().unwrap_or_default(),
        web_url: repo.html_url.clone(),
    }
}

impl From<ApiError> for DriverError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Cancelled => DriverError::Cancelled,
            other => DriverError::Remote(Box::new(other)),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct GitHubDriver {
    api: RwLock<Arc<dyn GitHubApi>>,
    auth: RwLock<AuthState>,
    catalogue: RwLock<Catalogue>,
    negative: NegativeCache,
    token: Option<String>,
    owners: Vec<Owner>,
    preferences: Preferences,
    refresh_interval: Duration,
    ssh_agent: fn() -> bool,
}

impl GitHubDriver {
    pub fn from_config(config: GitHubConfig) -> Result<Self, ConfigError> {
        let api = Arc::new(UreqApi::new(&config.api_url, config.token()));
        Self::with_api(config, api)
    }

    pub fn with_api(config: GitHubConfig, api: Arc<dyn GitHubApi>) -> Result<Self, ConfigError> {
        let owners = config
            .owners
            .iter()
            .map(|owner| {
                owner
                    .parse::<Owner>()
                    .map_err(|e| ConfigError::InvalidDriverConfig {
                        driver: TYPE_NAME.to_string(),
                        message: format!("invalid owner {:?}: {}", owner, e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if config.refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidDriverConfig {
                driver: TYPE_NAME.to_string(),
                message: "refresh_interval_secs must be positive".to_string(),
            });
        }

        Ok(Self {
            api: RwLock::new(api),
            auth: RwLock::new(AuthState::Pending),
            catalogue: RwLock::new(Catalogue::default()),
            negative: NegativeCache::new(),
            token: config.token(),
            owners,
            preferences: Preferences {
                prefer_http: config.prefer_http,
                private_key: config.private_key,
                private_key_passphrase: config.private_key_passphrase,
            },
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            ssh_agent: transport::ssh_agent_available,
        })
    }

    fn api(&self) -> Arc<dyn GitHubApi> {
        Arc::clone(&read(&self.api))
    }

    /// Swap to an anonymous client after the token was rejected.
    fn drop_token(&self) {
        log::warn!("GitHub token was rejected, continuing unauthenticated");
        let anonymous = self.api().without_token();
        *write(&self.api) = anonymous;
        *write(&self.auth) = AuthState::InvalidToken;
    }

    /// Run `call` and retry it once without the token if the token is
    /// rejected.
    fn call<T>(&self, call: impl Fn(&dyn GitHubApi) -> Result<T, ApiError>) -> Result<T, ApiError> {
        let api = self.api();
        match call(api.as_ref()) {
            Err(ApiError::Unauthorized) if api.has_token() => {
                self.drop_token();
                call(self.api().as_ref())
            }
            other => other,
        }
    }

    fn authenticate(&self, ctx: &Context) -> Result<(), DriverError> {
        let api = self.api();
        if !api.has_token() {
            log::info!("No GitHub token configured, using anonymous API access");
            *write(&self.auth) = AuthState::Anonymous;
            return Ok(());
        }

        match api.current_user(ctx) {
            Ok(user) => {
                log::info!("Authenticated to GitHub as {}", user.login);
                *write(&self.auth) = AuthState::Authenticated { login: user.login };
                Ok(())
            }
            Err(ApiError::Unauthorized) => {
                self.drop_token();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-fetch every configured owner's repositories.
    ///
    /// The listing replaces the catalogue, so deleted or hidden repositories
    /// drop out. Lookups under other owners are carried over. If any owner
    /// fails the catalogue is left as it was.
    fn refresh(&self, ctx: &Context) -> Result<(), DriverError> {
        if self.owners.is_empty() {
            return Ok(());
        }

        let mut fresh = Catalogue::default();
        for owner in &self.owners {
            let repos = match self.call(|api| api.owner_repositories(ctx, owner.as_str())) {
                Ok(repos) => repos,
                Err(ApiError::NotFound) => {
                    log::warn!("GitHub owner {} does not exist, skipping", owner);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            log::debug!("Fetched {} repositories of {}", repos.len(), owner);
            for repo in repos {
                if let Ok(key) = repo.full_name.parse::<RepoKey>() {
                    self.negative.remove(&key);
                }
                fresh.insert(repo);
            }
        }

        let count = fresh.repos.len();
        {
            let mut catalogue = write(&self.catalogue);
            let carried: Vec<ApiRepo> = catalogue
                .looked_up
                .iter()
                .filter_map(|id| catalogue.repos.get(id))
                .filter(|repo| !fresh.repos.contains_key(&repo.id) && !self.is_listed_owner(repo))
                .cloned()
                .collect();
            for repo in carried {
                fresh.remember(repo);
            }
            *catalogue = fresh;
        }
        log::info!("GitHub catalogue refreshed: {} repositories", count);
        Ok(())
    }

    /// Whether `repo` belongs to one of the owners `refresh` lists.
    fn is_listed_owner(&self, repo: &ApiRepo) -> bool {
        repo.full_name.split_once('/').is_some_and(|(owner, _)| {
            self.owners
                .iter()
                .any(|listed| listed.as_str().eq_ignore_ascii_case(owner))
        })
    }

    /// Ask the API for `key`, caching a hit and remembering a miss.
    fn lookup(&self, ctx: &Context, key: &RepoKey) -> Result<Option<ApiRepo>, DriverError> {
        if self.negative.contains(key) {
            return Ok(None);
        }
        match self.call(|api| api.repository(ctx, key.owner.as_str(), key.repo.as_str())) {
            Ok(repo) => {
                write(&self.catalogue).remember(repo.clone());
                Ok(Some(repo))
            }
            Err(ApiError::NotFound) => {
                self.negative.insert(key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_full(&self, ctx: &Context, key: &RepoKey) -> Result<Vec<RemoteRepo>, DriverError> {
        if let Some(repo) = read(&self.catalogue).by_key(key) {
            return Ok(vec![to_remote(repo)]);
        }
        Ok(self.lookup(ctx, key)?.iter().map(to_remote).collect())
    }

    fn resolve_bare(&self, ctx: &Context, name: &Repo) -> Result<Vec<RemoteRepo>, DriverError> {
        let cached: Vec<_> = read(&self.catalogue)
            .by_repo_name(name)
            .into_iter()
            .map(to_remote)
            .collect();
        if !cached.is_empty() {
            return Ok(cached);
        }

        // Not cached: try it under each owner we know about.
        let mut owners = self.owners.clone();
        if let AuthState::Authenticated { login } = &*read(&self.auth) {
            if let Ok(login) = login.parse::<Owner>() {
                if !owners.contains(&login) {
                    owners.push(login);
                }
            }
        }

        let mut found = Vec::new();
        for owner in owners {
            if ctx.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let key = RepoKey::new(owner, name.clone());
            if let Some(repo) = self.lookup(ctx, &key)? {
                found.push(to_remote(&repo));
            }
        }
        Ok(found)
    }

    fn cached_by_id(&self, id: u64) -> Option<ApiRepo> {
        read(&self.catalogue).repos.get(&id).cloned()
    }

    /// Work out how to clone repository `id` and where it should go.
    fn prepare(&self, ctx: &Context, id: &str) -> Result<(GitCloner, String), DriverError> {
        let numeric: u64 = id
            .parse()
            .map_err(|_| DriverError::UnknownRepository(id.to_string()))?;

        let repo = match self.cached_by_id(numeric) {
            Some(repo) => repo,
            None => match self.call(|api| api.repository_by_id(ctx, numeric)) {
                Ok(repo) => {
                    write(&self.catalogue).remember(repo.clone());
                    repo
                }
                Err(ApiError::NotFound) => {
                    return Err(DriverError::UnknownRepository(id.to_string()));
                }
                Err(e) => return Err(e.into()),
            },
        };

        let key: RepoKey = repo
            .full_name
            .parse()
            .map_err(|_| DriverError::InvalidRepository(repo.full_name.clone()))?;

        let chosen = transport::select_transport(
            repo.ssh_url.is_some(),
            repo.clone_url.is_some(),
            &self.preferences,
            (self.ssh_agent)(),
        )?;

        let (url, auth) = match chosen {
            Transport::Ssh => {
                let auth = match &self.preferences.private_key {
                    Some(path) => Auth::SshKey {
                        path: path.clone(),
                        passphrase: self.preferences.private_key_passphrase.clone(),
                    },
                    None => Auth::SshAgent,
                };
                (repo.ssh_url, auth)
            }
            Transport::Http => (repo.clone_url, self.http_auth()),
        };
        let url = url.ok_or_else(|| DriverError::InvalidRepository(repo.full_name.clone()))?;

        Ok((GitCloner::new(url, chosen, auth), key.to_string()))
    }

    fn http_auth(&self) -> Auth {
        match &self.token {
            Some(token) if *read(&self.auth) != AuthState::InvalidToken => {
                Auth::Token(token.clone())
            }
            _ => Auth::None,
        }
    }
}

impl Driver for GitHubDriver {
    fn init(&self, ctx: &Context) -> Result<(), DriverError> {
        self.authenticate(ctx)?;
        self.refresh(ctx)
    }

    fn run(&self, ctx: &Context) -> Result<(), DriverError> {
        if self.owners.is_empty() {
            ctx.wait();
            return Err(DriverError::Cancelled);
        }

        loop {
            if !ctx.sleep(self.refresh_interval) {
                return Err(DriverError::Cancelled);
            }
            match self.refresh(ctx) {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to refresh GitHub catalogue: {}", e),
            }
        }
    }

    fn status(&self, _ctx: &Context) -> Result<String, DriverError> {
        let mut status = match &*read(&self.auth) {
            AuthState::Pending => "initializing".to_string(),
            AuthState::Anonymous => "unauthenticated".to_string(),
            AuthState::Authenticated { login } => format!("authenticated as {}", login),
            AuthState::InvalidToken => "unauthenticated (invalid token)".to_string(),
        };
        if let Some(limit) = self.api().rate_limit() {
            status.push_str(&format!(
                ", {}/{} API requests remaining",
                limit.remaining, limit.limit
            ));
        }
        let cached = read(&self.catalogue).repos.len();
        status.push_str(&format!(", {} cached repositories", cached));
        Ok(status)
    }

    fn resolve(&self, ctx: &Context, query: &str) -> Result<Vec<RemoteRepo>, DriverError> {
        if ctx.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        match parse_query(query) {
            None => {
                log::debug!("Ignoring unrecognized query {:?}", query);
                Ok(Vec::new())
            }
            Some(Query::Full(key)) => self.resolve_full(ctx, &key),
            Some(Query::Bare(name)) => self.resolve_bare(ctx, &name),
        }
    }

    fn new_cloner(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<(Box<dyn BoundCloner>, String), DriverError> {
        if ctx.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        let (cloner, hint) = self.prepare(ctx, id)?;
        Ok((Box::new(cloner), hint))
    }
}
