//! GitHub REST API client.
//!
//! The driver only talks to GitHub through [`GitHubApi`], so tests can swap
//! in a scripted implementation. [`UreqApi`] is the real one.
//!
//! Every call takes a [`Context`]. `ureq` cannot be interrupted, so each
//! request runs on its own thread and the caller stops waiting for it as
//! soon as the context is cancelled.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::cancel::Context;

const USER_AGENT: &str = "srcget";
const ACCEPT: &str = "application/vnd.github+json";
const PER_PAGE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("bad credentials")]
    Unauthorized,
    #[error("API rate limit exceeded")]
    RateLimited { reset: Option<u64> },
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unable to decode response: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Repository as returned by the REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRepo {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub ssh_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub login: String,
}

/// Quota reported by the most recent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    /// Unix time at which the quota resets.
    pub reset: u64,
}

pub trait GitHubApi: Send + Sync {
    /// Whether requests carry a token.
    fn has_token(&self) -> bool;

    /// The same client without credentials.
    fn without_token(&self) -> Arc<dyn GitHubApi>;

    /// The authenticated user. Fails with [`ApiError::Unauthorized`] for a
    /// rejected token.
    fn current_user(&self, ctx: &Context) -> Result<ApiUser, ApiError>;

    fn repository(&self, ctx: &Context, owner: &str, name: &str) -> Result<ApiRepo, ApiError>;

    fn repository_by_id(&self, ctx: &Context, id: u64) -> Result<ApiRepo, ApiError>;

    /// Every repository of an organization or user.
    fn owner_repositories(&self, ctx: &Context, owner: &str) -> Result<Vec<ApiRepo>, ApiError>;

    /// Last quota seen, if any request has completed.
    fn rate_limit(&self) -> Option<RateLimit>;
}

/// [`GitHubApi`] over HTTPS using `ureq`.
pub struct UreqApi {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    rate_limit: Arc<Mutex<Option<RateLimit>>>,
}

impl UreqApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            rate_limit: Arc::new(Mutex::new(None)),
        }
    }

    fn get<T>(&self, ctx: &Context, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let url = format!("{}{}", self.base_url, path);
        log::debug!("GET {}", url);

        let mut request = self
            .agent
            .get(&url)
            .set("User-Agent", USER_AGENT)
            .set("Accept", ACCEPT);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        for (name, value) in query {
            request = request.query(name, value);
        }

        let rate_limit = Arc::clone(&self.rate_limit);
        // Room for one result, so an abandoned request never blocks on send.
        let (tx, rx) = bounded::<Result<T, ApiError>>(1);
        thread::Builder::new()
            .name("srcget-github".to_string())
            .spawn(move || {
                let _ = tx.send(execute(request, &rate_limit));
            })
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        select! {
            recv(rx) -> result => result.unwrap_or_else(|_| {
                Err(ApiError::Transport("request thread exited".to_string()))
            }),
            recv(ctx.done()) -> _ => {
                log::debug!("GET {} cancelled", url);
                Err(ApiError::Cancelled)
            }
        }
    }

    fn paginate(&self, ctx: &Context, path: &str) -> Result<Vec<ApiRepo>, ApiError> {
        let mut repos = Vec::new();
        let per_page = PER_PAGE.to_string();
        for page in 1.. {
            let page = page.to_string();
            let batch: Vec<ApiRepo> = self.get(
                ctx,
                path,
                &[("per_page", per_page.as_str()), ("page", page.as_str())],
            )?;
            let done = batch.len() < PER_PAGE;
            repos.extend(batch);
            if done {
                break;
            }
        }
        Ok(repos)
    }
}

fn execute<T: DeserializeOwned>(
    request: ureq::Request,
    rate_limit: &Mutex<Option<RateLimit>>,
) -> Result<T, ApiError> {
    match request.call() {
        Ok(response) => {
            record_rate_limit(rate_limit, &response);
            let body = response
                .into_string()
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
        }
        Err(ureq::Error::Status(code, response)) => {
            record_rate_limit(rate_limit, &response);
            Err(status_error(code, response))
        }
        Err(ureq::Error::Transport(e)) => Err(ApiError::Transport(e.to_string())),
    }
}

fn record_rate_limit(slot: &Mutex<Option<RateLimit>>, response: &ureq::Response) {
    let header = |name: &str| response.header(name)?.parse::<u64>().ok();
    let (Some(limit), Some(remaining), Some(reset)) = (
        header("x-ratelimit-limit"),
        header("x-ratelimit-remaining"),
        header("x-ratelimit-reset"),
    ) else {
        return;
    };
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(RateLimit {
        limit,
        remaining,
        reset,
    });
}

fn status_error(code: u16, response: ureq::Response) -> ApiError {
    let exhausted = response.header("x-ratelimit-remaining") == Some("0");
    let reset = response
        .header("x-ratelimit-reset")
        .and_then(|value| value.parse().ok());

    match code {
        404 => ApiError::NotFound,
        401 => ApiError::Unauthorized,
        429 => ApiError::RateLimited { reset },
        403 if exhausted => ApiError::RateLimited { reset },
        _ => {
            #[derive(Deserialize)]
            struct Body {
                message: String,
            }
            let message = response
                .into_string()
                .ok()
                .and_then(|body| serde_json::from_str::<Body>(&body).ok())
                .map(|body| body.message)
                .unwrap_or_default();
            ApiError::Status { code, message }
        }
    }
}

impl GitHubApi for UreqApi {
    fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn without_token(&self) -> Arc<dyn GitHubApi> {
        Arc::new(Self {
            agent: self.agent.clone(),
            base_url: self.base_url.clone(),
            token: None,
            rate_limit: Arc::new(Mutex::new(None)),
        })
    }

    fn current_user(&self, ctx: &Context) -> Result<ApiUser, ApiError> {
        if self.token.is_none() {
            return Err(ApiError::Unauthorized);
        }
        self.get(ctx, "/user", &[])
    }

    fn repository(&self, ctx: &Context, owner: &str, name: &str) -> Result<ApiRepo, ApiError> {
        self.get(ctx, &format!("/repos/{}/{}", owner, name), &[])
    }

    fn repository_by_id(&self, ctx: &Context, id: u64) -> Result<ApiRepo, ApiError> {
        self.get(ctx, &format!("/repositories/{}", id), &[])
    }

    fn owner_repositories(&self, ctx: &Context, owner: &str) -> Result<Vec<ApiRepo>, ApiError> {
        match self.paginate(ctx, &format!("/orgs/{}/repos", owner)) {
            Err(ApiError::NotFound) => self.paginate(ctx, &format!("/users/{}/repos", owner)),
            other => other,
        }
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        *self
            .rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    /// Minimal HTTP server answering every request with `respond(path)`.
    /// Returns the base URL and the paths requested so far.
    fn serve(respond: fn(&str) -> (u16, String)) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                handle(stream, respond, &log);
            }
        });
        (base, seen)
    }

    fn handle(
        stream: TcpStream,
        respond: fn(&str) -> (u16, String),
        log: &Mutex<Vec<String>>,
    ) {
        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                break;
            }
        }

        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let path = target.split('?').next().unwrap_or(target).to_string();
        let (code, body) = respond(&path);
        log.lock().unwrap().push(path);

        let mut stream = &stream;
        write!(
            stream,
            "HTTP/1.1 {} X\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             x-ratelimit-limit: 60\r\n\
             x-ratelimit-remaining: 57\r\n\
             x-ratelimit-reset: 1700000000\r\n\
             Connection: close\r\n\r\n{}",
            code,
            body.len(),
            body
        )
        .unwrap();
    }

    fn network_tests_enabled() -> bool {
        match std::env::var("SRCGET_RUN_NETWORK_TESTS") {
            Ok(value) => {
                let value = value.to_ascii_lowercase();
                value == "1" || value == "true" || value == "yes"
            }
            Err(_) => false,
        }
    }

    #[test]
    fn decodes_repository() {
        let repo: ApiRepo = serde_json::from_str(
            r#"{
                "id": 1296269,
                "name": "Hello-World",
                "full_name": "octocat/Hello-World",
                "description": null,
                "html_url": "https://github.com/octocat/Hello-World",
                "clone_url": "https://github.com/octocat/Hello-World.git",
                "ssh_url": "git@github.com:octocat/Hello-World.git",
                "private": false
            }"#,
        )
        .unwrap();
        assert_eq!(repo.id, 1296269);
        assert_eq!(repo.full_name, "octocat/Hello-World");
        assert!(repo.description.is_none());
        assert!(repo.ssh_url.is_some());
    }

    #[test]
    fn anonymous_client_has_no_user() {
        let api = UreqApi::new("http://127.0.0.1:9", None);
        assert!(!api.has_token());
        assert!(matches!(
            api.current_user(&Context::background()),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn without_token_drops_credentials() {
        let api = UreqApi::new("https://api.github.com/", Some("secret".into()));
        assert!(api.has_token());
        assert!(!api.without_token().has_token());
        assert_eq!(api.base_url, "https://api.github.com");
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let api = UreqApi::new("http://127.0.0.1:9", None);
        assert!(matches!(
            api.repository(&Context::background(), "octocat", "Hello-World"),
            Err(ApiError::Transport(_))
        ));
    }

    #[test]
    fn owner_repositories_fall_back_to_users() {
        let (base, seen) = serve(|path| match path {
            "/users/octocat/repos" => (
                200,
                r#"[{"id": 1, "name": "Hello-World", "full_name": "octocat/Hello-World"}]"#
                    .to_string(),
            ),
            _ => (404, r#"{"message": "Not Found"}"#.to_string()),
        });
        let api = UreqApi::new(&base, None);

        let repos = api
            .owner_repositories(&Context::background(), "octocat")
            .unwrap();

        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].full_name, "octocat/Hello-World");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["/orgs/octocat/repos", "/users/octocat/repos"]
        );
        assert_eq!(api.rate_limit().map(|limit| limit.remaining), Some(57));
    }

    #[test]
    fn missing_owner_is_not_found() {
        let (base, _) = serve(|_| (404, r#"{"message": "Not Found"}"#.to_string()));
        let api = UreqApi::new(&base, None);
        assert!(matches!(
            api.owner_repositories(&Context::background(), "ghost"),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn cancellation_abandons_a_request_in_flight() {
        // Accepts connections (via the backlog) but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let api = UreqApi::new(&format!("http://{}", listener.local_addr().unwrap()), None);
        let ctx = Context::background();

        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                ctx.cancel();
            })
        };

        let start = Instant::now();
        let result = api.repository(&ctx, "octocat", "Hello-World");
        assert!(matches!(result, Err(ApiError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn cancelled_context_sends_nothing() {
        let (base, seen) = serve(|_| (200, "{}".to_string()));
        let api = UreqApi::new(&base, None);
        let ctx = Context::background();
        ctx.cancel();

        assert!(matches!(
            api.repository_by_id(&ctx, 1),
            Err(ApiError::Cancelled)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn fetches_real_repository() {
        if !network_tests_enabled() {
            eprintln!("skipping network test (set SRCGET_RUN_NETWORK_TESTS=1)");
            return;
        }

        let api = UreqApi::new("https://api.github.com", None);
        let ctx = Context::background();
        let repo = api.repository(&ctx, "octocat", "Hello-World").unwrap();
        assert_eq!(repo.full_name, "octocat/Hello-World");
        assert!(api.rate_limit().is_some());

        assert!(matches!(
            api.repository(&ctx, "octocat", "this-repo-definitely-does-not-exist-12345"),
            Err(ApiError::NotFound)
        ));
    }
}
