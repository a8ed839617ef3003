use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::webdav::{WEBDAV_FILES_PATH, user_files_path};

const MAX_REDIRECTIONS: u32 = 5;
// One initial attempt plus one retry after a credential refresh.
const MAX_ATTEMPTS_WITH_FRESH_CREDENTIALS: u32 = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Get,
    Put,
    Delete,
    Mkcol,
    Propfind,
    Move,
    Copy,
}

impl DavMethod {
    fn as_http(self) -> Method {
        match self {
            DavMethod::Get => Method::GET,
            DavMethod::Put => Method::PUT,
            DavMethod::Delete => Method::DELETE,
            DavMethod::Mkcol => Method::from_bytes(b"MKCOL").unwrap(),
            DavMethod::Propfind => Method::from_bytes(b"PROPFIND").unwrap(),
            DavMethod::Move => Method::from_bytes(b"MOVE").unwrap(),
            DavMethod::Copy => Method::from_bytes(b"COPY").unwrap(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DavRequest {
    pub method: DavMethod,
    pub url: Url,
    pub depth: Option<&'static str>,
    pub destination: Option<String>,
    pub overwrite: Option<bool>,
    pub body: Option<String>,
}

impl DavRequest {
    pub fn new(method: DavMethod, url: Url) -> Self {
        Self {
            method,
            url,
            depth: None,
            destination: None,
            overwrite: None,
            body: None,
        }
    }

    pub fn depth(mut self, depth: &'static str) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug)]
pub struct DavResponse {
    status: StatusCode,
    headers: HeaderMap,
    final_url: Url,
    body: Vec<u8>,
}

impl DavResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    pub fn final_url(&self) -> &Url {
        &self.final_url
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Hook invoked when a response suggests the session is stale (302, or
/// 401 with non-anonymous credentials). Returning `true` means the
/// client state was repaired and the request may be retried once.
#[async_trait]
pub trait ConnectionValidator: Send + Sync {
    async fn validate(&self, client: &DavClient) -> bool;
}

/// HTTP execution for one server. Redirects are followed manually so
/// WebDAV methods and Destination headers survive relocation.
pub struct DavClient {
    http: Client,
    base_url: RwLock<Url>,
    credentials: RwLock<Credentials>,
    user_id: RwLock<Option<String>>,
    user_agent: String,
    follow_redirects: std::sync::atomic::AtomicBool,
    validator: RwLock<Option<Arc<dyn ConnectionValidator>>>,
    // Present only for clients that serialize their requests. The
    // validator runs through its own client, so it never waits here.
    request_lock: Option<tokio::sync::Mutex<()>>,
}

impl DavClient {
    pub fn new(
        base_url: Url,
        user_agent: impl Into<String>,
        synchronize_requests: bool,
    ) -> Result<Self, TransportError> {
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: RwLock::new(base_url),
            credentials: RwLock::new(Credentials::Anonymous),
            user_id: RwLock::new(None),
            user_agent: user_agent.into(),
            follow_redirects: std::sync::atomic::AtomicBool::new(true),
            validator: RwLock::new(None),
            request_lock: synchronize_requests.then(|| tokio::sync::Mutex::new(())),
        })
    }

    pub fn base_url(&self) -> Url {
        self.base_url.read().unwrap().clone()
    }

    pub fn set_base_url(&self, base_url: Url) {
        *self.base_url.write().unwrap() = base_url;
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().unwrap().clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        if let Credentials::Basic { user, .. } = &credentials {
            let mut user_id = self.user_id.write().unwrap();
            if user_id.is_none() {
                *user_id = Some(user.clone());
            }
        }
        *self.credentials.write().unwrap() = credentials;
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().unwrap().clone()
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.write().unwrap() = Some(user_id.into());
    }

    pub fn set_follow_redirects(&self, follow: bool) {
        self.follow_redirects
            .store(follow, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_validator(&self, validator: Arc<dyn ConnectionValidator>) {
        *self.validator.write().unwrap() = Some(validator);
    }

    /// Absolute URL of the account's WebDAV files root, with a trailing
    /// slash so relative joins stay inside it.
    pub fn user_files_url(&self) -> Result<Url, TransportError> {
        let user_id = self.user_id();
        let path = user_files_path(user_id.as_deref().unwrap_or(""));
        Ok(self.base_url().join(&path)?)
    }

    /// URL of a remote path relative to the user files root.
    pub fn url_for_remote_path(&self, remote_path: &str) -> Result<Url, TransportError> {
        let base = self.user_files_url()?;
        Ok(base.join(remote_path.trim_start_matches('/'))?)
    }

    pub async fn execute(&self, request: DavRequest) -> Result<DavResponse, TransportError> {
        match &self.request_lock {
            Some(lock) => {
                let _guard = lock.lock().await;
                self.execute_inner(request).await
            }
            None => self.execute_inner(request).await,
        }
    }

    async fn execute_inner(&self, request: DavRequest) -> Result<DavResponse, TransportError> {
        let mut attempts = 1u32;
        let mut response = self.send_once(&request).await?;
        let mut validation_failed = false;

        while attempts < MAX_ATTEMPTS_WITH_FRESH_CREDENTIALS && self.needs_validation(&response) {
            let validator = self.validator.read().unwrap().clone();
            let Some(validator) = validator else { break };
            debug!(status = %response.status(), "revalidating connection");
            if !validator.validate(self).await {
                // A rejected validation makes this response final; a
                // redirect that failed validation is not followed.
                validation_failed = true;
                break;
            }
            response = self.send_once(&request).await?;
            attempts += 1;
        }

        if !validation_failed
            && self
                .follow_redirects
                .load(std::sync::atomic::Ordering::SeqCst)
        {
            response = self.follow_redirection(request, response).await?;
        }
        Ok(response)
    }

    fn needs_validation(&self, response: &DavResponse) -> bool {
        response.status() == StatusCode::FOUND
            || (response.status() == StatusCode::UNAUTHORIZED
                && !self.credentials().is_anonymous())
    }

    async fn follow_redirection(
        &self,
        mut request: DavRequest,
        mut response: DavResponse,
    ) -> Result<DavResponse, TransportError> {
        let mut hops = 0u32;
        while hops < MAX_REDIRECTIONS && response.status().is_redirection() {
            let Some(location) = response.header(header::LOCATION.as_str()) else {
                break;
            };
            let next = self.base_url().join(&location)?;
            debug!(%next, hop = hops + 1, "following redirect");
            if let Some(destination) = request.destination.take() {
                request.destination = Some(rewrite_destination(&destination, next.as_str()));
            }
            // The superseded response body was already drained when it
            // was buffered, so the connection can be reused.
            request.url = next;
            response = self.send_once(&request).await?;
            hops += 1;
        }
        Ok(response)
    }

    async fn send_once(&self, request: &DavRequest) -> Result<DavResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method.as_http(), request.url.clone())
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header(header::USER_AGENT, self.user_agent.clone());
        if let Some(value) = self.credentials().header_value() {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        if let Some(depth) = request.depth {
            builder = builder.header("Depth", depth);
        }
        if let Some(destination) = &request.destination {
            builder = builder.header("Destination", destination.clone());
        }
        if let Some(overwrite) = request.overwrite {
            builder = builder.header("Overwrite", if overwrite { "T" } else { "F" });
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
                .body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response.bytes().await?.to_vec();
        debug!(method = ?request.method, url = %request.url, %status, "request completed");
        Ok(DavResponse {
            status,
            headers,
            final_url,
            body,
        })
    }
}

/// Moves a Destination header into the namespace a redirect landed in.
/// Everything from the WebDAV files segment on is kept; the authority
/// and mount prefix come from the redirect target.
fn rewrite_destination(destination: &str, redirect_target: &str) -> String {
    let Some(dest_idx) = destination.find(WEBDAV_FILES_PATH) else {
        return destination.to_string();
    };
    let Some(target_idx) = redirect_target.find(WEBDAV_FILES_PATH) else {
        return destination.to_string();
    };
    format!(
        "{}{}",
        &redirect_target[..target_idx],
        &destination[dest_idx..]
    )
}
