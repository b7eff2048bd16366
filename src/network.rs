/// HTTP transport and link resolution.
///
/// Redirects are never followed transparently: each hop is a crawl event the
/// spider and the mirror need to see, so the client is built with redirects
/// off and [`Resolver`] walks `Location` chains by hand, using HEAD for every
/// hop after the first. The final target's body is only fetched when its own
/// link is processed.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::link::{Link, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Headers are enough (rule probes, redirect hops).
    Head,
    /// Headers and body.
    Full,
}

/// Connection-class failures. HTTP error statuses are not errors here; they
/// arrive as ordinary responses.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid request: {0}")]
    Request(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Connect(_) | FetchError::Timeout)
    }
}

/// A single wire response, before any redirect handling.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// The seam between the crawler and the network. The crawl loop and the rule
/// engine only ever talk to this trait; tests substitute an in-memory
/// implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError>;
}

/// reqwest-backed transport with cookies on and redirects off.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(Config::CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError> {
        let method = match method {
            Method::Head => reqwest::Method::HEAD,
            Method::Get => reqwest::Method::GET,
        };
        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(classify_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(classify_error)?.to_vec();

        Ok(RawResponse {
            url: final_url,
            status,
            headers: response_headers,
            body,
        })
    }
}

fn classify_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() || e.is_request() {
        FetchError::Connect(e.to_string())
    } else {
        FetchError::Request(e.to_string())
    }
}

/// Cache validators from a stored copy, sent as conditional headers.
#[derive(Debug, Clone, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// What a link ultimately resolved to, redirect chain included.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// The URL that was requested.
    pub url: String,
    /// Status of the first response, redirect statuses included.
    pub status: u16,
    pub kind: FetchKind,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub expires: Option<String>,
    /// Raw `Link:` header values.
    pub link_headers: Vec<String>,
    /// Redirect chain as (status of the redirecting response, target URL).
    pub redirects: Vec<(u16, String)>,
    /// Present only for `Full` fetches that did not redirect.
    pub body: Option<Vec<u8>>,
}

impl FetchedResponse {
    /// Content type with any parameters (charset etc.) stripped, lower-cased.
    pub fn mimetype(&self) -> Option<String> {
        self.content_type.as_ref().map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn is_redirect(&self) -> bool {
        !self.redirects.is_empty()
    }

    /// Final target of the redirect chain, if any.
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirects.last().map(|(_, url)| url.as_str())
    }
}

pub fn is_redirect_status(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

pub fn is_permanent_redirect(status: u16) -> bool {
    matches!(status, 301 | 308)
}

/// Drives the Link resolution state machine against a [`Transport`].
pub struct Resolver<'a> {
    transport: &'a dyn Transport,
}

impl<'a> Resolver<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Resolver { transport }
    }

    /// Resolve `link`, reusing a cached outcome where it satisfies the
    /// request: failures and error statuses are never refetched, a cached
    /// full response satisfies everything, and a cached HEAD satisfies HEAD.
    /// Only a HEAD-cached link asked for a full fetch goes back on the wire.
    pub async fn resolve<'l>(
        &self,
        link: &'l mut Link,
        kind: FetchKind,
        validators: Option<&Validators>,
    ) -> &'l Resolution {
        let refetch = match &link.resolution {
            None => true,
            Some(Resolution::Failed(_)) => false,
            Some(Resolution::Fetched(r)) => {
                r.status < 400 && r.kind == FetchKind::Head && kind == FetchKind::Full
            }
        };
        if refetch {
            let outcome = self.fetch(&link.request_url(), kind, validators).await;
            return link.resolution.insert(outcome);
        }
        match &link.resolution {
            Some(res) => res,
            None => unreachable!("refetch covers the empty case"),
        }
    }

    async fn fetch(
        &self,
        url: &str,
        kind: FetchKind,
        validators: Option<&Validators>,
    ) -> Resolution {
        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(v) = validators {
            if let Some(etag) = &v.etag {
                headers.push(("If-None-Match".to_string(), etag.clone()));
            }
            if let Some(lm) = &v.last_modified {
                headers.push(("If-Modified-Since".to_string(), lm.clone()));
            }
        }
        let method = match kind {
            FetchKind::Head => Method::Head,
            FetchKind::Full => Method::Get,
        };

        let first = match self.transport.send(method, url, &headers).await {
            Ok(r) => r,
            Err(e) => return Resolution::Failed(e),
        };

        let mut redirects: Vec<(u16, String)> = Vec::new();
        let mut hop_status = first.status;
        let mut hop_url = first.url.clone();
        let mut hop_location = first.header("location").map(str::to_string);
        while is_redirect_status(hop_status) && redirects.len() < Config::MAX_REDIRECTS {
            let Some(location) = hop_location else { break };
            let Some(next_url) = absolutize_location(&hop_url, &location) else {
                break;
            };
            let next = match self.transport.send(Method::Head, &next_url, &[]).await {
                Ok(r) => r,
                Err(e) => return Resolution::Failed(e),
            };
            redirects.push((hop_status, next_url.clone()));
            hop_status = next.status;
            hop_url = next_url;
            hop_location = next.header("location").map(str::to_string);
        }

        // Read the headers out before the body is moved from `first`.
        let content_type = first.header("content-type").map(str::to_string);
        let content_length = first.header("content-length").and_then(|v| v.parse().ok());
        let etag = first.header("etag").map(str::to_string);
        let last_modified = first.header("last-modified").map(str::to_string);
        let expires = first.header("expires").map(str::to_string);
        let link_headers = first
            .headers_named("link")
            .into_iter()
            .map(str::to_string)
            .collect();
        let body = if kind == FetchKind::Full && redirects.is_empty() {
            Some(first.body)
        } else {
            None
        };
        Resolution::Fetched(FetchedResponse {
            url: first.url,
            status: first.status,
            kind,
            content_type,
            content_length,
            etag,
            last_modified,
            expires,
            link_headers,
            redirects,
            body,
        })
    }
}

fn absolutize_location(base: &str, location: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    Some(base.join(location).ok()?.to_string())
}
