use futures::StreamExt;
use rand::Rng;
use reqwest::header::{
    HeaderMap, ACCEPT, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    LOCATION,
};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use super::guard::{blocked_in_chain, GuardedResolver, HostResolver, SystemResolver, TargetGuard};
use crate::util::UrlValidationError;

/// `Accept` header for feed requests.
pub const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

/// `Accept` header for HTML pages fetched during discovery.
pub const HTML_ACCEPT: &str = "text/html, application/xhtml+xml;q=0.9, */*;q=0.5";

/// Errors that can occur while fetching a remote resource.
///
/// [`FetchError::is_retryable`] decides which of these the retry loop will
/// attempt again; everything else fails the fetch immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL could not be parsed or uses an unsupported scheme
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The target violates the SSRF policy (private address, metadata host, credentials)
    #[error("blocked target {url}: {reason}")]
    Blocked { url: String, reason: String },
    /// DNS lookup failed or returned no addresses
    #[error("could not resolve {host}: {reason}")]
    Unresolvable { host: String, reason: String },
    /// HTTP response with a non-success status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The attempt exceeded its per-request timeout
    #[error("request timed out")]
    Timeout,
    /// Connection, TLS or protocol failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The redirect chain was longer than allowed
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    /// Response body exceeded the configured size limit
    #[error("response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub(crate) fn from_validation(url: &str, err: UrlValidationError) -> Self {
        match err {
            UrlValidationError::InvalidUrl(_)
            | UrlValidationError::UnsupportedScheme(_)
            | UrlValidationError::MissingHost => FetchError::InvalidUrl(err.to_string()),
            UrlValidationError::Credentials
            | UrlValidationError::BlockedHost(_)
            | UrlValidationError::BlockedIp(_) => {
                tracing::warn!(url = %url, reason = %err, "Blocked fetch target");
                FetchError::Blocked {
                    url: url.to_owned(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if let Some(blocked) = blocked_in_chain(&err) {
            tracing::warn!(host = %blocked.host, ip = %blocked.ip, "Blocked connection to non-public address");
            return FetchError::Blocked {
                url: blocked.host.clone(),
                reason: blocked.to_string(),
            };
        }
        if err.is_timeout() {
            return FetchError::Timeout;
        }
        FetchError::Network(err)
    }

    /// Returns true if this error is transient and the request should be retried.
    ///
    /// Retryable: HTTP 408, 429 and 5xx, timeouts, transport failures and
    /// truncated bodies. SSRF rejections and malformed URLs never are.
    ///
    /// A failed DNS lookup ([`FetchError::Unresolvable`]) is not retried
    /// against the same host: the resolver has already given its answer, and
    /// discovery tries the `www.` host instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus(status) => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            FetchError::Timeout | FetchError::IncompleteResponse { .. } => true,
            FetchError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            FetchError::InvalidUrl(_)
            | FetchError::Blocked { .. }
            | FetchError::Unresolvable { .. }
            | FetchError::TooManyRedirects(_)
            | FetchError::ResponseTooLarge
            | FetchError::Exhausted { .. } => false,
        }
    }

    /// True when the host could not be reached at all (as opposed to
    /// answering with an error), which is when discovery tries `www.`.
    pub fn is_unreachable(&self) -> bool {
        match self.root() {
            FetchError::Unresolvable { .. } | FetchError::Timeout => true,
            FetchError::Network(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// The underlying error, looking through [`FetchError::Exhausted`].
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Conditional-GET cache validators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        Self {
            etag: get(ETAG),
            last_modified: get(LAST_MODIFIED),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Parameters of one fetch. Unset limits fall back to the fetcher's settings.
#[derive(Debug, Clone)]
pub struct RemoteFetchRequest {
    url: String,
    validators: Validators,
    timeout: Option<Duration>,
    max_attempts: Option<u32>,
    max_redirects: Option<usize>,
    accept: &'static str,
}

impl RemoteFetchRequest {
    /// A request for feed content.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            validators: Validators::default(),
            timeout: None,
            max_attempts: None,
            max_redirects: None,
            accept: FEED_ACCEPT,
        }
    }

    /// A request for an HTML page.
    pub fn html(url: impl Into<String>) -> Self {
        Self {
            accept: HTML_ACCEPT,
            ..Self::new(url)
        }
    }

    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = Some(hops);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// What the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok { body: String },
    NotModified,
}

/// Result of a successful fetch (after redirects and retries).
#[derive(Debug, Clone)]
pub struct RemoteFetchResult {
    pub outcome: FetchOutcome,
    /// Validators from the final response, for the next conditional GET
    pub validators: Validators,
    /// URL of the last hop in the redirect chain
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
}

impl RemoteFetchResult {
    /// Response body, or `None` for a 304.
    pub fn body(&self) -> Option<&str> {
        match &self.outcome {
            FetchOutcome::Ok { body } => Some(body),
            FetchOutcome::NotModified => None,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self.outcome, FetchOutcome::NotModified)
    }

    pub fn looks_like_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(false)
    }
}

/// Fetcher-wide defaults.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_attempts: 3,
            max_redirects: 5,
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(2),
            user_agent: concat!("feedgate/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// HTTP client that only talks to public addresses.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct SafeFetcher {
    client: reqwest::Client,
    guard: TargetGuard,
    settings: Arc<FetchSettings>,
}

impl SafeFetcher {
    /// Builds a fetcher that resolves hosts through the operating system.
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        Self::with_guard(settings, TargetGuard::new(Arc::new(SystemResolver)))
    }

    /// Builds a fetcher with a custom resolver.
    pub fn with_resolver(
        settings: FetchSettings,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, FetchError> {
        Self::with_guard(settings, TargetGuard::new(resolver))
    }

    pub(crate) fn with_guard(settings: FetchSettings, guard: TargetGuard) -> Result<Self, FetchError> {
        // Redirects are followed by hand so every hop goes through the guard.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedResolver::new(guard.clone())))
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            guard,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetches a remote resource as text.
    ///
    /// Validates the target, follows redirects manually (re-validating every
    /// hop), and retries transient failures with capped exponential backoff.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] / [`FetchError::Blocked`] before any I/O
    /// - [`FetchError::TooManyRedirects`] when the hop budget is spent
    /// - [`FetchError::HttpStatus`] for non-retryable statuses (e.g. 404)
    /// - [`FetchError::Exhausted`] after the last retryable failure
    pub async fn fetch_remote_text(
        &self,
        request: &RemoteFetchRequest,
    ) -> Result<RemoteFetchResult, FetchError> {
        // Address policy is enforced per hop in `attempt`, before any I/O
        let start = parse_target(request.url())?;
        let attempts = request
            .max_attempts
            .unwrap_or(self.settings.max_attempts)
            .max(1);

        let mut attempt: u32 = 1;
        loop {
            match self.attempt(&start, request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = backoff_delay(attempt, self.settings.backoff_base, self.settings.backoff_cap);
                    tracing::warn!(
                        url = %start,
                        attempt = attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() && attempts > 1 => {
                    tracing::debug!(url = %start, attempts = attempts, error = %e, "Retries exhausted");
                    return Err(FetchError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: walk the redirect chain until a non-redirect response.
    async fn attempt(
        &self,
        start: &Url,
        request: &RemoteFetchRequest,
    ) -> Result<RemoteFetchResult, FetchError> {
        let max_redirects = request.max_redirects.unwrap_or(self.settings.max_redirects);
        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let mut current = start.clone();
        let mut hops = 0usize;

        loop {
            self.guard.check(&current).await?;

            let deadline = Instant::now() + timeout;
            let mut builder = self
                .client
                .get(current.clone())
                .header(ACCEPT, request.accept);
            if let Some(etag) = &request.validators.etag {
                builder = builder.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &request.validators.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, modified.as_str());
            }

            let response = tokio::time::timeout_at(deadline, builder.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::from_transport)?;
            let status = response.status();

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                let Some(next) = redirect_target(&current, response.headers()) else {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                };
                hops += 1;
                if hops > max_redirects {
                    return Err(FetchError::TooManyRedirects(max_redirects));
                }
                tracing::debug!(from = %current, to = %next, hop = hops, "Following redirect");
                current = next;
                continue;
            }

            let validators = Validators::from_headers(response.headers());

            if status == StatusCode::NOT_MODIFIED {
                return Ok(RemoteFetchResult {
                    outcome: FetchOutcome::NotModified,
                    validators,
                    final_url: current,
                    status: status.as_u16(),
                    content_type: None,
                });
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_lowercase);

            let bytes = tokio::time::timeout_at(
                deadline,
                read_limited_bytes(response, self.settings.max_body_bytes),
            )
            .await
            .map_err(|_| FetchError::Timeout)??;

            return Ok(RemoteFetchResult {
                outcome: FetchOutcome::Ok {
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                },
                validators,
                final_url: current,
                status: status.as_u16(),
                content_type,
            });
        }
    }
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?.trim();
    if location.is_empty() {
        return None;
    }
    current.join(location).ok()
}

pub(crate) fn parse_target(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw.trim()).map_err(|e| FetchError::from_validation(raw, UrlValidationError::from(e)))
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)` plus up to half
/// of that again at random, never more than `cap`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let exp = exp.min(cap);
    let jitter_ms = (exp.as_millis() as u64) / 2;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    (exp + jitter).min(cap)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_transport)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feed::guard::tests::StaticResolver;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn fast_settings() -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            ..FetchSettings::default()
        }
    }

    /// Fetcher that may reach the local mock server but nothing else private.
    pub(crate) fn test_fetcher() -> SafeFetcher {
        let guard = TargetGuard::new(Arc::new(StaticResolver::default())).allowing_loopback();
        SafeFetcher::with_guard(fast_settings(), guard).unwrap()
    }

    fn strict_fetcher() -> SafeFetcher {
        SafeFetcher::with_resolver(fast_settings(), Arc::new(StaticResolver::default())).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml")
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let result = test_fetcher()
            .fetch_remote_text(&RemoteFetchRequest::new(&url))
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.body(), Some(VALID_RSS));
        assert_eq!(result.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(result.final_url.as_str(), url);
    }

    #[tokio::test]
    async fn test_private_targets_rejected_before_io() {
        let fetcher = strict_fetcher();
        for url in [
            "http://127.0.0.1/feed",
            "http://10.0.0.1/feed",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/feed",
            "http://[fe80::1]/feed",
            "http://100.64.0.1/feed",
            "http://224.0.0.1/feed",
            "http://localhost/feed",
            "http://metadata.google.internal/",
        ] {
            let err = fetcher
                .fetch_remote_text(&RemoteFetchRequest::new(url))
                .await
                .unwrap_err();
            assert!(
                matches!(err, FetchError::Blocked { .. }),
                "{url}: expected Blocked, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let fetcher = strict_fetcher();
        for url in ["not a url", "ftp://example.com/feed", "file:///etc/passwd"] {
            let err = fetcher
                .fetch_remote_text(&RemoteFetchRequest::new(url))
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::InvalidUrl(_)), "{url}: got {err:?}");
        }
        let err = fetcher
            .fetch_remote_text(&RemoteFetchRequest::new("https://u:p@example.com/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_redirect_to_private_address_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "http://169.254.169.254/latest/meta-data"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch_remote_text(&RemoteFetchRequest::new(format!("{}/start", mock_server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Blocked { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_relative_redirect_followed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let result = test_fetcher()
            .fetch_remote_text(&RemoteFetchRequest::new(format!("{}/old", mock_server.uri())))
            .await
            .unwrap();
        assert_eq!(result.final_url.path(), "/new");
        assert_eq!(result.body(), Some(VALID_RSS));
    }

    #[tokio::test]
    async fn test_redirect_budget_enforced() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch_remote_text(
                &RemoteFetchRequest::new(format!("{}/loop", mock_server.uri())).with_max_redirects(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects(2)));
    }

    #[tokio::test]
    async fn test_500_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 500, third succeeds
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let result = test_fetcher()
            .fetch_remote_text(
                &RemoteFetchRequest::new(format!("{}/feed", mock_server.uri())).with_max_attempts(3),
            )
            .await
            .unwrap();
        assert_eq!(result.status, 200);
    }

    #[tokio::test]
    async fn test_500_exhausts_attempts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch_remote_text(
                &RemoteFetchRequest::new(format!("{}/feed", mock_server.uri())).with_max_attempts(3),
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts: 3, last } => {
                assert!(matches!(*last, FetchError::HttpStatus(503)))
            }
            e => panic!("Expected Exhausted, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_404_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch_remote_text(
                &RemoteFetchRequest::new(format!("{}/feed", mock_server.uri())).with_max_attempts(3),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_429_is_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let result = test_fetcher()
            .fetch_remote_text(&RemoteFetchRequest::new(format!("{}/feed", mock_server.uri())))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_conditional_get_not_modified() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"abc\""))
            // `header` splits values on commas, which HTTP dates contain
            .and(header_exists("If-Modified-Since"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = RemoteFetchRequest::new(format!("{}/feed", mock_server.uri())).with_validators(
            Validators {
                etag: Some("\"abc\"".into()),
                last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
            },
        );
        let result = test_fetcher().fetch_remote_text(&request).await.unwrap();
        assert!(result.is_not_modified());
        assert_eq!(result.body(), None);
        assert_eq!(result.status, 304);

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(
            received[0]
                .headers
                .get("If-Modified-Since")
                .and_then(|v| v.to_str().ok()),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&mock_server)
            .await;

        let guard = TargetGuard::new(Arc::new(StaticResolver::default())).allowing_loopback();
        let fetcher = SafeFetcher::with_guard(
            FetchSettings {
                max_body_bytes: 1024,
                ..fast_settings()
            },
            guard,
        )
        .unwrap();
        let err = fetcher
            .fetch_remote_text(&RemoteFetchRequest::new(format!("{}/big", mock_server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch_remote_text(
                &RemoteFetchRequest::new(format!("{}/slow", mock_server.uri()))
                    .with_timeout(Duration::from_millis(50))
                    .with_max_attempts(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[test]
    fn test_backoff_is_capped() {
        let cap = Duration::from_secs(2);
        for attempt in 1..40 {
            assert!(backoff_delay(attempt, Duration::from_millis(250), cap) <= cap);
        }
        let first = backoff_delay(1, Duration::from_millis(100), cap);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    }

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::HttpStatus(408).is_retryable());
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(FetchError::HttpStatus(502).is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::HttpStatus(403).is_retryable());
        assert!(!FetchError::InvalidUrl("x".into()).is_retryable());
        let unresolvable = FetchError::Unresolvable {
            host: "nowhere.test".into(),
            reason: "no such host".into(),
        };
        assert!(!unresolvable.is_retryable());
        assert!(unresolvable.is_unreachable());
        assert!(!FetchError::Blocked {
            url: "x".into(),
            reason: "y".into()
        }
        .is_retryable());
    }
}
