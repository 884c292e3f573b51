use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiErrorBody;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    credentials::{CredentialStore, Notifier, SessionSink},
    error::{ErrorClassification, HttpFailure, TransportError},
    retry::{parse_retry_after, RetryPolicy},
};

pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please log in again.";

/// A logical request as issued by calling code.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Immutable view of one attempt of a logical request. Retries build a fresh
/// context through [`RequestContext::next_attempt`]; nothing is shared between
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
    attempt: u32,
}

impl RequestContext {
    fn first(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            body,
            attempt: 0,
        }
    }

    fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Retries performed so far; `0` for the first attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    url: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|source| TransportError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

pub struct HttpTransport {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    session: Arc<dyn SessionSink>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    session_notice_armed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<dyn SessionSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            session,
            notifier,
            policy: RetryPolicy::default(),
            session_notice_armed: AtomicBool::new(true),
        }
    }

    pub fn from_settings(
        settings: &ClientSettings,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<dyn SessionSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(settings.api_base_url.clone(), credentials, session, notifier)
            .with_retry_policy(RetryPolicy::from(&settings.retry))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransportError> {
        let mut spec = RequestSpec::new(Method::GET, path);
        for (key, value) in query {
            spec = spec.query(*key, value);
        }
        self.execute(spec).await?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.execute(RequestSpec::new(Method::DELETE, path)).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let url = self.url_string(path);
        let body = serde_json::to_value(body)
            .map_err(|source| TransportError::Encode { url, source })?;
        self.execute(RequestSpec::new(method, path).json(body))
            .await?
            .json()
    }

    /// Runs one logical request to completion, including any retries.
    ///
    /// Retries are strictly sequential: the next attempt starts only after the
    /// previous response and its backoff sleep have both completed.
    pub async fn execute(&self, spec: RequestSpec) -> Result<HttpResponse, TransportError> {
        let mut ctx = self.first_context(spec)?;
        loop {
            let response = self.send_once(&ctx).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|source| TransportError::Network {
                    method: ctx.method.clone(),
                    url: ctx.url.to_string(),
                    source,
                })?
                .to_vec();

            if !status.is_client_error() && !status.is_server_error() {
                self.session_notice_armed.store(true, Ordering::SeqCst);
                return Ok(HttpResponse {
                    status,
                    headers,
                    body,
                    url: ctx.url.to_string(),
                });
            }

            let classification = ErrorClassification::classify(
                &ctx.method,
                status,
                ApiErrorBody::server_message(&body),
            );

            if classification.session_invalid {
                self.invalidate_session().await;
                return Err(TransportError::Http(http_failure(&ctx, classification, false)));
            }

            if classification.retriable {
                let next = ctx.next_attempt();
                if self.policy.allows_attempt(next.attempt) {
                    let retry_after = retry_after_hint(&headers);
                    let delay = self.policy.delay_for_attempt(
                        next.attempt,
                        retry_after,
                        self.policy.sample_jitter(),
                    );
                    warn!(
                        method = %ctx.method,
                        url = %ctx.url,
                        status = status.as_u16(),
                        attempt = next.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "http: throttled, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    ctx = next;
                    continue;
                }
                warn!(
                    method = %ctx.method,
                    url = %ctx.url,
                    status = status.as_u16(),
                    retries = ctx.attempt,
                    "http: gave up after rate-limiting"
                );
                return Err(TransportError::Http(http_failure(&ctx, classification, true)));
            }

            let failure = http_failure(&ctx, classification, false);
            debug!(%failure, "http: request failed");
            if let Some(message) = failure.user_message() {
                self.notifier.show_error(&message);
            }
            return Err(TransportError::Http(failure));
        }
    }

    fn url_string(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn first_context(&self, spec: RequestSpec) -> Result<RequestContext, TransportError> {
        let raw = self.url_string(&spec.path);
        let mut url = Url::parse(&raw).map_err(|source| TransportError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        if !spec.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &spec.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(RequestContext::first(spec.method, url, spec.headers, spec.body))
    }

    async fn send_once(&self, ctx: &RequestContext) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .http
            .request(ctx.method.clone(), ctx.url.clone())
            .headers(ctx.headers.clone());
        if let Some(body) = &ctx.body {
            builder = builder.json(body);
        }
        builder = self.attach_auth(builder).await;
        debug!(method = %ctx.method, url = %ctx.url, attempt = ctx.attempt, "http: sending");
        builder
            .send()
            .await
            .map_err(|source| TransportError::Network {
                method: ctx.method.clone(),
                url: ctx.url.to_string(),
                source,
            })
    }

    async fn attach_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.get_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn invalidate_session(&self) {
        info!("http: session invalidated by server, clearing credentials");
        self.credentials.clear_token().await;
        self.credentials.clear_user().await;
        self.session.logout();
        if self.session_notice_armed.swap(false, Ordering::SeqCst) {
            self.notifier.show_error(SESSION_EXPIRED_MESSAGE);
        }
    }
}

fn retry_after_hint(headers: &HeaderMap) -> Option<std::time::Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, Utc::now())
}

fn http_failure(
    ctx: &RequestContext,
    classification: ErrorClassification,
    gave_up: bool,
) -> HttpFailure {
    HttpFailure {
        method: ctx.method.clone(),
        url: ctx.url.to_string(),
        classification,
        retries: ctx.attempt,
        gave_up,
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
