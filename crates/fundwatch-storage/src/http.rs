//! HTTP transport used by source adapters and the webhook notifier.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = "fundwatch/0.1 (+https://github.com/)";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-2xx response into `FetchError::HttpStatus`.
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::HttpStatus {
                status: self.status.as_u16(),
                url: self.final_url,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no response available for {url}")]
    NoResponse { url: String },
}

/// Outbound HTTP seam. Implementations do not check the status code; callers
/// decide what counts as failure.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError>;

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn collect(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        debug!(%status, url = %final_url, bytes = body.len(), "http response");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        debug!(url, "http get");
        let resp = self.client.get(url).timeout(timeout).send().await?;
        Self::collect(resp).await
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        debug!(url, "http post");
        let mut request = self.client.post(url).timeout(timeout).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.send().await?;
        Self::collect(resp).await
    }
}

/// A request observed by [`FixtureTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
enum Canned {
    Response { status: u16, body: Vec<u8> },
    Failure,
}

/// In-memory transport serving canned responses by URL.
///
/// Responses queued for one URL are served in order; the last one repeats.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    responses: Mutex<HashMap<String, VecDeque<Canned>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.push(
            url,
            Canned::Response {
                status,
                body: body.into(),
            },
        );
        self
    }

    pub fn with_failure(self, url: &str) -> Self {
        self.push(url, Canned::Failure);
        self
    }

    fn push(&self, url: &str, canned: Canned) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.entry(url.to_string()).or_default().push_back(canned);
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn serve(&self, request: RecordedRequest) -> Result<FetchedResponse, FetchError> {
        let url = request.url.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let canned = self.responses.lock().ok().and_then(|mut responses| {
            let queue = responses.get_mut(&url)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });

        match canned {
            Some(Canned::Response { status, body }) => Ok(FetchedResponse {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                final_url: url,
                body,
            }),
            Some(Canned::Failure) | None => Err(FetchError::NoResponse { url }),
        }
    }
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        self.serve(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            timeout,
        })
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        self.serve(RecordedRequest {
            method: "POST",
            url: url.to_string(),
            headers: headers.to_vec(),
            body: Some(body.clone()),
            timeout,
        })
    }
}
