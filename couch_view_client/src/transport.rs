//! The HTTP capability the [`Client`](crate::Client) is composed with.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use secrecy::{ExposeSecret, Secret};
use serde_json::Value;
use url::Url;

use crate::{Error, Result};

/// A fully resolved request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    /// Query string pairs, appended to any query already on `url`
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Sent as `application/json` when present
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            query: vec![],
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Response body, delivered as it arrives
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A response whose status and headers have arrived but whose body may still be streaming
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Build a response from a complete body
    pub fn full(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            body: futures::stream::once(async move { Ok::<_, io::Error>(body) }).boxed(),
        }
    }

    /// Buffer the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        let buf = self
            .body
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await
            .map_err(Error::Bytes)?;
        Ok(buf.freeze())
    }

    /// Buffer the whole body as text, replacing invalid UTF-8
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Whether the `Content-Type` is JSON
    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|mime| {
                let mime = mime.trim();
                mime == "application/json" || mime.ends_with("+json")
            })
            .unwrap_or(false)
    }
}

/// Executes requests against the data store
///
/// Implementations handle connection reuse, TLS and network retries. Status codes are
/// returned as-is; the [`Client`](crate::Client) classifies them.
#[async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync + 'static {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// [`Transport`] backed by a [`reqwest::Client`]
///
/// Requests accept `application/json` unless they set their own `Accept` header; servers
/// answer with `text/plain` otherwise.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    /// The `Bearer` token to send with each request, if any
    auth_token: Option<Secret<String>>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            auth_token: None,
        }
    }

    /// Create a transport whose requests time out after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::BuildHttpClient)?;
        Ok(Self {
            http_client,
            auth_token: None,
        })
    }

    /// Set the `Bearer` token that will be sent with each request to the server
    pub fn with_auth_token<S: Into<String>>(mut self, auth_token: S) -> Self {
        self.auth_token = Some(Secret::new(auth_token.into()));
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let TransportRequest {
            method,
            url,
            query,
            mut headers,
            body,
        } = request;
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }

        let mut req = self
            .http_client
            .request(method.clone(), url.clone())
            .headers(headers);
        if !query.is_empty() {
            req = req.query(&query);
        }
        if let Some(body) = &body {
            req = req.json(body);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(method, url.path(), src))?;

        Ok(TransportResponse {
            status: resp.status(),
            headers: resp.headers().clone(),
            body: resp.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }
}
