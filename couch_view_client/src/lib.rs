//! # couch_view_client
//!
//! Query map/reduce views and list functions on a CouchDB-style document store without
//! managing the design document that defines them.
//!
//! The [`Client`] is configured with a [`DesignDocument`] and installs it under an id derived
//! from its content, `_design/<fingerprint>`. Queries address that id directly; when the
//! server reports it missing, the client installs it, prunes stale versions, and retries the
//! query once.
//!
//! The target URL is a template whose `{name}` placeholders are resolved per call, see
//! [`placeholder`].
//!
//! ```no_run
//! # use couch_view_client::{Client, DesignDocument, ViewDefinition};
//! # use futures::StreamExt;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let design = DesignDocument::new().with_view(
//!     "by_name",
//!     ViewDefinition::new("function(doc) { emit(doc.name, null); }"),
//! );
//! let client = Client::builder("http://localhost:5984/{database}", design)
//!     .placeholder("database", "people")
//!     .build()?;
//!
//! let mut rows = client.view("by_name").param("limit", 10).stream().await?;
//! while let Some(event) = rows.next().await {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod design;
mod install;
pub mod placeholder;
mod query;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod test_util;

use std::sync::Arc;

use reqwest::{Method, StatusCode, header::HeaderMap};
use serde_json::Value;
use url::Url;

pub use design::{DesignDocument, DesignValue, Fingerprint, FunctionSource, ViewDefinition};
pub use install::InstalledDesignDoc;
pub use placeholder::{CallOptions, Placeholder, Placeholders};
pub use query::{ViewBody, ViewRequestBuilder, ViewResponse};
pub use stream::{RowEvent, RowStream};
pub use transport::{HttpTransport, Transport, TransportRequest, TransportResponse};

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("view '{0}' is not defined in the design document")]
    UnknownView(String),

    #[error("list '{0}' is not defined in the design document")]
    UnknownList(String),

    #[error("list '{list}' cannot be applied to temporary view '{view}'")]
    TemporaryList { view: String, list: String },

    #[error("failed to serialize the design document: {0}")]
    Design(#[source] serde_json::Error),

    #[error("failed to build the HTTP client: {0}")]
    BuildHttpClient(#[source] reqwest::Error),

    #[error("base URL '{url}' is invalid: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request URL error: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read the API response bytes: {0}")]
    Bytes(#[source] std::io::Error),

    #[error("failed to parse JSON response: {0}")]
    Json(#[source] serde_json::Error),

    #[error("not found: {path}: {message}")]
    NotFound { path: String, message: String },

    #[error("conflict: {path}: {message}")]
    Conflict { path: String, message: String },

    #[error("server responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("failed to decode streamed line '{line}': {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }

    /// The server reported the addressed resource missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The server reported a revision conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this error is a misuse of the client that never reached the network
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownView(_) | Self::UnknownList(_) | Self::TemporaryList { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client for querying the views of one design document
///
/// Cheap to clone; clones share the design document, its fingerprint and the transport.
#[derive(Debug, Clone)]
pub struct Client {
    /// URL template of the database, e.g. `http://{host}:5984/{database}`
    url_template: Arc<str>,
    placeholders: Arc<Placeholders>,
    design: Arc<DesignDocument>,
    /// Computed once from `design`
    fingerprint: Fingerprint,
    /// Forward conditional request headers and response `ETag`s for views
    trust_view_etags: bool,
    transport: Arc<dyn Transport>,
}

impl Client {
    /// Start building a [`Client`] for the database at `url_template`
    pub fn builder(url_template: impl Into<String>, design: DesignDocument) -> ClientBuilder {
        ClientBuilder {
            url_template: url_template.into(),
            design,
            placeholders: Placeholders::new(),
            trust_view_etags: false,
            transport: None,
        }
    }

    pub fn design(&self) -> &DesignDocument {
        &self.design
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn trusts_view_etags(&self) -> bool {
        self.trust_view_etags
    }

    /// The database URL for a call, with placeholders resolved and a trailing `/`
    pub fn database_url(&self, options: &CallOptions) -> Result<Url> {
        let resolved = self.placeholders.resolve(&self.url_template, options);
        let mut url = Url::parse(&resolved).map_err(|source| Error::BaseUrl {
            url: resolved.clone(),
            source,
        })?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Make a `PUT` request for the database itself
    ///
    /// Succeeds when the database was created or already existed, including a `404` answer.
    pub async fn create_database(&self, options: &CallOptions) -> Result<()> {
        let mut url = self.database_url(options)?;
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);

        let resp = self
            .transport
            .send(TransportRequest::new(Method::PUT, url))
            .await?;
        match resp.status {
            StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::OK => {
                tracing::info!(database = %path, "created database");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED | StatusCode::NOT_FOUND => {
                tracing::debug!(
                    database = %path,
                    status = %resp.status,
                    "database already exists"
                );
                Ok(())
            }
            _ => Err(error_for_status(&path, resp).await),
        }
    }

    /// Send a request for `path` relative to the database URL
    ///
    /// Any status other than success or `304 Not Modified` is returned as an [`Error`].
    pub(crate) async fn execute(
        &self,
        options: &CallOptions,
        method: Method,
        path: &str,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Option<Value>,
    ) -> Result<TransportResponse> {
        let url = self.database_url(options)?.join(path)?;
        let request = TransportRequest {
            method,
            url,
            query,
            headers,
            body,
        };
        let resp = self.transport.send(request).await?;
        if resp.status.is_success() || resp.status == StatusCode::NOT_MODIFIED {
            Ok(resp)
        } else {
            Err(error_for_status(path, resp).await)
        }
    }
}

/// Classify a failed response, reading its body for the message
async fn error_for_status(path: &str, resp: TransportResponse) -> Error {
    let code = resp.status;
    let message = match resp.text().await {
        Ok(text) => text,
        Err(e) => return e,
    };
    let path = path.to_string();
    match code {
        StatusCode::NOT_FOUND => Error::NotFound { path, message },
        StatusCode::CONFLICT => Error::Conflict { path, message },
        code => Error::ApiError { code, message },
    }
}

/// Builder for a [`Client`], produced by [`Client::builder`]
#[derive(Debug)]
pub struct ClientBuilder {
    url_template: String,
    design: DesignDocument,
    placeholders: Placeholders,
    trust_view_etags: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Register a fixed placeholder value
    pub fn placeholder(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.placeholders.insert(name, Placeholder::value(value));
        self
    }

    /// Register a placeholder computed from the call options
    pub fn computed_placeholder<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallOptions, &str) -> String + Send + Sync + 'static,
    {
        self.placeholders.insert(name, Placeholder::computed(f));
        self
    }

    /// Replace all registered placeholders
    pub fn placeholders(mut self, placeholders: Placeholders) -> Self {
        self.placeholders = placeholders;
        self
    }

    /// Forward `If-None-Match` on view requests and expose response `ETag`s
    ///
    /// Off by default: some servers reuse a database's identity after it is deleted and
    /// recreated, so a cached validator can claim "not modified" for data that no longer
    /// exists.
    pub fn trust_view_etags(mut self, trust: bool) -> Self {
        self.trust_view_etags = trust;
        self
    }

    /// Use `transport` instead of a default [`HttpTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Client> {
        let fingerprint = self.design.fingerprint().map_err(Error::Design)?;
        tracing::debug!(%fingerprint, "configured design document");
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()),
        };
        Ok(Client {
            url_template: self.url_template.into(),
            placeholders: Arc::new(self.placeholders),
            design: Arc::new(self.design),
            fingerprint,
            trust_view_etags: self.trust_view_etags,
            transport,
        })
    }
}

pub(crate) fn etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}
