//! View and list queries against the installed design document.

use std::collections::BTreeMap;

use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    CallOptions, Client, Error, Result, RowStream, TransportResponse, design::FunctionSource,
};

/// Body of a `POST _temp_view` request
#[derive(Debug, Serialize)]
struct TempView<'a> {
    language: &'a str,
    map: &'a FunctionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    reduce: Option<&'a FunctionSource>,
}

/// Where a validated query is sent
#[derive(Debug)]
enum Target {
    /// Path below the database of a view or list in the installed design document
    Named(String),
    /// Ad-hoc view, posted with its definition
    Temporary(Value),
}

impl Client {
    /// Compose a query of the view `name`
    ///
    /// # Example
    /// ```no_run
    /// # use couch_view_client::{Client, DesignDocument, ViewDefinition};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    /// # let design = DesignDocument::new()
    /// #     .with_view("by_name", ViewDefinition::new("function(doc) { emit(doc.name, 1); }"))
    /// #     .with_list("csv", "function(head, req) { }");
    /// let client = Client::builder("http://localhost:5984/people", design).build()?;
    /// let resp = client
    ///     .view("by_name")
    ///     .list("csv")
    ///     .param("startkey", "a")
    ///     .param("limit", 20)
    ///     .send()
    ///     .await?;
    /// println!("{:?}", resp.body());
    /// # Ok(())
    /// # }
    /// ```
    pub fn view(&self, name: impl Into<String>) -> ViewRequestBuilder<'_> {
        ViewRequestBuilder {
            client: self,
            view: name.into(),
            list: None,
            params: BTreeMap::new(),
            options: CallOptions::new(),
            if_none_match: None,
            temporary: false,
        }
    }
}

/// Used to compose a view or list query
///
/// Produced by [`Client::view`]. Finish with [`send`](Self::send) to buffer the response or
/// [`stream`](Self::stream) to decode rows as they arrive.
#[derive(Debug)]
pub struct ViewRequestBuilder<'c> {
    client: &'c Client,
    view: String,
    list: Option<String>,
    /// Query string parameters, JSON encoded when sent
    params: BTreeMap<String, Value>,
    /// Placeholder values for this call
    options: CallOptions,
    if_none_match: Option<String>,
    temporary: bool,
}

impl ViewRequestBuilder<'_> {
    /// Apply the list function `name` to the view's rows
    pub fn list(mut self, name: impl Into<String>) -> Self {
        self.list = Some(name.into());
        self
    }

    /// Set a query parameter, e.g. `key`, `limit` or `reduce`
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Set query parameters from the given collection of pairs
    pub fn params_from<S, V, C>(mut self, params: C) -> Self
    where
        S: Into<String>,
        V: Into<Value>,
        C: IntoIterator<Item = (S, V)>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set a placeholder value for this call, overriding the client's
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Replace the placeholder values for this call
    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Validator of a previous response, sent as `If-None-Match`
    ///
    /// Only sent when the client trusts view `ETag`s.
    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    /// Run the view's definition ad hoc through `_temp_view` instead of the design document
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Send the query and buffer the response
    pub async fn send(self) -> Result<ViewResponse> {
        let target = self.target()?;
        let resp = match self.issue(&target).await {
            Err(e) if e.is_not_found() && matches!(target, Target::Named(_)) => {
                self.install_for_retry().await?;
                self.issue(&target).await?
            }
            other => other?,
        };
        self.buffer(resp).await
    }

    /// Send the query and decode rows as they arrive
    ///
    /// The response status and the first decoded event are checked before the stream is
    /// returned, so a missing design document is installed and the query retried here, and
    /// a response that fails on its first line is returned as an error.
    pub async fn stream(self) -> Result<RowStream> {
        let target = self.target()?;
        match self.open_stream(&target).await {
            Err(e) if e.is_not_found() && matches!(target, Target::Named(_)) => {
                self.install_for_retry().await?;
                self.open_stream(&target).await
            }
            other => other,
        }
    }

    /// Validate the query against the design document
    fn target(&self) -> Result<Target> {
        let design = self.client.design();
        let view = design
            .view(&self.view)
            .ok_or_else(|| Error::UnknownView(self.view.clone()))?;

        if self.temporary {
            if let Some(list) = &self.list {
                return Err(Error::TemporaryList {
                    view: self.view.clone(),
                    list: list.clone(),
                });
            }
            let body = serde_json::to_value(TempView {
                language: design.language(),
                map: &view.map,
                reduce: view.reduce.as_ref(),
            })
            .map_err(Error::Design)?;
            return Ok(Target::Temporary(body));
        }

        let id = self.client.fingerprint().design_id();
        let path = match &self.list {
            None => format!("{id}/_view/{}", self.view),
            Some(list) => {
                if design.list(list).is_none() {
                    return Err(Error::UnknownList(list.clone()));
                }
                format!("{id}/_list/{list}/{}", self.view)
            }
        };
        Ok(Target::Named(path))
    }

    async fn install_for_retry(&self) -> Result<()> {
        info!(
            view = %self.view,
            list = ?self.list,
            fingerprint = %self.client.fingerprint(),
            "design document missing, installing before retrying the query"
        );
        self.client.install(&self.options).await
    }

    /// One attempt at the request, without any retry
    async fn issue(&self, target: &Target) -> Result<TransportResponse> {
        let query = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();

        match target {
            Target::Named(path) => {
                debug!(%path, "querying view");
                self.client
                    .execute(&self.options, Method::GET, path, query, self.headers(), None)
                    .await
            }
            Target::Temporary(body) => {
                debug!(view = %self.view, "querying temporary view");
                self.client
                    .execute(
                        &self.options,
                        Method::POST,
                        "_temp_view",
                        query,
                        self.headers(),
                        Some(body.clone()),
                    )
                    .await
            }
        }
    }

    /// Conditional headers for the request, honouring the client's trust in validators
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(etag) = &self.if_none_match else {
            return headers;
        };
        if !self.client.trusts_view_etags() {
            debug!("dropping If-None-Match, view etags are not trusted");
            return headers;
        }
        match HeaderValue::from_str(etag) {
            Ok(v) => {
                headers.insert(header::IF_NONE_MATCH, v);
            }
            Err(_) => debug!(%etag, "dropping If-None-Match that is not a valid header value"),
        }
        headers
    }

    fn response_etag(&self, resp: &TransportResponse) -> Option<String> {
        if self.client.trusts_view_etags() {
            crate::etag(&resp.headers)
        } else {
            None
        }
    }

    async fn open_stream(&self, target: &Target) -> Result<RowStream> {
        let resp = self.issue(target).await?;
        let etag = self.response_etag(&resp);
        let mut stream = RowStream::new(resp.body, etag);
        stream.first_outcome().await?;
        Ok(stream)
    }

    async fn buffer(&self, resp: TransportResponse) -> Result<ViewResponse> {
        let status = resp.status;
        let etag = self.response_etag(&resp);
        let is_json = resp.is_json();
        let body = if status == StatusCode::NOT_MODIFIED {
            ViewBody::NotModified
        } else if is_json {
            let bytes = resp.bytes().await?;
            ViewBody::Json(serde_json::from_slice(&bytes).map_err(Error::Json)?)
        } else {
            ViewBody::Text(resp.text().await?)
        };
        Ok(ViewResponse { status, etag, body })
    }
}

/// Body of a buffered view or list response
#[derive(Debug, Clone, PartialEq)]
pub enum ViewBody {
    /// A JSON response, views and most lists
    Json(Value),
    /// Any other content type a list function produced
    Text(String),
    /// `304 Not Modified` for a trusted `If-None-Match`
    NotModified,
}

/// A buffered view or list response
#[derive(Debug, Clone)]
pub struct ViewResponse {
    status: StatusCode,
    /// Only present when the client trusts view `ETag`s
    etag: Option<String>,
    body: ViewBody,
}

impl ViewResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self.body, ViewBody::NotModified)
    }

    pub fn body(&self) -> &ViewBody {
        &self.body
    }

    pub fn into_body(self) -> ViewBody {
        self.body
    }

    /// The `rows` (or `results`) array of a JSON response
    pub fn rows(&self) -> &[Value] {
        match &self.body {
            ViewBody::Json(Value::Object(o)) => o
                .get("rows")
                .or_else(|| o.get("results"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => &[],
        }
    }

    /// Top-level fields of a JSON response other than its rows, e.g. `total_rows`
    pub fn metadata(&self) -> Map<String, Value> {
        match &self.body {
            ViewBody::Json(Value::Object(o)) => o
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "rows" | "results"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Map::new(),
        }
    }
}
