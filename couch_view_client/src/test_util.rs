//! An in-memory stand-in for the server, for tests that need to count requests or hold
//! state across them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};

use crate::{Result, Transport, TransportRequest, TransportResponse};

pub(crate) const ROWS_BODY: &str = "{\"total_rows\":2,\"offset\":0,\"rows\":[\r\n\
{\"id\":\"a\",\"key\":\"a\",\"value\":1},\r\n\
{\"id\":\"b\",\"key\":\"b\",\"value\":2}\r\n\
]}\n";

pub(crate) const VIEW_ETAG: &str = "\"view-etag-1\"";

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: Method,
    /// Path below the database, e.g. `_design/abc/_view/by_name`
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, Default)]
struct State {
    design_docs: BTreeMap<String, String>,
    failing_deletes: BTreeSet<String>,
    /// Answer every view request with 404, installed or not
    views_always_missing: bool,
    requests: Vec<RecordedRequest>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeCouch {
    state: Mutex<State>,
}

impl FakeCouch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_design_doc(&self, id: &str, rev: &str) {
        self.state
            .lock()
            .design_docs
            .insert(id.to_string(), rev.to_string());
    }

    pub(crate) fn fail_deletes_of(&self, id: &str) {
        self.state.lock().failing_deletes.insert(id.to_string());
    }

    pub(crate) fn views_always_missing(&self) {
        self.state.lock().views_always_missing = true;
    }

    pub(crate) fn design_doc_ids(&self) -> Vec<String> {
        self.state.lock().design_docs.keys().cloned().collect()
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method.as_str() == method)
            .count()
    }

    fn respond(&self, request: &RecordedRequest) -> (StatusCode, HeaderMap, String) {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        let ok = |body: &str| (StatusCode::OK, json_headers(), body.to_string());
        let status = |code: StatusCode, body: &str| (code, json_headers(), body.to_string());
        let not_found = status(
            StatusCode::NOT_FOUND,
            r#"{"error":"not_found","reason":"missing"}"#,
        );

        let path = request.path.as_str();
        match (request.method.clone(), path) {
            (Method::PUT, "") => status(StatusCode::CREATED, r#"{"ok":true}"#),
            (Method::GET, "_all_docs") => {
                let rows: Vec<_> = state
                    .design_docs
                    .iter()
                    .map(|(id, rev)| serde_json::json!({"id": id, "key": id, "value": {"rev": rev}}))
                    .collect();
                ok(&serde_json::json!({"total_rows": rows.len(), "offset": 0, "rows": rows})
                    .to_string())
            }
            (Method::POST, "_temp_view") => ok(ROWS_BODY),
            (Method::PUT, id) if id.starts_with("_design/") && !id[8..].contains('/') => {
                if state.design_docs.contains_key(id) {
                    status(
                        StatusCode::CONFLICT,
                        r#"{"error":"conflict","reason":"Document update conflict."}"#,
                    )
                } else {
                    state.design_docs.insert(id.to_string(), "1-fake".to_string());
                    status(StatusCode::CREATED, r#"{"ok":true}"#)
                }
            }
            (Method::DELETE, id) => {
                if state.failing_deletes.contains(id) {
                    return status(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#);
                }
                let rev = request
                    .query
                    .iter()
                    .find(|(k, _)| k == "rev")
                    .map(|(_, v)| v.as_str());
                match state.design_docs.get(id) {
                    Some(current) if Some(current.as_str()) == rev => {
                        state.design_docs.remove(id);
                        ok(r#"{"ok":true}"#)
                    }
                    Some(_) => status(StatusCode::CONFLICT, r#"{"error":"conflict"}"#),
                    None => not_found,
                }
            }
            (Method::GET, path) if path.contains("/_view/") || path.contains("/_list/") => {
                let id = path.splitn(3, '/').take(2).collect::<Vec<_>>().join("/");
                if state.views_always_missing || !state.design_docs.contains_key(&id) {
                    return not_found;
                }
                let etag = HeaderValue::from_static(VIEW_ETAG);
                if request.headers.get(header::IF_NONE_MATCH) == Some(&etag) {
                    let mut headers = HeaderMap::new();
                    headers.insert(header::ETAG, etag);
                    return (StatusCode::NOT_MODIFIED, headers, String::new());
                }
                let mut headers = json_headers();
                headers.insert(header::ETAG, etag);
                (StatusCode::OK, headers, ROWS_BODY.to_string())
            }
            _ => not_found,
        }
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers
}

#[async_trait]
impl Transport for FakeCouch {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        // drop the leading `/<database>`
        let path = request
            .url
            .path()
            .trim_start_matches('/')
            .split_once('/')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        let recorded = RecordedRequest {
            method: request.method,
            path,
            query: request.query,
            headers: request.headers,
        };
        let (status, headers, body) = self.respond(&recorded);
        Ok(TransportResponse::full(status, headers, body))
    }
}
