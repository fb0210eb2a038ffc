//! Installing the client's design document and pruning older versions of it.

use reqwest::{Method, header::HeaderMap};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{CallOptions, Client, Error, Result, design::DESIGN_PREFIX};

/// A design document present on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDesignDoc {
    /// Full id, `_design/<name>`
    pub id: String,
    /// Current revision, required to delete it
    pub rev: String,
}

#[derive(Debug, Deserialize)]
struct AllDocs {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    value: AllDocsValue,
}

#[derive(Debug, Deserialize)]
struct AllDocsValue {
    rev: String,
}

impl Client {
    /// Install the current design document and delete every other design document
    ///
    /// A conflict on the install means the same version is already present, possibly
    /// installed concurrently by another client, and counts as success. Stale documents are
    /// deleted one at a time; the first failed delete ends the operation with that error,
    /// leaving the current version installed.
    pub async fn install(&self, options: &CallOptions) -> Result<()> {
        let id = self.fingerprint().design_id();
        info!(design_doc = %id, "installing design document");

        let body = serde_json::to_value(self.design()).map_err(Error::Design)?;
        match self
            .execute(options, Method::PUT, &id, vec![], HeaderMap::new(), Some(body))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(design_doc = %id, "design document already installed");
            }
            Err(e) => return Err(e),
        }

        for stale in self
            .installed_design_docs(options)
            .await?
            .into_iter()
            .filter(|doc| doc.id != id)
        {
            info!(design_doc = %stale.id, rev = %stale.rev, "deleting stale design document");
            self.execute(
                options,
                Method::DELETE,
                &document_path(&stale.id),
                vec![("rev".to_string(), stale.rev)],
                HeaderMap::new(),
                None,
            )
            .await?;
        }

        info!(design_doc = %id, "design document installed");
        Ok(())
    }

    /// List the design documents in the database
    pub async fn installed_design_docs(
        &self,
        options: &CallOptions,
    ) -> Result<Vec<InstalledDesignDoc>> {
        let query = vec![
            ("startkey".to_string(), format!("\"{DESIGN_PREFIX}\"")),
            ("endkey".to_string(), format!("\"{DESIGN_PREFIX}~\"")),
        ];
        let resp = self
            .execute(options, Method::GET, "_all_docs", query, HeaderMap::new(), None)
            .await?;
        let bytes = resp.bytes().await?;
        let all: AllDocs = serde_json::from_slice(&bytes).map_err(Error::Json)?;
        Ok(all
            .rows
            .into_iter()
            .filter(|row| row.id.starts_with(DESIGN_PREFIX))
            .map(|row| InstalledDesignDoc {
                id: row.id,
                rev: row.value.rev,
            })
            .collect())
    }
}

/// Path of a design document below the database, with the name after `_design/` escaped
fn document_path(id: &str) -> String {
    match id.strip_prefix(DESIGN_PREFIX) {
        Some(name) => format!("{DESIGN_PREFIX}{}", urlencoding::encode(name)),
        None => urlencoding::encode(id).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::{DesignDocument, ViewDefinition, test_util::FakeCouch};

    fn design() -> DesignDocument {
        DesignDocument::new().with_view(
            "by_name",
            ViewDefinition::new("function(doc) { emit(doc.name, null); }"),
        )
    }

    fn client(url: &str) -> Client {
        Client::builder(format!("{url}/{{database}}"), design())
            .placeholder("database", "people")
            .build()
            .expect("build client")
    }

    fn all_docs_matcher() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("startkey".into(), "\"_design/\"".into()),
            Matcher::UrlEncoded("endkey".into(), "\"_design/~\"".into()),
        ])
    }

    #[tokio::test]
    async fn install_puts_document_and_prunes_stale_versions() {
        let mut mock_server = Server::new_async().await;
        let client = client(&mock_server.url());
        let id = client.fingerprint().design_id();

        let put = mock_server
            .mock("PUT", format!("/people/{id}").as_str())
            .match_body(Matcher::Json(json!({
                "language": "javascript",
                "views": {"by_name": {"map": "function(doc) { emit(doc.name, null); }"}},
            })))
            .with_status(201)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;
        let list = mock_server
            .mock("GET", "/people/_all_docs")
            .match_query(all_docs_matcher())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "total_rows": 3,
                    "offset": 0,
                    "rows": [
                        {"id": "_design/0ld", "key": "_design/0ld", "value": {"rev": "3-a"}},
                        {"id": id, "key": id, "value": {"rev": "1-b"}},
                        {"id": "_design/zzz", "key": "_design/zzz", "value": {"rev": "7-c"}},
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let delete_old = mock_server
            .mock("DELETE", "/people/_design/0ld")
            .match_query(Matcher::UrlEncoded("rev".into(), "3-a".into()))
            .with_status(200)
            .create_async()
            .await;
        let delete_zzz = mock_server
            .mock("DELETE", "/people/_design/zzz")
            .match_query(Matcher::UrlEncoded("rev".into(), "7-c".into()))
            .with_status(200)
            .create_async()
            .await;
        let delete_current = mock_server
            .mock("DELETE", format!("/people/{id}").as_str())
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        client
            .install(&CallOptions::new())
            .await
            .expect("install design document");

        put.assert_async().await;
        list.assert_async().await;
        delete_old.assert_async().await;
        delete_zzz.assert_async().await;
        delete_current.assert_async().await;
    }

    #[test]
    fn design_document_names_are_escaped() {
        assert_eq!(document_path("_design/abc123"), "_design/abc123");
        assert_eq!(document_path("_design/a?b#c"), "_design/a%3Fb%23c");
        assert_eq!(document_path("_design/a/b"), "_design/a%2Fb");
    }

    #[tokio::test]
    async fn stale_ids_are_escaped_when_deleted() {
        let mut mock_server = Server::new_async().await;
        let client = client(&mock_server.url());
        let id = client.fingerprint().design_id();

        mock_server
            .mock("PUT", format!("/people/{id}").as_str())
            .with_status(201)
            .create_async()
            .await;
        mock_server
            .mock("GET", "/people/_all_docs")
            .match_query(all_docs_matcher())
            .with_status(200)
            .with_body(
                json!({"rows": [
                    {"id": "_design/odd?name#x", "key": "_design/odd?name#x", "value": {"rev": "2-d"}},
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let delete = mock_server
            .mock("DELETE", "/people/_design/odd%3Fname%23x")
            .match_query(Matcher::UrlEncoded("rev".into(), "2-d".into()))
            .with_status(200)
            .create_async()
            .await;

        client
            .install(&CallOptions::new())
            .await
            .expect("install design document");
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn install_conflict_is_success() {
        let mut mock_server = Server::new_async().await;
        let client = client(&mock_server.url());
        let id = client.fingerprint().design_id();

        let put = mock_server
            .mock("PUT", format!("/people/{id}").as_str())
            .with_status(409)
            .with_body(r#"{"error":"conflict","reason":"Document update conflict."}"#)
            .create_async()
            .await;
        let list = mock_server
            .mock("GET", "/people/_all_docs")
            .match_query(all_docs_matcher())
            .with_status(200)
            .with_body(
                json!({"rows": [{"id": id, "key": id, "value": {"rev": "1-b"}}]}).to_string(),
            )
            .create_async()
            .await;

        client.install(&CallOptions::new()).await.expect("conflict is success");

        put.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn install_failure_skips_pruning() {
        let mut mock_server = Server::new_async().await;
        let client = client(&mock_server.url());
        let id = client.fingerprint().design_id();

        let put = mock_server
            .mock("PUT", format!("/people/{id}").as_str())
            .with_status(403)
            .with_body(r#"{"error":"forbidden"}"#)
            .create_async()
            .await;
        let list = mock_server
            .mock("GET", "/people/_all_docs")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = client.install(&CallOptions::new()).await.unwrap_err();
        assert!(
            matches!(err, Error::ApiError { code, .. } if code == StatusCode::FORBIDDEN),
            "unexpected error: {err}"
        );

        put.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn failed_delete_stops_pruning() {
        let fake = Arc::new(FakeCouch::new());
        fake.insert_design_doc("_design/a", "1-a");
        fake.insert_design_doc("_design/b", "1-b");
        fake.fail_deletes_of("_design/a");

        let client = Client::builder("http://couch.test/{database}", design())
            .placeholder("database", "people")
            .transport(Arc::clone(&fake) as _)
            .build()
            .unwrap();

        let err = client.install(&CallOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::ApiError { .. }), "unexpected error: {err}");

        // the current version stays installed, `_design/b` was never attempted
        let mut expected = vec![
            "_design/a".to_string(),
            "_design/b".to_string(),
            client.fingerprint().design_id(),
        ];
        expected.sort();
        assert_eq!(fake.design_doc_ids(), expected);
        assert_eq!(fake.count("DELETE"), 1);
    }

    #[tokio::test]
    async fn concurrent_installs_of_the_same_version_both_succeed() {
        let fake = Arc::new(FakeCouch::new());
        let client = Client::builder("http://couch.test/{database}", design())
            .placeholder("database", "people")
            .transport(Arc::clone(&fake) as _)
            .build()
            .unwrap();
        let other = client.clone();

        let options = CallOptions::new();
        let (a, b) = tokio::join!(client.install(&options), other.install(&options));
        a.expect("first install");
        b.expect("second install");

        assert_eq!(fake.count("PUT"), 2);
        assert_eq!(fake.design_doc_ids(), vec![client.fingerprint().design_id()]);
    }
}
