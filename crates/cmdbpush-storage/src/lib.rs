//! CMDB document store client: natural-key lookups + `_bulk_docs` writes.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cmdbpush_core::{BulkDocs, CmdbRecord, EntityKind, ExistingDocument};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cmdbpush-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable at {url}: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding store response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding bulk payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bulk write to {url} failed: {source}")]
    WriteFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("bulk write to {url} rejected with http status {status}")]
    WriteRejected { status: u16, url: String },
}

/// Per-document entry of a `_bulk_docs` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocOutcome {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkDocOutcome {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteAck {
    pub status: u16,
    /// Empty when the store did not answer with the usual per-document array.
    pub outcomes: Vec<BulkDocOutcome>,
}

impl BulkWriteAck {
    pub fn failures(&self) -> impl Iterator<Item = &BulkDocOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

/// Read + bulk-write surface the reconciliation pipeline needs from the CMDB.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All documents of `kind` filed under `natural_key`. Store-reported
    /// application errors come back as an empty list.
    async fn fetch(
        &self,
        kind: EntityKind,
        natural_key: &str,
    ) -> Result<Vec<ExistingDocument>, StoreError>;

    async fn bulk_write(&self, records: &[CmdbRecord]) -> Result<BulkWriteAck, StoreError>;
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Relative query path for the documents of `kind` under `natural_key`.
pub fn lookup_path(kind: EntityKind, natural_key: &str) -> String {
    match kind {
        EntityKind::Provider => format!("provider/id/{natural_key}?include_docs=true"),
        EntityKind::Service => {
            format!("service/filters/provider_id/{natural_key}?include_docs=true")
        }
    }
}

fn join_url(base: &str, relative: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Turns a read response into documents.
///
/// Accepts either `{"rows": [{"doc": ...}, ...]}` or a bare document. Any
/// top-level `error` key means "nothing stored". Rows that do not decode into
/// a document are skipped.
pub fn decode_read_response(body: &JsonValue) -> Vec<ExistingDocument> {
    let Some(object) = body.as_object() else {
        debug!("store returned a non-object body; treating as empty");
        return Vec::new();
    };

    if object.contains_key("error") {
        debug!(response = %body, "got CMDB error in read response");
        return Vec::new();
    }

    let Some(rows) = object.get("rows") else {
        return match serde_json::from_value::<ExistingDocument>(body.clone()) {
            Ok(doc) => vec![doc],
            Err(err) => {
                warn!(error = %err, "singleton store response is not a document");
                Vec::new()
            }
        };
    };

    rows.as_array()
        .map(|rows| rows.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(|row| row.get("doc").filter(|doc| !doc.is_null()))
        .filter_map(|doc| match serde_json::from_value::<ExistingDocument>(doc.clone()) {
            Ok(doc) => Some(doc),
            Err(err) => {
                warn!(error = %err, "skipping undecodable store row");
                None
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct CmdbClient {
    client: reqwest::Client,
    read_base: String,
    write_base: String,
    credentials: Credentials,
}

impl CmdbClient {
    pub fn new(
        read_base: impl Into<String>,
        write_base: impl Into<String>,
        credentials: Credentials,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(&config)?,
            read_base: read_base.into(),
            write_base: write_base.into(),
            credentials,
        })
    }

    pub fn read_url(&self, kind: EntityKind, natural_key: &str) -> String {
        join_url(&self.read_base, &lookup_path(kind, natural_key))
    }

    pub fn bulk_docs_url(&self) -> String {
        join_url(&self.write_base, "_bulk_docs")
    }

    async fn get_documents(&self, url: String) -> Result<Vec<ExistingDocument>, StoreError> {
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| StoreError::Unavailable {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|source| StoreError::Unavailable {
            url: url.clone(),
            source,
        })?;
        debug!(%status, body = %text, "CMDB read response");

        // CouchDB answers a missing key with 404 + {"error": "not_found"}.
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body: JsonValue =
            serde_json::from_str(&text).map_err(|source| StoreError::Decode { url, source })?;
        Ok(decode_read_response(&body))
    }

    async fn post_bulk(&self, records: &[CmdbRecord]) -> Result<BulkWriteAck, StoreError> {
        let url = self.bulk_docs_url();
        let payload = serde_json::to_vec(&BulkDocs { docs: records })?;
        debug!(%url, documents = records.len(), "bulk posting to CMDB");

        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .body(payload)
            .send()
            .await
            .map_err(|source| StoreError::WriteFailed {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|source| StoreError::WriteFailed {
            url: url.clone(),
            source,
        })?;
        debug!(%status, body = %text, "result/s of bulk post");

        if !status.is_success() {
            return Err(StoreError::WriteRejected {
                status: status.as_u16(),
                url,
            });
        }

        let outcomes: Vec<BulkDocOutcome> = match serde_json::from_str(&text) {
            Ok(outcomes) => outcomes,
            Err(err) => {
                debug!(error = %err, "bulk response is not a per-document array");
                Vec::new()
            }
        };
        for failed in outcomes.iter().filter(|o| o.is_failure()) {
            warn!(
                id = failed.id.as_deref().unwrap_or("<new>"),
                error = failed.error.as_deref().unwrap_or_default(),
                reason = failed.reason.as_deref().unwrap_or_default(),
                "CMDB rejected document in bulk write"
            );
        }

        Ok(BulkWriteAck {
            status: status.as_u16(),
            outcomes,
        })
    }
}

#[async_trait]
impl DocumentStore for CmdbClient {
    async fn fetch(
        &self,
        kind: EntityKind,
        natural_key: &str,
    ) -> Result<Vec<ExistingDocument>, StoreError> {
        let url = self.read_url(kind, natural_key);
        let span = info_span!("cmdb_fetch", %kind, natural_key, %url);
        self.get_documents(url).instrument(span).await
    }

    async fn bulk_write(&self, records: &[CmdbRecord]) -> Result<BulkWriteAck, StoreError> {
        let span = info_span!("cmdb_bulk_write", documents = records.len());
        self.post_bulk(records).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdbpush_core::{DocIdentity, ServiceRecord};
    use serde_json::json;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CmdbClient {
        CmdbClient::new(
            format!("{}/read/", server.uri()),
            format!("{}/write", server.uri()),
            Credentials::new("pusher", "s3cret"),
            HttpClientConfig::default(),
        )
        .expect("client")
    }

    #[test]
    fn lookup_paths_follow_cmdb_views() {
        assert_eq!(
            lookup_path(EntityKind::Provider, "PSNC"),
            "provider/id/PSNC?include_docs=true"
        );
        assert_eq!(
            lookup_path(EntityKind::Service, "PSNC"),
            "service/filters/provider_id/PSNC?include_docs=true"
        );
    }

    #[test]
    fn decode_skips_rows_without_doc() {
        let body = json!({
            "rows": [
                {"doc": {"_id": "s1", "_rev": "1-a", "data": {"endpoint": "https://svc/a"}}},
                {"id": "orphan"},
                {"doc": null},
                {"doc": {"_id": "s2", "_rev": "3-c"}}
            ]
        });
        let docs = decode_read_response(&body);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].endpoint(), Some("https://svc/a"));
        assert_eq!(docs[1].doc_id, "s2");
    }

    #[test]
    fn decode_treats_error_key_as_empty() {
        let body = json!({"error": "not_found", "reason": "missing"});
        assert!(decode_read_response(&body).is_empty());
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("pusher", "s3cret"));
        assert!(rendered.contains("pusher"));
        assert!(!rendered.contains("s3cret"));
    }

    #[tokio::test]
    async fn fetch_returns_rows_in_store_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read/service/filters/provider_id/PSNC"))
            .and(query_param("include_docs", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_rows": 2,
                "rows": [
                    {"doc": {"_id": "s1", "_rev": "2-abc", "type": "service", "data": {"endpoint": "https://svc/a"}}},
                    {"doc": {"_id": "s2", "_rev": "1-def", "type": "service", "data": {"endpoint": "https://svc/b"}}}
                ]
            })))
            .mount(&server)
            .await;

        let docs = client_for(&server)
            .fetch(EntityKind::Service, "PSNC")
            .await
            .expect("fetch");
        let ids: Vec<_> = docs.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(docs[0].kind.as_deref(), Some("service"));
    }

    #[tokio::test]
    async fn fetch_wraps_singleton_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read/provider/id/PSNC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_id": "p1", "_rev": "5-aaa", "type": "provider", "data": {"name": "PSNC"}
            })))
            .mount(&server)
            .await;

        let docs = client_for(&server)
            .fetch(EntityKind::Provider, "PSNC")
            .await
            .expect("fetch");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].identity(), DocIdentity::new("p1", "5-aaa"));
    }

    #[tokio::test]
    async fn fetch_treats_store_errors_and_missing_keys_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read/provider/id/PSNC"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "query_parse_error"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/read/service/filters/provider_id/PSNC"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "not_found"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.fetch(EntityKind::Provider, "PSNC").await.unwrap().is_empty());
        assert!(client.fetch(EntityKind::Service, "PSNC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_surfaces_server_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch(EntityKind::Provider, "PSNC")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn fetch_reports_unreachable_store() {
        let client = CmdbClient::new(
            "http://127.0.0.1:1",
            "http://127.0.0.1:1",
            Credentials::new("u", "p"),
            HttpClientConfig::default(),
        )
        .unwrap();
        let err = client.fetch(EntityKind::Provider, "PSNC").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn bulk_write_posts_envelope_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write/_bulk_docs"))
            .and(header("content-type", "application/json"))
            .and(basic_auth("pusher", "s3cret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"ok": true, "id": "s1", "rev": "3-new"},
                {"id": "s9", "error": "conflict", "reason": "Document update conflict."}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let mut service = ServiceRecord::new("https://svc/a", Default::default());
        service.identity = Some(DocIdentity::new("s1", "2-abc"));
        let records = vec![CmdbRecord::from(service)];

        let ack = client_for(&server).bulk_write(&records).await.expect("write");
        assert_eq!(ack.status, 201);
        assert_eq!(ack.outcomes.len(), 2);
        assert_eq!(ack.failures().count(), 1);

        let received = server.received_requests().await.expect("recording enabled");
        let body: JsonValue = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["docs"][0]["_id"], "s1");
        assert_eq!(body["docs"][0]["_rev"], "2-abc");
        assert_eq!(body["docs"][0]["type"], "service");
        assert_eq!(body["docs"][0]["data"]["endpoint"], "https://svc/a");
    }

    #[tokio::test]
    async fn bulk_write_tolerates_unexpected_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_string("accepted"))
            .mount(&server)
            .await;

        let ack = client_for(&server).bulk_write(&[]).await.expect("write");
        assert!(ack.outcomes.is_empty());
    }

    #[tokio::test]
    async fn bulk_write_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write/_bulk_docs"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unauthorized"})))
            .mount(&server)
            .await;

        let err = client_for(&server).bulk_write(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { status: 401, .. }));
    }
}
