//! Core record model for pushing provider and service metadata into the CMDB.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "cmdbpush-core";

/// Provider natural key used when none is configured.
pub const DEFAULT_PROVIDER_ID: &str = "PSNC";

/// Document id + revision token the store needs to accept an update instead of an insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocIdentity {
    #[serde(rename = "_id")]
    pub doc_id: String,
    #[serde(rename = "_rev")]
    pub revision: String,
}

impl DocIdentity {
    pub fn new(doc_id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision: revision.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Provider,
    Service,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderData {
    pub name: String,
    pub country: String,
    pub country_code: String,
    pub roc: String,
    pub is_public: bool,
    pub owners: Vec<String>,
}

/// Site/provider description as pushed to the CMDB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub owners: Vec<String>,
    pub data: ProviderData,
    #[serde(flatten)]
    pub identity: Option<DocIdentity>,
}

impl ProviderRecord {
    pub fn new(owners: Vec<String>, data: ProviderData) -> Self {
        Self {
            owners,
            data,
            identity: None,
        }
    }
}

/// Status of one configured service as reported by its probe.
///
/// `natural_key` is the configured service endpoint. It only drives matching
/// against existing documents and never reaches the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(skip)]
    pub natural_key: String,
    pub data: JsonMap<String, JsonValue>,
    #[serde(flatten)]
    pub identity: Option<DocIdentity>,
}

impl ServiceRecord {
    /// Builds a record from probe output, using the natural key as `endpoint`
    /// when the probe did not report its own address.
    pub fn new(natural_key: impl Into<String>, data: JsonMap<String, JsonValue>) -> Self {
        let natural_key = natural_key.into();
        let fallback = natural_key.clone();
        Self::with_fallback_endpoint(natural_key, data, fallback)
    }

    /// Like [`ServiceRecord::new`], but injects `fallback_endpoint` (typically
    /// the address the status was fetched from) when `endpoint` is missing.
    pub fn with_fallback_endpoint(
        natural_key: impl Into<String>,
        mut data: JsonMap<String, JsonValue>,
        fallback_endpoint: impl Into<String>,
    ) -> Self {
        let natural_key = natural_key.into();
        if !data.contains_key("endpoint") {
            data.insert(
                "endpoint".to_string(),
                JsonValue::String(fallback_endpoint.into()),
            );
        }
        Self {
            natural_key,
            data,
            identity: None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.data.get("endpoint").and_then(JsonValue::as_str)
    }
}

/// A record ready for the bulk-write envelope, tagged with its CMDB `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CmdbRecord {
    Provider(ProviderRecord),
    Service(ServiceRecord),
}

impl CmdbRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Provider(_) => EntityKind::Provider,
            Self::Service(_) => EntityKind::Service,
        }
    }

    pub fn identity(&self) -> Option<&DocIdentity> {
        match self {
            Self::Provider(record) => record.identity.as_ref(),
            Self::Service(record) => record.identity.as_ref(),
        }
    }
}

impl From<ProviderRecord> for CmdbRecord {
    fn from(record: ProviderRecord) -> Self {
        Self::Provider(record)
    }
}

impl From<ServiceRecord> for CmdbRecord {
    fn from(record: ServiceRecord) -> Self {
        Self::Service(record)
    }
}

/// Last persisted state of a document, as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingDocument {
    #[serde(rename = "_id")]
    pub doc_id: String,
    #[serde(rename = "_rev")]
    pub revision: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

impl ExistingDocument {
    pub fn identity(&self) -> DocIdentity {
        DocIdentity::new(self.doc_id.clone(), self.revision.clone())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.data.get("endpoint").and_then(JsonValue::as_str)
    }
}

/// CouchDB `_bulk_docs` request body.
#[derive(Debug, Clone, Serialize)]
pub struct BulkDocs<'a> {
    pub docs: &'a [CmdbRecord],
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn psnc_provider() -> ProviderRecord {
        ProviderRecord::new(
            vec!["iam:alice".into()],
            ProviderData {
                name: "PSNC".into(),
                country: "Poland".into(),
                country_code: "PL".into(),
                roc: "NGI_PL".into(),
                is_public: true,
                owners: vec!["alice@psnc.pl".into()],
            },
        )
    }

    #[test]
    fn provider_without_identity_serializes_as_insert() {
        let value = serde_json::to_value(CmdbRecord::from(psnc_provider())).unwrap();
        assert_eq!(value["type"], "provider");
        assert_eq!(value["data"]["country_code"], "PL");
        assert_eq!(value["owners"], json!(["iam:alice"]));
        assert!(value.get("_id").is_none());
        assert!(value.get("_rev").is_none());
    }

    #[test]
    fn identity_is_flattened_into_couch_fields() {
        let mut provider = psnc_provider();
        provider.identity = Some(DocIdentity::new("p1", "7-xyz"));
        let value = serde_json::to_value(CmdbRecord::from(provider)).unwrap();
        assert_eq!(value["_id"], "p1");
        assert_eq!(value["_rev"], "7-xyz");
    }

    #[test]
    fn service_record_injects_missing_endpoint() {
        let data = json!({"status": "ok"}).as_object().cloned().unwrap();
        let record = ServiceRecord::new("https://svc/a", data);
        assert_eq!(record.endpoint(), Some("https://svc/a"));
    }

    #[test]
    fn fallback_endpoint_only_fills_a_missing_field() {
        let data = json!({"status": "ok"}).as_object().cloned().unwrap();
        let record =
            ServiceRecord::with_fallback_endpoint("https://svc/key", data, "https://svc/status");
        assert_eq!(record.natural_key, "https://svc/key");
        assert_eq!(record.endpoint(), Some("https://svc/status"));

        let data = json!({"endpoint": "https://svc/self"}).as_object().cloned().unwrap();
        let record =
            ServiceRecord::with_fallback_endpoint("https://svc/key", data, "https://svc/status");
        assert_eq!(record.endpoint(), Some("https://svc/self"));
    }

    #[test]
    fn service_record_keeps_reported_endpoint_and_hides_natural_key() {
        let data = json!({"endpoint": "https://svc/reported"})
            .as_object()
            .cloned()
            .unwrap();
        let record = ServiceRecord::new("https://svc/a", data);
        assert_eq!(record.endpoint(), Some("https://svc/reported"));

        let value = serde_json::to_value(CmdbRecord::from(record)).unwrap();
        assert_eq!(value["type"], "service");
        assert!(value.get("natural_key").is_none());
    }

    #[test]
    fn existing_document_tolerates_missing_data() {
        let doc: ExistingDocument =
            serde_json::from_value(json!({"_id": "s1", "_rev": "2-abc"})).unwrap();
        assert_eq!(doc.identity(), DocIdentity::new("s1", "2-abc"));
        assert_eq!(doc.endpoint(), None);
        assert_eq!(doc.kind, None);
    }

    #[test]
    fn bulk_envelope_wraps_docs() {
        let records = vec![CmdbRecord::from(psnc_provider())];
        let value = serde_json::to_value(BulkDocs { docs: &records }).unwrap();
        assert_eq!(value["docs"].as_array().map(Vec::len), Some(1));
    }
}
