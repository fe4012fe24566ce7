//! Natural-key matching of fresh records against existing CMDB documents.
//!
//! A record that leaves here with an identity is written as an update of that
//! document. One without is written as a new document. Identities are only
//! ever copied from documents sharing the record's natural key.

use std::collections::HashMap;

use cmdbpush_core::{CmdbRecord, DocIdentity, ExistingDocument, ProviderRecord, ServiceRecord};
use tracing::{info, warn};

/// Attaches the identity of the first existing provider document, if any.
pub fn reconcile_provider(
    mut record: ProviderRecord,
    existing: &[ExistingDocument],
) -> ProviderRecord {
    if let Some(doc) = existing.first() {
        info!(
            provider = %record.data.name,
            revision = %doc.revision,
            "provider already in CMDB"
        );
        record.identity = Some(doc.identity());
    }
    record
}

/// Existing service documents keyed by `data.endpoint`.
///
/// Built once per run. When several documents share an endpoint the one
/// returned last by the store wins.
#[derive(Debug, Clone, Default)]
pub struct ServiceIndex {
    by_endpoint: HashMap<String, DocIdentity>,
}

impl ServiceIndex {
    pub fn build(existing: &[ExistingDocument]) -> Self {
        let mut by_endpoint = HashMap::new();
        for doc in existing {
            let Some(endpoint) = doc.endpoint() else {
                continue;
            };
            if let Some(previous) = by_endpoint.insert(endpoint.to_string(), doc.identity()) {
                warn!(
                    endpoint,
                    dropped = %previous.doc_id,
                    kept = %doc.doc_id,
                    "multiple CMDB documents share one service endpoint"
                );
            }
        }
        Self { by_endpoint }
    }

    pub fn identity_for(&self, natural_key: &str) -> Option<&DocIdentity> {
        self.by_endpoint.get(natural_key)
    }

    pub fn len(&self) -> usize {
        self.by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_endpoint.is_empty()
    }
}

pub fn reconcile_service(mut record: ServiceRecord, index: &ServiceIndex) -> ServiceRecord {
    if let Some(identity) = index.identity_for(&record.natural_key) {
        info!(
            service = %record.natural_key,
            revision = %identity.revision,
            "revision for service already in CMDB"
        );
        record.identity = Some(identity.clone());
    }
    record
}

/// Provider first, then services in configured order.
pub fn assemble_batch(provider: ProviderRecord, services: Vec<ServiceRecord>) -> Vec<CmdbRecord> {
    std::iter::once(CmdbRecord::from(provider))
        .chain(services.into_iter().map(CmdbRecord::from))
        .collect()
}
