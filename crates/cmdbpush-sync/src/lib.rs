//! Push pipeline: load provider, probe services, reconcile against the CMDB, bulk write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use cmdbpush_core::{BulkDocs, CmdbRecord, EntityKind, ExistingDocument, DEFAULT_PROVIDER_ID};
use cmdbpush_probes::{
    default_services, load_provider, load_service_registry, ProbeCollector, ProbeConfig,
    ServiceDefinition, ServiceProbe,
};
use cmdbpush_storage::{CmdbClient, Credentials, DocumentStore, HttpClientConfig};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

mod reconcile;

pub use reconcile::{assemble_batch, reconcile_provider, reconcile_service, ServiceIndex};

pub const CRATE_NAME: &str = "cmdbpush-sync";

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub read_endpoint: String,
    pub write_endpoint: String,
    pub credentials: Credentials,
    pub provider_config_file: PathBuf,
    pub provider_id: String,
    pub services: Vec<ServiceDefinition>,
    pub http_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Fixed UTC offset used for the probe timestamp drift log. The default of
    /// +1 approximates Europe/Madrid standard time and ignores summer time.
    pub reference_utc_offset_hours: i32,
    pub user_agent: String,
}

impl PushConfig {
    pub fn new(
        read_endpoint: impl Into<String>,
        write_endpoint: impl Into<String>,
        credentials: Credentials,
        provider_config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            read_endpoint: read_endpoint.into(),
            write_endpoint: write_endpoint.into(),
            credentials,
            provider_config_file: provider_config_file.into(),
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            services: default_services(),
            http_timeout_secs: 20,
            probe_timeout_secs: 60,
            reference_utc_offset_hours: 1, // CET, standard time only
            user_agent: format!("cmdbpush/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Replaces the built-in service set with the one listed in a registry file.
    pub fn with_services_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let registry = load_service_registry(path)
            .with_context(|| format!("loading service registry {}", path.display()))?;
        self.services = registry.services;
        Ok(self)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn probe_config(&self) -> Result<ProbeConfig> {
        let reference_offset = self
            .reference_utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .with_context(|| {
                format!(
                    "invalid reference UTC offset {}h",
                    self.reference_utc_offset_hours
                )
            })?;
        Ok(ProbeConfig {
            http: self.http_client_config(),
            command_timeout: Duration::from_secs(self.probe_timeout_secs),
            reference_offset,
        })
    }
}

/// Reconciled batch, ready to be written.
#[derive(Debug, Clone, Serialize)]
pub struct PushPlan {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub records: Vec<CmdbRecord>,
    pub provider_updated: bool,
    pub services_updated: usize,
    pub skipped_services: Vec<String>,
}

impl PushPlan {
    pub fn services_probed(&self) -> usize {
        self.records.len().saturating_sub(1)
    }

    /// The `_bulk_docs` body this plan would be written as.
    pub fn envelope_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&BulkDocs {
            docs: &self.records,
        })
        .context("serializing bulk envelope")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub provider_updated: bool,
    pub services_configured: usize,
    pub services_probed: usize,
    pub services_skipped: usize,
    pub services_updated: usize,
    pub documents_submitted: usize,
    pub bulk_failures: usize,
}

pub struct PushPipeline {
    config: PushConfig,
    store: Box<dyn DocumentStore>,
    probe: Box<dyn ServiceProbe>,
}

impl PushPipeline {
    pub fn new(config: PushConfig) -> Result<Self> {
        let store = CmdbClient::new(
            config.read_endpoint.clone(),
            config.write_endpoint.clone(),
            config.credentials.clone(),
            config.http_client_config(),
        )?;
        let probe = ProbeCollector::new(config.probe_config()?)?;
        Ok(Self::with_components(config, Box::new(store), Box::new(probe)))
    }

    pub fn with_components(
        config: PushConfig,
        store: Box<dyn DocumentStore>,
        probe: Box<dyn ServiceProbe>,
    ) -> Self {
        Self {
            config,
            store,
            probe,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Everything up to, but not including, the bulk write.
    pub async fn plan(&self) -> Result<PushPlan> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let path = &self.config.provider_config_file;
        let provider = load_provider(path)
            .inspect_err(|err| error!(error = %err, "cannot load provider configuration"))
            .with_context(|| format!("loading provider configuration {}", path.display()))?;

        let existing_providers = self.lookup(EntityKind::Provider).await;
        let provider = reconcile_provider(provider, &existing_providers);
        let provider_updated = provider.identity.is_some();

        let existing_services = self.lookup(EntityKind::Service).await;
        let index = ServiceIndex::build(&existing_services);

        let mut services = Vec::with_capacity(self.config.services.len());
        let mut skipped_services = Vec::new();
        for service in &self.config.services {
            match self.probe.collect(service).await {
                Ok(record) => services.push(reconcile_service(record, &index)),
                Err(err) => {
                    warn!(
                        endpoint = %service.endpoint,
                        error = %err,
                        "service probe failed; leaving it out of the batch"
                    );
                    skipped_services.push(service.endpoint.clone());
                }
            }
        }
        let services_updated = services.iter().filter(|s| s.identity.is_some()).count();

        Ok(PushPlan {
            run_id,
            started_at,
            records: assemble_batch(provider, services),
            provider_updated,
            services_updated,
            skipped_services,
        })
    }

    pub async fn run_once(&self) -> Result<PushRunSummary> {
        let plan = self.plan().await?;
        let ack = self
            .store
            .bulk_write(&plan.records)
            .await
            .context("bulk writing records to CMDB")?;
        let bulk_failures = ack.failures().count();
        if bulk_failures > 0 {
            warn!(
                run_id = %plan.run_id,
                bulk_failures,
                "CMDB did not accept every document"
            );
        }

        let summary = PushRunSummary {
            run_id: plan.run_id,
            started_at: plan.started_at,
            finished_at: Utc::now(),
            provider_updated: plan.provider_updated,
            services_configured: self.config.services.len(),
            services_probed: plan.services_probed(),
            services_skipped: plan.skipped_services.len(),
            services_updated: plan.services_updated,
            documents_submitted: plan.records.len(),
            bulk_failures,
        };
        info!(
            run_id = %summary.run_id,
            documents = summary.documents_submitted,
            skipped = summary.services_skipped,
            "push complete"
        );
        Ok(summary)
    }

    /// Lookup failures degrade to "nothing stored": records get inserted fresh.
    async fn lookup(&self, kind: EntityKind) -> Vec<ExistingDocument> {
        match self.store.fetch(kind, &self.config.provider_id).await {
            Ok(docs) => docs,
            Err(err) => {
                warn!(
                    %kind,
                    provider_id = %self.config.provider_id,
                    error = %err,
                    "CMDB lookup failed; treating as no existing documents"
                );
                Vec::new()
            }
        }
    }
}
