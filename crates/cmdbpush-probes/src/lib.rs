//! Local data sources: the static provider description and live service probes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use cmdbpush_core::{ProviderData, ProviderRecord, ServiceRecord};
use cmdbpush_storage::{build_http_client, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "cmdbpush-probes";

/// Layout of the `timestamp` field some probes self-report.
pub const PROBE_TIMESTAMP_FORMAT: &str = "%Y%m%d %H%M%S";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("requesting {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("spawning `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("probe output is not valid JSON: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    #[error("probe output is JSON but not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, Deserialize)]
struct ProviderConfigFile {
    site: SiteSection,
}

#[derive(Debug, Clone, Deserialize)]
struct SiteSection {
    name: String,
    country: String,
    country_code: String,
    roc: String,
    is_public: bool,
    #[serde(default)]
    owner_contacts: Vec<String>,
    #[serde(default)]
    owner_contacts_iam: Vec<String>,
}

impl From<SiteSection> for ProviderRecord {
    fn from(site: SiteSection) -> Self {
        ProviderRecord::new(
            site.owner_contacts_iam,
            ProviderData {
                name: site.name,
                country: site.country,
                country_code: site.country_code,
                roc: site.roc,
                is_public: site.is_public,
                owners: site.owner_contacts,
            },
        )
    }
}

pub fn parse_provider(path: &Path, text: &str) -> Result<ProviderRecord, SourceError> {
    let file: ProviderConfigFile =
        serde_yaml::from_str(text).map_err(|source| SourceError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.site.into())
}

/// Loads the provider description (without identity) from a site YAML file.
pub fn load_provider(path: impl AsRef<Path>) -> Result<ProviderRecord, SourceError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SourceError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_provider(path, &text)
}

/// Where a service's current status comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSource {
    Http(String),
    Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Natural key: the endpoint the service is filed under in the CMDB.
    pub endpoint: String,
    pub source: ProbeSource,
}

impl ServiceDefinition {
    pub fn http(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            source: ProbeSource::Http(url.into()),
        }
    }

    pub fn command(endpoint: impl Into<String>, cmdline: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            source: ProbeSource::Command(cmdline.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRegistry {
    pub services: Vec<ServiceDefinition>,
}

/// Services pushed for the PSNC site when no registry file is given.
pub fn default_services() -> Vec<ServiceDefinition> {
    vec![
        ServiceDefinition::http(
            "https://deep.eagle.man.poznan.pl",
            "https://deep.eagle.man.poznan.pl",
        ),
        ServiceDefinition::command(
            "https://qcg-deep.apps.paas-dev.psnc.pl/api",
            "/cip/bin/run-qcg.sh",
        ),
    ]
}

pub fn load_service_registry(path: impl AsRef<Path>) -> Result<ServiceRegistry, SourceError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SourceError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| SourceError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Fetches the current status of one service as an identity-less record.
    async fn collect(&self, service: &ServiceDefinition) -> Result<ServiceRecord, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub http: HttpClientConfig,
    pub command_timeout: Duration,
    /// Zone the probes stamp their `timestamp` field in. A fixed offset, so
    /// the default (+01:00, Europe/Madrid standard time) is an hour off while
    /// summer time is in effect; only the drift log is affected.
    pub reference_offset: FixedOffset,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            command_timeout: Duration::from_secs(60),
            // CET; no summer-time adjustment.
            reference_offset: FixedOffset::east_opt(3600).unwrap_or_else(|| Utc.fix()),
        }
    }
}

#[derive(Debug)]
pub struct ProbeCollector {
    client: reqwest::Client,
    command_timeout: Duration,
    reference_offset: FixedOffset,
}

impl ProbeCollector {
    pub fn new(config: ProbeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(&config.http)?,
            command_timeout: config.command_timeout,
            reference_offset: config.reference_offset,
        })
    }

    async fn probe_http(&self, url: &str) -> Result<JsonMap<String, JsonValue>, ProbeError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ProbeError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await.map_err(|source| ProbeError::Http {
            url: url.to_string(),
            source,
        })?;
        parse_probe_output(&body)
    }

    async fn probe_command(
        &self,
        cmdline: &str,
    ) -> Result<JsonMap<String, JsonValue>, ProbeError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmdline)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                command: cmdline.to_string(),
                source,
            })?;

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout {
                command: cmdline.to_string(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| ProbeError::Spawn {
                command: cmdline.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::CommandStatus {
                command: cmdline.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_probe_output(&output.stdout)
    }

    fn log_timestamp_drift(&self, record: &ServiceRecord) {
        let Some(reported) = record.data.get("timestamp").and_then(JsonValue::as_str) else {
            return;
        };
        let now = Utc::now().with_timezone(&self.reference_offset);
        match timestamp_drift(reported, now) {
            Some(drift) => info!(
                endpoint = %record.natural_key,
                total_seconds = drift.num_seconds(),
                "total seconds difference since probe timestamp"
            ),
            None => debug!(
                endpoint = %record.natural_key,
                reported,
                "probe timestamp not in expected format"
            ),
        }
    }
}

#[async_trait]
impl ServiceProbe for ProbeCollector {
    async fn collect(&self, service: &ServiceDefinition) -> Result<ServiceRecord, ProbeError> {
        let span = info_span!("service_probe", endpoint = %service.endpoint);
        async {
            let data = match &service.source {
                ProbeSource::Http(url) => self.probe_http(url).await?,
                ProbeSource::Command(cmdline) => self.probe_command(cmdline).await?,
            };
            // A command line is not an address; those fall back to the natural key.
            let fallback = match &service.source {
                ProbeSource::Http(url) => url.clone(),
                ProbeSource::Command(_) => service.endpoint.clone(),
            };
            if !data.contains_key("endpoint") {
                debug!(%fallback, "probe did not report its endpoint; injecting fallback");
            }
            let record =
                ServiceRecord::with_fallback_endpoint(service.endpoint.clone(), data, fallback);
            self.log_timestamp_drift(&record);
            Ok::<_, ProbeError>(record)
        }
        .instrument(span)
        .await
    }
}

/// Probe output must be a JSON object.
pub fn parse_probe_output(bytes: &[u8]) -> Result<JsonMap<String, JsonValue>, ProbeError> {
    match serde_json::from_slice::<JsonValue>(bytes)? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(ProbeError::NotAnObject),
    }
}

/// Time elapsed between a probe-reported timestamp and `now`, both read as
/// wall-clock time in `now`'s zone.
pub fn timestamp_drift(reported: &str, now: DateTime<FixedOffset>) -> Option<chrono::Duration> {
    let reported = NaiveDateTime::parse_from_str(reported, PROBE_TIMESTAMP_FORMAT).ok()?;
    Some(now.naive_local() - reported)
}
