use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use cmdbpush_storage::Credentials;
use cmdbpush_sync::{PushConfig, PushPipeline};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cmdbpush-cli")]
#[command(about = "Push provider and service status data to the CMDB")]
struct Cli {
    /// CMDB read URL
    #[arg(long, value_name = "URL")]
    cmdb_read_endpoint: String,
    /// CMDB write URL
    #[arg(long, value_name = "URL")]
    cmdb_write_endpoint: String,
    /// CMDB username
    #[arg(long, value_name = "USERNAME")]
    cmdb_db_user: String,
    /// CMDB password
    #[arg(long, value_name = "PASSWORD")]
    cmdb_db_pass: String,
    /// Location of the CIP-like configuration file for the provider
    #[arg(long, value_name = "FILE")]
    provider_config_file: PathBuf,
    /// Provider natural key in the CMDB
    #[arg(long, value_name = "ID")]
    provider_id: Option<String>,
    /// YAML registry of services to probe, replacing the built-in set
    #[arg(long, value_name = "FILE")]
    services_file: Option<PathBuf>,
    #[arg(long, value_name = "SECS")]
    http_timeout_secs: Option<u64>,
    /// Print the bulk envelope instead of writing it
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn push_config(&self) -> Result<PushConfig> {
        let mut config = PushConfig::new(
            self.cmdb_read_endpoint.clone(),
            self.cmdb_write_endpoint.clone(),
            Credentials::new(self.cmdb_db_user.clone(), self.cmdb_db_pass.clone()),
            self.provider_config_file.clone(),
        );
        if let Some(provider_id) = &self.provider_id {
            config.provider_id = provider_id.clone();
        }
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        match &self.services_file {
            Some(path) => config.with_services_file(path),
            None => Ok(config),
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let pipeline = PushPipeline::new(cli.push_config()?)?;

    if cli.dry_run {
        let plan = pipeline.plan().await?;
        println!("{}", plan.envelope_json()?);
        eprintln!(
            "dry run: run_id={} documents={} skipped={}",
            plan.run_id,
            plan.records.len(),
            plan.skipped_services.len()
        );
        return Ok(());
    }

    let summary = pipeline.run_once().await?;
    println!(
        "push complete: run_id={} documents={} updated_services={} skipped={} bulk_failures={}",
        summary.run_id,
        summary.documents_submitted,
        summary.services_updated,
        summary.services_skipped,
        summary.bulk_failures
    );

    Ok(())
}
