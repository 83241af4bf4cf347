use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use s3_filestore::{
    Filestore, FilestoreConfig,
    config::ConfigArgs,
    models::{AclState, ObjectKey},
    services::{FileUpload, JobWorker},
};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "s3-filestore", version, about = "S3 storage access layer for CKAN")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration and check bucket access
    CheckConfig,
    /// Print the download URL for an object key
    Resolve { key: String },
    /// Print the download URL for a resource file
    ResolveResource { resource_id: String, filename: String },
    /// Bring every uploaded file of a dataset in line with its privacy flag
    UpdateVisibility {
        package_id: String,
        /// Target ACL instead of the one the dataset's privacy flag implies
        #[arg(long)]
        acl: Option<AclState>,
    },
    /// Upload a local file as a new version of a resource
    UploadResource {
        resource_id: String,
        path: PathBuf,
        #[arg(long)]
        package_id: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Process queued visibility jobs until interrupted
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = FilestoreConfig::from_env_and_args(&cli.config)?;
    tracing::debug!("Loaded configuration: {:?}", cfg);

    let filestore = Filestore::connect(cfg).await?;
    filestore.check_access().await?;

    match cli.command {
        Command::CheckConfig => {
            let cfg = &filestore.config;
            println!("bucket:          {}", cfg.store.bucket);
            println!("region:          {}", cfg.store.region);
            println!("path style:      {}", cfg.store.path_style);
            println!("acl:             {}", cfg.acl);
            println!("non-current acl: {}", cfg.non_current_acl);
            println!("cache window:    {}s", cfg.cache_window.as_secs());
            println!("async updates:   {}", cfg.capabilities.async_visibility_update);
        }
        Command::Resolve { key } => {
            let key = ObjectKey::new(key)?;
            println!("{}", filestore.resolver.resolve(&key).await?);
        }
        Command::ResolveResource {
            resource_id,
            filename,
        } => {
            let key = filestore
                .propagator
                .paths()
                .resource_key(&resource_id, &filename)?;
            println!("{}", filestore.resolver.resolve(&key).await?);
        }
        Command::UpdateVisibility { package_id, acl } => {
            let report = filestore
                .propagator
                .update_visibility(&package_id, acl)
                .await?;
            tracing::info!("Visibility update of {} finished: {:?}", package_id, report);
            if !report.is_clean() {
                bail!("{} objects could not be updated", report.failed);
            }
        }
        Command::UploadResource {
            resource_id,
            path,
            package_id,
            content_type,
        } => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("{} has no usable file name", path.display()))?
                .to_string();
            let body = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let outcome = filestore
                .uploader
                .upload_resource(
                    &resource_id,
                    package_id.as_deref(),
                    FileUpload {
                        filename,
                        body: body.into(),
                        content_type,
                        ..FileUpload::default()
                    },
                )
                .await?;
            println!("{} {} {}", outcome.key, outcome.etag, outcome.acl);
        }
        Command::Worker => {
            let Some(queue) = filestore.queue.clone() else {
                bail!("the worker needs S3FILESTORE_REDIS_URL");
            };
            let worker = JobWorker::new(
                Arc::new(queue),
                filestore.propagator.clone(),
                filestore.config.queue.job_ttl,
            );
            worker
                .run(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", err);
                    }
                })
                .await;
        }
    }

    Ok(())
}
