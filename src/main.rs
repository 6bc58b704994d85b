use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ocibake::error::{with_retry, RetryConfig};
use ocibake::layer::{CancelFlag, ReqwestTransport};
use ocibake::oci::{ImageReference, OciLayoutWriter, Platform, Registry, RegistryAuth, RegistryClient};
use ocibake::{logging, pipeline, BakeError, BuildContext, ImageSpec};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[clap(long, global = true, help = "Emit logs as JSON")]
    log_json: bool,

    #[clap(long, env = "OCIBAKE_REGISTRY_USERNAME", hide_env_values = true)]
    username: Option<String>,

    #[clap(long, env = "OCIBAKE_REGISTRY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[clap(long, env = "OCIBAKE_REGISTRY_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the image described by a document
    Build {
        #[clap(short = 'f', long, help = "Image document (YAML, or JSON with a .json extension)")]
        file: PathBuf,

        #[clap(short = 't', long, help = "Reference to push to")]
        tag: Option<String>,

        #[clap(long, requires = "tag", help = "Push the built image to --tag")]
        push: bool,

        #[clap(long, value_name = "DIR", help = "Also write the image as an OCI layout")]
        oci_layout: Option<PathBuf>,

        #[clap(long, default_value = "linux/amd64", help = "Platform for index bases and empty images")]
        platform: String,

        #[clap(short, long, default_value = "0", help = "Layer build threads (0 = one per CPU)")]
        jobs: usize,

        #[clap(long, default_value = "3", help = "Attempts for registry pushes")]
        retries: u32,
    },
    /// Pin the base image to a digest and print the document
    Resolve {
        #[clap(short = 'f', long)]
        file: PathBuf,

        #[clap(long, default_value = "3", help = "Attempts for the registry lookup")]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json, cli.verbose)
        .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))?;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling build");
            on_interrupt.cancel();
        }
    });

    // reqwest's blocking client owns its own runtime and must stay off the
    // async workers.
    tokio::task::spawn_blocking(move || run(cli, cancel))
        .await
        .context("build task panicked")?
}

fn run(cli: Cli, cancel: CancelFlag) -> Result<()> {
    let auth = RegistryAuth::from_parts(cli.username.clone(), cli.password.clone(), cli.token.clone());

    match cli.command {
        Commands::Build {
            file,
            tag,
            push,
            oci_layout,
            platform,
            jobs,
            retries,
        } => {
            let spec = ImageSpec::load(&file).with_context(|| format!("loading {}", file.display()))?;
            let platform = Platform::parse(&platform)?;
            let registry: Arc<dyn Registry> =
                Arc::new(RegistryClient::new(auth)?.with_platform(platform.clone()));
            let transport = Arc::new(ReqwestTransport::new().context("building HTTP client")?);

            let ctx = BuildContext::new(registry.clone(), transport)
                .with_cancel(cancel.clone())
                .with_jobs(jobs)
                .with_platform(platform);
            let output = pipeline::build(&spec, &ctx)?;
            tracing::info!(digest = %output.digest, "Build finished");

            if let Some(dir) = oci_layout {
                OciLayoutWriter::new(&dir)
                    .write(&output.image, Some(registry.as_ref()), tag.as_deref())
                    .with_context(|| format!("writing OCI layout to {}", dir.display()))?;
            }

            if push {
                if cancel.is_cancelled() {
                    return Err(BakeError::Cancelled.into());
                }
                let target = tag.context("--push requires --tag")?;
                let reference = ImageReference::parse(&target)?;
                let config = RetryConfig {
                    max_attempts: retries.max(1),
                    ..RetryConfig::default()
                };
                let digest = with_retry(&config, "push", || registry.push_image(&reference, &output.image))?;
                println!("{}", reference.with_digest(&digest));
            } else {
                println!("{}", output.digest);
            }
        }
        Commands::Resolve { file, retries } => {
            let spec = ImageSpec::load(&file).with_context(|| format!("loading {}", file.display()))?;
            let registry: Arc<dyn Registry> = Arc::new(RegistryClient::new(auth)?);
            let config = RetryConfig {
                max_attempts: retries.max(1),
                ..RetryConfig::default()
            };
            let resolved = with_retry(&config, "resolve", || pipeline::resolve(spec.clone(), &registry))?;
            print!("{}", resolved.to_yaml()?);
        }
    }

    Ok(())
}
