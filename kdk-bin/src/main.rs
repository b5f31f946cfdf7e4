//! kdk
//!
//! Command-line interface for managing the kdk development container.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kdk_common::{ImageRef, KdkError, Result};
use kdk_engine::bollard::Docker;
use kdk_engine::config::{ConfigStore, KdkConfig, RunOptions, SshSettings};
use kdk_engine::prompt::StdinPrompt;
use kdk_engine::{DockerRuntime, Orchestrator};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kdk")]
#[command(about = "Manage the kdk development container", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the configuration, pull the base image, and set up an ssh identity
    Init(InitArgs),
    /// Pull the configured base image
    Pull,
    /// Start the container and provision it
    Up(UpArgs),
    /// Re-run the in-container provisioning step
    Provision,
    /// Open an interactive session in the container
    Ssh,
    /// Commit the running container to a new snapshot image
    Snapshot,
    /// Remove snapshot images not backing the running container
    Prune,
    /// Force-remove the container
    Destroy,
    /// Snapshot, recreate the container from the snapshot, and prune
    Restart,
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Base image fresh containers start from
    #[arg(long, default_value = "ubuntu:24.04")]
    image: String,
    /// Host port published to the container's sshd
    #[arg(long, default_value_t = 2222)]
    ssh_port: u16,
    /// Login user inside the container
    #[arg(long, default_value = "kdk")]
    ssh_user: String,
    /// Extra volume binds, HOST:CONTAINER[:MODE]
    #[arg(long = "volume")]
    volumes: Vec<String>,
    /// Extra published ports, HOST:CONTAINER
    #[arg(long = "port")]
    ports: Vec<String>,
    /// Extra environment variables, KEY=VALUE
    #[arg(long = "env")]
    env: Vec<String>,
}

#[derive(Debug, Args)]
struct UpArgs {
    /// Start from this image instead of being offered a choice
    #[arg(long)]
    image: Option<String>,
}

impl InitArgs {
    fn into_config(self) -> Result<KdkConfig> {
        let mut ports = vec![format!("{}:22", self.ssh_port)];
        ports.extend(self.ports);
        let mut env = BTreeMap::new();
        for pair in &self.env {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                KdkError::Config(format!("invalid env var '{pair}': expected KEY=VALUE"))
            })?;
            env.insert(key.to_string(), value.to_string());
        }
        Ok(KdkConfig {
            image: self.image.parse()?,
            runtime: RunOptions {
                volumes: self.volumes,
                ports,
                ..Default::default()
            },
            env,
            ssh: SshSettings {
                port: self.ssh_port,
                user: self.ssh_user,
            },
        })
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let user = std::env::var("USER")
        .map_err(|_| KdkError::Config("USER is not set; cannot derive snapshot tags".to_string()))?;
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| KdkError::Runtime(format!("failed to connect to the container runtime: {e}")))?;
    let runtime = Arc::new(DockerRuntime::new(Arc::new(docker)));
    let orchestrator = Orchestrator::new(runtime, Arc::new(StdinPrompt), &user);
    let store = ConfigStore::new(ConfigStore::default_path()?);

    match cli.command {
        Commands::Init(args) => {
            orchestrator.init(&store, &args.into_config()?).await?;
            info!("kdk is ready; run `kdk up` to start the container");
        }
        Commands::Pull => {
            let config = store.load().await?;
            orchestrator.pull(&config).await?;
        }
        Commands::Up(args) => {
            let config = store.load().await?;
            let image_override = args
                .image
                .as_deref()
                .map(str::parse::<ImageRef>)
                .transpose()?;
            orchestrator.up(&config, true, image_override).await?;
        }
        Commands::Provision => {
            orchestrator.provision().await?;
        }
        Commands::Ssh => {
            let config = store.load().await?;
            orchestrator.ssh(&config, &store.key_dir()).await?;
        }
        Commands::Snapshot => {
            let image = orchestrator.snapshot().await?;
            println!("created {image}");
        }
        Commands::Prune => {
            orchestrator.prune(true).await?;
        }
        Commands::Destroy => {
            orchestrator.destroy(true).await?;
        }
        Commands::Restart => {
            let config = store.load().await?;
            orchestrator.restart(&config).await?;
        }
    }
    Ok(())
}
