//! Perch - tenant agent workload provisioning CLI

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perch::client::ProvisioningClient;
use perch::config::InstanceConfig;
use perch::retry::RetryConfig;
use perch::settings::Settings;

/// Perch - provision and manage per-tenant agent workloads
#[derive(Parser, Debug)]
#[command(name = "perch", version, about, long_about = None)]
struct Cli {
    /// Path to the operator settings file (backend selection, image, pool)
    #[arg(long, env = "PERCH_SETTINGS", default_value = "/etc/perch/settings.yaml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision an instance bundle, or reconcile an existing one
    ///
    /// Applies config, secret, storage, workload, endpoint and policy in
    /// dependency order. Re-running with the same arguments converges on
    /// the same state, so a failed provision can simply be retried.
    Provision {
        /// Owning tenant id
        tenant: String,
        /// Instance id within the tenant
        instance: String,
        /// Path to the instance configuration YAML
        #[arg(short = 'f', long = "config")]
        config_file: PathBuf,
        /// Pin the workload to a named pool worker (host pool only)
        #[arg(long)]
        worker: Option<String>,
    },

    /// Re-apply config and secret for a running instance
    ///
    /// Leaves compute, storage, endpoint and policy untouched. The new
    /// config takes effect when the workload next restarts.
    UpdateConfig {
        /// Owning tenant id
        tenant: String,
        /// Instance id within the tenant
        instance: String,
        /// Path to the instance configuration YAML
        #[arg(short = 'f', long = "config")]
        config_file: PathBuf,
    },

    /// Tear down one instance bundle
    Deprovision {
        /// Owning tenant id
        tenant: String,
        /// Instance id within the tenant
        instance: String,
    },

    /// Tear down every bundle a tenant owns, including shared substrate
    DeprovisionAll {
        /// Tenant id to sweep
        tenant: String,
    },

    /// Report the derived status of one instance
    Status {
        /// Owning tenant id
        tenant: String,
        /// Instance id within the tenant
        instance: String,
        /// Poll until the instance reports running
        #[arg(long)]
        wait: bool,
    },

    /// List instances with their derived status
    List {
        /// Restrict the listing to one tenant
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Print recent log output from an instance's workload
    Logs {
        /// Owning tenant id
        tenant: String,
        /// Instance id within the tenant
        instance: String,
        /// Number of trailing lines to fetch (defaults to everything)
        #[arg(long)]
        tail: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - the kube client's rustls stack needs one
    // registered before the first TLS handshake.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}. \
             TLS-backed backends cannot operate without one; this usually means \
             another provider was installed first or aws-lc-rs did not build.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.settings)
        .map_err(|e| anyhow::anyhow!("failed to load settings {:?}: {}", cli.settings, e))?;
    let client = ProvisioningClient::from_settings(&settings)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect backend: {}", e))?;

    match cli.command {
        Commands::Provision {
            tenant,
            instance,
            config_file,
            worker,
        } => {
            let config = load_instance_config(&config_file).await?;
            let receipt = client
                .provision(&tenant, &instance, &config, worker.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::UpdateConfig {
            tenant,
            instance,
            config_file,
        } => {
            let config = load_instance_config(&config_file).await?;
            client.update_config(&tenant, &instance, &config).await?;
            println!("updated config for {tenant}/{instance}");
        }
        Commands::Deprovision { tenant, instance } => {
            client.deprovision(&tenant, &instance).await?;
            println!("deprovisioned {tenant}/{instance}");
        }
        Commands::DeprovisionAll { tenant } => {
            client.deprovision_all(&tenant).await?;
            println!("deprovisioned all instances of {tenant}");
        }
        Commands::Status {
            tenant,
            instance,
            wait,
        } => {
            let status = if wait {
                client
                    .wait_until_running(&tenant, &instance, &RetryConfig::status_poll())
                    .await?
            } else {
                client.get_status(&tenant, &instance).await?
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List { tenant } => {
            let entries = client.list_status(tenant.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Logs {
            tenant,
            instance,
            tail,
        } => {
            let output = client.logs(&tenant, &instance, tail).await?;
            print!("{output}");
        }
    }

    Ok(())
}

/// Read and parse an instance configuration YAML file.
async fn load_instance_config(path: &Path) -> anyhow::Result<InstanceConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read instance config {:?}: {}", path, e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse instance config {:?}: {}", path, e))
}
