//! zitirtc - Zero-trust overlay networking for real-time media

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use zitirtc::config::Config;
use zitirtc::controller::{IdentityAdmin, SessionManager};
use zitirtc::identity::{
    enroll_if_needed, role_attributes, EnrollOutcome, Enrollment, EnrollmentParams, KeyAlgorithm,
    Role,
};
use zitirtc::transport::list_interfaces;
use zitirtc::AppContext;

#[derive(Parser)]
#[command(name = "zitirtc")]
#[command(about = "Zero-trust overlay networking for real-time media")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ZITIRTC_CONFIG")]
    config: Option<PathBuf>,

    /// Controller URL, overrides the configuration
    #[arg(long, global = true)]
    controller: Option<String>,

    /// Identity path without extension, overrides the configuration
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from its one-time token
    Enroll {
        /// Token file; defaults to `<identity>.jwt`
        #[arg(long)]
        jwt: Option<PathBuf>,

        /// Output credential file; derived from the token path when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Key algorithm for the generated key (ec-p256, ec-p384, rsa)
        #[arg(long, default_value = "ec-p256")]
        key_alg: KeyAlgorithm,

        /// Name for the certificate request
        #[arg(long)]
        id_name: Option<String>,

        /// Additional CA bundle trusted for the controller
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Third-party certificate (ottca enrollment)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Third-party private key (ottca enrollment)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Username (updb enrollment)
        #[arg(long)]
        username: Option<String>,

        /// Password (updb enrollment)
        #[arg(long, env = "ZITI_ENROLL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Set up the overlay and hold the session until Ctrl-C
    Session,

    /// Print the role attributes of a role
    Roles {
        /// admin, enroller, device, device-pending-enroll or inactive
        role: String,
    },

    /// Manage identities on the controller
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// List local network interfaces
    Interfaces,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Create an identity and print its enrollment token
    Create { name: String, role: Role },
    /// Show an identity
    Get { id: String },
    /// Rename an identity and replace its role
    Update { id: String, name: String, role: Role },
    /// Delete an identity
    Delete { id: String },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(url) = &cli.controller {
        config.controller_url = url.clone();
    }
    if let Some(identity) = &cli.identity {
        config.identity_path = identity.clone();
    }
    Ok(config)
}

async fn run_session(config: Config) -> Result<()> {
    let app = AppContext::setup(config).await?;
    println!("Session established with {}", app.session().controller_url());
    println!(
        "Overlay services: {}",
        app.overlay().catalog().services().len()
    );
    println!("Press Ctrl-C to exit");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        reason = app.keepalive().failed() => {
            error!("Keep-alive stopped: {}", reason);
        }
    }

    app.shutdown();
    Ok(())
}

async fn run_identity(config: Config, action: IdentityAction) -> Result<()> {
    let session = SessionManager::create_api_session(&config.controller_url, &config.identity_path)
        .await?
        .with_dev_env(config.dev_env);
    let admin = IdentityAdmin::new(Arc::new(session), config.services.clone());

    match action {
        IdentityAction::Create { name, role } => {
            let created = admin.create_identity(&name, role).await?;
            println!("id:  {}", created.id);
            println!("jwt: {}", created.jwt);
        }
        IdentityAction::Get { id } => {
            let identity = admin.get_identity(&id).await?;
            println!("{:#?}", identity);
        }
        IdentityAction::Update { id, name, role } => {
            admin.update_identity(&id, &name, role).await?;
            println!("Updated {}", id);
        }
        IdentityAction::Delete { id } => {
            admin.delete_identity(&id).await?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Enroll {
            jwt,
            out,
            key_alg,
            id_name,
            ca,
            cert,
            key,
            username,
            password,
        } => {
            let params = EnrollmentParams {
                key_alg,
                id_name,
                ca_override: ca,
                cert_path: cert,
                key_path: key,
                username,
                password,
                output_path: out,
            };
            match jwt {
                Some(jwt) => {
                    let written = Enrollment::from_token_file(jwt, params).run().await?;
                    println!("Identity written to {}", written.display());
                }
                None => match enroll_if_needed(&config.identity_path, params).await? {
                    EnrollOutcome::Enrolled(path) => {
                        println!("Identity written to {}", path.display())
                    }
                    EnrollOutcome::AlreadyEnrolled => println!("Nothing to enroll"),
                },
            }
        }

        Commands::Session => {
            run_session(config).await?;
        }

        Commands::Roles { role } => {
            let attributes = role_attributes(&role, &config.services)?;
            println!("{}", serde_json::to_string(&attributes)?);
        }

        Commands::Identity { action } => {
            run_identity(config, action).await?;
        }

        Commands::Interfaces => {
            for iface in list_interfaces()? {
                let addrs: Vec<String> = iface.addrs.iter().map(|a| a.to_string()).collect();
                println!("{:>3}  {:<16} {}", iface.index, iface.name, addrs.join(", "));
            }
        }
    }

    Ok(())
}
