// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ssh-jail binary
//!
//! Runs the credential-recording SSH listener and offers a few
//! administrative commands over its configuration and ban file.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use ssh_jail::config::{generate_config_template, load_config, validate_config, JailConfig};
use ssh_jail::jail::{Address, BanFile, BanStore, Clock, Jail, SystemClock};
use ssh_jail::server::{generate_host_key, JailServer, SessionPolicy};
use ssh_jail::utils::logging;
use std::path::{Path, PathBuf};

/// SSH jail - records brute-force credentials and bans repeat offenders
#[derive(Parser, Debug)]
#[command(name = "ssh-jail")]
#[command(version)]
#[command(
    about = "Credential-recording SSH listener with per-address bans",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short = 'b', long, global = true, value_name = "ADDR")]
    bind_address: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true, value_name = "PORT")]
    port: Option<u16>,

    /// Host key file
    #[arg(short = 'k', long, global = true, value_name = "FILE")]
    host_key: Option<PathBuf>,

    /// Ban file
    #[arg(short = 'f', long, global = true, value_name = "FILE")]
    ban_file: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the listener (default)
    Run,

    /// Generate a configuration file template
    GenConfig {
        /// Output path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Check configuration for errors
    CheckConfig,

    /// Generate an Ed25519 host key
    GenHostKey {
        /// Output file path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// List currently banned addresses
    List,

    /// Lift the ban on an address
    Unban {
        /// IPv4 or IPv6 address
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose);

    match &cli.command {
        None | Some(Commands::Run) => run_server(&cli).await,
        Some(Commands::GenConfig { output }) => gen_config(output.as_deref()),
        Some(Commands::CheckConfig) => check_config(&cli),
        Some(Commands::GenHostKey { output, force }) => gen_host_key(output, *force),
        Some(Commands::List) => list_bans(&cli).await,
        Some(Commands::Unban { address }) => unban(&cli, address).await,
    }
}

/// Load file and environment configuration, then apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<JailConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config(None).context("Failed to load configuration")?,
    };

    apply_cli_overrides(&mut config, cli);
    validate_config(&config)?;
    Ok(config)
}

fn apply_cli_overrides(config: &mut JailConfig, cli: &Cli) {
    if let Some(bind_address) = &cli.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host_key) = &cli.host_key {
        config.server.host_key = host_key.clone();
    }
    if let Some(ban_file) = &cli.ban_file {
        config.jail.ban_file = ban_file.clone();
    }
}

async fn run_server(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;

    if !config.server.host_key.exists() {
        anyhow::bail!(
            "Host key {} not found. Generate one with: ssh-jail gen-host-key -o {}",
            config.server.host_key.display(),
            config.server.host_key.display()
        );
    }

    let jail = Jail::open(&config.jail)
        .await
        .context("Failed to open ban store")?;
    let policy = SessionPolicy::from_settings(&config.jail);

    tracing::info!(
        address = %config.server.bind_address,
        port = config.server.port,
        ban_file = %config.jail.ban_file.display(),
        ban_threshold = jail.ledger().threshold(),
        ban_duration_secs = config.jail.ban_duration_secs,
        notifications = config.jail.webhook_url.is_some(),
        "Starting ssh-jail"
    );

    let server = JailServer::new(config.server, jail, policy);
    server
        .run_until(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

fn gen_config(output: Option<&Path>) -> Result<()> {
    let template = generate_config_template();

    if let Some(path) = output {
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            // May hold a webhook secret
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .context("Failed to create configuration file")?;

            file.write_all(template.as_bytes())
                .context("Failed to write configuration file")?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(path, &template).context("Failed to write configuration file")?;
        }

        println!("Configuration template written to {}", path.display());
    } else {
        print!("{template}");
    }

    Ok(())
}

fn check_config(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;

    println!("✓ Configuration is valid\n");
    println!("Server:");
    println!("  Bind address: {}", config.server.bind_address);
    println!("  Port: {}", config.server.port);
    println!("  Host key: {}", config.server.host_key.display());
    if !config.server.host_key.exists() {
        println!("    (missing, generate with `ssh-jail gen-host-key`)");
    }
    println!("  Max connections: {}", config.server.max_connections);

    println!("\nJail:");
    println!("  Ban file: {}", config.jail.ban_file.display());
    println!("  Ban threshold: {}", config.jail.effective_ban_threshold());
    println!("  Ban duration: {}s", config.jail.ban_duration_secs);
    println!(
        "  Attempts per connection: {}",
        config.jail.max_attempts_per_connection
    );
    println!("  Response delay: {}ms", config.jail.response_delay_ms);
    println!("  Notify threshold: {}", config.jail.notify_threshold);
    println!(
        "  Webhook: {}",
        if config.jail.webhook_url.is_some() {
            "configured"
        } else {
            "disabled"
        }
    );

    Ok(())
}

fn gen_host_key(output: &Path, force: bool) -> Result<()> {
    let fingerprint = generate_host_key(output, force)?;

    println!("✓ Host key generated: {}", output.display());
    println!("  Fingerprint: {fingerprint}");
    println!("\nUse it with -k/--host-key or in YAML config:");
    println!("server:");
    println!("  host_key: {}", output.display());

    Ok(())
}

async fn open_store(cli: &Cli) -> Result<BanStore> {
    let config = resolve_config(cli)?;
    BanStore::builder(BanFile::new(&config.jail.ban_file))
        .open()
        .await
        .with_context(|| format!("Failed to open {}", config.jail.ban_file.display()))
}

async fn list_bans(cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let bans = store.bans().await;

    if bans.is_empty() {
        println!("No banned addresses");
        return Ok(());
    }

    let now = SystemClock.now_millis();
    println!("{} banned address(es):", bans.len());
    for (address, expires_at) in bans {
        let remaining_secs = expires_at.saturating_sub(now) / 1000;
        println!(
            "  {:<40} until {} ({}m {}s left)",
            address,
            format_expiry(expires_at),
            remaining_secs / 60,
            remaining_secs % 60
        );
    }

    Ok(())
}

/// Ban files are edited in place; a running listener keeps its in-memory
/// copy until it is restarted.
async fn unban(cli: &Cli, address: &str) -> Result<()> {
    let address = Address::parse(address)?;
    let store = open_store(cli).await?;

    if !store.is_banned(&address).await {
        println!("{address} is not banned");
        return Ok(());
    }

    store.unban(&address).await?;
    println!("✓ Unbanned {address}");
    Ok(())
}

fn format_expiry(epoch_millis: u64) -> String {
    i64::try_from(epoch_millis)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|utc| {
            utc.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S %z")
                .to_string()
        })
        .unwrap_or_else(|| epoch_millis.to_string())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
