use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use zeroize::Zeroizing;

use dk_core::{telemetry, CoreConfig, DeviceCapabilities, DeviceId, KeyService, UserId};
use dk_store::Vault;

const ENV_PASSPHRASE: &str = "DK_VAULT_PASSPHRASE";
const ENV_PASSPHRASE_CONFIRM: &str = "DK_VAULT_PASSPHRASE_CONFIRM";
const MIN_PASSPHRASE_LEN: usize = 12;

#[derive(Parser, Debug)]
#[command(author, version, about = "Device key daemon", long_about = None)]
struct Cli {
    /// Database path; overrides DK_DB_PATH and the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the key database and set its passphrase
    Init,
    /// Create a device held by this core
    Provision {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        /// Advertise ML-KEM-768 alongside the classical suite
        #[arg(long)]
        hybrid: bool,
    },
    /// Run one rotation pass and exit
    Rotate,
    /// Run the periodic rotation task until Ctrl-C
    Run,
    /// Revoke a device and re-key its conversations
    Revoke {
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "revoked by operator")]
        reason: String,
    },
    /// Print and verify the audit records
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let mut config = CoreConfig::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Commands::Init => init_command(config).await,
        Commands::Provision { user, name, hybrid } => provision_command(config, &user, &name, hybrid).await,
        Commands::Rotate => rotate_command(config).await,
        Commands::Run => run_command(config).await,
        Commands::Revoke { device, reason } => revoke_command(config, &device, &reason).await,
        Commands::Audit => audit_command(config).await,
    }
}

async fn init_command(config: CoreConfig) -> Result<()> {
    if config.database_path.exists() {
        return Err(anyhow!("database already exists at {}", config.database_path.display()));
    }
    let passphrase = prompt_passphrase_twice("Create vault passphrase: ")?;
    let path = config.database_path.clone();
    let service = KeyService::connect(config, Vault::new()).await?;
    service.store().unlock(passphrase.as_bytes()).await?;
    service.store().close().await;
    println!("Key database created at {}", path.display());
    Ok(())
}

async fn provision_command(config: CoreConfig, user: &str, name: &str, hybrid: bool) -> Result<()> {
    let service = open_unlocked(config).await?;
    let capabilities = if hybrid { DeviceCapabilities::hybrid() } else { DeviceCapabilities::classical() };
    let device = service
        .provision_local_device(&UserId::from(user), name, &capabilities)
        .await?;
    let identity = service.get_verified_identity(device).await?;
    println!("Device ID: {device}");
    println!("Fingerprint: {}", identity.fingerprint);
    service.store().close().await;
    Ok(())
}

async fn rotate_command(config: CoreConfig) -> Result<()> {
    let service = open_unlocked(config).await?;
    let report = service.run_rotation_pass(Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    service.store().close().await;
    Ok(())
}

async fn run_command(config: CoreConfig) -> Result<()> {
    let interval = config.rotation_check_interval();
    let service = open_unlocked(config).await?;
    let task = dk_core::scheduler::spawn_rotation_task(service.clone(), interval);
    info!(interval_secs = interval.as_secs(), "rotation task running");

    signal::ctrl_c().await?;
    info!("service stopping");
    task.abort();
    service.store().close().await;
    Ok(())
}

async fn revoke_command(config: CoreConfig, device: &str, reason: &str) -> Result<()> {
    let device: DeviceId = device.parse().map_err(|_| anyhow!("invalid device id {device:?}"))?;
    let service = open_unlocked(config).await?;
    let outcome = service.revoke_device(device, reason).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    service.store().close().await;
    Ok(())
}

async fn audit_command(config: CoreConfig) -> Result<()> {
    let service = open_unlocked(config).await?;
    for record in service.rotation_records(None).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    for record in service.revocation_records().await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    let report = service.verify_audit_chain().await?;
    println!(
        "Audit chain intact: {} rotation records, {} revocation records",
        report.rotation_records, report.revocation_records
    );
    service.store().close().await;
    Ok(())
}

async fn open_unlocked(config: CoreConfig) -> Result<KeyService> {
    if !config.database_path.exists() {
        return Err(anyhow!("database missing at {}; run init first", config.database_path.display()));
    }
    let vault = Vault::with_auto_lock(config.vault_auto_lock_secs);
    let service = KeyService::connect(config, vault).await?;
    let passphrase = prompt_passphrase_once("Vault passphrase: ")?;
    service
        .store()
        .unlock(passphrase.as_bytes())
        .await
        .context("unlocking vault")?;
    Ok(service)
}

fn prompt_passphrase_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(ENV_PASSPHRASE) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = Zeroizing::new(rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?);
    if pw.len() < MIN_PASSPHRASE_LEN {
        return Err(anyhow!("passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters"));
    }
    Ok(pw)
}

fn prompt_passphrase_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(ENV_PASSPHRASE) {
        if !pw.is_empty() {
            if let Ok(confirm) = std::env::var(ENV_PASSPHRASE_CONFIRM) {
                if confirm != pw {
                    return Err(anyhow!("passphrase confirmation mismatch"));
                }
            }
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_passphrase_once(prompt)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ").map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passphrases do not match"));
    }
    Ok(first)
}
