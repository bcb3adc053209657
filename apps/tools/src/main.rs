use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use delivery_core::config::{load_settings, prepare_database_url};
use ratchet::ProtocolStore;
use shared::domain::{DeviceId, MessageId, RecipientDevice, ServiceId};
use storage::Storage;
use tracing::info;

/// Operator commands against the local delivery database.
#[derive(Parser, Debug)]
#[command(name = "delivery-tools")]
struct Cli {
    /// TOML settings file; `DELIVERY__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-recipient delivery state of one message.
    Status { message_id: i64 },
    /// Known devices and sessions of a recipient.
    Devices { service_id: String },
    /// Archives a session so the next send fetches fresh prekeys.
    ArchiveSession { service_id: String, device_id: u32 },
    /// Approves a changed identity key.
    TrustIdentity { service_id: String },
    /// Prints the effective settings.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    if let Command::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await?;
    info!(%database_url, "opened delivery database");

    match cli.command {
        Command::Status { message_id } => {
            let message_id = MessageId(message_id);
            if !storage.message_exists(message_id).await? {
                bail!("message {message_id:?} not found");
            }
            for row in storage.recipient_states(message_id).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.recipient_key,
                    row.status.as_str(),
                    row.mode.map(|mode| mode.as_str()).unwrap_or("-"),
                    row.error.as_deref().unwrap_or("")
                );
            }
            for row in storage.device_deliveries(message_id).await? {
                println!("  {}\t{}\t{}", row.device, row.status.as_str(), row.mode.as_str());
            }
            let summary = storage.delivery_summary(message_id).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Devices { service_id } => {
            let service_id = ServiceId::new(service_id);
            match storage.recipient_devices(&service_id).await? {
                Some(devices) => {
                    let ids: Vec<String> = devices.iter().map(ToString::to_string).collect();
                    println!("devices: {}", ids.join(","));
                }
                None => println!("devices: unknown"),
            }
            for session in storage.list_sessions(&service_id).await? {
                println!(
                    "  device {}\tactive={}\tarchived={}",
                    session.device_id, session.active, session.archived
                );
            }
            let registered = storage.is_registered(&service_id).await?;
            println!("registered: {registered:?}");
            let trust = storage.identity_trust(&service_id).await?;
            println!("identity: {}", trust.map(|t| t.as_str()).unwrap_or("none"));
        }
        Command::ArchiveSession {
            service_id,
            device_id,
        } => {
            let device = RecipientDevice::new(ServiceId::new(service_id), DeviceId(device_id));
            if !device.device_id.is_valid() {
                bail!("device ids start at 1");
            }
            storage.archive_session(&device).await?;
            println!("archived session for {device}");
        }
        Command::TrustIdentity { service_id } => {
            let service_id = ServiceId::new(service_id);
            if storage.trust_identity(&service_id).await? {
                println!("identity of {service_id} is now trusted");
            } else {
                bail!("no identity stored for {service_id}");
            }
        }
        Command::ShowConfig => {}
    }

    Ok(())
}
