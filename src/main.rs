//! tracelink daemon: runs the background sync workers and the operator
//! command surface. The interview UI consumes the library crate directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use tracelink::config::Config;
use tracelink::coupon::CouponLedger;
use tracelink::definition::DefinitionStore;
use tracelink::store::SessionDb;
use tracelink::sync::{DefinitionSync, HttpTransport, SyncTransport, UploadWorker};

#[derive(Parser)]
#[command(name = "tracelink")]
#[command(about = "Offline-first interview runtime for facility tablets")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tracelink.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "TRACELINK_DATA_DIR")]
    data_dir: Option<String>,

    /// Device ID (overrides config file)
    #[arg(long, env = "TRACELINK_DEVICE_ID")]
    device_id: Option<String>,

    /// Passphrase the session store key is derived from
    #[arg(long, env = "TRACELINK_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the upload queue state
    Status,
    /// Put a FAILED_TERMINAL upload back in the queue
    Requeue {
        /// Session id of the terminal upload
        session_id: String,
    },
    /// Pre-generate unused coupon codes for printing
    Mint {
        /// Number of codes to generate
        #[arg(default_value_t = 10)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracelink=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str::<Config>(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(data_dir) = cli.data_dir {
        config.device.data_dir = PathBuf::from(data_dir);
    }
    if let Some(device_id) = cli.device_id {
        config.device.id = device_id;
    }

    info!("Device ID: {}", config.device.id);
    info!("Data dir: {}", config.device.data_dir.display());

    let db = Arc::new(SessionDb::open(&config.device.data_dir, &cli.passphrase)?);

    if let Some(command) = cli.command {
        return run_command(command, &db).await;
    }

    let definitions = Arc::new(DefinitionStore::open(
        &config.device.data_dir.join("definitions"),
    )?);
    let ledger = Arc::new(CouponLedger::new(db.clone()));
    let transport: Arc<dyn SyncTransport> = Arc::new(HttpTransport::new(
        &config.sync.server_url,
        &config.sync.facility_token,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let definition_sync = DefinitionSync::new(transport.clone(), definitions.clone());
    let definition_task = tokio::spawn(definition_sync.run(
        Duration::from_secs(config.sync.definition_check_interval_secs),
        shutdown_rx.clone(),
    ));

    let upload_worker = UploadWorker::new(
        db.clone(),
        ledger,
        transport,
        &config.device.id,
        config.sync.max_upload_attempts,
        config.sync.backoff_base_ms,
        config.sync.backoff_cap_ms,
    );
    let upload_task = tokio::spawn(upload_worker.run(
        Duration::from_secs(config.sync.upload_poll_interval_secs),
        shutdown_rx,
    ));

    info!("Sync workers started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(definition_task, upload_task);

    Ok(())
}

async fn run_command(command: Commands, db: &Arc<SessionDb>) -> anyhow::Result<()> {
    match command {
        Commands::Status => {
            let report = db.upload_report()?;
            if report.is_empty() {
                println!("upload queue is empty");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:>8}  {}",
                "SESSION", "STATUS", "ATTEMPTS", "LAST ERROR"
            );
            for record in report {
                println!(
                    "{:<38} {:<16} {:>8}  {}",
                    record.session_id,
                    record.status.as_str(),
                    record.attempts,
                    record.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Requeue { session_id } => {
            if db.requeue_upload(&session_id)? {
                println!("requeued {session_id}");
            } else {
                eprintln!("{session_id} is not a failed upload");
                std::process::exit(1);
            }
        }
        Commands::Mint { count } => {
            let ledger = CouponLedger::new(db.clone());
            for code in ledger.mint(count)? {
                println!("{code}");
            }
        }
    }
    Ok(())
}
