use clap::Parser;
use cloudlink::mqtt::{Dispatch, MqttConfig, SessionHandle};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Keeps a broker session open and follows gateway and drone announcements
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Config file, defaults to <config dir>/cloudlink/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device id sent with `info` requests
    #[arg(long, default_value = "123")]
    device_id: String,

    /// Write a default config file if none exists and continue
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    if args.init_config {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => MqttConfig::default_path()?,
        };
        MqttConfig::ensure_default_config(&path).await?;
    }
    let config = MqttConfig::load(args.config.as_deref()).await?;

    let (session, session_task) = SessionHandle::initialize(&config)
        .map_err(|e| eyre!("Failed to initialize MQTT client: {}", e))?;
    session.connect_with_retry().await?;

    info!("Commands: info | status | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "info" => request_info(&session, &config.command_topic, &args.device_id).await?,
                    "status" => {
                        let status = session.status().await?;
                        info!("{:#?}", status);
                    }
                    "quit" | "exit" => break,
                    "" => {}
                    other => warn!("Unknown command: {}", other),
                },
                None => break,
            },
        }
    }

    match session.unsubscribe_all().await? {
        Dispatch::Requested => info!("Unsubscribed from all topics"),
        Dispatch::Rejected(reason) => info!("Skipped unsubscribe: {:?}", reason),
    }
    session.close().await?;
    drop(session);
    if let Err(e) = session_task.await {
        error!("Session task failed: {}", e);
    }
    Ok(())
}

async fn request_info(session: &SessionHandle, topic: &str, device_id: &str) -> Result<()> {
    let message = json!({
        "method": "get_info",
        "data": { "device_id": device_id },
    })
    .to_string();

    match session.publish(topic, message).await? {
        Dispatch::Requested => info!("Requested device info on {}", topic),
        Dispatch::Rejected(reason) => warn!("Cannot publish. MQTT is not ready: {:?}", reason),
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
