use color_eyre::{eyre::eyre, Result};
use iotcore_link::config::LinkConfig;
use iotcore_link::mqtt::{ConnectionPool, InboundEndpoint, OutboundEndpoint, RumqttConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("usage: iotcore-link <config.toml>"))?;
    let config = LinkConfig::load(&path).await?;
    let options = config.manager_options().await?;

    let pool = ConnectionPool::new();
    let manager = pool.get_or_create(options, Arc::new(RumqttConnector::new()))?;
    info!("Using broker {}", manager.endpoint());

    let (inbound, mut configs) = InboundEndpoint::attach(
        manager.clone(),
        "device-config",
        &config.identity.device_id,
        config.inbound.qos,
    )?;
    let outbound =
        OutboundEndpoint::attach(manager.clone(), "device-events", &config.outbound_settings())?;

    let mut status = inbound.status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!("Broker connection {}", current);
        }
    });

    let config_task = tokio::spawn(async move {
        while let Some(message) = configs.recv().await {
            info!("Device configuration received\n{}", message.render());
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    debug!("Publishing {} bytes to {}", line.len(), outbound.topic());
                    if let Err(e) = outbound.send(line, None, false) {
                        warn!("Event not sent: {}", e);
                    }
                }
                Ok(None) => {
                    info!("Input closed, waiting for Ctrl-C");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    }

    outbound.detach().await?;
    inbound.detach().await?;
    manager.close(false).await?;
    status_task.abort();
    config_task.abort();
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
