use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier::transport::{BrokerTransport, TcpBrokerClient, TcpBrokerConfig};
use courier::{Command, CommandExecutor, CommandsConfig, CommandsService, ExecuteOptions, ExecutorError};
use courier_shared::{destinations, now_ms};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    sent_at_ms: u64,
}

impl Command for Ping {
    const TYPE: &'static str = "ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    app: String,
    sent_at_ms: u64,
}

struct PingExecutor {
    app: String,
}

#[async_trait]
impl CommandExecutor for PingExecutor {
    type Command = Ping;
    type Output = Pong;

    async fn execute(&self, command: Ping) -> Result<Pong, ExecutorError> {
        Ok(Pong {
            app: self.app.clone(),
            sent_at_ms: command.sent_at_ms,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = CommandsConfig::from_env().context("invalid configuration")?;
    let relay = TcpBrokerConfig {
        address: std::env::var("COURIER_RELAY_ADDR").unwrap_or_else(|_| "127.0.0.1:7070".into()),
        ..Default::default()
    };

    info!("Courier node starting: {} ({})", config.app_name, config.app_instance_id);
    info!("  Relay: {}", relay.address);

    let broker = Arc::new(TcpBrokerClient::connect(relay));
    let transport = BrokerTransport::new(broker).with_error_channel(destinations::errors(&config.app_name));

    let service = CommandsService::builder(config.clone()).transport(transport).build();
    service.add_executor(PingExecutor {
        app: config.app_name.clone(),
    })?;
    service.start().await?;

    if let Ok(target) = std::env::var("COURIER_PING_TARGET") {
        let pinger = service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let ping = Ping { sent_at_ms: now_ms() };
                let options = ExecuteOptions::target(target.clone()).with_timeout(Duration::from_secs(3));

                match pinger.execute_sync_with(ping, options).await {
                    Ok(result) => match result.value_as::<Pong>() {
                        Ok(pong) => info!(
                            "Pong from {} in {} ms",
                            pong.app,
                            now_ms().saturating_sub(pong.sent_at_ms)
                        ),
                        Err(e) => warn!("Unexpected pong payload: {}", e),
                    },
                    Err(e) => error!("Ping to {} failed: {}", target, e),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.shutdown();
    Ok(())
}
