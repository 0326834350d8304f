//! Ridehail CLI
//!
//! Operator binary:
//! - Declare the broker topology
//! - Run the WebSocket gateway
//! - Print the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ridehail::api::{self, ApiConfig, AppState};
use ridehail::broker::{topology, Broker, BrokerConnection};
use ridehail::config::{generate_default_config, Config};
use ridehail::mq::ConsumerGroup;
use ridehail::relay::{ride_status_consumer, LocationRelay};
use ridehail::shutdown::{shutdown_signal, GracefulShutdown};
use ridehail::websocket::Manager;

#[derive(Parser)]
#[command(name = "ridehail")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ride-hailing messaging gateway")]
#[command(long_about = "Connects ride-hailing services through RabbitMQ and keeps passengers and drivers connected over WebSocket.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: searched in standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Declare exchanges, queues and bindings
    InitTopology,

    /// Run the WebSocket gateway
    Gateway,

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    ridehail::logging::init(&config.logging)?;

    match cli.command {
        Commands::InitTopology => init_topology(&config).await,
        Commands::Gateway => gateway(config).await,
        Commands::Config => Ok(()),
    }
}

async fn init_topology(config: &Config) -> anyhow::Result<()> {
    let broker_config = config.broker.to_broker_config();
    tracing::info!(url = %broker_config.redacted_url(), "Connecting to RabbitMQ");

    let connection = BrokerConnection::connect(broker_config)
        .await
        .context("failed to connect to RabbitMQ")?;

    let declared = topology::declare_topology(connection.as_ref()).await;
    connection.close().await?;
    declared.context("failed to declare topology")?;

    tracing::info!("Topology declared");
    Ok(())
}

async fn gateway(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting ridehail gateway v{}", env!("CARGO_PKG_VERSION"));

    let broker_config = config.broker.to_broker_config();
    tracing::info!(url = %broker_config.redacted_url(), "Connecting to RabbitMQ");
    let connection = BrokerConnection::connect(broker_config)
        .await
        .context("failed to connect to RabbitMQ")?;
    let broker: Arc<dyn Broker> = connection.clone();

    // WebSocket sessions
    let manager = Arc::new(Manager::new(config.websocket.to_ws_config()));
    manager.start_router().await;
    let inbound = manager
        .take_inbound()
        .await
        .context("inbound channel already taken")?;

    // Broker to passengers
    let ctx = CancellationToken::new();
    let mut consumers = ConsumerGroup::new();
    consumers.add(Arc::new(ride_status_consumer(
        Arc::clone(&broker),
        config
            .consumer
            .for_queue(topology::RIDE_STATUS, "ridehail-gateway"),
        &manager,
    )?));
    consumers.start_all(&ctx).await?;
    let consumers = Arc::new(consumers);

    // Drivers to broker
    let relay = LocationRelay::new(Arc::clone(&manager), Arc::clone(&broker));
    let relay_handle = tokio::spawn(relay.run(inbound, ctx.clone()));

    // HTTP
    let api_config = ApiConfig::new(config.websocket.host.clone(), config.websocket.port);
    let state = AppState::new(
        Arc::clone(&manager),
        Arc::clone(&broker),
        Arc::new(config.auth.authenticator()),
        api_config.clone(),
    )
    .with_consumers(Arc::clone(&consumers));
    let http_stop = CancellationToken::new();
    let server_exited = CancellationToken::new();
    let server = {
        let http_stop = http_stop.clone();
        let server_exited = server_exited.clone();
        tokio::spawn(async move {
            let result =
                api::serve(state, &api_config, async move { http_stop.cancelled().await }).await;
            server_exited.cancel();
            result
        })
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server_exited.cancelled() => {
            tracing::error!("HTTP server stopped unexpectedly");
        }
    }

    let mut shutdown = GracefulShutdown::new(config.shutdown.timeout());

    shutdown.register("consumers", move |left| async move {
        consumers.stop_all(left).await?;
        Ok(())
    });

    let ws = Arc::clone(&manager);
    shutdown.register("websocket", move |left| async move {
        ws.shutdown(left).await?;
        Ok(())
    });

    shutdown.register("http", move |_| async move {
        http_stop.cancel();
        server.await??;
        Ok(())
    });

    let relay_ctx = ctx.clone();
    shutdown.register("relay", move |_| async move {
        relay_ctx.cancel();
        relay_handle.await?;
        Ok(())
    });

    shutdown.register("broker", move |_| async move {
        connection.close().await?;
        Ok(())
    });

    shutdown.run().await;
    tracing::info!("Ridehail gateway stopped");
    Ok(())
}
