//! Order intake service: HTTP in, order events out.

use std::process::ExitCode;
use std::sync::Arc;

use cafebucks::bus::{BusConfig, Connector, EventBus};
use cafebucks::config::Config;
use cafebucks::{http, logging};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config);
    info!(env = %config.env, log_level = %config.log_level, "starting cafebucks");

    let bus_config = config.bus_config();
    let result = run(&config, bus_config.clone()).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(
                error = %e,
                topic = %bus_config.topic,
                group = %bus_config.group_id,
                brokers = ?bus_config.brokers,
                "cafebucks exited with an error"
            );
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "kafka")]
async fn run(config: &Config, bus_config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    serve_with(config, bus_config, &cafebucks::bus::KafkaConnector::new()).await
}

#[cfg(not(feature = "kafka"))]
async fn run(config: &Config, bus_config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("built without the kafka feature; events stay in this process");
    let broker = cafebucks::bus::InMemoryBroker::new().with_topic(&bus_config.topic, 3);
    serve_with(config, bus_config, &broker).await
}

async fn serve_with<C: Connector + 'static>(
    config: &Config,
    bus_config: BusConfig,
    connector: &C,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = bus_config.shutdown_timeout;
    let bus = Arc::new(EventBus::connect(bus_config, connector)?);

    let addr = format!("0.0.0.0:{}", config.port);
    info!(%addr, "binding to TCP socket");
    let listener = TcpListener::bind(&addr).await?;

    http::serve_until(bus, listener, http::wait_for_shutdown_signal(), deadline).await?;
    Ok(())
}
