//! ==============================================================================
//! main.rs - telemetry gateway entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the gateway core to its consumers and runs until ctrl+c.
//!
//! responsibilities:
//!     - load configuration and initialize logging
//!     - start the gateway core (udp ingest + liveness sweeper)
//!     - start the consumers: json api, tcp relay, indicator leds
//!     - cooperative shutdown on ctrl+c
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                       gateway (gateway.rs)                   │
//!     │  ┌─────────────┐   ┌────────────┐   ┌──────────────────┐     │
//!     │  │ ingest loop │──►│  registry  │◄──│ liveness sweeper │     │
//!     │  │ (udp 50000) │   │ (4 slots)  │   │ (1s tick)        │     │
//!     │  └──────┬──────┘   └─────┬──────┘   └──────────────────┘     │
//!     │         │ notify         │ snapshots                         │
//!     └─────────┼────────────────┼───────────────────────────────────┘
//!          ┌────┴──────┐         │
//!          ▼           ▼         ▼
//!     ┌─────────┐ ┌─────────┐ ┌─────────────┐
//!     │  leds   │ │  relay  │ │  json api   │
//!     │ (gpio)  │ │  (tcp)  │ │ (port 3000) │
//!     └─────────┘ └─────────┘ └─────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_gateway::api::{self, ApiState};
use telemetry_gateway::clock::MonotonicClock;
use telemetry_gateway::config::GatewayConfig;
use telemetry_gateway::hal::Hal;
use telemetry_gateway::indicator::IndicatorLeds;
use telemetry_gateway::relay::TcpRelay;
use telemetry_gateway::transport::UdpSocketFactory;
use telemetry_gateway::Gateway;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Sensor Gateway - Telemetry Host");
    println!("===========================================================");

    // step 1: load configuration
    let config = GatewayConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging.level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // step 3: gateway core
    let clock = Arc::new(MonotonicClock::new());
    let factory = UdpSocketFactory { bind_ip: config.ingest.bind_ip };
    let gateway = Gateway::new(&config, factory, clock);
    gateway.run();

    // step 4: consumers
    let mut consumers = Vec::new();

    if config.api.enabled {
        let state = ApiState {
            gateway_name: Arc::from(gateway.name()),
            registry: gateway.registry(),
            status: gateway.transport_status(),
            clock: gateway.clock(),
        };
        let bind = config.api.bind.clone();
        let shutdown = gateway.shutdown_signal();
        consumers.push(tokio::spawn(async move {
            if let Err(e) = api::serve(state, &bind, shutdown).await {
                error!("[API] {:#}", e);
            }
        }));
    }

    if config.relay.enabled {
        let relay = TcpRelay::new(&config.relay.host, config.relay.port, config.relay.connect_timeout());
        consumers.push(tokio::spawn(relay.run(gateway.subscribe(), gateway.shutdown_signal())));
    }

    if config.indicator.enabled {
        match Hal::new() {
            Ok(hal) => {
                let mut leds = IndicatorLeds::new(Arc::new(hal), config.indicator.pins.clone());
                match leds.init() {
                    Ok(()) => consumers
                        .push(tokio::spawn(leds.run(gateway.subscribe(), gateway.shutdown_signal()))),
                    Err(e) => warn!("[LED] indicators disabled: {:#}", e),
                }
            }
            Err(e) => warn!("[LED] no gpio access, indicators disabled: {:#}", e),
        }
    }

    info!("[STARTUP] {} up, waiting for sensor nodes", gateway.name());

    // step 5: wait for ctrl+c
    match signal::ctrl_c().await {
        Ok(()) => info!("[SHUTDOWN] received ctrl+c"),
        Err(e) => error!("[SHUTDOWN] unable to listen for ctrl+c: {}", e),
    }

    gateway.shutdown().await;
    for task in consumers {
        if let Err(e) = task.await {
            warn!("[SHUTDOWN] consumer task failed: {}", e);
        }
    }
    info!("[SHUTDOWN] done");
    Ok(())
}
