//! Modbus/TCP peripheral bound on the overlay
//!
//! Enrolls (or loads) an identity with the `modbus` option, authenticates it
//! up front and binds `<identity name>-modbus`. Serves until Ctrl-C, then
//! drains open connections.
//!
//! ## Usage
//! ```bash
//! modbus-server
//! modbus-server -i ./plc.json --read-timeout 30 --write-timeout 5
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use overlay_apps::cli::{staged, IdentityArgs};
use overlay_apps::modbus::Peripheral;
use overlay_sdk::telemetry::init_tracing;
use overlay_sdk::{serve, ServeConfig, Shutdown};

/// Enrollment option that provisions the bind grant for the modbus service
const MODBUS_OPTION: &str = "modbus";

/// Simulated PLC reachable only through the overlay
#[derive(Parser, Debug)]
#[command(name = "modbus-server")]
#[command(about = "Serve a simulated Modbus/TCP peripheral on the overlay")]
#[command(version)]
struct Args {
    #[command(flatten)]
    identity: IdentityArgs,

    /// Seconds a connection may stay silent before it is closed
    #[arg(long, env = "MODBUS_READ_TIMEOUT", default_value_t = 10)]
    read_timeout: u64,

    /// Seconds allowed to flush one response
    #[arg(long, env = "MODBUS_WRITE_TIMEOUT", default_value_t = 5)]
    write_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.identity.verbose, args.identity.json);

    let shutdown = Shutdown::new();
    shutdown.on_ctrl_c();

    let config = args.identity.config().with_option(MODBUS_OPTION);
    let contexts = args.identity.contexts(&config, &shutdown).await.map_err(staged)?;
    let context = contexts.first().context("No identity loaded")?;

    context.authenticate().await.map_err(staged)?;
    let service = format!("{}-{}", context.identity_name(), MODBUS_OPTION);
    let mut listener = context.listen(&service).await.map_err(staged)?;
    info!(service = %service, "Modbus peripheral listening");

    let serve_config = ServeConfig {
        read_timeout: Duration::from_secs(args.read_timeout),
        write_timeout: Duration::from_secs(args.write_timeout),
        ..ServeConfig::default()
    };
    let summary = serve(&mut listener, Arc::new(Peripheral::new()), serve_config, shutdown)
        .await
        .map_err(staged)?;

    info!(
        accepted = summary.accepted,
        completed = summary.completed,
        failed = summary.failed,
        "Modbus peripheral stopped"
    );
    Ok(())
}
