//! Overlay service check
//!
//! Pre-flight for database style clients: lists what every identity is
//! granted, checks that some identity grants the target and dials the
//! `host:port` address (the port is discarded). With `--modbus` it also reads
//! holding registers from a Modbus peripheral at that address.
//!
//! ## Usage
//! ```bash
//! overlay-check
//! overlay-check -q PostgresDemo:5432
//! OVERLAY_IDENTITIES="a.json;b.json" overlay-check -q plc-modbus:502 --modbus
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use overlay_apps::cli::{staged, IdentityArgs};
use overlay_apps::modbus::{self, Frame, Request, Response, MAX_ADU_LEN};
use overlay_sdk::telemetry::init_tracing;
use overlay_sdk::{service_name_from_address, OverlayError, OverlayStream, Shutdown};

/// Dial a service by address and report the outcome
#[derive(Parser, Debug)]
#[command(name = "overlay-check")]
#[command(about = "Check that an overlay service is granted and reachable")]
#[command(version)]
struct Args {
    #[command(flatten)]
    identity: IdentityArgs,

    /// `service:port` to dial; only the service name is used
    #[arg(short = 'q', long, default_value = "PostgresDemo:5432")]
    address: String,

    /// Read this many holding registers from a Modbus peripheral
    #[arg(long, value_name = "COUNT")]
    modbus: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.identity.verbose, args.identity.json);

    let service = service_name_from_address(&args.address);
    let shutdown = Shutdown::new();
    shutdown.on_ctrl_c();

    let config = args.identity.config();
    let contexts = args.identity.contexts(&config, &shutdown).await.map_err(staged)?;

    if !contexts.check_identity_is_valid(service).await {
        if shutdown.is_cancelled() {
            return Err(staged(OverlayError::Cancelled));
        }
        return Err(staged(OverlayError::NoSuchService(service.to_string())));
    }

    let stream = contexts.dial_address(&args.address).await.map_err(staged)?;
    info!(service = %service, "Service reachable");

    if let Some(count) = args.modbus {
        let values = read_holding_registers(stream, count).await?;
        println!("{:?}", values);
    }

    Ok(())
}

async fn read_holding_registers(mut stream: OverlayStream, quantity: u16) -> Result<Vec<u16>> {
    let request = modbus::encode_request(&Frame {
        transaction_id: 1,
        unit_id: 1,
        body: Request::ReadHoldingRegisters { address: 0, quantity },
    });
    stream.write_all(&request).await.context("Failed to send Modbus request")?;

    let mut buf = Vec::with_capacity(MAX_ADU_LEN);
    let mut chunk = [0u8; MAX_ADU_LEN];
    let frame = loop {
        if let Some((frame, _)) = modbus::decode_response(&buf).map_err(staged)? {
            break frame;
        }
        let n = stream.read(&mut chunk).await.context("Failed to read Modbus response")?;
        if n == 0 {
            bail!("Peripheral closed the connection before responding");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    match frame.body {
        Response::Registers { values, .. } => Ok(values),
        Response::Exception { code, .. } => {
            warn!(code = %code, "Peripheral answered with an exception");
            bail!("Modbus exception: {}", code)
        }
        other => bail!("Unexpected Modbus response: {:?}", other),
    }
}
