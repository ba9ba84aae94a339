//! Petstore HTTP client over the overlay
//!
//! Resolves the URL host as a logical service name, dials it through the
//! first identity that grants it and prints the response body. Identities are
//! authenticated lazily by the resolver.
//!
//! ## Usage
//! ```bash
//! # Enroll a demo identity on first run, then query the demo petstore
//! petstore-client
//!
//! # Explicit identity and URL
//! petstore-client -i ./petstore.json \
//!   -q "http://PetstoreDemo/api/v3/pet/findByStatus?status=sold"
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use overlay_apps::cli::{staged, IdentityArgs};
use overlay_apps::http::{fetch, split_url, HttpError};
use overlay_sdk::telemetry::init_tracing;
use overlay_sdk::Shutdown;

/// HTTP client that dials its server by service name
#[derive(Parser, Debug)]
#[command(name = "petstore-client")]
#[command(about = "Query the demo petstore through the overlay")]
#[command(version)]
struct Args {
    #[command(flatten)]
    identity: IdentityArgs,

    /// URL to fetch; its host is the overlay service name
    #[arg(
        short,
        long,
        default_value = "http://PetstoreDemo/api/v3/pet/findByStatus?status=available"
    )]
    query: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.identity.verbose, args.identity.json);

    let (service, _) = split_url(&args.query).context("Invalid query URL")?;
    let shutdown = Shutdown::new();
    shutdown.on_ctrl_c();

    let config = args.identity.config();
    let contexts = args.identity.contexts(&config, &shutdown).await.map_err(staged)?;

    if !contexts.any_grants(&service).await {
        warn!(service = %service, "No identity grants this service; the request will fail");
    }

    let response = match fetch(&contexts, &args.query).await {
        Ok(response) => response,
        Err(HttpError::Overlay(e)) => return Err(staged(e)),
        Err(e) => return Err(e).context("HTTP request failed"),
    };

    if response.is_success() {
        info!(service = %service, bytes = response.body.len(), "Request succeeded");
    } else {
        warn!(service = %service, status = %response.status, "Unexpected response status");
    }
    println!("{}", response.text());

    Ok(())
}
