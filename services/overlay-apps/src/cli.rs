//! Command line options shared by the sample binaries

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use overlay_sdk::config::DEFAULT_BROKER_URL;
use overlay_sdk::{
    acquire_contexts, ContextCollection, ControllerEnroller, ControllerTransport, OverlayConfig,
    OverlayError, Shutdown,
};

#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Enrollment broker that provisions demo identities
    #[arg(
        short = 'a',
        long = "broker",
        env = "OVERLAY_BROKER_URL",
        default_value = DEFAULT_BROKER_URL
    )]
    pub broker: String,

    /// Identity file to use instead of the environment list or the default file
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json: bool,
}

impl IdentityArgs {
    /// Environment configuration with the command line applied on top
    pub fn config(&self) -> OverlayConfig {
        OverlayConfig::from_env().with_broker_url(self.broker.clone())
    }

    /// Load or enroll identities against the real controller. Outstanding
    /// controller calls return `Cancelled` once `shutdown` fires.
    pub async fn contexts(
        &self,
        config: &OverlayConfig,
        shutdown: &Shutdown,
    ) -> Result<ContextCollection, OverlayError> {
        let transport = Arc::new(ControllerTransport::new(config.request_timeout));
        let enroller = ControllerEnroller::new(config.request_timeout)?;
        let explicit = self.identity.as_deref();
        acquire_contexts(config, explicit, transport, &enroller, shutdown).await
    }
}

/// Operator-facing error naming the failed stage
pub fn staged(e: OverlayError) -> anyhow::Error {
    anyhow::anyhow!("{} failed: {}", e.stage(), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Demo {
        #[command(flatten)]
        identity: IdentityArgs,
    }

    #[test]
    fn test_short_flags() {
        let demo =
            Demo::parse_from(["demo", "-a", "http://127.0.0.1:9000", "-i", "mine.json", "-v"]);
        assert_eq!(demo.identity.broker, "http://127.0.0.1:9000");
        assert_eq!(demo.identity.identity, Some(PathBuf::from("mine.json")));
        assert!(demo.identity.verbose);
        assert!(!demo.identity.json);
        assert_eq!(demo.identity.config().broker_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_staged_names_the_stage() {
        let e = staged(OverlayError::NoSuchService("PostgresDemo".to_string()));
        assert_eq!(
            e.to_string(),
            "resolution failed: Service [PostgresDemo] is not available by any overlay context"
        );
    }
}
