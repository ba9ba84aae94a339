//! Runtime configuration
//!
//! Defaults match the public demo network; every value can be overridden from
//! the environment (`OVERLAY_*`) or by the binaries' command line.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Broker that hands out temporary demo identities
pub const DEFAULT_BROKER_URL: &str = "https://aperitivo.production.netfoundry.io";
/// Provisioning endpoint on the broker
pub const DEFAULT_PROVISIONING_PATH: &str = "/aperitivo/v1/identities";
/// Identity file written to, and read from, the working directory
pub const DEFAULT_IDENTITY_FILE: &str = "taste_of_ziti.json";
/// Environment variable holding a `;`-separated list of identity files
pub const DEFAULT_IDENTITIES_ENV: &str = "OVERLAY_IDENTITIES";

/// SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Enrollment broker base URL
    pub broker_url: String,
    /// Path appended to `broker_url` for provisioning requests
    pub provisioning_path: String,
    /// Identity file used when no explicit path or env list is given
    pub default_identity_file: PathBuf,
    /// Name of the environment variable listing identity files
    pub identities_env: String,
    /// Capability strings sent to the broker (e.g. "modbus")
    pub enrollment_options: Vec<String>,
    /// Deadline for broker and controller HTTP requests
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Deadline for establishing a stream to a service
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            provisioning_path: DEFAULT_PROVISIONING_PATH.to_string(),
            default_identity_file: PathBuf::from(DEFAULT_IDENTITY_FILE),
            identities_env: DEFAULT_IDENTITIES_ENV.to_string(),
            enrollment_options: Vec::new(),
            request_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(15),
        }
    }
}

impl OverlayConfig {
    /// Defaults overlaid with `OVERLAY_BROKER_URL`, `OVERLAY_IDENTITY_FILE`
    /// and `OVERLAY_DIAL_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("OVERLAY_BROKER_URL") {
            config.broker_url = url;
        }
        if let Ok(path) = env::var("OVERLAY_IDENTITY_FILE") {
            config.default_identity_file = PathBuf::from(path);
        }
        if let Some(secs) = env::var("OVERLAY_DIAL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.dial_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_default_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_identity_file = path.into();
        self
    }

    /// Add a capability string requested from the broker
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.enrollment_options.push(option.into());
        self
    }

    /// Full provisioning URL
    pub fn provisioning_url(&self) -> String {
        format!(
            "{}/{}",
            self.broker_url.trim_end_matches('/'),
            self.provisioning_path.trim_start_matches('/')
        )
    }
}

/// Timeouts and limits for the listen/serve loop
#[derive(Debug, Clone, Copy)]
pub struct ServeConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Largest request frame accepted before the connection is closed
    pub max_frame_len: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            max_frame_len: 64 * 1024,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
