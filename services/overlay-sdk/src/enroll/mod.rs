//! Enrollment Client
//!
//! Provisioning is three steps: ask the broker for a one-time token, trade
//! the token for a certificate, persist the bundle. Any failure leaves the
//! identity path untouched; a consumed token is never retried.

pub mod exchange;
pub mod token;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::identity::{store, CredentialBundle};

pub use exchange::{ControllerEnroller, EnrollmentExchange};
pub use token::{EnrollmentClaims, EnrollmentToken};

/// Provisioning request body
#[derive(Debug, Clone, Serialize)]
struct ProvisioningRequest<'a> {
    options: &'a [String],
}

/// Broker answer to a provisioning request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedIdentity {
    pub name: String,
    pub jwt: String,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Client for the enrollment broker
pub struct EnrollmentClient {
    http_client: Client,
    provisioning_url: String,
    options: Vec<String>,
}

impl EnrollmentClient {
    pub fn new(config: &OverlayConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                OverlayError::BrokerUnreachable(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http_client,
            provisioning_url: config.provisioning_url(),
            options: config.enrollment_options.clone(),
        })
    }

    /// Ask the broker for a new temporary identity
    pub async fn request_identity(&self, options: &[String]) -> Result<IssuedIdentity> {
        info!(url = %self.provisioning_url, options = ?options, "Requesting identity from broker");

        let response = self
            .http_client
            .post(&self.provisioning_url)
            .json(&ProvisioningRequest { options })
            .send()
            .await
            .map_err(|e| OverlayError::BrokerUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OverlayError::Broker {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<IssuedIdentity>()
            .await
            .map_err(|e| OverlayError::BrokerUnreachable(format!("invalid broker response: {}", e)))
    }

    /// Request, enroll and persist in one go. Nothing is written unless every
    /// step succeeded.
    #[instrument(skip(self, path, exchange), fields(path = %path.display()))]
    pub async fn provision(
        &self,
        path: &Path,
        exchange: &dyn EnrollmentExchange,
    ) -> Result<CredentialBundle> {
        let issued = self.request_identity(&self.options).await?;
        let token = EnrollmentToken::parse(&issued.jwt)?;

        let mut bundle = enroll(&token, &issued.name, exchange).await?;
        bundle.valid_until = issued.valid_until;

        store::save(&bundle, path)?;

        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        match bundle.valid_until {
            Some(until) => info!(
                identity = %bundle.name,
                path = %absolute.display(),
                valid_until = %rfc1123(until),
                "Identity enrolled; it will be removed by the broker after the validity window"
            ),
            None => info!(identity = %bundle.name, path = %absolute.display(), "Identity enrolled"),
        }

        Ok(bundle)
    }
}

/// Trade a token for a credential bundle. An expired token fails before any
/// controller traffic.
pub async fn enroll(
    token: &EnrollmentToken,
    name: &str,
    exchange: &dyn EnrollmentExchange,
) -> Result<CredentialBundle> {
    token.ensure_valid_at(Utc::now())?;

    let material = exchange.exchange(token).await?;
    let bundle = CredentialBundle {
        name: name.to_string(),
        controllers: vec![token.controller().to_string()],
        id: material,
        valid_until: None,
    };

    bundle.validate().map_err(|reason| {
        OverlayError::Enrollment(format!("issued identity is invalid: {}", reason))
    })?;

    Ok(bundle)
}

pub(crate) fn rfc1123(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
