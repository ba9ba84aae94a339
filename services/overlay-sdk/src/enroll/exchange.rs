//! Certificate exchange with the controller

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::token::{EnrollmentToken, ONE_TIME_TOKEN_METHOD};
use crate::error::{OverlayError, Result};
use crate::identity::{split_pem_chain, IdentityMaterial};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Turns a one-time token into key material
#[async_trait]
pub trait EnrollmentExchange: Send + Sync {
    async fn exchange(&self, token: &EnrollmentToken) -> Result<IdentityMaterial>;
}

/// JSON form of the enrollment response
#[derive(Debug, Deserialize)]
struct EnrollResponse {
    data: EnrolledCert,
}

#[derive(Debug, Deserialize)]
struct EnrolledCert {
    cert: String,
    #[serde(default)]
    ca: Option<String>,
}

/// Enrolls against the controller named in the token: fresh key pair, CSR,
/// signed certificate back
pub struct ControllerEnroller {
    http_client: Client,
}

impl ControllerEnroller {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| OverlayError::Enrollment(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl EnrollmentExchange for ControllerEnroller {
    async fn exchange(&self, token: &EnrollmentToken) -> Result<IdentityMaterial> {
        let key_pair = KeyPair::generate()
            .map_err(|e| OverlayError::Enrollment(format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, token.claims().sub.clone());
        let csr = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| OverlayError::Enrollment(format!("CSR generation failed: {}", e)))?;

        let url = format!(
            "{}/edge/client/v1/enroll?method={}&token={}",
            token.controller(),
            ONE_TIME_TOKEN_METHOD,
            urlencoding::encode(token.secret())
        );
        debug!(controller = %token.controller(), "Submitting enrollment CSR");

        let response = self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, PEM_CONTENT_TYPE)
            .header(ACCEPT, format!("{}, application/json", PEM_CONTENT_TYPE))
            .body(csr)
            .send()
            .await
            .map_err(|e| OverlayError::Enrollment(format!("controller unreachable: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(OverlayError::Enrollment(format!(
                "controller returned {}: {}",
                status, body
            )));
        }

        let (cert, ca) = parse_enrollment_response(&body)?;
        info!(controller = %token.controller(), "Enrollment certificate issued");

        Ok(IdentityMaterial {
            key: key_pair.serialize_pem(),
            cert,
            ca,
        })
    }
}

/// First certificate is the identity's own, the remainder is the chain
fn parse_enrollment_response(body: &str) -> Result<(String, Option<String>)> {
    let (pem, extra_ca) = if body.trim_start().starts_with('{') {
        let parsed: EnrollResponse = serde_json::from_str(body).map_err(|e| {
            OverlayError::Enrollment(format!("unreadable enrollment response: {}", e))
        })?;
        (parsed.data.cert, parsed.data.ca)
    } else {
        (body.to_string(), None)
    };

    let mut certs = split_pem_chain(&pem);
    if certs.is_empty() {
        return Err(OverlayError::Enrollment(
            "enrollment response carried no certificate".to_string(),
        ));
    }
    let cert = certs.remove(0);

    let mut chain = certs.concat();
    if let Some(ca) = extra_ca {
        chain.push_str(&ca);
    }
    let ca = if chain.is_empty() { None } else { Some(chain) };

    Ok((cert, ca))
}
