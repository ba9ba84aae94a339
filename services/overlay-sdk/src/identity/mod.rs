//! Credential bundles
//!
//! A bundle is the durable result of enrollment: the identity name, its
//! private key and certificate chain, and the controller endpoints it
//! authenticates against. Bundles are immutable once issued.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable network identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    /// Identity name as known to the controller
    pub name: String,
    /// Controller base URLs, first one preferred
    pub controllers: Vec<String>,
    /// Key material
    pub id: IdentityMaterial,
    /// When the broker will remove this identity, if temporary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// PEM-encoded key, certificate and trust chain
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMaterial {
    pub key: String,
    pub cert: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

// Never print the private key
impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .field("ca", &self.ca.as_ref().map(|c| c.len()))
            .finish()
    }
}

impl CredentialBundle {
    /// Preferred controller endpoint
    pub fn controller(&self) -> Option<&str> {
        self.controllers.first().map(String::as_str)
    }

    pub fn is_expired(&self) -> bool {
        self.valid_until.map(|t| t <= Utc::now()).unwrap_or(false)
    }

    /// Structural checks; a bundle failing these is never loaded or saved
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("identity name is empty".to_string());
        }
        if self.controllers.is_empty() {
            return Err("no controller endpoints".to_string());
        }
        if let Some(bad) = self
            .controllers
            .iter()
            .find(|c| !(c.starts_with("https://") || c.starts_with("http://")))
        {
            return Err(format!("controller endpoint is not an http(s) URL: {}", bad));
        }
        if !(self.id.key.contains("-----BEGIN") && self.id.key.contains("PRIVATE KEY-----")) {
            return Err("private key is not PEM encoded".to_string());
        }
        if !self.id.cert.contains("-----BEGIN CERTIFICATE-----")
            || !self.id.cert.contains("-----END CERTIFICATE-----")
        {
            return Err("certificate is not PEM encoded".to_string());
        }
        Ok(())
    }
}

/// Split a PEM chain into its individual certificate blocks, in order
pub fn split_pem_chain(chain: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";

    let mut certs = Vec::new();
    let mut rest = chain;
    while let Some(start) = rest.find("-----BEGIN CERTIFICATE-----") {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        certs.push(format!("{}\n", &rest[start..stop]));
        rest = &rest[stop..];
    }
    certs
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_valid_bundle() {
        let b = bundle("alice");
        assert!(b.validate().is_ok());
        assert_eq!(b.controller(), Some("https://ctrl.example.test:1280"));
        assert!(!b.is_expired());
    }

    #[test]
    fn test_validate_rejects_missing_pieces() {
        let mut b = bundle("alice");
        b.controllers.clear();
        assert!(b.validate().is_err());

        let mut b = bundle("alice");
        b.id.key = "not a key".to_string();
        assert!(b.validate().unwrap_err().contains("private key"));

        let mut b = bundle("alice");
        b.id.cert = "-----BEGIN CERTIFICATE-----\nMIIB".to_string();
        assert!(b.validate().unwrap_err().contains("certificate"));

        let mut b = bundle(" ");
        b.name = " ".to_string();
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", bundle("alice"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("MIGHAgEAMBMG"));
    }

    #[test]
    fn test_split_pem_chain() {
        let chain = format!("{}{}", CERT, CA);
        let certs = split_pem_chain(&chain);
        assert_eq!(certs.len(), 2);
        assert!(certs[0].contains("Q2xpZW50"));
        assert!(certs[1].contains("Y2Fyb290"));
        assert!(split_pem_chain("garbage").is_empty());
    }
}
