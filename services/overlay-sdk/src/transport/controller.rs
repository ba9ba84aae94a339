//! Controller-backed transport
//!
//! Authenticates with the identity's client certificate against the edge
//! client API and reads the service catalog from it. Streams are opened in
//! direct mode: each service carries a `host.v1` config naming the address
//! and port that serve it, and dial/bind go straight over TCP.

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::{
    Acceptor, Inbound, OverlaySession, OverlayStream, OverlayTransport, Permissions,
    ServiceDescriptor, HOST_ADDRESS_KEY, HOST_PORT_KEY,
};
use crate::error::{OverlayError, Result};
use crate::identity::{split_pem_chain, CredentialBundle};

const SESSION_HEADER: &str = "zt-session";
const HOST_CONFIG_TYPE: &str = "host.v1";

/// Edge API response wrapper
#[derive(Debug, Deserialize)]
struct EdgeResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ApiSession {
    token: String,
    #[serde(default)]
    identity: Option<ApiIdentity>,
}

#[derive(Debug, Deserialize)]
struct ApiIdentity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EdgeService {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
}

impl From<EdgeService> for ServiceDescriptor {
    fn from(service: EdgeService) -> Self {
        let permissions = Permissions {
            dial: service.permissions.iter().any(|p| p.eq_ignore_ascii_case("dial")),
            bind: service.permissions.iter().any(|p| p.eq_ignore_ascii_case("bind")),
        };

        let mut metadata = HashMap::new();
        for (config_type, value) in &service.config {
            let Some(fields) = value.as_object() else {
                continue;
            };
            for (field, v) in fields {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                metadata.insert(format!("{}.{}", config_type, field), rendered);
            }
        }

        ServiceDescriptor {
            name: service.name,
            permissions,
            metadata,
        }
    }
}

/// Overlay transport talking to a real controller
#[derive(Debug, Clone)]
pub struct ControllerTransport {
    request_timeout: Duration,
}

impl ControllerTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    fn client_for(&self, bundle: &CredentialBundle) -> Result<Client> {
        let auth_err = |reason: String| OverlayError::Auth {
            identity: bundle.name.clone(),
            reason,
        };

        let pem = format!("{}\n{}", bundle.id.key.trim_end(), bundle.id.cert);
        let identity = Identity::from_pem(pem.as_bytes())
            .map_err(|e| auth_err(format!("invalid client certificate: {}", e)))?;

        let mut builder = Client::builder()
            .timeout(self.request_timeout)
            .identity(identity);

        for ca in bundle.id.ca.as_deref().map(split_pem_chain).unwrap_or_default() {
            let cert = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| auth_err(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| auth_err(format!("failed to create HTTP client: {}", e)))
    }
}

impl Default for ControllerTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl OverlayTransport for ControllerTransport {
    fn kind(&self) -> &str {
        "controller"
    }

    async fn authenticate(&self, bundle: &CredentialBundle) -> Result<Box<dyn OverlaySession>> {
        let controller = bundle
            .controller()
            .ok_or_else(|| OverlayError::Auth {
                identity: bundle.name.clone(),
                reason: "no controller endpoint".to_string(),
            })?
            .trim_end_matches('/')
            .to_string();

        let http_client = self.client_for(bundle)?;
        let url = format!("{}/edge/client/v1/authenticate?method=cert", controller);

        let response = http_client
            .post(&url)
            .json(&serde_json::json!({ "configTypes": [HOST_CONFIG_TYPE] }))
            .send()
            .await
            .map_err(|e| OverlayError::Auth {
                identity: bundle.name.clone(),
                reason: format!("controller unreachable: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OverlayError::Auth {
                identity: bundle.name.clone(),
                reason: format!("controller returned {}: {}", status, body),
            });
        }

        let session: EdgeResponse<ApiSession> =
            response.json().await.map_err(|e| OverlayError::Auth {
                identity: bundle.name.clone(),
                reason: format!("unreadable session: {}", e),
            })?;

        let identity = session
            .data
            .identity
            .map(|i| i.name)
            .unwrap_or_else(|| bundle.name.clone());

        info!(identity = %identity, controller = %controller, "Authenticated with controller");

        Ok(Box::new(ControllerSession {
            http_client,
            controller,
            identity,
            token: session.data.token,
        }))
    }
}

struct ControllerSession {
    http_client: Client,
    controller: String,
    identity: String,
    token: String,
}

#[async_trait]
impl OverlaySession for ControllerSession {
    fn identity_name(&self) -> &str {
        &self.identity
    }

    async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        let url = format!(
            "{}/edge/client/v1/services?limit=500&configTypes={}",
            self.controller,
            urlencoding::encode(HOST_CONFIG_TYPE)
        );

        let response = self
            .http_client
            .get(&url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| OverlayError::Controller(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(OverlayError::NotAuthenticated(self.identity.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OverlayError::Controller(format!(
                "service listing failed with {}: {}",
                status, body
            )));
        }

        let services: EdgeResponse<Vec<EdgeService>> = response
            .json()
            .await
            .map_err(|e| OverlayError::Controller(format!("unreadable service list: {}", e)))?;

        debug!(identity = %self.identity, count = services.data.len(), "Service catalog fetched");
        Ok(services.data.into_iter().map(ServiceDescriptor::from).collect())
    }

    async fn dial(&self, service: &ServiceDescriptor) -> Result<OverlayStream> {
        let (host, port) = direct_target(service).map_err(|reason| OverlayError::Dial {
            service: service.name.clone(),
            reason,
        })?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    OverlayError::ConnectionRefused(service.name.clone())
                }
                _ => OverlayError::Dial {
                    service: service.name.clone(),
                    reason: e.to_string(),
                },
            })?;
        let _ = stream.set_nodelay(true);

        Ok(Box::new(stream))
    }

    async fn bind(&self, service: &ServiceDescriptor) -> Result<Box<dyn Acceptor>> {
        let bind_err = |reason: String| OverlayError::Bind {
            service: service.name.clone(),
            reason,
        };

        let (host, port) = direct_target(service).map_err(bind_err)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| bind_err(e.to_string()))?;

        info!(service = %service.name, address = %format!("{}:{}", host, port), "Service bound");
        Ok(Box::new(TcpAcceptor {
            service: service.name.clone(),
            listener,
        }))
    }
}

struct TcpAcceptor {
    service: String,
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn service(&self) -> &str {
        &self.service
    }

    async fn accept(&mut self) -> Result<Inbound> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Inbound {
            stream: Box::new(stream),
            peer: peer.to_string(),
        })
    }
}

fn direct_target(service: &ServiceDescriptor) -> std::result::Result<(String, u16), String> {
    let host = service
        .metadata
        .get(HOST_ADDRESS_KEY)
        .ok_or_else(|| format!("service has no {} address", HOST_CONFIG_TYPE))?;
    let port = service
        .metadata
        .get(HOST_PORT_KEY)
        .ok_or_else(|| format!("service has no {} port", HOST_CONFIG_TYPE))?
        .parse::<u16>()
        .map_err(|e| format!("invalid {} port: {}", HOST_CONFIG_TYPE, e))?;
    Ok((host.clone(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{fixtures, IdentityMaterial};
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use rcgen::{CertificateParams, KeyPair};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bundle_for(controller: &str) -> CredentialBundle {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["alice".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let mut bundle = fixtures::bundle("alice");
        bundle.controllers = vec![controller.to_string()];
        bundle.id = IdentityMaterial {
            key: key.serialize_pem(),
            cert: cert.pem(),
            ca: None,
        };
        bundle
    }

    async fn spawn_controller(echo_port: u16) -> String {
        let services = move |headers: HeaderMap| async move {
            if headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) != Some("tok-1") {
                return Err(HttpStatus::UNAUTHORIZED);
            }
            Ok(Json(json!({
                "data": [
                    {
                        "name": "echo",
                        "permissions": ["Dial"],
                        "config": { "host.v1": { "address": "127.0.0.1", "port": echo_port } }
                    },
                    { "name": "reports", "permissions": ["Bind", "Dial"] }
                ]
            })))
        };

        let app = Router::new()
            .route(
                "/edge/client/v1/authenticate",
                post(|| async {
                    Json(json!({ "data": { "token": "tok-1", "identity": { "name": "alice" } } }))
                }),
            )
            .route("/edge/client/v1/services", get(services));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_edge_service_conversion() {
        let raw: EdgeService = serde_json::from_value(json!({
            "name": "db",
            "permissions": ["Dial"],
            "config": { "host.v1": { "address": "10.0.0.5", "port": 5432, "protocol": "tcp" } }
        }))
        .unwrap();

        let descriptor = ServiceDescriptor::from(raw);
        assert_eq!(descriptor.permissions, Permissions::DIAL);
        assert_eq!(descriptor.metadata[HOST_ADDRESS_KEY], "10.0.0.5");
        assert_eq!(descriptor.metadata[HOST_PORT_KEY], "5432");
        assert_eq!(direct_target(&descriptor).unwrap(), ("10.0.0.5".to_string(), 5432));
    }

    #[test]
    fn test_direct_target_requires_host_config() {
        let descriptor = ServiceDescriptor::new("bare", Permissions::DIAL);
        assert!(direct_target(&descriptor).unwrap_err().contains("address"));

        let descriptor = descriptor
            .with_metadata(HOST_ADDRESS_KEY, "localhost")
            .with_metadata(HOST_PORT_KEY, "not-a-port");
        assert!(direct_target(&descriptor).unwrap_err().contains("port"));
    }

    #[tokio::test]
    async fn test_authenticate_list_and_dial() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let controller = spawn_controller(echo_port).await;
        let transport = ControllerTransport::default();
        let session = transport
            .authenticate(&bundle_for(&controller))
            .await
            .unwrap();
        assert_eq!(session.identity_name(), "alice");

        let services = session.services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].permissions, Permissions::DIAL_BIND);

        let mut stream = session.dial(&services[0]).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let err = session.dial(&services[1]).await.err().unwrap();
        assert!(matches!(err, OverlayError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_auth_failure() {
        let transport = ControllerTransport::new(Duration::from_secs(2));
        let err = transport
            .authenticate(&bundle_for("http://127.0.0.1:9"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OverlayError::Auth { .. }));
    }
}
