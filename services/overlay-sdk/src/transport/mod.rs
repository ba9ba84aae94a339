//! Overlay transport seam
//!
//! The SDK treats the overlay network as an opaque capability: authenticate
//! a credential bundle, list the services it may reach, dial one, bind one.
//! Concrete fabrics implement [`OverlayTransport`]; contexts only ever hold a
//! `dyn OverlayTransport`.

pub mod controller;
pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::identity::CredentialBundle;

pub use controller::ControllerTransport;
pub use loopback::LoopbackFabric;

/// Metadata key carrying the target host of a directly reachable service
pub const HOST_ADDRESS_KEY: &str = "host.v1.address";
/// Metadata key carrying the target port of a directly reachable service
pub const HOST_PORT_KEY: &str = "host.v1.port";

/// Bidirectional byte stream carried by the overlay
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type OverlayStream = Box<dyn ByteStream>;

/// What an identity may do with a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub dial: bool,
    pub bind: bool,
}

impl Permissions {
    pub const DIAL: Permissions = Permissions {
        dial: true,
        bind: false,
    };
    pub const BIND: Permissions = Permissions {
        dial: false,
        bind: true,
    };
    pub const DIAL_BIND: Permissions = Permissions {
        dial: true,
        bind: true,
    };
}

/// Service access descriptor from a catalog refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            name: name.into(),
            permissions,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An overlay network implementation
#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &str;

    /// One authentication exchange with the controller
    async fn authenticate(&self, bundle: &CredentialBundle) -> Result<Box<dyn OverlaySession>>;
}

/// Authenticated session for one identity
#[async_trait]
pub trait OverlaySession: Send + Sync {
    /// Identity name as reported by the controller
    fn identity_name(&self) -> &str;

    /// Fresh catalog snapshot
    async fn services(&self) -> Result<Vec<ServiceDescriptor>>;

    async fn dial(&self, service: &ServiceDescriptor) -> Result<OverlayStream>;

    async fn bind(&self, service: &ServiceDescriptor) -> Result<Box<dyn Acceptor>>;
}

/// Inbound connection with a peer label for logs
pub struct Inbound {
    pub stream: OverlayStream,
    pub peer: String,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound").field("peer", &self.peer).finish()
    }
}

/// Accepting side of a bound service
#[async_trait]
pub trait Acceptor: Send {
    fn service(&self) -> &str;

    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<Inbound>;
}
