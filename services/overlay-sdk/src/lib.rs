//! Overlay SDK
//!
//! Identity-brokered dialing over an overlay network: provision and persist a
//! network identity, authenticate it into an overlay context, resolve logical
//! service names to byte streams across a collection of contexts, and serve
//! inbound connections on a bound service.

pub mod bootstrap;
pub mod collection;
pub mod config;
pub mod context;
pub mod enroll;
pub mod error;
pub mod identity;
pub mod serve;
pub mod telemetry;
pub mod transport;

pub use bootstrap::{acquire_contexts, select_identity_sources, IdentitySource};
pub use collection::{service_name_from_address, CollectionBuilder, ContextCollection};
pub use config::{OverlayConfig, ServeConfig};
pub use context::{AuthState, OverlayContext};
pub use enroll::{ControllerEnroller, EnrollmentClient, EnrollmentExchange, EnrollmentToken};
pub use error::{OverlayError, Result, Stage};
pub use identity::CredentialBundle;
pub use serve::{serve, ListenerState, OverlayListener, ServeSummary, ServiceProtocol, Shutdown};
pub use transport::{
    ControllerTransport, LoopbackFabric, OverlayStream, OverlayTransport, Permissions,
    ServiceDescriptor,
};
