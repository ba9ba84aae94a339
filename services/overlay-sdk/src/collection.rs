//! Context Collection and service resolver
//!
//! Contexts are registered once at startup through [`CollectionBuilder`];
//! the built collection is immutable and cheap to clone. Resolution is a
//! linear, first-match scan in registration order.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::OverlayContext;
use crate::error::{OverlayError, Result};
use crate::serve::Shutdown;
use crate::transport::OverlayStream;

/// Registration phase
#[derive(Default)]
pub struct CollectionBuilder {
    contexts: Vec<Arc<OverlayContext>>,
    shutdown: Option<Shutdown>,
}

impl std::fmt::Debug for CollectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionBuilder")
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl CollectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share `shutdown` with every context registered after this call
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn add(mut self, context: OverlayContext) -> Self {
        self.push(context);
        self
    }

    pub fn push(&mut self, context: OverlayContext) {
        let context = match &self.shutdown {
            Some(shutdown) => context.with_shutdown(shutdown.clone()),
            None => context,
        };
        self.contexts.push(Arc::new(context));
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn build(self) -> ContextCollection {
        ContextCollection {
            contexts: self.contexts.into(),
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

/// Immutable, ordered set of overlay contexts
#[derive(Clone)]
pub struct ContextCollection {
    contexts: Arc<[Arc<OverlayContext>]>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for ContextCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCollection")
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl ContextCollection {
    pub fn builder() -> CollectionBuilder {
        CollectionBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<OverlayContext>> {
        self.contexts.iter()
    }

    pub fn first(&self) -> Option<&Arc<OverlayContext>> {
        self.contexts.first()
    }

    /// Earliest-registered context that the controller currently grants
    /// `service`. Failed contexts are skipped without being consulted.
    pub async fn resolve(&self, service: &str) -> Result<Arc<OverlayContext>> {
        for context in self.contexts.iter() {
            if self.shutdown.is_cancelled() {
                return Err(OverlayError::Cancelled);
            }
            if context.is_failed() {
                continue;
            }
            if context.has_service(service).await {
                return Ok(context.clone());
            }
        }
        if self.shutdown.is_cancelled() {
            return Err(OverlayError::Cancelled);
        }
        Err(OverlayError::NoSuchService(service.to_string()))
    }

    /// Resolve, then dial on the winning context
    pub async fn dial_by_service(&self, service: &str) -> Result<OverlayStream> {
        let context = self.resolve(service).await?;
        info!(service = %service, identity = %context.identity_name(), "Dialing service");
        context.dial(service).await
    }

    /// Pre-flight check: does any context grant `service`
    pub async fn any_grants(&self, service: &str) -> bool {
        self.resolve(service).await.is_ok()
    }

    /// Dial a `host:port` shaped address; the host is the service name and
    /// the port is ignored
    pub async fn dial_address(&self, address: &str) -> Result<OverlayStream> {
        self.dial_by_service(service_name_from_address(address)).await
    }

    /// Authenticate every context concurrently, log the services each one
    /// grants and report whether any of them grants `service`
    pub async fn check_identity_is_valid(&self, service: &str) -> bool {
        let mut found = false;
        let outcomes = join_all(self.contexts.iter().map(|c| c.authenticate())).await;

        for (context, outcome) in self.contexts.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(
                    identity = %context.bundle().name,
                    stage = %e.stage(),
                    error = %e,
                    "Unable to authenticate; delete the saved identity file to enroll a fresh one"
                );
                continue;
            }

            match context.list_services().await {
                Ok(services) => {
                    let identity = context.identity_name();
                    for s in &services {
                        info!(identity = %identity, service = %s.name, "Available service");
                    }
                    found |= services.iter().any(|s| s.name == service);
                }
                Err(e) => warn!(
                    identity = %context.identity_name(),
                    error = %e,
                    "Unable to list services"
                ),
            }
        }

        found
    }
}

/// Strip a trailing `:port` from a dial address
pub fn service_name_from_address(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => address,
    }
}
