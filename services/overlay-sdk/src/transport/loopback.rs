//! In-memory overlay fabric
//!
//! Stands in for a real controller and router mesh in tests and local runs.
//! Grants are kept per identity name; a dial is paired with the bound
//! acceptor for the service through a `tokio::io::duplex` pipe.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    Acceptor, Inbound, OverlaySession, OverlayStream, OverlayTransport, Permissions,
    ServiceDescriptor,
};
use crate::error::{OverlayError, Result};
use crate::identity::CredentialBundle;

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 32;

#[derive(Default)]
struct FabricState {
    grants: HashMap<String, Vec<ServiceDescriptor>>,
    rejected: HashSet<String>,
    authentications: HashMap<String, usize>,
    catalog_fetches: HashMap<String, usize>,
    listeners: HashMap<String, Listener>,
}

struct Listener {
    id: Uuid,
    tx: mpsc::Sender<Inbound>,
}

/// Shared in-memory overlay; clones see the same state
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
    auth_latency: Duration,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every authentication exchange
    pub fn with_auth_latency(mut self, latency: Duration) -> Self {
        self.auth_latency = latency;
        self
    }

    /// Grant `identity` access to `service`, replacing an earlier grant
    pub fn grant(&self, identity: &str, service: &str, permissions: Permissions) {
        self.grant_descriptor(identity, ServiceDescriptor::new(service, permissions));
    }

    pub fn grant_descriptor(&self, identity: &str, descriptor: ServiceDescriptor) {
        let mut state = self.lock();
        let services = state.grants.entry(identity.to_string()).or_default();
        services.retain(|s| s.name != descriptor.name);
        services.push(descriptor);
    }

    pub fn revoke(&self, identity: &str, service: &str) {
        if let Some(services) = self.lock().grants.get_mut(identity) {
            services.retain(|s| s.name != service);
        }
    }

    /// Make the controller refuse this identity
    pub fn reject(&self, identity: &str) {
        self.lock().rejected.insert(identity.to_string());
    }

    /// Number of authentication exchanges seen for `identity`
    pub fn authentications(&self, identity: &str) -> usize {
        self.lock()
            .authentications
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Number of catalog refreshes seen for `identity`
    pub fn catalog_fetches(&self, identity: &str) -> usize {
        self.lock()
            .catalog_fetches
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_bound(&self, service: &str) -> bool {
        self.lock()
            .listeners
            .get(service)
            .map(|l| !l.tx.is_closed())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OverlayTransport for LoopbackFabric {
    fn kind(&self) -> &str {
        "loopback"
    }

    async fn authenticate(&self, bundle: &CredentialBundle) -> Result<Box<dyn OverlaySession>> {
        let rejected = {
            let mut state = self.lock();
            *state.authentications.entry(bundle.name.clone()).or_insert(0) += 1;
            state.rejected.contains(&bundle.name)
        };

        if !self.auth_latency.is_zero() {
            tokio::time::sleep(self.auth_latency).await;
        }

        if rejected {
            return Err(OverlayError::Auth {
                identity: bundle.name.clone(),
                reason: "identity rejected by controller".to_string(),
            });
        }

        let session = LoopbackSession {
            fabric: self.clone(),
            identity: bundle.name.clone(),
            token: Uuid::new_v4(),
        };
        debug!(identity = %session.identity, token = %session.token, "Loopback session issued");
        Ok(Box::new(session))
    }
}

struct LoopbackSession {
    fabric: LoopbackFabric,
    identity: String,
    token: Uuid,
}

impl LoopbackSession {
    fn granted(&self, service: &str) -> Option<ServiceDescriptor> {
        self.fabric
            .lock()
            .grants
            .get(&self.identity)
            .and_then(|services| services.iter().find(|s| s.name == service).cloned())
    }
}

#[async_trait]
impl OverlaySession for LoopbackSession {
    fn identity_name(&self) -> &str {
        &self.identity
    }

    async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        let mut state = self.fabric.lock();
        *state
            .catalog_fetches
            .entry(self.identity.clone())
            .or_insert(0) += 1;
        Ok(state.grants.get(&self.identity).cloned().unwrap_or_default())
    }

    async fn dial(&self, service: &ServiceDescriptor) -> Result<OverlayStream> {
        // The controller enforces policy on its own, independent of the caller's cache
        match self.granted(&service.name) {
            Some(s) if s.permissions.dial => {}
            _ => return Err(OverlayError::ServiceUnavailable(service.name.clone())),
        }

        let tx = self
            .fabric
            .lock()
            .listeners
            .get(&service.name)
            .map(|l| l.tx.clone())
            .ok_or_else(|| OverlayError::ConnectionRefused(service.name.clone()))?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = Inbound {
            stream: Box::new(server),
            peer: self.identity.clone(),
        };
        tx.send(inbound)
            .await
            .map_err(|_| OverlayError::ConnectionRefused(service.name.clone()))?;

        Ok(Box::new(client))
    }

    async fn bind(&self, service: &ServiceDescriptor) -> Result<Box<dyn Acceptor>> {
        match self.granted(&service.name) {
            Some(s) if s.permissions.bind => {}
            _ => {
                return Err(OverlayError::Bind {
                    service: service.name.clone(),
                    reason: format!("identity {} may not bind", self.identity),
                })
            }
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let id = Uuid::new_v4();
        {
            let mut state = self.fabric.lock();
            if let Some(existing) = state.listeners.get(&service.name) {
                if !existing.tx.is_closed() {
                    return Err(OverlayError::Bind {
                        service: service.name.clone(),
                        reason: "service is already bound".to_string(),
                    });
                }
            }
            state
                .listeners
                .insert(service.name.clone(), Listener { id, tx });
        }

        Ok(Box::new(LoopbackAcceptor {
            fabric: self.fabric.clone(),
            service: service.name.clone(),
            id,
            rx,
        }))
    }
}

struct LoopbackAcceptor {
    fabric: LoopbackFabric,
    service: String,
    id: Uuid,
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl Acceptor for LoopbackAcceptor {
    fn service(&self) -> &str {
        &self.service
    }

    async fn accept(&mut self) -> Result<Inbound> {
        self.rx.recv().await.ok_or_else(|| OverlayError::Bind {
            service: self.service.clone(),
            reason: "listener closed".to_string(),
        })
    }
}

impl Drop for LoopbackAcceptor {
    fn drop(&mut self) {
        let mut state = self.fabric.lock();
        if state
            .listeners
            .get(&self.service)
            .map(|l| l.id == self.id)
            .unwrap_or(false)
        {
            state.listeners.remove(&self.service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::fixtures::bundle;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rejected_identity_fails_auth() {
        let fabric = LoopbackFabric::new();
        fabric.reject("mallory");

        let err = fabric.authenticate(&bundle("mallory")).await.err().unwrap();
        assert!(matches!(err, OverlayError::Auth { .. }));
        assert_eq!(fabric.authentications("mallory"), 1);
    }

    #[tokio::test]
    async fn test_dial_pairs_with_bound_acceptor() {
        let fabric = LoopbackFabric::new();
        fabric.grant("server", "echo", Permissions::BIND);
        fabric.grant("client", "echo", Permissions::DIAL);

        let server = fabric.authenticate(&bundle("server")).await.unwrap();
        let client = fabric.authenticate(&bundle("client")).await.unwrap();
        let echo = ServiceDescriptor::new("echo", Permissions::DIAL_BIND);

        let mut acceptor = server.bind(&echo).await.unwrap();
        assert!(fabric.is_bound("echo"));

        let mut outbound = client.dial(&echo).await.unwrap();
        outbound.write_all(b"ping").await.unwrap();

        let mut inbound = acceptor.accept().await.unwrap();
        assert_eq!(inbound.peer, "client");
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(acceptor);
        assert!(!fabric.is_bound("echo"));
    }

    #[tokio::test]
    async fn test_dial_without_listener_is_refused() {
        let fabric = LoopbackFabric::new();
        fabric.grant("client", "echo", Permissions::DIAL);
        let client = fabric.authenticate(&bundle("client")).await.unwrap();

        let err = client
            .dial(&ServiceDescriptor::new("echo", Permissions::DIAL))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OverlayError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_bind_requires_permission_and_is_exclusive() {
        let fabric = LoopbackFabric::new();
        fabric.grant("a", "svc", Permissions::DIAL);
        fabric.grant("b", "svc", Permissions::BIND);
        fabric.grant("c", "svc", Permissions::BIND);
        let svc = ServiceDescriptor::new("svc", Permissions::BIND);

        let a = fabric.authenticate(&bundle("a")).await.unwrap();
        assert!(matches!(a.bind(&svc).await, Err(OverlayError::Bind { .. })));

        let b = fabric.authenticate(&bundle("b")).await.unwrap();
        let c = fabric.authenticate(&bundle("c")).await.unwrap();
        let _held = b.bind(&svc).await.unwrap();
        assert!(matches!(c.bind(&svc).await, Err(OverlayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_catalog_reflects_live_grants() {
        let fabric = LoopbackFabric::new();
        let session = fabric.authenticate(&bundle("alice")).await.unwrap();
        assert!(session.services().await.unwrap().is_empty());

        fabric.grant("alice", "Foo", Permissions::DIAL);
        let names: Vec<String> = session
            .services()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Foo".to_string()]);
        assert_eq!(fabric.catalog_fetches("alice"), 2);

        fabric.revoke("alice", "Foo");
        assert!(session.services().await.unwrap().is_empty());
    }
}
