//! Overlay Context
//!
//! One authenticated session for one credential bundle. Authentication runs
//! at most once per context: concurrent first callers share the in-flight
//! attempt, and a failure is final for the life of the context.
//!
//! Grants can change on the controller at any time. `has_service` always asks
//! the controller; `dial` and `listen` reuse a catalog snapshot only while it
//! is younger than the catalog max age. Every network wait also returns
//! [`OverlayError::Cancelled`] once the context's shutdown signal fires.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::error::{OverlayError, Result};
use crate::identity::CredentialBundle;
use crate::serve::{OverlayListener, Shutdown};
use crate::transport::{OverlaySession, OverlayStream, OverlayTransport, ServiceDescriptor};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CATALOG_MAX_AGE: Duration = Duration::from_secs(30);

/// Authentication state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Failed,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Unauthenticated => write!(f, "unauthenticated"),
            AuthState::Authenticated => write!(f, "authenticated"),
            AuthState::Failed => write!(f, "failed"),
        }
    }
}

type SessionOutcome = std::result::Result<Box<dyn OverlaySession>, String>;

struct CatalogSnapshot {
    services: Vec<ServiceDescriptor>,
    fetched_at: Instant,
}

pub struct OverlayContext {
    bundle: Arc<CredentialBundle>,
    transport: Arc<dyn OverlayTransport>,
    session: OnceCell<SessionOutcome>,
    catalog: RwLock<Option<CatalogSnapshot>>,
    catalog_max_age: Duration,
    dial_timeout: Duration,
    shutdown: Shutdown,
    span: Span,
}

impl std::fmt::Debug for OverlayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayContext")
            .field("identity", &self.bundle.name)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl OverlayContext {
    pub fn new(bundle: CredentialBundle, transport: Arc<dyn OverlayTransport>) -> Self {
        let span = info_span!("overlay_context", identity = %bundle.name);
        Self {
            bundle: Arc::new(bundle),
            transport,
            session: OnceCell::new(),
            catalog: RwLock::new(None),
            catalog_max_age: DEFAULT_CATALOG_MAX_AGE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            shutdown: Shutdown::new(),
            span,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// How long `dial` and `listen` may trust a catalog snapshot
    pub fn with_catalog_max_age(mut self, max_age: Duration) -> Self {
        self.catalog_max_age = max_age;
        self
    }

    /// Abort authentication, catalog fetches, dials and binds when `shutdown`
    /// fires
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn bundle(&self) -> &CredentialBundle {
        &self.bundle
    }

    /// Name reported by the controller once authenticated, the bundle's
    /// name before that
    pub fn identity_name(&self) -> &str {
        match self.session.get() {
            Some(Ok(session)) => session.identity_name(),
            _ => &self.bundle.name,
        }
    }

    pub fn state(&self) -> AuthState {
        match self.session.get() {
            None => AuthState::Unauthenticated,
            Some(Ok(_)) => AuthState::Authenticated,
            Some(Err(_)) => AuthState::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state() == AuthState::Failed
    }

    /// Authenticate now. Idempotent once it has succeeded; after a failure
    /// every call returns the same error without contacting the controller.
    pub async fn authenticate(&self) -> Result<()> {
        self.cancellable(self.session()).await.map(|_| ())
    }

    /// Race `operation` against the shutdown signal. An abandoned
    /// authentication leaves the cell empty for the next caller.
    async fn cancellable<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(OverlayError::Cancelled),
            outcome = operation => outcome,
        }
    }

    async fn session(&self) -> Result<&dyn OverlaySession> {
        let outcome = self
            .session
            .get_or_init(|| {
                async {
                    info!(transport = self.transport.kind(), "Authenticating identity");
                    match self.transport.authenticate(&self.bundle).await {
                        Ok(session) => {
                            info!(identity = session.identity_name(), "Identity authenticated");
                            Ok(session)
                        }
                        Err(e) => {
                            warn!(error = %e, "Authentication failed; context disabled");
                            Err(match e {
                                OverlayError::Auth { reason, .. } => reason,
                                other => other.to_string(),
                            })
                        }
                    }
                }
                .instrument(self.span.clone())
            })
            .await;

        match outcome {
            Ok(session) => Ok(session.as_ref()),
            Err(reason) => Err(OverlayError::Auth {
                identity: self.bundle.name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Fresh catalog from the controller. Requires a prior `authenticate`.
    pub async fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let session = match self.session.get() {
            Some(Ok(session)) => session.as_ref(),
            _ => return Err(OverlayError::NotAuthenticated(self.bundle.name.clone())),
        };
        self.cancellable(self.refresh_catalog(session)).await
    }

    /// Whether the controller currently grants `name`. Authenticates lazily
    /// and always fetches a fresh catalog, so a revoked grant is seen on the
    /// next call. `false` covers "not granted", a failed context, a failed
    /// fetch and shutdown.
    pub async fn has_service(&self, name: &str) -> bool {
        let found = self
            .cancellable(async {
                let session = self.session().await?;
                let services = self.refresh_catalog(session).await?;
                Ok::<_, OverlayError>(services.iter().any(|s| s.name == name))
            })
            .await;

        match found {
            Ok(found) => found,
            Err(e @ OverlayError::Auth { .. }) | Err(e @ OverlayError::Cancelled) => {
                debug!(parent: &self.span, service = %name, error = %e, "Service check skipped");
                false
            }
            Err(e) => {
                warn!(parent: &self.span, service = %name, error = %e, "Catalog refresh failed");
                false
            }
        }
    }

    /// Open a stream to `name`, authenticating first if needed
    pub async fn dial(&self, name: &str) -> Result<OverlayStream> {
        self.cancellable(async {
            let session = self.session().await?;
            let service = match self.lookup(session, name).await? {
                Some(s) if s.permissions.dial => s,
                _ => return Err(OverlayError::ServiceUnavailable(name.to_string())),
            };

            debug!(parent: &self.span, service = %name, "Dialing service");
            let dialed = tokio::time::timeout(self.dial_timeout, session.dial(&service))
                .await
                .map_err(|_| OverlayError::timeout("dial", self.dial_timeout))?;

            if let Err(OverlayError::ServiceUnavailable(_)) = &dialed {
                // The controller no longer grants what the snapshot listed
                self.invalidate_catalog();
            }
            dialed
        })
        .await
    }

    /// Bind `name` for inbound connections; requires bind permission
    pub async fn listen(&self, name: &str) -> Result<OverlayListener> {
        self.cancellable(async {
            let session = self.session().await?;
            let service = match self.lookup(session, name).await? {
                Some(s) if s.permissions.bind => s,
                Some(_) => {
                    return Err(OverlayError::Bind {
                        service: name.to_string(),
                        reason: format!("identity {} has no bind permission", self.identity_name()),
                    })
                }
                None => {
                    return Err(OverlayError::Bind {
                        service: name.to_string(),
                        reason: "service is not in the catalog".to_string(),
                    })
                }
            };

            let acceptor = match session.bind(&service).await {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    self.invalidate_catalog();
                    return Err(e);
                }
            };
            info!(parent: &self.span, service = %name, "Listening on service");
            Ok(OverlayListener::new(acceptor, self.span.clone()))
        })
        .await
    }

    /// Descriptor for `name` from a snapshot younger than the max age,
    /// fetching a new one when the snapshot is stale or lacks `name`
    async fn lookup(
        &self,
        session: &dyn OverlaySession,
        name: &str,
    ) -> Result<Option<ServiceDescriptor>> {
        if let Some(found) = self.cached(name) {
            return Ok(Some(found));
        }
        let services = self.refresh_catalog(session).await?;
        Ok(services.into_iter().find(|s| s.name == name))
    }

    fn cached(&self, name: &str) -> Option<ServiceDescriptor> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = catalog.as_ref()?;
        if snapshot.fetched_at.elapsed() >= self.catalog_max_age {
            return None;
        }
        snapshot.services.iter().find(|s| s.name == name).cloned()
    }

    fn invalidate_catalog(&self) {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn refresh_catalog(
        &self,
        session: &dyn OverlaySession,
    ) -> Result<Vec<ServiceDescriptor>> {
        let services = session.services().instrument(self.span.clone()).await?;
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Some(CatalogSnapshot {
            services: services.clone(),
            fetched_at: Instant::now(),
        });
        Ok(services)
    }
}
