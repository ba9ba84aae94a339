//! Identity source selection and startup
//!
//! Precedence: an explicit identity file, then the environment-supplied
//! list, then the default file. The default file is enrolled into only when
//! it does not exist yet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::collection::{CollectionBuilder, ContextCollection};
use crate::config::OverlayConfig;
use crate::context::OverlayContext;
use crate::enroll::{EnrollmentClient, EnrollmentExchange};
use crate::error::{OverlayError, Result};
use crate::identity::{store, CredentialBundle};
use crate::serve::Shutdown;
use crate::transport::OverlayTransport;

/// Where the identities for this run come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Explicit(PathBuf),
    Environment(Vec<PathBuf>),
    Default(PathBuf),
}

impl std::fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentitySource::Explicit(p) => write!(f, "explicit file {}", p.display()),
            IdentitySource::Environment(paths) => {
                write!(f, "environment list of {} file(s)", paths.len())
            }
            IdentitySource::Default(p) => write!(f, "default file {}", p.display()),
        }
    }
}

/// Apply the source precedence. An env value with no usable entries counts
/// as unset.
pub fn select_identity_sources(
    explicit: Option<&Path>,
    env_value: Option<&str>,
    default: &Path,
) -> IdentitySource {
    if let Some(path) = explicit {
        return IdentitySource::Explicit(path.to_path_buf());
    }

    let listed: Vec<PathBuf> = env_value
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if !listed.is_empty() {
        return IdentitySource::Environment(listed);
    }

    IdentitySource::Default(default.to_path_buf())
}

/// Build the context collection for this run, reading the identity list from
/// the environment variable named in `config`. Every context shares
/// `shutdown`.
pub async fn acquire_contexts(
    config: &OverlayConfig,
    explicit: Option<&Path>,
    transport: Arc<dyn OverlayTransport>,
    enroller: &dyn EnrollmentExchange,
    shutdown: &Shutdown,
) -> Result<ContextCollection> {
    let env_value = std::env::var(&config.identities_env).ok();
    let source = select_identity_sources(
        explicit,
        env_value.as_deref(),
        &config.default_identity_file,
    );
    acquire_from(source, config, transport, enroller, shutdown).await
}

/// Load (or enroll) every bundle named by `source`, in order
pub async fn acquire_from(
    source: IdentitySource,
    config: &OverlayConfig,
    transport: Arc<dyn OverlayTransport>,
    enroller: &dyn EnrollmentExchange,
    shutdown: &Shutdown,
) -> Result<ContextCollection> {
    info!(source = %source, "Acquiring identities");

    let bundles: Vec<CredentialBundle> = match source {
        IdentitySource::Explicit(path) => vec![store::load(&path)?],
        IdentitySource::Environment(paths) => paths
            .iter()
            .map(|p| store::load(p))
            .collect::<Result<Vec<_>>>()?,
        IdentitySource::Default(path) => {
            if store::exists(&path) {
                vec![store::load(&path)?]
            } else {
                info!(path = %path.display(), "No saved identity, enrolling a new one");
                let client = EnrollmentClient::new(config)?;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(OverlayError::Cancelled),
                    provisioned = client.provision(&path, enroller) => vec![provisioned?],
                }
            }
        }
    };

    let mut builder = CollectionBuilder::new().with_shutdown(shutdown.clone());
    for bundle in bundles {
        let context = OverlayContext::new(bundle, transport.clone());
        builder.push(context.with_dial_timeout(config.dial_timeout));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enroll::exchange::testing::CountingExchange;
    use crate::error::OverlayError;
    use crate::identity::fixtures::bundle;
    use crate::transport::LoopbackFabric;
    use tempfile::TempDir;

    #[test]
    fn test_precedence() {
        let default = Path::new("taste_of_ziti.json");

        assert_eq!(
            select_identity_sources(Some(Path::new("mine.json")), Some("a.json;b.json"), default),
            IdentitySource::Explicit(PathBuf::from("mine.json"))
        );
        assert_eq!(
            select_identity_sources(None, Some(" a.json ; b.json ;"), default),
            IdentitySource::Environment(vec![PathBuf::from("a.json"), PathBuf::from("b.json")])
        );
        assert_eq!(
            select_identity_sources(None, Some(" ; "), default),
            IdentitySource::Default(PathBuf::from("taste_of_ziti.json"))
        );
        assert_eq!(
            select_identity_sources(None, None, default),
            IdentitySource::Default(PathBuf::from("taste_of_ziti.json"))
        );
    }

    #[tokio::test]
    async fn test_environment_list_keeps_order() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        store::save(&bundle("first"), &first).unwrap();
        store::save(&bundle("second"), &second).unwrap();

        let contexts = acquire_from(
            IdentitySource::Environment(vec![second.clone(), first.clone()]),
            &OverlayConfig::default(),
            Arc::new(LoopbackFabric::new()),
            &CountingExchange::default(),
            &Shutdown::new(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = contexts.iter().map(|c| c.bundle().name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_existing_default_file_skips_enrollment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taste_of_ziti.json");
        store::save(&bundle("saved"), &path).unwrap();

        // Broker URL points nowhere; touching it would fail the test
        let config = OverlayConfig::default().with_broker_url("http://127.0.0.1:9");
        let exchange = CountingExchange::default();
        let contexts = acquire_from(
            IdentitySource::Default(path),
            &config,
            Arc::new(LoopbackFabric::new()),
            &exchange,
            &Shutdown::new(),
        )
        .await
        .unwrap();

        assert_eq!(contexts.len(), 1);
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = acquire_from(
            IdentitySource::Explicit(dir.path().join("absent.json")),
            &OverlayConfig::default(),
            Arc::new(LoopbackFabric::new()),
            &CountingExchange::default(),
            &Shutdown::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OverlayError::IdentityNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contexts_share_the_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.json");
        store::save(&bundle("slow"), &path).unwrap();

        let fabric = LoopbackFabric::new()
            .with_auth_latency(std::time::Duration::from_secs(60));
        let shutdown = Shutdown::new();
        let contexts = acquire_from(
            IdentitySource::Explicit(path),
            &OverlayConfig::default(),
            Arc::new(fabric),
            &CountingExchange::default(),
            &shutdown,
        )
        .await
        .unwrap();

        let dial = tokio::spawn(async move { contexts.dial_by_service("Foo").await });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        shutdown.cancel();

        let err = dial.await.unwrap().err().unwrap();
        assert!(matches!(err, OverlayError::Cancelled));
    }
}
