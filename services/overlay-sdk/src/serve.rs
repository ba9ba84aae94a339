//! Listen/serve loop
//!
//! A bound listener accepts until the shutdown signal fires. Every accepted
//! connection runs as its own task: read a bounded request, decode, handle,
//! encode, write, repeat until the peer hangs up. Read and write are bounded
//! by deadlines; any per-connection error closes that connection only.

use async_trait::async_trait;
use futures::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::ServeConfig;
use crate::error::{OverlayError, Result};
use crate::transport::{Acceptor, Inbound, OverlayStream};

const READ_CHUNK: usize = 4096;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Cancellation signal; clones observe the same signal. A [`Shutdown::child`]
/// also fires when any ancestor does, but cancelling it leaves the ancestors
/// running.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    /// Own receiver first, then one per ancestor
    watched: Vec<watch::Receiver<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            watched: vec![rx],
        }
    }

    /// Signal scoped to one component: cancelled by `self`, cancellable on
    /// its own
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut watched = Vec::with_capacity(self.watched.len() + 1);
        watched.push(rx);
        watched.extend(self.watched.iter().cloned());
        Self {
            tx: Arc::new(tx),
            watched,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.watched.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this signal or an ancestor has been cancelled
    pub async fn cancelled(&self) {
        let waits = self.watched.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                // An ancestor dropped without cancelling never fires
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }

    /// Cancel on Ctrl-C
    pub fn on_ctrl_c(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Bound,
    Accepting,
    ShuttingDown,
    Stopped,
}

/// A bound overlay service
pub struct OverlayListener {
    service: String,
    acceptor: Box<dyn Acceptor>,
    state: ListenerState,
    span: Span,
}

impl OverlayListener {
    pub(crate) fn new(acceptor: Box<dyn Acceptor>, span: Span) -> Self {
        Self {
            service: acceptor.service().to_string(),
            acceptor,
            state: ListenerState::Bound,
            span,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub async fn accept(&mut self) -> Result<Inbound> {
        self.acceptor.accept().await
    }

    fn transition(&mut self, next: ListenerState) {
        debug!(
            parent: &self.span,
            service = %self.service,
            from = ?self.state,
            to = ?next,
            "Listener state"
        );
        self.state = next;
    }
}

/// Application protocol carried over a bound service
pub trait ServiceProtocol: Send + Sync + 'static {
    type Request: Send + std::fmt::Debug;
    type Response: Send;

    /// Decode one request from the front of `buf`. `Ok(None)` asks for more
    /// bytes; an error means the stream cannot be resynchronised and the
    /// connection is closed.
    fn decode(&self, buf: &[u8]) -> Result<Option<(Self::Request, usize)>>;

    /// Map a request to its response. Unsupported operations get the
    /// protocol's own error response.
    fn handle(&self, request: Self::Request) -> Self::Response;

    fn encode(&self, response: &Self::Response, out: &mut Vec<u8>);
}

/// Hook for observing connection outcomes
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn closed(&self, peer: &str, outcome: &Result<()>);
}

/// Connection counters for one run of [`serve`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Accept and serve until `shutdown` fires, then drain in-flight connections
pub async fn serve<P: ServiceProtocol>(
    listener: &mut OverlayListener,
    protocol: Arc<P>,
    config: ServeConfig,
    shutdown: Shutdown,
) -> Result<ServeSummary> {
    serve_observed(listener, protocol, config, shutdown, None).await
}

pub async fn serve_observed<P: ServiceProtocol>(
    listener: &mut OverlayListener,
    protocol: Arc<P>,
    config: ServeConfig,
    shutdown: Shutdown,
    observer: Option<Arc<dyn ConnectionObserver>>,
) -> Result<ServeSummary> {
    let mut connections = JoinSet::new();
    let mut summary = ServeSummary::default();
    let mut sequence: u64 = 0;
    // Stops this listener's connections only; `shutdown` belongs to the caller
    let local = shutdown.child();

    listener.transition(ListenerState::Accepting);
    info!(parent: &listener.span, service = %listener.service, "Accepting connections");

    let outcome = loop {
        tokio::select! {
            biased;

            _ = local.cancelled() => break Ok(()),

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                tally(&mut summary, joined);
            }

            accepted = listener.accept() => match accepted {
                Ok(inbound) => {
                    sequence += 1;
                    summary.accepted += 1;
                    let span = info_span!(
                        parent: &listener.span,
                        "connection",
                        service = %listener.service,
                        peer = %inbound.peer,
                        n = sequence,
                    );
                    connections.spawn(
                        run_connection(
                            inbound,
                            protocol.clone(),
                            config,
                            local.clone(),
                            observer.clone(),
                        )
                        .instrument(span),
                    );
                }
                Err(e) if e.is_recoverable() => {
                    warn!(parent: &listener.span, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(parent: &listener.span, error = %e, "Listener failed");
                    break Err(e);
                }
            },
        }
    };

    listener.transition(ListenerState::ShuttingDown);
    if outcome.is_err() {
        local.cancel();
    }
    while let Some(joined) = connections.join_next().await {
        tally(&mut summary, joined);
    }
    listener.transition(ListenerState::Stopped);

    info!(
        parent: &listener.span,
        service = %listener.service,
        accepted = summary.accepted,
        completed = summary.completed,
        failed = summary.failed,
        "Listener stopped"
    );

    outcome.map(|_| summary)
}

fn tally(
    summary: &mut ServeSummary,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => summary.completed += 1,
        Ok(Err(_)) => summary.failed += 1,
        Err(e) => {
            error!(error = %e, "Connection task aborted");
            summary.failed += 1;
        }
    }
}

async fn run_connection<P: ServiceProtocol>(
    inbound: Inbound,
    protocol: Arc<P>,
    config: ServeConfig,
    shutdown: Shutdown,
    observer: Option<Arc<dyn ConnectionObserver>>,
) -> Result<()> {
    debug!("Connection accepted");
    let outcome = serve_connection(inbound.stream, protocol.as_ref(), &config, &shutdown).await;

    match &outcome {
        Ok(()) => debug!("Connection closed by peer"),
        Err(OverlayError::Cancelled) => debug!("Connection cancelled by shutdown"),
        Err(e) => warn!(error = %e, stage = %e.stage(), "Connection closed"),
    }
    if let Some(observer) = observer {
        observer.closed(&inbound.peer, &outcome).await;
    }
    outcome
}

/// Serve one connection until the peer hangs up, a deadline passes or
/// shutdown fires. The stream is always shut down before returning.
pub async fn serve_connection<P: ServiceProtocol>(
    mut stream: OverlayStream,
    protocol: &P,
    config: &ServeConfig,
    shutdown: &Shutdown,
) -> Result<()> {
    let outcome = exchange(&mut stream, protocol, config, shutdown).await;
    let _ = tokio::time::timeout(config.write_timeout, stream.shutdown()).await;
    outcome
}

async fn exchange<P: ServiceProtocol>(
    stream: &mut OverlayStream,
    protocol: &P,
    config: &ServeConfig,
    shutdown: &Shutdown,
) -> Result<()> {
    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut reply = Vec::new();

    loop {
        while let Some((request, used)) = protocol.decode(&pending)? {
            pending.drain(..used);
            debug!(request = ?request, "Dispatching request");

            let response = protocol.handle(request);
            reply.clear();
            protocol.encode(&response, &mut reply);

            let write = async {
                stream.write_all(&reply).await?;
                stream.flush().await?;
                Ok::<_, std::io::Error>(())
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(OverlayError::Cancelled),
                written = tokio::time::timeout(config.write_timeout, write) => match written {
                    Ok(result) => result?,
                    Err(_) => return Err(OverlayError::timeout("write", config.write_timeout)),
                },
            }
        }

        if pending.len() >= config.max_frame_len {
            return Err(OverlayError::Protocol(format!(
                "request exceeds {} bytes",
                config.max_frame_len
            )));
        }

        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(OverlayError::Cancelled),
            read = tokio::time::timeout(config.read_timeout, stream.read(&mut chunk)) => {
                match read {
                    Ok(result) => result?,
                    Err(_) => return Err(OverlayError::timeout("read", config.read_timeout)),
                }
            }
        };

        if read == 0 {
            if pending.is_empty() {
                return Ok(());
            }
            return Err(OverlayError::Protocol(
                "connection closed mid-request".to_string(),
            ));
        }
        pending.extend_from_slice(&chunk[..read]);
    }
}
