//! HTTP/1.1 over overlay streams
//!
//! The URL host is the logical service name. It is resolved through the
//! context collection and sent unchanged as the `Host` header; the port, if
//! any, is ignored.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{debug, warn};

use overlay_sdk::{ContextCollection, OverlayError, OverlayStream};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("HTTP exchange failed: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Status and fully collected body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Split a URL into (service name, path and query)
pub fn split_url(url: &str) -> Result<(String, String), HttpError> {
    let invalid = |reason: &str| HttpError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;
    let service = uri.host().ok_or_else(|| invalid("missing host"))?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    Ok((service.to_string(), path.to_string()))
}

/// Send `GET path` on an already dialed stream
pub async fn get(
    stream: OverlayStream,
    service: &str,
    path: &str,
) -> Result<HttpResponse, HttpError> {
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "HTTP connection closed with error");
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, service)
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    debug!(service = %service, status = %status, bytes = body.len(), "HTTP response");

    Ok(HttpResponse { status, body })
}

/// Resolve the URL's host through `contexts`, dial it and `GET` the URL
pub async fn fetch(contexts: &ContextCollection, url: &str) -> Result<HttpResponse, HttpError> {
    let (service, path) = split_url(url)?;
    let stream = contexts.dial_by_service(&service).await?;
    get(stream, &service, &path).await
}
