//! HTTP(S) endpoint of the attachment handshake
//!
//! Handlers forward every request to the session owner as an [`Event`] and
//! answer from its reply.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::body::Bytes;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::fsm::{DeviceReport, ResponseReply};

pub const BOOTSTRAP_PATH: &str = "/bootstrap/";
pub const RESPONSE_PATH: &str = "/bootstrap/response/";

/// Request delivered to the session owner
#[derive(Debug)]
pub enum Event {
    Discovery {
        report: DeviceReport,
        /// The script to return, or `None` for 204
        reply: oneshot::Sender<Option<String>>,
    },
    Response {
        from: SocketAddr,
        text: String,
        reply: oneshot::Sender<ResponseReply>,
    },
}

pub fn router(events: mpsc::Sender<Event>) -> Router {
    Router::new()
        .route(BOOTSTRAP_PATH, post(bootstrap_handler).fallback(not_found_handler))
        .route(RESPONSE_PATH, post(response_handler).fallback(not_found_handler))
        .fallback(not_found_handler)
        .with_state(events)
}

async fn bootstrap_handler(
    State(events): State<mpsc::Sender<Event>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let fields = parse_fields(&body);
    let (reply, rx) = oneshot::channel();
    let event = Event::Discovery {
        report: DeviceReport::new(remote.ip(), fields),
        reply,
    };
    if events.send(event).await.is_err() {
        return StatusCode::NO_CONTENT.into_response();
    }
    match rx.await {
        Ok(Some(script)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/x-shellscript")],
            script,
        )
            .into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn response_handler(
    State(events): State<mpsc::Sender<Event>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let mut fields = parse_fields(&body);
    let (reply, rx) = oneshot::channel();
    let event = Event::Response {
        from: remote,
        text: fields.remove("text").unwrap_or_default(),
        reply,
    };
    if events.send(event).await.is_err() {
        return StatusCode::NO_CONTENT.into_response();
    }
    match rx.await {
        Ok(ResponseReply::Accepted { .. }) => StatusCode::OK.into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Urlencoded fields of a device request, whatever its Content-Type; an
/// undecodable body yields no fields
fn parse_fields(body: &[u8]) -> BTreeMap<String, String> {
    serde_urlencoded::from_bytes(body).unwrap_or_else(|e| {
        debug!(error = %e, "Ignoring undecodable request body");
        BTreeMap::new()
    })
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Accept connections until `shutdown` turns true
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(
            addr = %addr,
            tls = tls.is_some(),
            "Attachment listener started"
        );
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutting down attachment listener");
                    break;
                }
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let router = router.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => handle_connection(stream, remote, router).await,
                                    Err(e) => debug!(
                                        error = %e,
                                        remote_addr = %remote,
                                        "TLS handshake failed"
                                    ),
                                },
                                None => handle_connection(stream, remote, router).await,
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection<S>(stream: S, remote: SocketAddr, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(remote));
        router.clone().oneshot(req)
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(
            error = %e,
            remote_addr = %remote,
            "Connection error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields(b"hostname=node-a&wg_public=ab%2Bc%3D&text=two+words");
        assert_eq!(fields["hostname"], "node-a");
        assert_eq!(fields["wg_public"], "ab+c=");
        assert_eq!(fields["text"], "two words");

        assert!(parse_fields(b"").is_empty());
        assert_eq!(parse_fields(b"text")["text"], "");
    }
}
