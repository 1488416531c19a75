//! Per-request orchestration
//!
//! Facts are extracted, candidates are pulled from the rule program one at a
//! time, and each is handshaken in turn. The first success is answered with
//! the upstream's own response and relayed; a failed candidate only moves on
//! to the next one.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::candidates::{Candidate, CandidateIterator};
use super::facts;
use super::handshake::{self, Established, HandshakeTimeouts, UpstreamResponse};
use super::tunnel::Relay;
use crate::engine::{Engine, QueryContext};
use crate::error::{ProximaError, Result};

/// Dispatcher settings
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherConfig {
    pub timeouts: HandshakeTimeouts,
    /// Close a relay after this long without traffic in either direction
    pub relay_idle_timeout: Option<Duration>,
}

/// Handles CONNECT requests against a loaded rule program.
pub struct Dispatcher {
    engine: Engine,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(engine: Engine, config: DispatcherConfig) -> Self {
        Self { engine, config }
    }

    /// Answer one request. Errors become plain-text responses.
    pub async fn handle<B>(&self, req: Request<B>, remote: SocketAddr, rid: u64) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        match self.dispatch(req, remote, rid).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProximaError::NoCandidate => info!("No candidate succeeded"),
                    e if e.is_client_error() => info!(error = %e, "Rejected request"),
                    e => error!(error = %e, "Request failed"),
                }
                error_response(e.status_code(), &e.to_string())
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>, remote: SocketAddr, rid: u64) -> Result<Response<Full<Bytes>>>
    where
        B: Send + 'static,
    {
        let request_facts = facts::extract(&req, remote, rid).await?;
        debug!(authority = %request_facts.target, resolved = %request_facts.resolved, "Facts extracted");

        // Fires when this future is dropped, e.g. the client went away mid-search.
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let ctx = QueryContext::with_span(Span::current()).with_cancellation(cancel);
        let mut candidates = CandidateIterator::new(&self.engine, request_facts.as_list(), ctx)?;

        while let Some(term) = candidates.next().await? {
            let candidate = match Candidate::from_term(&term) {
                Ok(candidate) => candidate,
                Err(reason) => {
                    warn!(candidate = %term, "Candidate failed: {}", reason);
                    continue;
                }
            };

            match handshake::establish(
                &candidate,
                &request_facts.target,
                req.headers(),
                &self.config.timeouts,
            )
            .await
            {
                Ok(established) => {
                    info!(candidate = %candidate, authority = %request_facts.target, "Tunnel established");
                    drop(candidates);
                    return Ok(self.start_relay(req, established));
                }
                Err(e) => {
                    let failure = ProximaError::CandidateFailure {
                        candidate: candidate.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", failure);
                }
            }
        }

        Err(ProximaError::NoCandidate)
    }

    /// Take over the client connection once the response is sent and relay it.
    fn start_relay<B>(&self, req: Request<B>, established: Established<TcpStream>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let Established {
            upstream,
            response,
            leftover,
        } = established;
        let relay = Relay::new(self.config.relay_idle_timeout);
        let on_upgrade = hyper::upgrade::on(req);

        tokio::spawn(
            async move {
                let upgraded = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        debug!("CONNECT upgrade failed: {}", e);
                        return;
                    }
                };
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() {
                    if let Err(e) = client.write_all(&leftover).await {
                        debug!("Failed to deliver upstream bytes: {}", e);
                        return;
                    }
                }
                let stats = relay.run(client, upstream).await;
                info!(
                    bytes_sent = stats.client_to_upstream,
                    bytes_received = stats.upstream_to_client + leftover.len() as u64,
                    "Tunnel finished"
                );
            }
            .instrument(Span::current()),
        );

        mirror_response(response)
    }
}

/// The client sees the upstream's status line and headers. Body framing
/// headers are dropped since a tunnel has no body.
fn mirror_response(upstream: UpstreamResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = upstream.status;
    for (name, value) in upstream.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    if let Some(reason) = upstream.reason {
        if let Ok(reason) = ReasonPhrase::try_from(reason) {
            response.extensions_mut().insert(reason);
        }
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
