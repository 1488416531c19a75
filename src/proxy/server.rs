//! Proxy server implementation using hyper
//!
//! Accepts client connections, assigns each request an id and a span, and
//! hands it to the [`Dispatcher`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

use super::dispatcher::Dispatcher;
use crate::error::Result;

/// Proxy server
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    next_rid: Arc<AtomicU64>,
}

impl ProxyServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            next_rid: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serve connections from `listener` until `shutdown` turns true.
    ///
    /// Tunnels already relaying are not interrupted by shutdown.
    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote)) => {
                            let dispatcher = self.dispatcher.clone();
                            let next_rid = self.next_rid.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, remote, dispatcher, next_rid).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        remote: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        next_rid: Arc<AtomicU64>,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            let rid = next_rid.fetch_add(1, Ordering::Relaxed) + 1;
            let span = info_span!("request", rid, remote = %remote);

            async move {
                debug!(method = %req.method(), uri = %req.uri(), "Request received");
                Ok::<_, Infallible>(dispatcher.handle(req, remote, rid).await)
            }
            .instrument(span)
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}
