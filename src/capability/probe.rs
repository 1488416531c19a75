//! `probe(+Proxy, +Url, +Headers, ?Status)`
//!
//! Issues a GET for `Url` through the upstream `Proxy` and unifies `Status`
//! with the response code. A transport failure fails the call so the rule can
//! move on to its next candidate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{atom_arg, pair, Capability};
use crate::engine::{Bindings, EngineError, QueryContext, Result, Term};

/// Parse a URL, assuming `http://` when no scheme is given.
pub fn parse_url(raw: &str) -> std::result::Result<Url, url::ParseError> {
    if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("http://{}", raw))
    }
}

/// Outbound HTTP used by `probe/4`.
///
/// Implementations are called from blocking threads, never from an async task.
pub trait ProbeTransport: Send + Sync {
    /// GET `target` through the proxy at `proxy` and return the status code.
    /// Gives up early once `cancel` fires.
    fn get(
        &self,
        proxy: &Url,
        target: &Url,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u16>;
}

/// Most clients kept alive at once. Each one owns a connection pool.
const MAX_CACHED_CLIENTS: usize = 64;

/// Shared transport keeping one pooled client per upstream proxy.
pub struct PooledProbeTransport {
    clients: DashMap<String, reqwest::Client>,
    capacity: usize,
    timeout: Duration,
    runtime: Handle,
}

impl PooledProbeTransport {
    pub fn new(timeout: Duration, runtime: Handle) -> Self {
        Self {
            clients: DashMap::new(),
            capacity: MAX_CACHED_CLIENTS,
            timeout,
            runtime,
        }
    }

    fn client(&self, proxy: &Url) -> anyhow::Result<reqwest::Client> {
        if let Some(client) = self.clients.get(proxy.as_str()) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy.as_str())?)
            .timeout(self.timeout)
            .build()?;

        while self.clients.len() >= self.capacity {
            let Some(evicted) = self.clients.iter().next().map(|entry| entry.key().clone()) else {
                break;
            };
            self.clients.remove(&evicted);
            debug!(proxy = %evicted, "Evicted probe client");
        }
        self.clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

impl ProbeTransport for PooledProbeTransport {
    fn get(
        &self,
        proxy: &Url,
        target: &Url,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u16> {
        let request = self
            .client(proxy)?
            .get(target.clone())
            .headers(headers.clone());
        self.runtime.block_on(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(anyhow::anyhow!("probe cancelled")),
                result = async {
                    let response = request.send().await?;
                    let status = response.status().as_u16();
                    response.bytes().await?;
                    Ok(status)
                } => result,
            }
        })
    }
}

/// The `probe/4` capability.
pub struct Probe {
    transport: Arc<dyn ProbeTransport>,
}

impl Probe {
    pub fn new(transport: Arc<dyn ProbeTransport>) -> Self {
        Self { transport }
    }
}

fn url_arg(bindings: &Bindings, term: &Term) -> Result<Url> {
    let raw = atom_arg(bindings, term)?;
    parse_url(&raw).map_err(|_| EngineError::domain_error("url", &Term::Atom(raw.clone())))
}

fn header_values(bindings: &Bindings, value: &Term) -> Result<Vec<Arc<str>>> {
    match value {
        Term::Atom(atom) if !value.is_nil() => Ok(vec![atom.clone()]),
        _ => bindings
            .list_items(value)?
            .iter()
            .map(|item| atom_arg(bindings, item))
            .collect(),
    }
}

/// Build a header map from a list of `Name-Value` or `Name-[Value, ...]` terms.
fn header_map(bindings: &Bindings, headers: &Term) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for item in bindings.list_items(headers)? {
        let item = bindings.deref(&item);
        if item.is_var() {
            return Err(EngineError::Instantiation);
        }
        let malformed = || EngineError::domain_error("header", &bindings.resolve(&item));
        let (key, value) = pair(bindings, &item).ok_or_else(malformed)?;
        let name = match key {
            Term::Atom(name) => HeaderName::from_bytes(name.as_bytes()).map_err(|_| malformed())?,
            Term::Var(_) => return Err(EngineError::Instantiation),
            _ => return Err(malformed()),
        };
        if value.is_var() {
            return Err(EngineError::Instantiation);
        }
        for v in header_values(bindings, &value)? {
            let v = HeaderValue::from_str(&v).map_err(|_| malformed())?;
            map.append(name.clone(), v);
        }
    }
    Ok(map)
}

impl Capability for Probe {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn arity(&self) -> usize {
        4
    }

    fn call(&self, args: &[Term], bindings: &mut Bindings, ctx: &QueryContext) -> Result<bool> {
        let [proxy, target, headers, status] = args else {
            return Ok(false);
        };

        let proxy = url_arg(bindings, proxy)?;
        let target = url_arg(bindings, target)?;
        let headers = header_map(bindings, headers)?;

        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let outcome = self
            .transport
            .get(&proxy, &target, &headers, ctx.cancellation());
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match outcome {
            Ok(code) => {
                debug!(parent: ctx.span().and_then(|s| s.id()), proxy = %proxy, url = %target, status = code, "Probe completed");
                Ok(bindings.unify(status, &Term::Integer(i64::from(code))))
            }
            Err(e) => {
                debug!(parent: ctx.span().and_then(|s| s.id()), proxy = %proxy, url = %target, error = %e, "Probe failed");
                Ok(false)
            }
        }
    }
}
