//! Fact extraction for inbound CONNECT requests

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, Method, Request};

use crate::engine::{read_term, Bindings, Term};
use crate::error::{ProximaError, Result};

const BASIC_PREFIX: &[u8] = b"basic ";

/// Facts describing one CONNECT request.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    /// Target authority as requested, `host:port`
    pub target: String,
    /// First address the target resolved to
    pub resolved: SocketAddr,
    /// Override facts followed by `rid(N)`, `remote(Addr)` and `target(Authority)`
    pub facts: Vec<Term>,
}

impl RequestFacts {
    /// The fact list as a single list term.
    pub fn as_list(&self) -> Term {
        Term::list(self.facts.iter().cloned())
    }
}

/// Validate the request and build its fact list.
///
/// The target is resolved before any candidate is tried so that a bogus
/// authority never reaches the rule program.
pub async fn extract<B>(req: &Request<B>, remote: SocketAddr, rid: u64) -> Result<RequestFacts> {
    if req.method() != Method::CONNECT {
        return Err(ProximaError::MethodNotAllowed(req.method().to_string()));
    }

    let target = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| ProximaError::UnprocessableTarget(req.uri().to_string()))?;

    let resolved = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| ProximaError::UnprocessableTarget(format!("{}: {}", target, e)))?
        .next()
        .ok_or_else(|| {
            ProximaError::UnprocessableTarget(format!("{}: no addresses", target))
        })?;

    let mut facts = override_facts(req.headers())?;
    facts.push(Term::compound("rid", vec![Term::Integer(rid as i64)]));
    facts.push(Term::compound("remote", vec![Term::atom(remote.to_string())]));
    facts.push(Term::compound("target", vec![Term::atom(&target)]));

    Ok(RequestFacts {
        target,
        resolved,
        facts,
    })
}

/// Decode policy facts carried in a `Proxy-Authorization: Basic` header.
///
/// A header without the Basic scheme is ignored. Once the scheme matches,
/// every decode or parse failure is an error.
pub fn override_facts(headers: &HeaderMap) -> Result<Vec<Term>> {
    let Some(value) = headers.get(PROXY_AUTHORIZATION) else {
        return Ok(Vec::new());
    };
    let value = value.as_bytes();
    if value.len() < BASIC_PREFIX.len()
        || !value[..BASIC_PREFIX.len()].eq_ignore_ascii_case(BASIC_PREFIX)
    {
        return Ok(Vec::new());
    }

    let invalid =
        |reason: String| ProximaError::UnprocessableTarget(format!("credentials: {}", reason));

    let payload = std::str::from_utf8(&value[BASIC_PREFIX.len()..])
        .map_err(|e| invalid(e.to_string()))?
        .trim();
    let decoded = BASE64.decode(payload).map_err(|e| invalid(e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|e| invalid(e.to_string()))?;
    let (policy, _) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("missing ':' separator".into()))?;

    let read = read_term(&format!("[{}]", policy)).map_err(|e| invalid(e.to_string()))?;
    Bindings::new()
        .list_items(&read.term)
        .map_err(|e| invalid(e.to_string()))
}
