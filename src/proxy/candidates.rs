//! Lazy candidate generation over `tunnel(Proxy, Facts)`

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::capability::join_host_port;
use crate::engine::{Engine, EngineError, Query, QueryContext, Solutions, Term};
use crate::error::{ProximaError, Result};

const ENTRY_QUERY: &str = "tunnel(Proxy, Facts)";

/// An upstream proxy proposed by the rule program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// `host:port` to dial
    pub address: String,
    /// `user[:pass]` embedded in the authority
    pub credentials: Option<String>,
}

impl Candidate {
    pub fn from_term(term: &Term) -> std::result::Result<Self, String> {
        match term {
            Term::Atom(atom) if !term.is_nil() => Self::parse(atom),
            other => Err(format!("not an authority: {}", other)),
        }
    }

    /// Parse `[user[:pass]@]host[:port]`, defaulting the port to 80.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let url = Url::parse(&format!("http://{}", raw)).map_err(|e| e.to_string())?;
        let host = match url.host() {
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => return Err("missing host".into()),
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let credentials = match (url.username(), url.password()) {
            ("", None) => None,
            (user, None) => Some(user.to_string()),
            (user, Some(pass)) => Some(format!("{}:{}", user, pass)),
        };

        Ok(Self {
            address: join_host_port(&host, port),
            credentials,
        })
    }

    /// Value for the outbound `Proxy-Authorization` header, if any.
    pub fn proxy_authorization(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .map(|c| format!("Basic {}", BASE64.encode(c)))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Pulls candidates from the rule program one at a time.
///
/// The search is resumed only when the caller asks for the next candidate,
/// on a blocking thread since capabilities may perform network I/O.
pub struct CandidateIterator {
    solutions: Option<Solutions>,
    cancel: CancellationToken,
}

impl CandidateIterator {
    pub fn new(engine: &Engine, facts: Term, ctx: QueryContext) -> Result<Self> {
        let query = Query::parse(ENTRY_QUERY)?.bind("Facts", facts);
        let cancel = ctx.cancellation().clone();
        Ok(Self {
            solutions: Some(engine.query(&query, ctx)),
            cancel,
        })
    }

    /// The next proposed proxy term, or `None` once the rules are exhausted.
    ///
    /// After the context's token fires the search is not resumed again.
    pub async fn next(&mut self) -> Result<Option<Term>> {
        let Some(mut solutions) = self.solutions.take() else {
            return Ok(None);
        };
        if self.cancel.is_cancelled() {
            return Err(ProximaError::EngineFailure(EngineError::Cancelled));
        }

        let (solutions, item) = tokio::task::spawn_blocking(move || {
            let item = solutions.next();
            (solutions, item)
        })
        .await
        .map_err(|e| ProximaError::Internal(format!("rule evaluation task failed: {}", e)))?;

        match item {
            None => Ok(None),
            Some(Err(e)) => Err(ProximaError::EngineFailure(e)),
            Some(Ok(solution)) => {
                self.solutions = Some(solutions);
                let proxy = solution
                    .get("Proxy")
                    .cloned()
                    .ok_or_else(|| ProximaError::Internal("entry query lost Proxy".into()))?;
                Ok(Some(proxy))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{self, ProbeTransport};
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn engine(source: &str) -> Engine {
        let mut builder = Engine::builder().unwrap();
        builder.consult_str("test", source).unwrap();
        builder.build().unwrap()
    }

    async fn drain(iterator: &mut CandidateIterator) -> Result<Vec<String>> {
        let mut seen = Vec::new();
        while let Some(term) = iterator.next().await? {
            seen.push(term.as_atom().unwrap().to_string());
        }
        Ok(seen)
    }

    #[test]
    fn test_candidate_parse() {
        let candidate = Candidate::parse("localhost:8080").unwrap();
        assert_eq!(candidate.address, "localhost:8080");
        assert_eq!(candidate.credentials, None);
        assert_eq!(candidate.proxy_authorization(), None);

        let candidate = Candidate::parse("proxy.local").unwrap();
        assert_eq!(candidate.address, "proxy.local:80");

        let candidate = Candidate::parse("[::1]:3128").unwrap();
        assert_eq!(candidate.address, "[::1]:3128");
    }

    #[test]
    fn test_candidate_credentials() {
        let candidate = Candidate::parse("foo:bar@localhost:8080").unwrap();
        assert_eq!(candidate.address, "localhost:8080");
        assert_eq!(candidate.credentials.as_deref(), Some("foo:bar"));
        assert_eq!(
            candidate.proxy_authorization().as_deref(),
            Some("Basic Zm9vOmJhcg==")
        );

        let candidate = Candidate::parse("foo@localhost:8080").unwrap();
        assert_eq!(candidate.credentials.as_deref(), Some("foo"));
    }

    #[test]
    fn test_candidate_rejects_non_authorities() {
        assert!(Candidate::from_term(&Term::Integer(1)).is_err());
        assert!(Candidate::from_term(&Term::var(0)).is_err());
        assert!(Candidate::from_term(&Term::nil()).is_err());
        assert!(Candidate::parse("local host:80").is_err());
        assert!(Candidate::parse("localhost:99999").is_err());
    }

    #[tokio::test]
    async fn test_candidates_in_rule_order() {
        let engine = engine(
            "tunnel(P, Facts) :- member(target(T), Facts), T == 'example.com:443', P = 'a:1'.\n\
             tunnel('b:2', _).\n\
             tunnel(P, Facts) :- member(priority(high), Facts), P = 'c:3'.",
        );
        let facts = Term::list(vec![
            Term::compound("priority", vec![Term::atom("high")]),
            Term::compound("target", vec![Term::atom("example.com:443")]),
        ]);
        let mut iterator = CandidateIterator::new(&engine, facts, QueryContext::new()).unwrap();
        assert_eq!(drain(&mut iterator).await.unwrap(), vec!["a:1", "b:2", "c:3"]);
        assert!(iterator.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_rules_means_no_candidates() {
        let engine = engine("");
        let mut iterator = CandidateIterator::new(&engine, Term::nil(), QueryContext::new()).unwrap();
        assert!(iterator.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engine_error_aborts_iteration() {
        let engine = engine(
            "tunnel('a:1', _).\n\
             tunnel(P, _) :- host_port(P, _, _).\n\
             tunnel('c:3', _).",
        );
        let mut iterator = CandidateIterator::new(&engine, Term::nil(), QueryContext::new()).unwrap();
        assert_eq!(iterator.next().await.unwrap(), Some(Term::atom("a:1")));
        let err = iterator.next().await.unwrap_err();
        assert!(matches!(
            err,
            ProximaError::EngineFailure(EngineError::Existence { .. })
        ));
        assert!(iterator.next().await.unwrap().is_none());
    }

    /// Counts probes and cancels the request on the first one.
    struct ClientGoneAway {
        probes: AtomicUsize,
    }

    impl ProbeTransport for ClientGoneAway {
        fn get(
            &self,
            _proxy: &Url,
            _target: &Url,
            _headers: &HeaderMap,
            cancel: &CancellationToken,
        ) -> anyhow::Result<u16> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            Err(anyhow::anyhow!("probe cancelled"))
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_probing() {
        let transport = Arc::new(ClientGoneAway {
            probes: AtomicUsize::new(0),
        });
        let mut builder = Engine::builder().unwrap();
        capability::register_all(&mut builder, transport.clone());
        builder
            .consult_str(
                "test",
                "tunnel(P, _) :- member(P, ['a:1', 'b:2', 'c:3']), probe(P, 'http://example.com/', [], 200).\n\
                 tunnel('d:4', _).",
            )
            .unwrap();
        let engine = builder.build().unwrap();

        let token = CancellationToken::new();
        let ctx = QueryContext::new().with_cancellation(token.clone());
        let mut iterator = CandidateIterator::new(&engine, Term::nil(), ctx).unwrap();

        let err = iterator.next().await.unwrap_err();
        assert!(matches!(
            err,
            ProximaError::EngineFailure(EngineError::Cancelled)
        ));
        assert!(token.is_cancelled());
        assert_eq!(transport.probes.load(Ordering::SeqCst), 1);
        assert!(iterator.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_resumption() {
        let engine = engine("tunnel('a:1', _).\ntunnel('b:2', _).");
        let token = CancellationToken::new();
        let ctx = QueryContext::new().with_cancellation(token.clone());
        let mut iterator = CandidateIterator::new(&engine, Term::nil(), ctx).unwrap();

        assert_eq!(iterator.next().await.unwrap(), Some(Term::atom("a:1")));
        token.cancel();
        assert!(matches!(
            iterator.next().await,
            Err(ProximaError::EngineFailure(EngineError::Cancelled))
        ));
        assert!(iterator.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capability_error_aborts_iteration() {
        let mut builder = Engine::builder().unwrap();
        capability::register_all(&mut builder, Arc::new(ClientGoneAway {
            probes: AtomicUsize::new(0),
        }));
        builder
            .consult_str(
                "test",
                "tunnel('a:1', _).\n\
                 tunnel(P, _) :- host_port(foo, H, Port), host_port(P, H, Port).\n\
                 tunnel('c:3', _).",
            )
            .unwrap();
        let engine = builder.build().unwrap();

        let mut iterator = CandidateIterator::new(&engine, Term::nil(), QueryContext::new()).unwrap();
        assert_eq!(iterator.next().await.unwrap(), Some(Term::atom("a:1")));
        let err = iterator.next().await.unwrap_err();
        assert!(matches!(
            err,
            ProximaError::EngineFailure(EngineError::Domain { domain: "host_port", .. })
        ));
        assert!(iterator.next().await.unwrap().is_none());
    }
}
