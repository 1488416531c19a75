//! `host_port(?HostPort, ?Host, ?Port)`

use super::{atom_arg, Capability};
use crate::engine::{Bindings, EngineError, QueryContext, Result, Term};

/// Converts between a `host:port` atom and its host and port.
pub struct HostPort;

/// Join a host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port` on its last colon, removing IPv6 brackets.
pub fn split_host_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((host, port.parse().ok()?))
}

impl Capability for HostPort {
    fn name(&self) -> &'static str {
        "host_port"
    }

    fn arity(&self) -> usize {
        3
    }

    fn call(&self, args: &[Term], bindings: &mut Bindings, _ctx: &QueryContext) -> Result<bool> {
        let [host_port, host, port] = args else {
            return Ok(false);
        };

        match bindings.deref(host_port) {
            Term::Var(_) => {
                let host = atom_arg(bindings, host)?;
                let port = match bindings.deref(port) {
                    Term::Integer(p) => u16::try_from(p)
                        .map_err(|_| EngineError::domain_error("port", &Term::Integer(p)))?,
                    Term::Var(_) => return Err(EngineError::Instantiation),
                    other => return Err(EngineError::type_error("integer", &other)),
                };
                let joined = Term::atom(join_host_port(&host, port));
                Ok(bindings.unify(host_port, &joined))
            }
            Term::Atom(atom) => {
                let (h, p) = split_host_port(&atom)
                    .ok_or_else(|| EngineError::domain_error("host_port", &Term::Atom(atom.clone())))?;
                Ok(bindings.unify(host, &Term::atom(h))
                    && bindings.unify(port, &Term::Integer(i64::from(p))))
            }
            other => Err(EngineError::type_error("atom", &other)),
        }
    }
}
