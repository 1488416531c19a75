//! Native capabilities callable from rule programs
//!
//! Each capability validates its arguments before acting. Misuse raises an
//! [`EngineError`] that aborts the whole query; ordinary failure only
//! backtracks.

mod host_port;
mod log;
mod probe;
mod uri_template;

pub use host_port::{join_host_port, split_host_port, HostPort};
pub use log::Log;
pub use probe::{parse_url, PooledProbeTransport, Probe, ProbeTransport};
pub use uri_template::UriTemplate;

use std::sync::Arc;

use crate::engine::{Bindings, EngineBuilder, EngineError, QueryContext, Result, Term};

/// A native predicate
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> usize;

    /// Run the predicate. `args` has exactly `arity()` elements.
    ///
    /// `Ok(false)` fails the call; any bindings made are undone by the caller.
    fn call(&self, args: &[Term], bindings: &mut Bindings, ctx: &QueryContext) -> Result<bool>;
}

/// Register the four standard capabilities.
pub fn register_all(builder: &mut EngineBuilder, transport: Arc<dyn ProbeTransport>) {
    builder
        .register(Arc::new(HostPort))
        .register(Arc::new(UriTemplate))
        .register(Arc::new(Probe::new(transport)))
        .register(Arc::new(Log));
}

/// Dereference a required atom argument.
fn atom_arg(bindings: &Bindings, term: &Term) -> Result<Arc<str>> {
    match bindings.deref(term) {
        Term::Atom(atom) => Ok(atom),
        Term::Var(_) => Err(EngineError::Instantiation),
        other => Err(EngineError::type_error("atom", &other)),
    }
}

/// Split a `Key-Value` term, dereferencing both sides.
fn pair(bindings: &Bindings, term: &Term) -> Option<(Term, Term)> {
    match bindings.deref(term).name_and_args() {
        Some(("-", [key, value])) => Some((bindings.deref(key), bindings.deref(value))),
        _ => None,
    }
}
