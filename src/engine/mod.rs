//! Embedded rule engine
//!
//! A clause database indexed by predicate name and arity, loaded once at
//! startup and immutable afterwards. Queries run against a shared
//! [`Engine`] handle and yield their solutions lazily.

mod bindings;
mod builtins;
mod error;
mod machine;
mod reader;
mod term;

pub use bindings::{normalize, Bindings, Mark};
pub use error::{EngineError, Result};
pub use machine::{Solution, Solutions};
pub use reader::{read_program, read_term, ReadTerm};
pub use term::{Compound, Term, Var, NIL};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

use crate::capability::Capability;
use machine::Machine;

const BASELINE: &str = include_str!("baseline.pl");

/// A stored clause. Its variables are numbered `0..var_count`.
#[derive(Debug, Clone)]
pub struct Clause {
    head: Term,
    body: Term,
    var_count: usize,
}

impl Clause {
    fn from_read(read: ReadTerm) -> Result<Self> {
        let (head, body) = match read.term.name_and_args() {
            Some((":-", [head, body])) => (head.clone(), body.clone()),
            _ => (read.term.clone(), Term::atom("true")),
        };
        match head {
            Term::Var(_) => return Err(EngineError::Instantiation),
            Term::Atom(_) | Term::Compound(_) => {}
            other => return Err(EngineError::type_error("callable", &other)),
        }
        Ok(Self {
            head,
            body,
            var_count: read.var_count,
        })
    }
}

/// Execution context handed to capabilities.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    span: Option<Span>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose logger is the given request span.
    pub fn with_span(span: Span) -> Self {
        Self {
            span: Some(span),
            ..Self::default()
        }
    }

    /// Tie the query to `token`. Once it fires, capabilities stop doing I/O
    /// and the query ends with [`EngineError::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Loaded clauses, dynamic declarations and native capabilities.
#[derive(Default)]
pub struct Database {
    predicates: HashMap<Arc<str>, BTreeMap<usize, Arc<Vec<Clause>>>>,
    dynamic: HashSet<(Arc<str>, usize)>,
    capabilities: HashMap<Arc<str>, BTreeMap<usize, Arc<dyn Capability>>>,
}

impl Database {
    fn clauses(&self, name: &str, arity: usize) -> Option<&Arc<Vec<Clause>>> {
        self.predicates.get(name)?.get(&arity)
    }

    fn capability(&self, name: &str, arity: usize) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)?.get(&arity)
    }

    fn is_dynamic(&self, name: &str, arity: usize) -> bool {
        self.dynamic.contains(&(Arc::from(name), arity))
    }

    fn add_clause(&mut self, clause: Clause) -> Result<()> {
        let (name, arity) = clause
            .head
            .indicator()
            .ok_or_else(|| EngineError::type_error("callable", &clause.head))?;
        let clauses = self
            .predicates
            .entry(name)
            .or_default()
            .entry(arity)
            .or_default();
        Arc::make_mut(clauses).push(clause);
        Ok(())
    }

    fn declare_dynamic(&mut self, spec: &Term) -> Result<()> {
        match spec {
            Term::Var(_) => Err(EngineError::Instantiation),
            Term::Cons(cell) => {
                self.declare_dynamic(&cell.0)?;
                self.declare_dynamic(&cell.1)
            }
            t if t.is_nil() => Ok(()),
            Term::Compound(c) if &*c.functor == "," && c.args.len() == 2 => {
                self.declare_dynamic(&c.args[0])?;
                self.declare_dynamic(&c.args[1])
            }
            Term::Compound(c) if &*c.functor == "/" && c.args.len() == 2 => {
                match (&c.args[0], &c.args[1]) {
                    (Term::Atom(name), Term::Integer(arity)) if *arity >= 0 => {
                        self.dynamic.insert((name.clone(), *arity as usize));
                        Ok(())
                    }
                    (Term::Var(_), _) | (_, Term::Var(_)) => Err(EngineError::Instantiation),
                    _ => Err(EngineError::type_error("predicate_indicator", spec)),
                }
            }
            other => Err(EngineError::type_error("predicate_indicator", other)),
        }
    }
}

/// Collects programs and capabilities, then freezes them into an [`Engine`].
///
/// The baseline library is always loaded first. Clauses for a predicate that
/// already has clauses are appended after them; nothing is ever replaced.
pub struct EngineBuilder {
    db: Database,
    initialization: Vec<(String, ReadTerm)>,
}

impl EngineBuilder {
    pub fn new() -> Result<Self> {
        let mut builder = Self {
            db: Database::default(),
            initialization: Vec::new(),
        };
        builder.consult_str("baseline", BASELINE)?;
        Ok(builder)
    }

    /// Make a native capability callable from rule programs.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> &mut Self {
        self.db
            .capabilities
            .entry(Arc::from(capability.name()))
            .or_default()
            .insert(capability.arity(), capability);
        self
    }

    /// Load the program text `source`. `origin` names it in diagnostics.
    pub fn consult_str(&mut self, origin: &str, source: &str) -> Result<&mut Self> {
        let mut loaded = 0;
        for read in read_program(source)? {
            match read.term.name_and_args() {
                Some((":-", [directive])) => {
                    let directive = directive.clone();
                    self.directive(origin, &directive, read)?;
                }
                _ => {
                    self.db.add_clause(Clause::from_read(read)?)?;
                    loaded += 1;
                }
            }
        }
        debug!(origin, clauses = loaded, "Program loaded");
        Ok(self)
    }

    pub fn consult_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::System(format!("{}: {}", path.display(), e)))?;
        self.consult_str(&path.display().to_string(), &source)
    }

    fn directive(&mut self, origin: &str, directive: &Term, read: ReadTerm) -> Result<()> {
        match directive.name_and_args() {
            Some(("dynamic", [spec])) => self.db.declare_dynamic(spec),
            Some(("initialization", [goal])) => {
                self.initialization.push((
                    origin.to_string(),
                    ReadTerm {
                        term: goal.clone(),
                        ..read
                    },
                ));
                Ok(())
            }
            _ => Err(EngineError::domain_error("directive", directive)),
        }
    }

    /// Freeze the database and run pending initialization goals in load order.
    pub fn build(self) -> Result<Engine> {
        let engine = Engine {
            db: Arc::new(self.db),
        };
        for (origin, goal) in self.initialization {
            let mut solutions = engine.query(&Query::from_read(goal), QueryContext::new());
            match solutions.next() {
                Some(Ok(_)) => debug!(origin = %origin, "Initialization goal succeeded"),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(EngineError::System(format!(
                        "{}: initialization goal failed",
                        origin
                    )))
                }
            }
        }
        Ok(engine)
    }
}

/// A parsed goal plus values for some of its variables.
#[derive(Debug, Clone)]
pub struct Query {
    goal: Term,
    variables: Vec<(String, Var)>,
    var_count: usize,
    bound: Vec<(Var, Term)>,
}

impl Query {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self::from_read(read_term(source)?))
    }

    fn from_read(read: ReadTerm) -> Self {
        Self {
            goal: read.term,
            variables: read.variables,
            var_count: read.var_count,
            bound: Vec::new(),
        }
    }

    /// Bind the named variable to `value` before the query runs.
    ///
    /// Variables inside `value` are private to it. Unknown names are ignored.
    pub fn bind(mut self, name: &str, value: Term) -> Self {
        if let Some(var) = self
            .variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
        {
            self.bound.push((var, value));
        }
        self
    }
}

/// Shared handle to a loaded, immutable rule program.
#[derive(Clone)]
pub struct Engine {
    db: Arc<Database>,
}

impl Engine {
    pub fn builder() -> Result<EngineBuilder> {
        EngineBuilder::new()
    }

    /// Start a query. No work is done until the first solution is requested.
    pub fn query(&self, query: &Query, ctx: QueryContext) -> Solutions {
        let mut bindings = Bindings::with_vars(query.var_count);
        let mut goal = query.goal.clone();
        for (var, value) in &query.bound {
            let (value, count) = normalize(value);
            let base = bindings.alloc(count);
            if !bindings.unify(&Term::Var(*var), &value.offset(base)) {
                goal = Term::atom("fail");
            }
        }
        let machine = Machine::new(self.db.clone(), ctx, bindings);
        Solutions::new(machine, goal, query.variables.clone())
    }

    /// Parse and run `source` with a default context.
    pub fn query_str(&self, source: &str) -> Result<Solutions> {
        Ok(self.query(&Query::parse(source)?, QueryContext::new()))
    }
}
