//! Rule program value domain
//!
//! Terms are immutable and cheaply clonable. Variables are indices into a
//! [`Bindings`](super::Bindings) environment; they carry no value themselves.

use std::fmt;
use std::sync::Arc;

/// Atom naming the empty list.
pub const NIL: &str = "[]";

/// Variable handle, an index into the binding environment of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(pub usize);

/// Compound term: functor plus ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    pub functor: Arc<str>,
    pub args: Vec<Term>,
}

/// A rule program value
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Atom(Arc<str>),
    Integer(i64),
    Float(f64),
    Var(Var),
    Compound(Arc<Compound>),
    /// List cell `[Head|Tail]`. The empty list is the atom `[]`.
    Cons(Arc<(Term, Term)>),
}

impl Term {
    pub fn atom(name: impl AsRef<str>) -> Self {
        Term::Atom(Arc::from(name.as_ref()))
    }

    pub fn nil() -> Self {
        Term::atom(NIL)
    }

    pub fn var(index: usize) -> Self {
        Term::Var(Var(index))
    }

    /// Build a compound term. A compound with no arguments is the atom itself.
    pub fn compound(functor: impl AsRef<str>, args: Vec<Term>) -> Self {
        if args.is_empty() {
            return Term::atom(functor);
        }
        Term::Compound(Arc::new(Compound {
            functor: Arc::from(functor.as_ref()),
            args,
        }))
    }

    pub fn cons(head: Term, tail: Term) -> Self {
        Term::Cons(Arc::new((head, tail)))
    }

    /// `Key-Value` pair term.
    pub fn pair(key: Term, value: Term) -> Self {
        Term::compound("-", vec![key, value])
    }

    /// Proper list of the given items.
    pub fn list(items: impl IntoIterator<Item = Term>) -> Self {
        Term::list_with_tail(items, Term::nil())
    }

    /// List of the given items ending in `tail` instead of `[]`.
    pub fn list_with_tail(items: impl IntoIterator<Item = Term>, tail: Term) -> Self {
        let items: Vec<Term> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(tail, |tail, head| Term::cons(head, tail))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Term::Atom(a) if &**a == NIL)
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(a) => Some(a),
            _ => None,
        }
    }

    /// Name and arguments of a callable term.
    pub fn name_and_args(&self) -> Option<(&str, &[Term])> {
        match self {
            Term::Atom(a) => Some((a, &[])),
            Term::Compound(c) => Some((&c.functor, &c.args)),
            _ => None,
        }
    }

    /// `Name/Arity` indicator term for this callable.
    pub fn indicator(&self) -> Option<(Arc<str>, usize)> {
        match self {
            Term::Atom(a) => Some((a.clone(), 0)),
            Term::Compound(c) => Some((c.functor.clone(), c.args.len())),
            _ => None,
        }
    }

    /// Shift every variable index by `base`.
    pub fn offset(&self, base: usize) -> Term {
        if base == 0 {
            return self.clone();
        }
        match self {
            Term::Var(Var(i)) => Term::Var(Var(i + base)),
            Term::Compound(c) => Term::Compound(Arc::new(Compound {
                functor: c.functor.clone(),
                args: c.args.iter().map(|a| a.offset(base)).collect(),
            })),
            Term::Cons(cell) => Term::cons(cell.0.offset(base), cell.1.offset(base)),
            other => other.clone(),
        }
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::atom(value)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Integer(value)
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Float(value)
    }
}

/// Binary operators written infix when displaying terms.
fn infix_operator(name: &str) -> bool {
    matches!(
        name,
        ":-" | ";" | "->" | "," | "=" | "\\=" | "==" | "\\==" | "is" | "=:=" | "=\\=" | "<"
            | ">" | "=<" | ">=" | "=.." | "+" | "-" | "*" | "/" | "//" | "mod" | "rem" | ":"
            | "^" | "**"
    )
}

fn is_letter_atom(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

fn is_symbol_atom(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| "+-*/\\^<>=~:.?@#&$".contains(c))
}

fn needs_quotes(name: &str) -> bool {
    !(is_letter_atom(name) || is_symbol_atom(name) || matches!(name, NIL | "!" | ";" | "{}"))
}

fn write_atom(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if !needs_quotes(name) {
        return f.write_str(name);
    }
    f.write_str("'")?;
    for c in name.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("'")
}

fn write_operand(f: &mut fmt::Formatter<'_>, term: &Term) -> fmt::Result {
    match term {
        Term::Compound(c) if c.args.len() == 2 && infix_operator(&c.functor) => {
            write!(f, "({})", term)
        }
        _ => write!(f, "{}", term),
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Atom(a) => write_atom(f, a),
            Term::Integer(i) => write!(f, "{}", i),
            Term::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Term::Var(Var(i)) => write!(f, "_G{}", i),
            Term::Compound(c) => {
                if c.args.len() == 2 && infix_operator(&c.functor) {
                    write_operand(f, &c.args[0])?;
                    if c.functor.chars().all(|ch| ch.is_ascii_alphabetic()) || &*c.functor == ":-"
                    {
                        write!(f, " {} ", c.functor)?;
                    } else if &*c.functor == "," {
                        f.write_str(",")?;
                    } else {
                        f.write_str(&c.functor)?;
                    }
                    return write_operand(f, &c.args[1]);
                }
                write_atom(f, &c.functor)?;
                f.write_str("(")?;
                for (i, arg) in c.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Term::Cons(_) => {
                f.write_str("[")?;
                let mut current = self;
                let mut first = true;
                loop {
                    match current {
                        Term::Cons(cell) => {
                            if !first {
                                f.write_str(",")?;
                            }
                            first = false;
                            write!(f, "{}", cell.0)?;
                            current = &cell.1;
                        }
                        t if t.is_nil() => break,
                        tail => {
                            write!(f, "|{}", tail)?;
                            break;
                        }
                    }
                }
                f.write_str("]")
            }
        }
    }
}
