//! Substitution environment
//!
//! Bindings are recorded on a trail so that backtracking can undo them back to
//! a mark. Unification does not perform the occurs check.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{EngineError, Result};
use super::term::{Compound, Term, Var};

/// Position in the binding history that can be restored on backtracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    trail: usize,
    vars: usize,
}

/// Variable binding environment for one query
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    slots: Vec<Option<Term>>,
    trail: Vec<usize>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment with `count` unbound variables, numbered from zero.
    pub fn with_vars(count: usize) -> Self {
        let mut bindings = Self::new();
        bindings.alloc(count);
        bindings
    }

    /// Allocate `count` fresh variables and return the index of the first.
    pub fn alloc(&mut self, count: usize) -> usize {
        let base = self.slots.len();
        self.slots.resize(base + count, None);
        base
    }

    pub fn fresh(&mut self) -> Term {
        Term::var(self.alloc(1))
    }

    pub fn mark(&self) -> Mark {
        Mark {
            trail: self.trail.len(),
            vars: self.slots.len(),
        }
    }

    /// Undo every binding made since `mark` and drop variables allocated after it.
    pub fn undo(&mut self, mark: Mark) {
        while self.trail.len() > mark.trail {
            if let Some(index) = self.trail.pop() {
                if let Some(slot) = self.slots.get_mut(index) {
                    *slot = None;
                }
            }
        }
        self.slots.truncate(mark.vars);
    }

    fn bind(&mut self, var: Var, value: Term) {
        if var.0 >= self.slots.len() {
            self.slots.resize(var.0 + 1, None);
        }
        self.slots[var.0] = Some(value);
        self.trail.push(var.0);
    }

    /// Follow variable bindings until reaching an unbound variable or a non-variable.
    pub fn deref(&self, term: &Term) -> Term {
        let mut current = term;
        loop {
            match current {
                Term::Var(Var(i)) => match self.slots.get(*i) {
                    Some(Some(bound)) => current = bound,
                    _ => return current.clone(),
                },
                _ => return current.clone(),
            }
        }
    }

    /// Fully substitute bound variables throughout `term`.
    pub fn resolve(&self, term: &Term) -> Term {
        match self.deref(term) {
            Term::Compound(c) => Term::Compound(Arc::new(Compound {
                functor: c.functor.clone(),
                args: c.args.iter().map(|a| self.resolve(a)).collect(),
            })),
            Term::Cons(cell) => Term::cons(self.resolve(&cell.0), self.resolve(&cell.1)),
            other => other,
        }
    }

    pub fn unify(&mut self, a: &Term, b: &Term) -> bool {
        let mut pending = vec![(a.clone(), b.clone())];
        while let Some((a, b)) = pending.pop() {
            let a = self.deref(&a);
            let b = self.deref(&b);
            match (&a, &b) {
                (Term::Var(x), Term::Var(y)) if x == y => {}
                (Term::Var(x), _) => self.bind(*x, b.clone()),
                (_, Term::Var(y)) => self.bind(*y, a.clone()),
                (Term::Atom(x), Term::Atom(y)) => {
                    if x != y {
                        return false;
                    }
                }
                (Term::Integer(x), Term::Integer(y)) => {
                    if x != y {
                        return false;
                    }
                }
                (Term::Float(x), Term::Float(y)) => {
                    if x != y {
                        return false;
                    }
                }
                (Term::Compound(x), Term::Compound(y)) => {
                    if x.functor != y.functor || x.args.len() != y.args.len() {
                        return false;
                    }
                    pending.extend(x.args.iter().cloned().zip(y.args.iter().cloned()));
                }
                (Term::Cons(x), Term::Cons(y)) => {
                    pending.push((x.0.clone(), y.0.clone()));
                    pending.push((x.1.clone(), y.1.clone()));
                }
                _ => return false,
            }
        }
        true
    }

    /// Iterate over the elements of a proper list.
    ///
    /// Raises an instantiation error for a partial list and a type error for
    /// anything that is not a list.
    pub fn list_items(&self, term: &Term) -> Result<Vec<Term>> {
        let mut items = Vec::new();
        let mut current = self.deref(term);
        loop {
            match current {
                Term::Cons(cell) => {
                    items.push(cell.0.clone());
                    current = self.deref(&cell.1);
                }
                t if t.is_nil() => return Ok(items),
                Term::Var(_) => return Err(EngineError::Instantiation),
                _ => return Err(EngineError::type_error("list", &self.resolve(term))),
            }
        }
    }

    /// Copy `term` replacing each unbound variable with a fresh one.
    pub fn copy(&mut self, term: &Term) -> Term {
        let mut renamed = HashMap::new();
        self.copy_with(term, &mut renamed)
    }

    fn copy_with(&mut self, term: &Term, renamed: &mut HashMap<Var, Term>) -> Term {
        match self.deref(term) {
            Term::Var(v) => {
                if let Some(fresh) = renamed.get(&v) {
                    return fresh.clone();
                }
                let fresh = self.fresh();
                renamed.insert(v, fresh.clone());
                fresh
            }
            Term::Compound(c) => {
                let args = c.args.iter().map(|a| self.copy_with(a, renamed)).collect();
                Term::Compound(Arc::new(Compound {
                    functor: c.functor.clone(),
                    args,
                }))
            }
            Term::Cons(cell) => {
                let head = self.copy_with(&cell.0, renamed);
                let tail = self.copy_with(&cell.1, renamed);
                Term::cons(head, tail)
            }
            other => other,
        }
    }
}

/// Rename the unbound variables of a resolved term to `0..n`, returning the
/// renamed term and `n`. Used to move terms between binding environments.
pub fn normalize(term: &Term) -> (Term, usize) {
    fn walk(term: &Term, renamed: &mut HashMap<Var, usize>) -> Term {
        match term {
            Term::Var(v) => {
                let next = renamed.len();
                Term::var(*renamed.entry(*v).or_insert(next))
            }
            Term::Compound(c) => Term::Compound(Arc::new(Compound {
                functor: c.functor.clone(),
                args: c.args.iter().map(|a| walk(a, renamed)).collect(),
            })),
            Term::Cons(cell) => {
                let head = walk(&cell.0, renamed);
                Term::cons(head, walk(&cell.1, renamed))
            }
            other => other.clone(),
        }
    }

    let mut renamed = HashMap::new();
    let term = walk(term, &mut renamed);
    (term, renamed.len())
}
