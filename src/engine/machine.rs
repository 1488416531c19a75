//! Depth-first solver
//!
//! Goals waiting to run form a persistent continuation list. Every point where
//! the search may resume later is pushed on an explicit choice-point stack,
//! so the next solution is only computed when it is asked for.

use std::sync::Arc;

use super::bindings::{normalize, Bindings, Mark};
use super::builtins;
use super::error::{EngineError, Result};
use super::term::{Term, Var};
use super::{Clause, Database, QueryContext};

enum Goal {
    /// Run `term`. A cut inside it truncates the choice stack to `cut_barrier`.
    Call { term: Term, cut_barrier: usize },
    CutTo(usize),
}

struct Frame {
    goal: Goal,
    next: Cont,
}

type Cont = Option<Arc<Frame>>;

fn push_call(term: Term, cut_barrier: usize, next: Cont) -> Cont {
    if matches!(&term, Term::Atom(a) if &**a == "true") {
        return next;
    }
    Some(Arc::new(Frame {
        goal: Goal::Call { term, cut_barrier },
        next,
    }))
}

fn push_cut(height: usize, next: Cont) -> Cont {
    Some(Arc::new(Frame {
        goal: Goal::CutTo(height),
        next,
    }))
}

enum Alternative {
    /// Remaining clauses of a predicate call.
    Clauses {
        goal: Term,
        clauses: Arc<Vec<Clause>>,
        next: usize,
        cont: Cont,
    },
    /// Continue with a saved continuation (else branch, negation success).
    Resume(Cont),
}

struct ChoicePoint {
    mark: Mark,
    alternative: Alternative,
}

enum Step {
    Continue(Cont),
    Fail,
}

pub(super) struct Machine {
    db: Arc<Database>,
    ctx: QueryContext,
    bindings: Bindings,
    choices: Vec<ChoicePoint>,
}

impl Machine {
    pub(super) fn new(db: Arc<Database>, ctx: QueryContext, bindings: Bindings) -> Self {
        Self {
            db,
            ctx,
            bindings,
            choices: Vec::new(),
        }
    }

    pub(super) fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Search for the first solution of `goal`.
    pub(super) fn start(&mut self, goal: Term) -> Result<bool> {
        self.run(push_call(goal, 0, None))
    }

    /// Backtrack into the most recent choice point and search for the next solution.
    pub(super) fn resume(&mut self) -> Result<bool> {
        match self.backtrack()? {
            Some(cont) => self.run(cont),
            None => Ok(false),
        }
    }

    fn run(&mut self, mut cont: Cont) -> Result<bool> {
        loop {
            let Some(frame) = cont else {
                return Ok(true);
            };
            cont = frame.next.clone();
            let step = match &frame.goal {
                Goal::CutTo(height) => {
                    self.choices.truncate(*height);
                    Step::Continue(cont)
                }
                Goal::Call { term, cut_barrier } => self.step(term, *cut_barrier, cont)?,
            };
            cont = match step {
                Step::Continue(next) => next,
                Step::Fail => match self.backtrack()? {
                    Some(next) => next,
                    None => return Ok(false),
                },
            };
        }
    }

    fn backtrack(&mut self) -> Result<Option<Cont>> {
        while let Some(choice) = self.choices.pop() {
            self.bindings.undo(choice.mark);
            match choice.alternative {
                Alternative::Resume(cont) => return Ok(Some(cont)),
                Alternative::Clauses {
                    goal,
                    clauses,
                    next,
                    cont,
                } => {
                    if let Some(cont) = self.try_clauses(&goal, clauses, next, cont) {
                        return Ok(Some(cont));
                    }
                }
            }
        }
        Ok(None)
    }

    fn push_choice(&mut self, alternative: Alternative) {
        self.choices.push(ChoicePoint {
            mark: self.bindings.mark(),
            alternative,
        });
    }

    /// Resolve `goal` against `clauses[start..]`, leaving a choice point for
    /// the clauses after the first one whose head unifies.
    fn try_clauses(
        &mut self,
        goal: &Term,
        clauses: Arc<Vec<Clause>>,
        start: usize,
        cont: Cont,
    ) -> Option<Cont> {
        let height = self.choices.len();
        for index in start..clauses.len() {
            let clause = &clauses[index];
            let mark = self.bindings.mark();
            let base = self.bindings.alloc(clause.var_count);
            if !self.bindings.unify(&clause.head.offset(base), goal) {
                self.bindings.undo(mark);
                continue;
            }
            let body = clause.body.offset(base);
            if index + 1 < clauses.len() {
                self.choices.push(ChoicePoint {
                    mark,
                    alternative: Alternative::Clauses {
                        goal: goal.clone(),
                        clauses: clauses.clone(),
                        next: index + 1,
                        cont: cont.clone(),
                    },
                });
            }
            return Some(push_call(body, height, cont));
        }
        None
    }

    fn step(&mut self, term: &Term, barrier: usize, cont: Cont) -> Result<Step> {
        let goal = self.bindings.deref(term);
        let (name, args) = match &goal {
            Term::Var(_) => return Err(EngineError::Instantiation),
            Term::Atom(_) | Term::Compound(_) => goal.name_and_args().unwrap_or(("", &[])),
            _ => return Err(EngineError::type_error("callable", &goal)),
        };

        match (name, args.len()) {
            ("true", 0) => return Ok(Step::Continue(cont)),
            ("fail", 0) | ("false", 0) => return Ok(Step::Fail),
            ("!", 0) => {
                self.choices.truncate(barrier);
                return Ok(Step::Continue(cont));
            }
            (",", 2) => {
                let rest = push_call(args[1].clone(), barrier, cont);
                return Ok(Step::Continue(push_call(args[0].clone(), barrier, rest)));
            }
            (";", 2) => {
                let left = self.bindings.deref(&args[0]);
                let height = self.choices.len();
                self.push_choice(Alternative::Resume(push_call(
                    args[1].clone(),
                    barrier,
                    cont.clone(),
                )));
                if let Some(("->", [condition, then])) = left.name_and_args() {
                    let then = push_call(then.clone(), barrier, cont);
                    return Ok(Step::Continue(push_call(
                        condition.clone(),
                        height + 1,
                        push_cut(height, then),
                    )));
                }
                return Ok(Step::Continue(push_call(left, barrier, cont)));
            }
            ("->", 2) => {
                let height = self.choices.len();
                let then = push_call(args[1].clone(), barrier, cont);
                return Ok(Step::Continue(push_call(
                    args[0].clone(),
                    height,
                    push_cut(height, then),
                )));
            }
            ("\\+", 1) | ("not", 1) => {
                let height = self.choices.len();
                self.push_choice(Alternative::Resume(cont));
                let fail = push_call(Term::atom("fail"), height, None);
                return Ok(Step::Continue(push_call(
                    args[0].clone(),
                    height + 1,
                    push_cut(height, fail),
                )));
            }
            ("call", n) if n >= 1 => {
                let target = add_args(&self.bindings.deref(&args[0]), &args[1..])?;
                let height = self.choices.len();
                return Ok(Step::Continue(push_call(target, height, cont)));
            }
            ("findall", 3) => {
                let results = self.find_all(&args[0], &args[1])?;
                return Ok(if self.bindings.unify(&Term::list(results), &args[2]) {
                    Step::Continue(cont)
                } else {
                    Step::Fail
                });
            }
            _ => {}
        }

        if let Some(outcome) = builtins::call(name, args, &mut self.bindings) {
            return Ok(if outcome? { Step::Continue(cont) } else { Step::Fail });
        }

        let db = self.db.clone();
        if let Some(capability) = db.capability(name, args.len()) {
            if self.ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let mark = self.bindings.mark();
            if capability.call(args, &mut self.bindings, &self.ctx)? {
                return Ok(Step::Continue(cont));
            }
            self.bindings.undo(mark);
            return Ok(Step::Fail);
        }

        match db.clauses(name, args.len()) {
            Some(clauses) => Ok(match self.try_clauses(&goal, clauses.clone(), 0, cont) {
                Some(next) => Step::Continue(next),
                None => Step::Fail,
            }),
            None if db.is_dynamic(name, args.len()) => Ok(Step::Fail),
            None => Err(EngineError::Existence {
                name: name.to_string(),
                arity: args.len(),
            }),
        }
    }

    /// Collect a copy of `template` for every solution of `goal`.
    ///
    /// The search runs on a separate choice stack and leaves no bindings behind.
    fn find_all(&mut self, template: &Term, goal: &Term) -> Result<Vec<Term>> {
        let saved = std::mem::take(&mut self.choices);
        let mark = self.bindings.mark();
        let collected = self.collect(template, goal);
        self.bindings.undo(mark);
        self.choices = saved;

        Ok(collected?
            .into_iter()
            .map(|(term, count)| {
                let base = self.bindings.alloc(count);
                term.offset(base)
            })
            .collect())
    }

    fn collect(&mut self, template: &Term, goal: &Term) -> Result<Vec<(Term, usize)>> {
        let mut results = Vec::new();
        let mut found = self.start(goal.clone())?;
        while found {
            results.push(normalize(&self.bindings.resolve(template)));
            found = self.resume()?;
        }
        Ok(results)
    }
}

/// Extend a callable term with extra arguments, as `call/N` does.
fn add_args(goal: &Term, extra: &[Term]) -> Result<Term> {
    match goal {
        Term::Var(_) => Err(EngineError::Instantiation),
        Term::Atom(name) => Ok(Term::compound(&**name, extra.to_vec())),
        Term::Compound(c) => {
            let mut args = c.args.clone();
            args.extend_from_slice(extra);
            Ok(Term::compound(&*c.functor, args))
        }
        other => Err(EngineError::type_error("callable", other)),
    }
}

/// One satisfying binding of a query's named variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    values: Vec<(String, Term)>,
}

impl Solution {
    /// Value bound to the named query variable, fully resolved.
    pub fn get(&self, name: &str) -> Option<&Term> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, term)| term)
    }
}

enum State {
    Fresh(Term),
    Running,
    Done,
}

/// Lazy sequence of query solutions.
///
/// Each call to `next` resumes the search exactly as far as the next
/// solution. An error ends the sequence.
pub struct Solutions {
    machine: Machine,
    variables: Vec<(String, Var)>,
    state: State,
}

impl Solutions {
    pub(super) fn new(machine: Machine, goal: Term, variables: Vec<(String, Var)>) -> Self {
        Self {
            machine,
            variables,
            state: State::Fresh(goal),
        }
    }

    fn capture(&self) -> Solution {
        let bindings = self.machine.bindings();
        Solution {
            values: self
                .variables
                .iter()
                .map(|(name, var)| (name.clone(), bindings.resolve(&Term::Var(*var))))
                .collect(),
        }
    }
}

impl Iterator for Solutions {
    type Item = Result<Solution>;

    fn next(&mut self) -> Option<Self::Item> {
        let outcome = match std::mem::replace(&mut self.state, State::Running) {
            State::Fresh(goal) => self.machine.start(goal),
            State::Running => self.machine.resume(),
            State::Done => {
                self.state = State::Done;
                return None;
            }
        };
        match outcome {
            Ok(true) => Some(Ok(self.capture())),
            Ok(false) => {
                self.state = State::Done;
                None
            }
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}
