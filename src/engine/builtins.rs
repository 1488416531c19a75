//! Deterministic builtin predicates
//!
//! Each builtin either succeeds once, fails, or raises an error. Control
//! constructs live in the solver.

use std::cmp::Ordering;

use super::bindings::Bindings;
use super::error::{EngineError, Result};
use super::term::Term;

/// Run the builtin `name/args.len()`, or return `None` if there is no such builtin.
pub(super) fn call(name: &str, args: &[Term], bindings: &mut Bindings) -> Option<Result<bool>> {
    let outcome = match (name, args) {
        ("=", [a, b]) => Ok(bindings.unify(a, b)),
        ("\\=", [a, b]) => {
            let mark = bindings.mark();
            let unified = bindings.unify(a, b);
            bindings.undo(mark);
            Ok(!unified)
        }
        ("==", [a, b]) => Ok(order(bindings, a, b) == Ordering::Equal),
        ("\\==", [a, b]) => Ok(order(bindings, a, b) != Ordering::Equal),
        ("@<", [a, b]) => Ok(order(bindings, a, b) == Ordering::Less),
        ("@>", [a, b]) => Ok(order(bindings, a, b) == Ordering::Greater),
        ("@=<", [a, b]) => Ok(order(bindings, a, b) != Ordering::Greater),
        ("@>=", [a, b]) => Ok(order(bindings, a, b) != Ordering::Less),

        ("is", [result, expr]) => {
            eval(bindings, expr).and_then(|value| Ok(bindings.unify(result, &value.into())))
        }
        ("=:=", [a, b]) => compare_numbers(bindings, a, b).map(|o| o == Ordering::Equal),
        ("=\\=", [a, b]) => compare_numbers(bindings, a, b).map(|o| o != Ordering::Equal),
        ("<", [a, b]) => compare_numbers(bindings, a, b).map(|o| o == Ordering::Less),
        (">", [a, b]) => compare_numbers(bindings, a, b).map(|o| o == Ordering::Greater),
        ("=<", [a, b]) => compare_numbers(bindings, a, b).map(|o| o != Ordering::Greater),
        (">=", [a, b]) => compare_numbers(bindings, a, b).map(|o| o != Ordering::Less),

        ("var", [t]) => Ok(bindings.deref(t).is_var()),
        ("nonvar", [t]) => Ok(!bindings.deref(t).is_var()),
        ("atom", [t]) => Ok(matches!(bindings.deref(t), Term::Atom(_))),
        ("number", [t]) => Ok(matches!(bindings.deref(t), Term::Integer(_) | Term::Float(_))),
        ("integer", [t]) => Ok(matches!(bindings.deref(t), Term::Integer(_))),
        ("float", [t]) => Ok(matches!(bindings.deref(t), Term::Float(_))),
        ("atomic", [t]) => Ok(matches!(
            bindings.deref(t),
            Term::Atom(_) | Term::Integer(_) | Term::Float(_)
        )),
        ("compound", [t]) => Ok(matches!(bindings.deref(t), Term::Compound(_) | Term::Cons(_))),
        ("callable", [t]) => Ok(matches!(bindings.deref(t), Term::Atom(_) | Term::Compound(_))),
        ("is_list", [t]) => Ok(bindings.list_items(t).is_ok()),

        ("atom_length", [atom, length]) => atom_length(bindings, atom, length),
        ("atom_concat", [a, b, whole]) => atom_concat(bindings, a, b, whole),
        ("atom_number", [atom, number]) => atom_number(bindings, atom, number),
        ("length", [list, length]) => list_length(bindings, list, length),
        ("functor", [term, name, arity]) => functor(bindings, term, name, arity),
        ("=..", [term, list]) => univ(bindings, term, list),
        ("copy_term", [original, copy]) => {
            let fresh = bindings.copy(original);
            Ok(bindings.unify(&fresh, copy))
        }
        _ => return None,
    };
    Some(outcome)
}

// ============================================================================
// Standard order
// ============================================================================

fn rank(term: &Term) -> u8 {
    match term {
        Term::Var(_) => 0,
        Term::Integer(_) | Term::Float(_) => 1,
        Term::Atom(_) => 3,
        Term::Compound(_) | Term::Cons(_) => 4,
    }
}

fn order(bindings: &Bindings, a: &Term, b: &Term) -> Ordering {
    compare_terms(&bindings.resolve(a), &bindings.resolve(b))
}

fn compare_terms(a: &Term, b: &Term) -> Ordering {
    match (a, b) {
        (Term::Var(x), Term::Var(y)) => x.cmp(y),
        (Term::Integer(x), Term::Integer(y)) => x.cmp(y),
        (Term::Atom(x), Term::Atom(y)) => x.cmp(y),
        (x @ (Term::Integer(_) | Term::Float(_)), y @ (Term::Integer(_) | Term::Float(_))) => {
            let (fx, fy) = (as_f64(x), as_f64(y));
            fx.partial_cmp(&fy)
                .unwrap_or(Ordering::Equal)
                .then_with(|| matches!(y, Term::Float(_)).cmp(&matches!(x, Term::Float(_))))
        }
        (x @ (Term::Compound(_) | Term::Cons(_)), y @ (Term::Compound(_) | Term::Cons(_))) => {
            let (xn, xa) = structure(x);
            let (yn, ya) = structure(y);
            xa.len()
                .cmp(&ya.len())
                .then_with(|| xn.cmp(yn))
                .then_with(|| {
                    xa.iter()
                        .zip(ya.iter())
                        .map(|(l, r)| compare_terms(l, r))
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                })
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn structure(term: &Term) -> (&str, Vec<Term>) {
    match term {
        Term::Compound(c) => (&c.functor, c.args.clone()),
        Term::Cons(cell) => (".", vec![cell.0.clone(), cell.1.clone()]),
        _ => ("", Vec::new()),
    }
}

fn as_f64(term: &Term) -> f64 {
    match term {
        Term::Integer(i) => *i as f64,
        Term::Float(x) => *x,
        _ => f64::NAN,
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn to_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }
}

impl From<Number> for Term {
    fn from(value: Number) -> Self {
        match value {
            Number::Int(i) => Term::Integer(i),
            Number::Float(x) => Term::Float(x),
        }
    }
}

fn compare_numbers(bindings: &Bindings, a: &Term, b: &Term) -> Result<Ordering> {
    match (eval(bindings, a)?, eval(bindings, b)?) {
        (Number::Int(x), Number::Int(y)) => Ok(x.cmp(&y)),
        (x, y) => Ok(x.to_f64().partial_cmp(&y.to_f64()).unwrap_or(Ordering::Equal)),
    }
}

fn overflow() -> EngineError {
    EngineError::Evaluation("int_overflow")
}

fn int_op(
    x: Number,
    y: Number,
    culprit: &Term,
    op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Number> {
    match (x, y) {
        (Number::Int(a), Number::Int(b)) => op(a, b).map(Number::Int).ok_or_else(overflow),
        _ => Err(EngineError::type_error("integer", culprit)),
    }
}

fn mixed_op(
    x: Number,
    y: Number,
    int: impl Fn(i64, i64) -> Option<i64>,
    float: impl Fn(f64, f64) -> f64,
) -> Result<Number> {
    match (x, y) {
        (Number::Int(a), Number::Int(b)) => int(a, b).map(Number::Int).ok_or_else(overflow),
        _ => Ok(Number::Float(float(x.to_f64(), y.to_f64()))),
    }
}

fn eval(bindings: &Bindings, expr: &Term) -> Result<Number> {
    let expr = bindings.deref(expr);
    match &expr {
        Term::Integer(i) => Ok(Number::Int(*i)),
        Term::Float(x) => Ok(Number::Float(*x)),
        Term::Var(_) => Err(EngineError::Instantiation),
        Term::Compound(c) if c.args.len() == 1 => {
            let x = eval(bindings, &c.args[0])?;
            match &*c.functor {
                "-" => match x {
                    Number::Int(i) => i.checked_neg().map(Number::Int).ok_or_else(overflow),
                    Number::Float(f) => Ok(Number::Float(-f)),
                },
                "+" => Ok(x),
                "abs" => match x {
                    Number::Int(i) => i.checked_abs().map(Number::Int).ok_or_else(overflow),
                    Number::Float(f) => Ok(Number::Float(f.abs())),
                },
                "sign" => match x {
                    Number::Int(i) => Ok(Number::Int(i.signum())),
                    Number::Float(f) => Ok(Number::Float(if f == 0.0 { 0.0 } else { f.signum() })),
                },
                "float" => Ok(Number::Float(x.to_f64())),
                "integer" => Ok(Number::Int(x.to_f64().round() as i64)),
                "truncate" => Ok(Number::Int(x.to_f64().trunc() as i64)),
                _ => Err(EngineError::type_error("evaluable", &expr)),
            }
        }
        Term::Compound(c) if c.args.len() == 2 => {
            let x = eval(bindings, &c.args[0])?;
            let y = eval(bindings, &c.args[1])?;
            match &*c.functor {
                "+" => mixed_op(x, y, i64::checked_add, |a, b| a + b),
                "-" => mixed_op(x, y, i64::checked_sub, |a, b| a - b),
                "*" => mixed_op(x, y, i64::checked_mul, |a, b| a * b),
                "/" => divide(x, y),
                "//" => {
                    check_divisor(y)?;
                    int_op(x, y, &expr, i64::checked_div)
                }
                "mod" => {
                    check_divisor(y)?;
                    int_op(x, y, &expr, |a, b| {
                        a.checked_rem(b)
                            .map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
                    })
                }
                "rem" => {
                    check_divisor(y)?;
                    int_op(x, y, &expr, i64::checked_rem)
                }
                "min" => Ok(if compare(x, y) == Ordering::Greater { y } else { x }),
                "max" => Ok(if compare(x, y) == Ordering::Less { y } else { x }),
                "**" => Ok(Number::Float(x.to_f64().powf(y.to_f64()))),
                "^" => match (x, y) {
                    (Number::Int(_), Number::Int(b)) if b < 0 => {
                        Err(EngineError::Evaluation("undefined"))
                    }
                    (Number::Int(a), Number::Int(b)) => u32::try_from(b)
                        .ok()
                        .and_then(|b| a.checked_pow(b))
                        .map(Number::Int)
                        .ok_or_else(overflow),
                    _ => Ok(Number::Float(x.to_f64().powf(y.to_f64()))),
                },
                ">>" => int_op(x, y, &expr, |a, b| u32::try_from(b).ok().and_then(|b| a.checked_shr(b))),
                "<<" => int_op(x, y, &expr, |a, b| u32::try_from(b).ok().and_then(|b| a.checked_shl(b))),
                "/\\" => int_op(x, y, &expr, |a, b| Some(a & b)),
                "\\/" => int_op(x, y, &expr, |a, b| Some(a | b)),
                _ => Err(EngineError::type_error("evaluable", &expr)),
            }
        }
        _ => Err(EngineError::type_error("evaluable", &expr)),
    }
}

fn compare(x: Number, y: Number) -> Ordering {
    match (x, y) {
        (Number::Int(a), Number::Int(b)) => a.cmp(&b),
        _ => x.to_f64().partial_cmp(&y.to_f64()).unwrap_or(Ordering::Equal),
    }
}

fn check_divisor(y: Number) -> Result<()> {
    if y.to_f64() == 0.0 {
        return Err(EngineError::Evaluation("zero_divisor"));
    }
    Ok(())
}

fn divide(x: Number, y: Number) -> Result<Number> {
    check_divisor(y)?;
    match (x, y) {
        (Number::Int(a), Number::Int(b)) if a.checked_rem(b) == Some(0) => {
            a.checked_div(b).map(Number::Int).ok_or_else(overflow)
        }
        _ => Ok(Number::Float(x.to_f64() / y.to_f64())),
    }
}

// ============================================================================
// Atoms and structure
// ============================================================================

fn text_of(term: &Term) -> Option<String> {
    match term {
        Term::Atom(a) => Some(a.to_string()),
        Term::Integer(_) | Term::Float(_) => Some(term.to_string()),
        _ => None,
    }
}

fn expect_text(bindings: &Bindings, term: &Term) -> Result<Option<String>> {
    match bindings.deref(term) {
        Term::Var(_) => Ok(None),
        t => text_of(&t)
            .map(Some)
            .ok_or_else(|| EngineError::type_error("atomic", &t)),
    }
}

fn atom_length(bindings: &mut Bindings, atom: &Term, length: &Term) -> Result<bool> {
    let text = expect_text(bindings, atom)?.ok_or(EngineError::Instantiation)?;
    let count = text.chars().count() as i64;
    Ok(bindings.unify(length, &Term::Integer(count)))
}

fn atom_concat(bindings: &mut Bindings, a: &Term, b: &Term, whole: &Term) -> Result<bool> {
    match (
        expect_text(bindings, a)?,
        expect_text(bindings, b)?,
        expect_text(bindings, whole)?,
    ) {
        (Some(x), Some(y), _) => Ok(bindings.unify(whole, &Term::atom(format!("{}{}", x, y)))),
        (Some(x), None, Some(w)) => Ok(match w.strip_prefix(&x) {
            Some(rest) => bindings.unify(b, &Term::atom(rest)),
            None => false,
        }),
        (None, Some(y), Some(w)) => Ok(match w.strip_suffix(&y) {
            Some(rest) => bindings.unify(a, &Term::atom(rest)),
            None => false,
        }),
        _ => Err(EngineError::Instantiation),
    }
}

fn atom_number(bindings: &mut Bindings, atom: &Term, number: &Term) -> Result<bool> {
    match bindings.deref(atom) {
        Term::Atom(text) => {
            let parsed = if let Ok(i) = text.parse::<i64>() {
                Term::Integer(i)
            } else if let Ok(x) = text.parse::<f64>() {
                Term::Float(x)
            } else {
                return Ok(false);
            };
            Ok(bindings.unify(number, &parsed))
        }
        Term::Var(_) => match bindings.deref(number) {
            n @ (Term::Integer(_) | Term::Float(_)) => {
                Ok(bindings.unify(atom, &Term::atom(n.to_string())))
            }
            Term::Var(_) => Err(EngineError::Instantiation),
            other => Err(EngineError::type_error("number", &other)),
        },
        other => Err(EngineError::type_error("atom", &other)),
    }
}

fn list_length(bindings: &mut Bindings, list: &Term, length: &Term) -> Result<bool> {
    match bindings.list_items(list) {
        Ok(items) => Ok(bindings.unify(length, &Term::Integer(items.len() as i64))),
        Err(EngineError::Instantiation) => match bindings.deref(length) {
            Term::Integer(n) if n >= 0 => {
                let items: Vec<Term> = (0..n).map(|_| bindings.fresh()).collect();
                Ok(bindings.unify(list, &Term::list(items)))
            }
            Term::Integer(_) => Err(EngineError::domain_error("not_less_than_zero", length)),
            Term::Var(_) => Err(EngineError::Instantiation),
            other => Err(EngineError::type_error("integer", &other)),
        },
        Err(_) => Ok(false),
    }
}

fn functor(bindings: &mut Bindings, term: &Term, name: &Term, arity: &Term) -> Result<bool> {
    match bindings.deref(term) {
        Term::Var(_) => {
            let name = bindings.deref(name);
            let arity = match bindings.deref(arity) {
                Term::Integer(n) if n >= 0 => n as usize,
                Term::Var(_) => return Err(EngineError::Instantiation),
                other => return Err(EngineError::type_error("integer", &other)),
            };
            let built = match (&name, arity) {
                (Term::Var(_), _) => return Err(EngineError::Instantiation),
                (_, 0) => name.clone(),
                (Term::Atom(functor), n) => {
                    let args = (0..n).map(|_| bindings.fresh()).collect();
                    Term::compound(&**functor, args)
                }
                (other, _) => return Err(EngineError::type_error("atom", other)),
            };
            Ok(bindings.unify(term, &built))
        }
        Term::Compound(c) => Ok(bindings.unify(name, &Term::Atom(c.functor.clone()))
            && bindings.unify(arity, &Term::Integer(c.args.len() as i64))),
        Term::Cons(_) => {
            Ok(bindings.unify(name, &Term::atom(".")) && bindings.unify(arity, &Term::Integer(2)))
        }
        atomic => Ok(bindings.unify(name, &atomic) && bindings.unify(arity, &Term::Integer(0))),
    }
}

fn univ(bindings: &mut Bindings, term: &Term, list: &Term) -> Result<bool> {
    match bindings.deref(term) {
        Term::Var(_) => {
            let items = bindings.list_items(list)?;
            let Some((head, args)) = items.split_first() else {
                return Err(EngineError::domain_error("non_empty_list", list));
            };
            let built = match bindings.deref(head) {
                Term::Var(_) => return Err(EngineError::Instantiation),
                Term::Atom(name) => Term::compound(&*name, args.to_vec()),
                atomic if args.is_empty() => atomic,
                other => return Err(EngineError::type_error("atom", &other)),
            };
            Ok(bindings.unify(term, &built))
        }
        Term::Compound(c) => {
            let mut items = vec![Term::Atom(c.functor.clone())];
            items.extend(c.args.iter().cloned());
            Ok(bindings.unify(list, &Term::list(items)))
        }
        Term::Cons(cell) => {
            let items = vec![Term::atom("."), cell.0.clone(), cell.1.clone()];
            Ok(bindings.unify(list, &Term::list(items)))
        }
        atomic => Ok(bindings.unify(list, &Term::list(vec![atomic]))),
    }
}
