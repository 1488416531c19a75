//! `log(+Level, +Message, +Pairs)`

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::{atom_arg, pair, Capability};
use crate::engine::{Bindings, EngineError, QueryContext, Result, Term};

/// Emits a record on the request span. Fails when the query has no span.
pub struct Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

fn level_arg(bindings: &Bindings, term: &Term) -> Result<Level> {
    let atom = atom_arg(bindings, term)?;
    match &*atom {
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warn" => Ok(Level::Warn),
        "error" => Ok(Level::Error),
        _ => Err(EngineError::domain_error("log_level", &Term::Atom(atom))),
    }
}

fn field_value(term: &Term) -> Value {
    match term {
        Term::Atom(a) => Value::String(a.to_string()),
        Term::Integer(i) => Value::from(*i),
        Term::Float(x) => serde_json::Number::from_f64(*x)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(x.to_string())),
        other => Value::String(other.to_string()),
    }
}

fn fields_arg(bindings: &Bindings, pairs: &Term) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for item in bindings.list_items(pairs)? {
        let item = bindings.deref(&item);
        if item.is_var() {
            return Err(EngineError::Instantiation);
        }
        let not_a_pair = || EngineError::type_error("pair", &bindings.resolve(&item));
        let (key, value) = pair(bindings, &item).ok_or_else(not_a_pair)?;
        let Term::Atom(key) = key else {
            return Err(not_a_pair());
        };
        if value.is_var() {
            return Err(EngineError::Instantiation);
        }
        fields.insert(key.to_string(), field_value(&bindings.resolve(&value)));
    }
    Ok(fields)
}

impl Capability for Log {
    fn name(&self) -> &'static str {
        "log"
    }

    fn arity(&self) -> usize {
        3
    }

    fn call(&self, args: &[Term], bindings: &mut Bindings, ctx: &QueryContext) -> Result<bool> {
        let [level, message, pairs] = args else {
            return Ok(false);
        };
        let Some(span) = ctx.span() else {
            return Ok(false);
        };

        let level = level_arg(bindings, level)?;
        let fields = Value::Object(fields_arg(bindings, pairs)?);
        let message = atom_arg(bindings, message)?;

        match level {
            Level::Debug => debug!(parent: span, fields = %fields, "{}", message),
            Level::Info => info!(parent: span, fields = %fields, "{}", message),
            Level::Warn => warn!(parent: span, fields = %fields, "{}", message),
            Level::Error => error!(parent: span, fields = %fields, "{}", message),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Span;

    fn log(ctx: &QueryContext, args: [Term; 3]) -> Result<bool> {
        let mut bindings = Bindings::with_vars(1);
        Log.call(&args, &mut bindings, ctx)
    }

    fn with_span() -> QueryContext {
        QueryContext::with_span(Span::none())
    }

    #[test]
    fn test_log_without_span_fails() {
        let result = log(
            &QueryContext::new(),
            [Term::atom("info"), Term::atom("hello"), Term::nil()],
        );
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn test_log_with_span() {
        let pairs = Term::list(vec![
            Term::pair(Term::atom("proxy"), Term::atom("localhost:8080")),
            Term::pair(Term::atom("attempt"), Term::Integer(2)),
        ]);
        for level in ["debug", "info", "warn", "error"] {
            let result = log(&with_span(), [Term::atom(level), Term::atom("hello"), pairs.clone()]);
            assert_eq!(result, Ok(true));
        }
    }

    #[test]
    fn test_log_argument_errors() {
        let ctx = with_span();
        assert_eq!(
            log(&ctx, [Term::var(0), Term::atom("m"), Term::nil()]),
            Err(EngineError::Instantiation)
        );
        assert_eq!(
            log(&ctx, [Term::atom("trace"), Term::atom("m"), Term::nil()]),
            Err(EngineError::domain_error("log_level", &Term::atom("trace")))
        );
        assert_eq!(
            log(&ctx, [Term::atom("info"), Term::atom("m"), Term::list(vec![Term::atom("x")])]),
            Err(EngineError::type_error("pair", &Term::atom("x")))
        );
        assert_eq!(
            log(
                &ctx,
                [
                    Term::atom("info"),
                    Term::atom("m"),
                    Term::list(vec![Term::pair(Term::atom("k"), Term::var(0))])
                ]
            ),
            Err(EngineError::Instantiation)
        );
        assert_eq!(
            log(&ctx, [Term::atom("info"), Term::Integer(1), Term::nil()]),
            Err(EngineError::type_error("atom", &Term::Integer(1)))
        );
    }

    #[test]
    fn test_field_values() {
        assert_eq!(field_value(&Term::atom("a")), Value::String("a".into()));
        assert_eq!(field_value(&Term::Integer(3)), Value::from(3));
        assert_eq!(field_value(&Term::Float(1.5)), Value::from(1.5));
        assert_eq!(
            field_value(&Term::compound("f", vec![Term::atom("x")])),
            Value::String("f(x)".into())
        );
    }
}
