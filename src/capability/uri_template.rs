//! `uri_template(+Template, +Pairs, ?Expanded)`
//!
//! RFC 6570 URI templates, levels 1 through 4. Parsing and expansion are
//! done by `iri-string`; this module maps terms onto template values.

use iri_string::spec::UriSpec;
use iri_string::template::simple_context::{SimpleContext, Value};
use iri_string::template::UriTemplateStr;

use super::{atom_arg, pair, Capability};
use crate::engine::{Bindings, EngineError, QueryContext, Result, Term};

/// Expands a URI template with values from a `Name-Value` list.
pub struct UriTemplate;

/// Text of an atomic term, or `None` for an unbound one.
fn scalar(term: &Term) -> Option<String> {
    match term {
        Term::Var(_) => None,
        Term::Atom(a) => Some(a.to_string()),
        other => Some(other.to_string()),
    }
}

fn value_of(bindings: &Bindings, term: &Term) -> Result<Option<Value>> {
    match term {
        Term::Var(_) => Ok(None),
        Term::Cons(_) => {
            let items = bindings.list_items(term)?;
            let pairs: Option<Vec<(String, String)>> = items
                .iter()
                .map(|item| {
                    let (k, v) = pair(bindings, item)?;
                    Some((scalar(&k)?, scalar(&v)?))
                })
                .collect();
            if let Some(pairs) = pairs {
                return Ok(Some(Value::Assoc(pairs)));
            }
            Ok(Some(Value::List(
                items
                    .iter()
                    .filter_map(|item| scalar(&bindings.resolve(item)))
                    .collect(),
            )))
        }
        t if t.is_nil() => Ok(Some(Value::List(Vec::new()))),
        other => Ok(scalar(other).map(Value::String)),
    }
}

impl Capability for UriTemplate {
    fn name(&self) -> &'static str {
        "uri_template"
    }

    fn arity(&self) -> usize {
        3
    }

    fn call(&self, args: &[Term], bindings: &mut Bindings, _ctx: &QueryContext) -> Result<bool> {
        let [template, pairs, expanded] = args else {
            return Ok(false);
        };

        let raw = atom_arg(bindings, template)?;
        let template = UriTemplateStr::new(&raw)
            .map_err(|_| EngineError::domain_error("uri_template", &Term::Atom(raw.clone())))?;

        let mut context = SimpleContext::new();
        for item in bindings.list_items(pairs)? {
            let Some((key, value)) = pair(bindings, &item) else {
                continue;
            };
            let Term::Atom(key) = key else {
                continue;
            };
            if let Some(value) = value_of(bindings, &value)? {
                context.insert(key.to_string(), value);
            }
        }

        let result = template
            .expand::<UriSpec, _>(&context)
            .map_err(|_| EngineError::domain_error("uri_template", &Term::Atom(raw.clone())))?
            .to_string();
        Ok(bindings.unify(expanded, &Term::atom(result)))
    }
}
