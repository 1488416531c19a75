use thiserror::Error;

use super::term::Term;

/// Errors raised while reading or evaluating a rule program.
///
/// Every variant aborts the query that raised it; none is mistaken for
/// ordinary failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A required argument was unbound.
    #[error("instantiation error")]
    Instantiation,

    /// A bound argument had the wrong shape.
    #[error("type error: expected {expected}, found {culprit}")]
    Type { expected: &'static str, culprit: Term },

    /// A well-typed argument carried an invalid value.
    #[error("domain error: {culprit} is not a valid {domain}")]
    Domain { domain: &'static str, culprit: Term },

    /// Call to a predicate with no clauses that was never declared.
    #[error("existence error: unknown procedure {name}/{arity}")]
    Existence { name: String, arity: usize },

    #[error("evaluation error: {0}")]
    Evaluation(&'static str),

    /// A wrapped lower-level failure.
    #[error("system error: {0}")]
    System(String),

    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// The request that owns the query went away.
    #[error("query cancelled")]
    Cancelled,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn type_error(expected: &'static str, culprit: &Term) -> Self {
        EngineError::Type {
            expected,
            culprit: culprit.clone(),
        }
    }

    pub fn domain_error(domain: &'static str, culprit: &Term) -> Self {
        EngineError::Domain {
            domain,
            culprit: culprit.clone(),
        }
    }

    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        EngineError::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            EngineError::domain_error("host_port", &Term::atom("foo")).to_string(),
            "domain error: foo is not a valid host_port"
        );
        assert_eq!(
            EngineError::type_error("atom", &Term::Integer(0)).to_string(),
            "type error: expected atom, found 0"
        );
        assert_eq!(
            EngineError::Existence {
                name: "tunnel".to_string(),
                arity: 2
            }
            .to_string(),
            "existence error: unknown procedure tunnel/2"
        );
    }
}
