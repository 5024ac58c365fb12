use std::fmt;

use doppio_bson::PathError;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    UnknownOperator(String),
    BadValue(String),
    TypeMismatch(String),
    Path(PathError),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::UnknownOperator(name) => write!(f, "unknown operator: {name}"),
            QueryError::BadValue(msg) => write!(f, "bad value: {msg}"),
            QueryError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            QueryError::Path(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<PathError> for QueryError {
    fn from(e: PathError) -> Self {
        QueryError::Path(e)
    }
}
