use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PathError {
    /// A scalar value sits on the path where a document or array is needed.
    Conflict(String),
    /// An array was addressed with something other than a valid index.
    BadIndex(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Conflict(path) => write!(f, "path conflict at '{path}'"),
            PathError::BadIndex(path) => write!(f, "invalid array index at '{path}'"),
        }
    }
}

impl std::error::Error for PathError {}
