use std::fmt::{self, Display};

/// Errors produced when decoding model values from their stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownStatus { kind: &'static str, value: String },
    InvalidValue(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownStatus { kind, value } => {
                write!(f, "unknown {kind} status: {value}")
            }
            ModelError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
