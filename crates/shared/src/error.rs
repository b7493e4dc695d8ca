//! Error types shared across CareBill crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Invalid {kind}: {value}")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl SharedError {
    pub fn invalid(kind: &'static str, value: &str) -> Self {
        Self::InvalidValue {
            kind,
            value: value.to_string(),
        }
    }
}
