use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("json error: {0}")]
    JsonError(String),
    #[error("utf8 error")]
    Utf8Error,
}

pub type Result<T> = std::result::Result<T, TypesError>;

impl From<serde_json::Error> for TypesError {
    fn from(err: serde_json::Error) -> Self {
        TypesError::JsonError(err.to_string())
    }
}

impl From<std::str::Utf8Error> for TypesError {
    fn from(_: std::str::Utf8Error) -> Self {
        TypesError::Utf8Error
    }
}
