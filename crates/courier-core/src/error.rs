use courier_types::TypesError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("status {0}: {1}")]
    Status(u16, String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out")]
    Timeout,
}

impl TransportError {
    /// 5xx, 408, 429, a closed connection or an attempt timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status(code, _) => {
                *code >= 500 || *code == 408 || *code == 429
            }
            TransportError::ConnectionClosed | TransportError::Timeout => true,
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, TransportError::Status(406, _))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::Status(404, _))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("validation {0}")]
    Validation(String),
    #[error("transport {0}")]
    Transport(#[from] TransportError),
    #[error("storage {0}")]
    Storage(String),
    #[error("crypto {0}")]
    Crypto(String),
    #[error("not found {0}")]
    NotFound(String),
    #[error("structural {0}")]
    Structural(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            CoreError::NotFound(_) => true,
            CoreError::Transport(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl From<TypesError> for CoreError {
    fn from(err: TypesError) -> Self {
        CoreError::Structural(err.to_string())
    }
}
