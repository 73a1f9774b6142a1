use crate::checkout::CheckoutError;
use crate::clients::ImportError;
use crate::dispatch::DispatchError;
use crate::policy::Rejection;

#[derive(Debug)]
pub enum EngineError {
    NotFound { what: &'static str, key: String },
    /// Malformed or out-of-range input.
    Invalid(String),
    /// Well-formed booking refused by the acceptance policy.
    Rejected(Rejection),
    LimitExceeded(&'static str),
    Import(ImportError),
    Checkout(CheckoutError),
    /// A third-party API we had to read from failed.
    Upstream(DispatchError),
    WalError(String),
}

impl EngineError {
    pub(crate) fn not_found(what: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound {
            what,
            key: key.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { what, key } => write!(f, "{what} not found: {key}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Rejected(r) => write!(f, "booking not accepted: {r}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Import(e) => write!(f, "import failed: {e}"),
            EngineError::Checkout(e) => write!(f, "{e}"),
            EngineError::Upstream(e) => write!(f, "upstream error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ImportError> for EngineError {
    fn from(e: ImportError) -> Self {
        EngineError::Import(e)
    }
}

impl From<CheckoutError> for EngineError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::Invalid(msg) => EngineError::Invalid(msg),
            other => EngineError::Checkout(other),
        }
    }
}
