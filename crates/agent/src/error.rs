//! The cross-cutting error envelope: a single closed vocabulary for every
//! component's failures, plus the retryability call the Agent API's
//! `{kind, retryable}` envelope surfaces to the caller on an unrecoverable
//! failure.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Timeout,
    RateLimit,
    Auth,
    ContextOverflow,
    ProviderError,
    Network,
    Storage,
    Parse,
    Validation,
    ConsistencyBlock,
    NotFound,
    ConcurrencyConflict,
    Cancelled,
}

impl ErrorKind {
    /// Whether a caller may usefully retry the same call unchanged.
    /// `CANCELLED` is deliberately not retryable: a cancelled turn was
    /// abandoned by its own caller, not interrupted by a transient fault.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::ProviderError)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what.into())
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "turn was cancelled")
    }
}

impl From<quill_llm::LlmError> for CoreError {
    fn from(err: quill_llm::LlmError) -> Self {
        use quill_llm::LlmError::*;
        let kind = match err {
            Timeout => ErrorKind::Timeout,
            RateLimit => ErrorKind::RateLimit,
            Auth => ErrorKind::Auth,
            ContextOverflow => ErrorKind::ContextOverflow,
            ProviderError(_) => ErrorKind::ProviderError,
            Network(_) => ErrorKind::Network,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<quill_memory::MemoryError> for CoreError {
    fn from(err: quill_memory::MemoryError) -> Self {
        use quill_memory::MemoryError::*;
        let kind = match &err {
            Storage(_) => ErrorKind::Storage,
            NotFound(_) => ErrorKind::NotFound,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<quill_generator::GeneratorError> for CoreError {
    fn from(err: quill_generator::GeneratorError) -> Self {
        use quill_generator::GeneratorError::*;
        let kind = match &err {
            Llm(inner) => return inner.clone().into(),
            ContextOverflow => ErrorKind::ContextOverflow,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<quill_setting::SettingError> for CoreError {
    fn from(err: quill_setting::SettingError) -> Self {
        let quill_setting::SettingError::Llm(inner) = err;
        inner.into()
    }
}

impl From<quill_intent::IntentError> for CoreError {
    fn from(err: quill_intent::IntentError) -> Self {
        let quill_intent::IntentError::Llm(inner) = err;
        inner.into()
    }
}
