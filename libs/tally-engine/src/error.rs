#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("allowlist error: {0}")]
    Allowlist(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// String-carrying variants get the context prepended to the message.
    /// `Io` is rewrapped so the original `ErrorKind` survives.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Validation(msg) => EngineError::Validation(format!("{ctx}: {msg}")),
            EngineError::Allowlist(msg) => EngineError::Allowlist(format!("{ctx}: {msg}")),
            EngineError::NotFound(msg) => EngineError::NotFound(format!("{ctx}: {msg}")),
            EngineError::Io(e) => {
                EngineError::Io(std::io::Error::new(e.kind(), format!("{ctx}: {e}")))
            }
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
