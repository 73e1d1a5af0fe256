use battleship_engine_protocol::error::FrameError;

/// Close code sent to a client socket when the server tears down the
/// connection. Values mirror the close-code table the engine is specified
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    Protocol = 1002,
    Abnormal = 1006,
    Policy = 1008,
    Internal = 1011,
}

/// Top-level error type for the session engine. Every variant carries
/// enough information to pick a [`CloseCode`] and a human-readable reason
/// for the socket that is about to be closed.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("state invariant violated: {0}")]
    Invariant(String),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn policy(reason: impl Into<String>) -> Self {
        EngineError::Policy(reason.into())
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        EngineError::Invariant(reason.into())
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            EngineError::Protocol(_) => CloseCode::Protocol,
            EngineError::Policy(_) => CloseCode::Policy,
            EngineError::Invariant(_) => CloseCode::Internal,
            EngineError::Datastore(_) => CloseCode::Internal,
            EngineError::Internal(_) => CloseCode::Internal,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
