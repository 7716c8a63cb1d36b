//! Error handling for the FXS bridge

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Hardware error on port {port:?}: {operation} failed: {reason}")]
    Hardware {
        port: Option<usize>,
        operation: &'static str,
        reason: String,
    },

    #[error("Port {0} is busy")]
    PortBusy(usize),

    #[error("Unknown port: {0}")]
    UnknownPort(String),

    #[error("Unknown line attribute: {0}")]
    UnknownAttribute(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Call leg error: {0}")]
    CallLeg(String),

    #[error("Unrecognized hardware event {code:#010x} on port {port}")]
    FatalEvent { port: usize, code: u32 },

    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn hardware<E: std::fmt::Display>(port: Option<usize>, operation: &'static str, err: E) -> Self {
        Self::Hardware {
            port,
            operation,
            reason: err.to_string(),
        }
    }

    pub fn unknown_port<S: Into<String>>(port: S) -> Self {
        Self::UnknownPort(port.into())
    }

    pub fn call_leg<S: Into<String>>(msg: S) -> Self {
        Self::CallLeg(msg.into())
    }

    pub fn dispatcher<S: Into<String>>(msg: S) -> Self {
        Self::Dispatcher(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error should abort the whole process rather than the
    /// current operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalEvent { .. })
    }
}
