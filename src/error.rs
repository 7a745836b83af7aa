use thiserror::Error;

/// Startup-time failures. Request-time errors never reach this type; handlers
/// render them directly as HTTP responses.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
