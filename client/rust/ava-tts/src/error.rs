use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TtsError>;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("websocket error: {0}")]
    Ws(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no connection-started event within {0:?}")]
    ConnectionStartTimeout(Duration),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no session-started event within {0:?}")]
    SessionStartTimeout(Duration),

    #[error("no session-finished event within {0:?}")]
    SessionFinishTimeout(Duration),

    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error("no active session")]
    NoActiveSession,

    #[error("engine is closed")]
    Closed,

    #[error("audio output error: {0}")]
    Audio(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TtsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TtsError::Ws(err.to_string())
    }
}

impl From<toml::de::Error> for TtsError {
    fn from(err: toml::de::Error) -> Self {
        TtsError::Config(err.to_string())
    }
}
