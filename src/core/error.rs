use std::io;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("correlation store unavailable: {0}")]
    Store(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("delivery error: {0}")]
    Delivery(String),
    #[error("timeout")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout
        } else {
            EngineError::Delivery(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Db(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}
