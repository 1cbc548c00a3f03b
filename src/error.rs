use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Ambiguous current period: expected exactly one row flagged current, found {matches}")]
    AmbiguousPeriod { matches: usize },

    #[error("Invalid period code: {0:?}")]
    InvalidPeriodCode(String),

    #[error("Dictionary load error: {0}")]
    DictionaryLoad(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    /// Stable code used in logs; the client only ever sees the message.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Configuration(_) => "configuration",
            QueryError::Channel(_) => "channel",
            QueryError::Database(_) => "database",
            QueryError::AmbiguousPeriod { .. } => "ambiguous_period",
            QueryError::InvalidPeriodCode(_) => "invalid_period_code",
            QueryError::DictionaryLoad(_) => "dictionary_load",
            QueryError::Llm(_) => "llm",
            QueryError::Synthesis(_) => "synthesis",
            QueryError::Io(_) => "io",
            QueryError::Json(_) => "json",
        }
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        QueryError::Database(err.to_string())
    }
}

impl From<russh::Error> for QueryError {
    fn from(err: russh::Error) -> Self {
        QueryError::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
