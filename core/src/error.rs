use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document error: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("download limit reached")]
    Quota,

    #[error("{0} has expired")]
    Expired(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
