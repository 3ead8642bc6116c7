use thiserror::Error;

#[derive(Error, Debug)]
pub enum NanonisError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection to {address} failed: {message}")]
    Connect { address: String, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("External interface {interface} unreachable: {message}")]
    ExternalUnreachable { interface: String, message: String },
    #[error("Failed to load command catalog {source_name}: {message}")]
    Load { source_name: String, message: String },
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Server error {code}: {message}")]
    ServerError { code: i32, message: String },
    #[error("Script error on line {line}: {message}")]
    Script { line: usize, message: String },
    #[error("Type error: {0}")]
    Type(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<std::io::Error> for NanonisError {
    fn from(source: std::io::Error) -> Self {
        NanonisError::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl NanonisError {
    pub(crate) fn load(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        NanonisError::Load {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}
