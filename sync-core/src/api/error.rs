use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("File not found on storage: {0}")]
    NotFound(String),

    #[error("File already exists on storage: {0}")]
    AlreadyExists(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Server { status, .. } if *status >= 500 => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
