use thiserror::Error;

#[derive(Error, Debug)]
pub enum CiError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Store returned {status} for {method} {path}")]
    Store {
        status: u16,
        method: &'static str,
        path: String,
    },

    #[error("Store response for {0} carried no version tag")]
    MissingVersion(String),

    #[error("Source feed returned {status} for {url}")]
    Feed { status: u16, url: String },

    #[error("Provisioning API returned {status} for {method} {uri}")]
    Provisioning {
        status: u16,
        method: &'static str,
        uri: String,
    },

    #[error("Failed to publish status to {path}: {source}")]
    StatusPublish {
        path: String,
        #[source]
        source: Box<CiError>,
    },

    #[error("Gave up updating {path} after {attempts} conflicting writes")]
    Contention { path: String, attempts: u32 },

    #[error("Unknown job variant: {0}")]
    UnknownVariant(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CiError {
    /// Transport-level failures are retried by the caller's next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            CiError::Transport(_) => true,
            CiError::Store { status, .. } | CiError::Feed { status, .. } => {
                *status >= 500 || *status == 429
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CiError>;
