use fireplace_common::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FireplaceError {
    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("no access token; pair the controller at /api/authorize first")]
    Unauthorized,

    #[error("failed to reach remote API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote API returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("unexpected remote payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("credential storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("hardware failure: {0}")]
    Hardware(String),
}

pub type Result<T> = std::result::Result<T, FireplaceError>;
