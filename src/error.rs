use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("gateway rejected request ({status}): {body}")]
    Gateway {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, BillingError>;
