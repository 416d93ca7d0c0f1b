//! Error types for the log backend boundary

use thiserror::Error;

/// Failure pushing a batch to the log-aggregation backend
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("log push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("log backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode log payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("log sink unavailable: {0}")]
    Unavailable(String),
}

/// Failure running a range query against the log backend
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("log query request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("log backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected query response: {0}")]
    Decode(String),

    #[error("failed to decode log line: {0}")]
    Line(#[from] serde_json::Error),
}
