use thiserror::Error;
use uuid::Uuid;

/// Main error type for the campaign engine.
///
/// Only programming-contract violations and infrastructure failures surface
/// here. Business rejections (sequence-invalid, risk-rejected) are returned
/// as typed outcomes rather than errors, so callers can make decisions on
/// structured reasons instead of catching exceptions.
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),

    // Event bus errors
    #[error("Event bus is closed")]
    BusClosed,

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
