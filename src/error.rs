use thiserror::Error;

use crate::attr::AttrType;

/// Request pipeline errors.
#[derive(Debug, Error)]
pub enum PepError {
    /// Malformed configuration. Only produced while loading config.
    #[error("config error: {0}")]
    Config(String),

    /// An extractor or obligation produced a value that does not parse as its declared type.
    #[error("attribute value {value:?} is not a valid {ty:?}: {reason}")]
    Attribute {
        value: String,
        ty: AttrType,
        reason: String,
    },

    /// Decision service call failed.
    #[error("policy decision failed ({phase}): {reason}")]
    Pdp { phase: &'static str, reason: String },

    #[error("downstream resolution failed: {0}")]
    Downstream(String),

    #[error("invalid action {0}")]
    InvalidAction(&'static str),

    #[error("malformed dns packet: {0}")]
    Protocol(String),
}

impl PepError {
    pub fn pdp(phase: &'static str, reason: impl ToString) -> Self {
        PepError::Pdp {
            phase,
            reason: reason.to_string(),
        }
    }
}

impl From<hickory_proto::error::ProtoError> for PepError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        PepError::Protocol(err.to_string())
    }
}
