//! Error taxonomy for the relay pipeline.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Wrong number of keypoints or vector values. Never truncated or padded.
    #[error("contract violation: expected {expected} {what}, got {actual}")]
    ContractViolation {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Named keypoint found outside its canonical slot
    #[error("contract violation: keypoint {index} is {actual:?}, expected {expected:?}")]
    KeypointOrder {
        index: usize,
        expected: &'static str,
        actual: String,
    },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference timed out after {}ms", .0.as_millis())]
    InferenceTimeout(Duration),

    #[error("channel failure: {0}")]
    Channel(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("osc encoding failed: {0}")]
    Encode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Failures the capture loop logs and retries instead of stopping on.
    pub fn is_inference_failure(&self) -> bool {
        matches!(self, Self::Inference(_) | Self::InferenceTimeout(_))
    }

    /// Estimator output that breaks the 17-keypoint contract. Fatal to the
    /// capture loop; no retry or reconnect can fix it.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. } | Self::KeypointOrder { .. })
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<bincode::Error> for RelayError {
    fn from(e: bincode::Error) -> Self {
        RelayError::Channel(format!("malformed message: {e}"))
    }
}

impl From<rosc::OscError> for RelayError {
    fn from(e: rosc::OscError) -> Self {
        RelayError::Encode(format!("{e:?}"))
    }
}
