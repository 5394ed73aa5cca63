use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::LocationSample;

/// A single field-level problem with a sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    /// Latitude outside [-90, 90] or not a number.
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    /// Longitude outside [-180, 180] or not a number.
    #[error("longitude {0} is outside [-180, 180]")]
    Longitude(f64),
    /// Timestamp must be a positive epoch-ms value.
    #[error("timestamp {0} must be > 0")]
    Timestamp(i64),
    /// Tracked user id is empty.
    #[error("userId must not be empty")]
    EmptyUserId,
    /// Accuracy is negative or not a number.
    #[error("accuracy {0} must be >= 0")]
    Accuracy(f64),
}

/// Result of validating a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Human-readable field errors. Empty means the sample is valid.
    #[serde(default)]
    pub violations: Vec<String>,
}

impl ValidationOutcome {
    /// True when no field failed.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    fn reject(&mut self, err: FieldError) {
        self.violations.push(err.to_string());
    }
}

/// Checks every field of `sample`, collecting all failures rather than
/// stopping at the first.
pub fn validate_sample(sample: &LocationSample) -> ValidationOutcome {
    let mut out = ValidationOutcome::default();

    if !(-90.0..=90.0).contains(&sample.latitude) {
        out.reject(FieldError::Latitude(sample.latitude));
    }
    if !(-180.0..=180.0).contains(&sample.longitude) {
        out.reject(FieldError::Longitude(sample.longitude));
    }
    if sample.timestamp <= 0 {
        out.reject(FieldError::Timestamp(sample.timestamp));
    }
    if sample.user_id.is_empty() {
        out.reject(FieldError::EmptyUserId);
    }
    if let Some(acc) = sample.accuracy {
        // NaN fails the comparison and is rejected too.
        if !(acc >= 0.0) {
            out.reject(FieldError::Accuracy(acc));
        }
    }

    out
}
