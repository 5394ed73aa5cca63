use serde::{Deserialize, Serialize};

use crate::time::EpochMs;

/// A raw position fix as reported by the platform location provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Degrees, -90..=90.
    pub latitude: f64,
    /// Degrees, -180..=180.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Meters above sea level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Fix time in epoch milliseconds.
    pub timestamp: EpochMs,
}

impl Position {
    /// Position with only coordinates and a timestamp.
    pub fn new(latitude: f64, longitude: f64, timestamp: EpochMs) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            altitude: None,
            speed: None,
            timestamp,
        }
    }

    /// Attaches the tracked user and turns the fix into a sample.
    pub fn into_sample(self, user_id: impl Into<String>) -> LocationSample {
        LocationSample {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            altitude: self.altitude,
            speed: self.speed,
            timestamp: self.timestamp,
            user_id: user_id.into(),
        }
    }
}

/// A single position observation for a tracked child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// Degrees, -90..=90.
    pub latitude: f64,
    /// Degrees, -180..=180.
    pub longitude: f64,
    /// Horizontal accuracy in meters, >= 0 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Meters above sea level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Observation time in epoch milliseconds, > 0.
    pub timestamp: EpochMs,
    /// Identifier of the child being tracked. Never empty.
    pub user_id: String,
}

impl LocationSample {
    /// Minimal sample with no optional readings.
    pub fn new(user_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: EpochMs) -> Self {
        Position::new(latitude, longitude, timestamp).into_sample(user_id)
    }

    /// The platform fix this sample was built from.
    pub fn position(&self) -> Position {
        Position {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            altitude: self.altitude,
            speed: self.speed,
            timestamp: self.timestamp,
        }
    }

    /// Body posted to the location ingest endpoint.
    pub fn payload(&self) -> LocationPayload {
        LocationPayload {
            hijo_id: self.user_id.clone(),
            latitud: self.latitude,
            longitud: self.longitude,
        }
    }
}

/// A sample that failed immediate delivery and waits in the retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedLocationSample {
    /// Unique entry id assigned at enqueue time.
    pub id: String,
    /// Failed redelivery attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Enqueue time in epoch milliseconds.
    pub created_at: EpochMs,
    /// The original sample.
    #[serde(flatten)]
    pub sample: LocationSample,
}

impl QueuedLocationSample {
    /// Wraps a sample as a fresh queue entry.
    pub fn new(id: impl Into<String>, sample: LocationSample, created_at: EpochMs) -> Self {
        Self {
            id: id.into(),
            retry_count: 0,
            created_at,
            sample,
        }
    }

    /// Milliseconds since the entry was enqueued.
    pub fn age_ms(&self, now: EpochMs) -> i64 {
        now - self.created_at
    }
}

/// Wire body for `POST <base_url><location_path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    /// Child identifier.
    pub hijo_id: String,
    /// Latitude in degrees.
    pub latitud: f64,
    /// Longitude in degrees.
    pub longitud: f64,
}

/// Persisted "is tracking active, for whom".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSessionState {
    /// True while a tracking session should be running.
    pub is_active: bool,
    /// Tracked user; present whenever `is_active` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Time of the last transition in epoch milliseconds.
    #[serde(default)]
    pub last_updated: EpochMs,
}

impl TrackingSessionState {
    /// Active session for `user_id`.
    pub fn active(user_id: impl Into<String>, now: EpochMs) -> Self {
        Self {
            is_active: true,
            user_id: Some(user_id.into()),
            last_updated: now,
        }
    }

    /// Stopped session.
    pub fn inactive(now: EpochMs) -> Self {
        Self {
            is_active: false,
            user_id: None,
            last_updated: now,
        }
    }

    /// The user to resume for, if this state describes a resumable session.
    pub fn resumable_user(&self) -> Option<&str> {
        match (&self.is_active, &self.user_id) {
            (true, Some(id)) if !id.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }
}
