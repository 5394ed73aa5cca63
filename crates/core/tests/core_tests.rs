//! Integration tests for the core crate.

use geotrack_core::{
    LocationSample, Position, QueuedLocationSample, TrackingSessionState,
};

#[test]
fn test_payload_uses_ingest_field_names() {
    let sample = LocationSample::new("42", -12.04, -77.04, 1_700_000_000_000);
    let json = serde_json::to_value(sample.payload()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"hijo_id": "42", "latitud": -12.04, "longitud": -77.04})
    );
}

#[test]
fn test_queued_sample_is_flat_json() {
    let sample = LocationSample::new("42", -12.04, -77.04, 1_700_000_000_000);
    let queued = QueuedLocationSample::new("01HZX", sample, 1_700_000_000_500);
    let json = serde_json::to_value(&queued).unwrap();
    assert_eq!(json["id"], "01HZX");
    assert_eq!(json["retryCount"], 0);
    assert_eq!(json["createdAt"], 1_700_000_000_500_i64);
    assert_eq!(json["userId"], "42");
    assert_eq!(json["latitude"], -12.04);
    assert!(json.get("accuracy").is_none());

    let back: QueuedLocationSample = serde_json::from_value(json).unwrap();
    assert_eq!(back, queued);
}

#[test]
fn test_queued_sample_tolerates_missing_retry_count() {
    let raw = r#"{"id":"a","createdAt":5,"latitude":1.0,"longitude":2.0,"timestamp":3,"userId":"u"}"#;
    let entry: QueuedLocationSample = serde_json::from_str(raw).unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.sample.user_id, "u");
}

#[test]
fn test_session_state_resumable_user() {
    let active = TrackingSessionState::active("42", 10);
    assert_eq!(active.resumable_user(), Some("42"));

    let stopped = TrackingSessionState::inactive(11);
    assert_eq!(stopped.resumable_user(), None);

    // An active flag without a user cannot be resumed.
    let broken: TrackingSessionState =
        serde_json::from_str(r#"{"isActive":true,"lastUpdated":1}"#).unwrap();
    assert_eq!(broken.resumable_user(), None);
}

#[test]
fn test_position_round_trips_into_sample() {
    let mut pos = Position::new(10.0, 20.0, 99);
    pos.accuracy = Some(4.5);
    pos.speed = Some(1.2);
    let sample = pos.clone().into_sample("child-1");
    assert_eq!(sample.user_id, "child-1");
    assert_eq!(sample.position(), pos);
}
