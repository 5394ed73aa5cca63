//! Platform location provider seam and the providers shipped with the agent.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use geotrack_core::{distance_m, Clock, Position};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::debug;

/// Minimum time and distance between reported positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub min_distance_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            min_distance_m: 10.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no position available")]
    Unavailable,
    #[error("location provider failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// One immediate fix, outside any watch cadence.
    async fn current_position(&self) -> Result<Position, ProviderError>;

    /// Starts delivering fixes. Delivery stops when the receiver is dropped.
    fn watch(&self, options: WatchOptions) -> Result<mpsc::Receiver<Position>, ProviderError>;
}

/// Polls `next` every `options.interval` and forwards fixes that moved at
/// least `options.min_distance_m` from the last forwarded one. `next`
/// returning `None` ends the watch.
fn spawn_filtered_watch<F>(options: WatchOptions, mut next: F) -> mpsc::Receiver<Position>
where
    F: FnMut() -> Option<Position> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut tick = interval(options.interval);
        let mut last: Option<Position> = None;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = tick.tick() => {}
            }
            let Some(pos) = next() else {
                debug!("location watch source exhausted");
                break;
            };
            let moved = last
                .as_ref()
                .map_or(true, |prev| distance_m(prev, &pos) >= options.min_distance_m);
            if !moved {
                continue;
            }
            if tx.send(pos.clone()).await.is_err() {
                break;
            }
            last = Some(pos);
        }
    });
    rx
}

/// A device that never moves.
pub struct FixedProvider {
    latitude: f64,
    longitude: f64,
    clock: Arc<dyn Clock>,
}

impl FixedProvider {
    pub fn new(latitude: f64, longitude: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            latitude,
            longitude,
            clock,
        }
    }

    fn fix(&self) -> Position {
        Position::new(self.latitude, self.longitude, self.clock.now_ms())
    }
}

#[async_trait]
impl LocationProvider for FixedProvider {
    async fn current_position(&self) -> Result<Position, ProviderError> {
        Ok(self.fix())
    }

    fn watch(&self, options: WatchOptions) -> Result<mpsc::Receiver<Position>, ProviderError> {
        let (lat, lon, clock) = (self.latitude, self.longitude, self.clock.clone());
        Ok(spawn_filtered_watch(options, move || {
            Some(Position::new(lat, lon, clock.now_ms()))
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayPoint {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    accuracy: Option<f64>,
    #[serde(default)]
    altitude: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
}

/// Replays a recorded route, restamping each point with the current time.
pub struct ReplayProvider {
    points: Arc<Vec<ReplayPoint>>,
    cursor: Arc<Mutex<usize>>,
    looped: bool,
    clock: Arc<dyn Clock>,
}

impl ReplayProvider {
    /// Loads a JSON array of `{latitude, longitude, accuracy?, altitude?, speed?}`.
    pub fn load_from(path: &Path, looped: bool, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read replay file {}", path.display()))?;
        let points: Vec<ReplayPoint> = serde_json::from_str(&raw)
            .with_context(|| format!("parse replay file {}", path.display()))?;
        anyhow::ensure!(!points.is_empty(), "replay file {} has no points", path.display());
        Ok(Self::from_points(points, looped, clock))
    }

    /// Builds a route from bare coordinates.
    pub fn from_coordinates(coords: &[(f64, f64)], looped: bool, clock: Arc<dyn Clock>) -> Self {
        let points = coords
            .iter()
            .map(|&(latitude, longitude)| ReplayPoint {
                latitude,
                longitude,
                accuracy: None,
                altitude: None,
                speed: None,
            })
            .collect();
        Self::from_points(points, looped, clock)
    }

    fn from_points(points: Vec<ReplayPoint>, looped: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            points: Arc::new(points),
            cursor: Arc::new(Mutex::new(0)),
            looped,
            clock,
        }
    }
}

fn stamp(p: &ReplayPoint, now: i64) -> Position {
    Position {
        latitude: p.latitude,
        longitude: p.longitude,
        accuracy: p.accuracy,
        altitude: p.altitude,
        speed: p.speed,
        timestamp: now,
    }
}

#[async_trait]
impl LocationProvider for ReplayProvider {
    async fn current_position(&self) -> Result<Position, ProviderError> {
        let idx = *self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        // Most recently emitted point, or the first one before any emission.
        let idx = idx.saturating_sub(1).min(self.points.len().saturating_sub(1));
        self.points
            .get(idx)
            .map(|p| stamp(p, self.clock.now_ms()))
            .ok_or(ProviderError::Unavailable)
    }

    fn watch(&self, options: WatchOptions) -> Result<mpsc::Receiver<Position>, ProviderError> {
        if self.points.is_empty() {
            return Err(ProviderError::Unavailable);
        }
        let points = self.points.clone();
        let cursor = self.cursor.clone();
        let looped = self.looped;
        let clock = self.clock.clone();
        Ok(spawn_filtered_watch(options, move || {
            let mut idx = cursor.lock().unwrap_or_else(|e| e.into_inner());
            if *idx >= points.len() {
                if !looped {
                    return None;
                }
                *idx = 0;
            }
            let pos = stamp(&points[*idx], clock.now_ms());
            *idx += 1;
            Some(pos)
        }))
    }
}
