//! Geolocation sources
//!
//! A source is a push-style stream of position samples with errors
//! interleaved. `None` means the device stopped reporting for good.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::incident::Coordinates;
use crate::store::server_timestamp;

/// Raw position reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            heading: None,
            speed: None,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> std::result::Result<(), GeoError> {
        self.coordinates()
            .validate()
            .map_err(|e| GeoError::InvalidSample(e.to_string()))?;
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(GeoError::InvalidSample(format!("accuracy {}", self.accuracy)));
        }
        Ok(())
    }

    /// Profile patch for this sample; `updatedAt` comes from the store clock
    pub fn to_patch(&self) -> Value {
        json!({
            "location": {
                "latitude": self.latitude,
                "longitude": self.longitude,
            },
            "locationMetadata": {
                "accuracy": self.accuracy,
                "heading": self.heading,
                "speed": self.speed,
                "updatedAt": server_timestamp(),
            },
        })
    }
}

/// Acquisition failures. None of them ends a feed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeoError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable (no signal)")]
    Unavailable,

    #[error("Timed out acquiring position")]
    Timeout,

    #[error("Invalid sample: {0}")]
    InvalidSample(String),
}

pub type GeoResult = std::result::Result<PositionSample, GeoError>;

#[async_trait]
pub trait GeolocationSource: Send + 'static {
    /// Next sample or error; `None` once the source has ended
    async fn next(&mut self) -> Option<GeoResult>;
}

/// Source fed through a channel, e.g. from a device WebSocket
pub struct ChannelSource {
    rx: mpsc::Receiver<GeoResult>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<GeoResult>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl GeolocationSource for ChannelSource {
    async fn next(&mut self) -> Option<GeoResult> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_shape() {
        let mut sample = PositionSample::new(14.5, 121.0, 8.0);
        sample.heading = Some(90.0);
        let patch = sample.to_patch();
        assert_eq!(patch["location"]["latitude"], 14.5);
        assert_eq!(patch["locationMetadata"]["heading"], 90.0);
        assert!(patch["locationMetadata"]["speed"].is_null());
        assert_eq!(patch["locationMetadata"]["updatedAt"], server_timestamp());
    }

    #[test]
    fn test_sample_validation() {
        assert!(PositionSample::new(0.0, 0.0, 5.0).validate().is_ok());
        assert!(PositionSample::new(100.0, 0.0, 5.0).validate().is_err());
        assert!(PositionSample::new(0.0, 0.0, -1.0).validate().is_err());
        assert!(PositionSample::new(0.0, 0.0, f64::NAN).validate().is_err());
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_sender_dropped() {
        let (tx, mut source) = ChannelSource::new(4);
        tx.send(Err(GeoError::Timeout)).await.unwrap();
        drop(tx);
        assert_eq!(source.next().await, Some(Err(GeoError::Timeout)));
        assert_eq!(source.next().await, None);
    }
}
