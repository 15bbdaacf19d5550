use serde::{Deserialize, Serialize};
use std::fmt;

/// Tracker-local object identifier.
///
/// Backends disagree on the id type (SORT emits integers, some deep-sort
/// builds emit strings), so both are carried as-is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackId {
    Int(i64),
    Text(String),
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackId::Int(id) => write!(f, "{}", id),
            TrackId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for TrackId {
    fn from(id: i64) -> Self {
        TrackId::Int(id)
    }
}

impl From<i32> for TrackId {
    fn from(id: i32) -> Self {
        TrackId::Int(i64::from(id))
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        TrackId::Text(id.to_string())
    }
}

/// Axis-aligned box in pixel coordinates, corners `(x1, y1)` and `(x2, y2)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Euclidean distance between the two box centroids.
    pub fn centroid_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.centroid();
        let (bx, by) = other.centroid();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Integer pixel corners, truncated toward zero.
    pub fn to_pixels(&self) -> [i64; 4] {
        [
            self.x1 as i64,
            self.y1 as i64,
            self.x2 as i64,
            self.y2 as i64,
        ]
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One tracker's per-frame output for a single object.
///
/// `bbox` is optional because some backends emit placeholder entries for
/// tentative tracks; those are dropped by the confirmation engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawTrack {
    pub id: TrackId,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl RawTrack {
    pub fn new(id: impl Into<TrackId>, bbox: BoundingBox) -> Self {
        Self {
            id: id.into(),
            bbox: Some(bbox),
            class: None,
            confidence: None,
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Detector box from the same frame, not yet associated with a track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub bbox: BoundingBox,
    /// Class label, absent when the detector's class index has no name.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(bbox: BoundingBox, class: Option<&str>, confidence: f32) -> Self {
        Self {
            bbox,
            class: class.map(str::to_string),
            confidence,
        }
    }
}
