//! Normalisation of backend output into a single raw-track shape.
//!
//! Trackers come in two flavours: those that carry the detector class through
//! to each track, and those (SORT and friends) that only return boxes and ids.
//! For the second kind the class is recovered here by nearest-centroid matching
//! against the same frame's detector boxes, so nothing downstream has to know
//! which backend produced a frame.

use serde::{Deserialize, Serialize};

use super::result::{BoundingBox, DetectionBox, RawTrack};

/// Per-frame output of a tracker backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerOutput {
    /// Tracks already carry their class label.
    Labelled { tracks: Vec<RawTrack> },
    /// Tracks carry no class; `detections` are the frame's detector boxes.
    Unlabelled {
        tracks: Vec<RawTrack>,
        #[serde(default)]
        detections: Vec<DetectionBox>,
    },
}

impl TrackerOutput {
    pub fn labelled(tracks: Vec<RawTrack>) -> Self {
        TrackerOutput::Labelled { tracks }
    }

    pub fn unlabelled(tracks: Vec<RawTrack>, detections: Vec<DetectionBox>) -> Self {
        TrackerOutput::Unlabelled { tracks, detections }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TrackerOutput::Labelled { tracks } | TrackerOutput::Unlabelled { tracks, .. } => {
                tracks.is_empty()
            }
        }
    }

    /// Flatten into raw tracks with classes filled in where recoverable.
    pub fn into_raw_tracks(self) -> Vec<RawTrack> {
        match self {
            TrackerOutput::Labelled { tracks } => tracks,
            TrackerOutput::Unlabelled { tracks, detections } => tracks
                .into_iter()
                .map(|mut track| {
                    if track.class.is_none() {
                        if let Some(bbox) = &track.bbox {
                            track.class = nearest_detection(bbox, &detections)
                                .and_then(|det| det.class.clone());
                        }
                    }
                    track
                })
                .collect(),
        }
    }
}

/// Closest detector box by centroid distance. No cutoff; ties keep the first.
pub fn nearest_detection<'a>(
    bbox: &BoundingBox,
    detections: &'a [DetectionBox],
) -> Option<&'a DetectionBox> {
    let mut best: Option<(&DetectionBox, f32)> = None;
    for det in detections {
        let distance = bbox.centroid_distance(&det.bbox);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((det, distance)),
        }
    }
    best.map(|(det, _)| det)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, class: &str) -> DetectionBox {
        DetectionBox::new(BoundingBox::new(x, y, x + 10.0, y + 10.0), Some(class), 0.9)
    }

    #[test]
    fn labelled_output_passes_through() {
        let tracks = vec![RawTrack::new(1, BoundingBox::new(0.0, 0.0, 5.0, 5.0)).with_class("car")];
        let out = TrackerOutput::labelled(tracks.clone()).into_raw_tracks();
        assert_eq!(out, tracks);
    }

    #[test]
    fn unlabelled_tracks_take_nearest_detection_class() {
        let tracks = vec![
            RawTrack::new(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            RawTrack::new(2, BoundingBox::new(100.0, 100.0, 110.0, 110.0)),
        ];
        let detections = vec![det(98.0, 101.0, "truck"), det(1.0, 0.0, "person")];
        let out = TrackerOutput::unlabelled(tracks, detections).into_raw_tracks();
        assert_eq!(out[0].class.as_deref(), Some("person"));
        assert_eq!(out[1].class.as_deref(), Some("truck"));
    }

    #[test]
    fn far_detection_still_matches_without_cutoff() {
        let tracks = vec![RawTrack::new(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0))];
        let detections = vec![det(5000.0, 5000.0, "bus")];
        let out = TrackerOutput::unlabelled(tracks, detections).into_raw_tracks();
        assert_eq!(out[0].class.as_deref(), Some("bus"));
    }

    #[test]
    fn equidistant_detections_pick_first_encountered() {
        let bbox = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        let detections = vec![det(0.0, 10.0, "left"), det(20.0, 10.0, "right")];
        let best = nearest_detection(&bbox, &detections).expect("match");
        assert_eq!(best.class.as_deref(), Some("left"));
    }

    #[test]
    fn no_detections_leaves_class_empty() {
        let tracks = vec![RawTrack::new(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0))];
        let out = TrackerOutput::unlabelled(tracks, vec![]).into_raw_tracks();
        assert!(out[0].class.is_none());
    }

    #[test]
    fn parses_recorded_unlabelled_frame() {
        let line = r#"{"kind":"unlabelled","tracks":[{"id":7,"bbox":[0,0,10,10]},{"id":"x"}],
            "detections":[{"bbox":[1,1,9,9],"class":"dog","confidence":0.7}]}"#;
        let output: TrackerOutput = serde_json::from_str(line).expect("parse");
        let tracks = output.into_raw_tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].class.as_deref(), Some("dog"));
        assert!(tracks[1].bbox.is_none());
        assert!(tracks[1].class.is_none());
    }
}
