//! Replay backend: feeds recorded tracker output back through the pipeline.
//!
//! The recording is newline-delimited JSON, one `TrackerOutput` per frame.
//! Blank lines are empty frames. A line that fails to parse is reported as a
//! failed frame, the same way a live detector error would be.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::detect::backend::{Frame, TrackerBackend};
use crate::detect::normalize::TrackerOutput;

pub struct ReplayTracker {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    exhausted: bool,
    frames_read: u64,
}

impl ReplayTracker {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open tracker recording {}", path.display()))?;
        log::info!("ReplayTracker: replaying {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            exhausted: false,
            frames_read: 0,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl TrackerBackend for ReplayTracker {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn update(&mut self, frame: &Frame) -> Result<TrackerOutput> {
        if self.exhausted {
            return Ok(TrackerOutput::labelled(vec![]));
        }
        let line = match self.lines.next() {
            Some(line) => line
                .with_context(|| format!("failed to read {}", self.path.display()))?,
            None => {
                log::info!(
                    "ReplayTracker: end of recording after {} frames",
                    self.frames_read
                );
                self.exhausted = true;
                return Ok(TrackerOutput::labelled(vec![]));
            }
        };
        self.frames_read += 1;
        if line.trim().is_empty() {
            return Ok(TrackerOutput::labelled(vec![]));
        }
        serde_json::from_str(&line).map_err(|e| {
            anyhow!(
                "invalid recorded frame {} (line {}): {}",
                frame.sequence,
                self.frames_read,
                e
            )
        })
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_frames_and_reports_bad_lines() {
        let mut file = NamedTempFile::new().expect("temp recording");
        writeln!(
            file,
            r#"{{"kind":"labelled","tracks":[{{"id":1,"bbox":[0,0,4,4],"class":"car"}}]}}"#
        )
        .expect("write");
        writeln!(file).expect("write");
        writeln!(file, "not json").expect("write");

        let mut tracker = ReplayTracker::open(file.path()).expect("open");
        let frame = Frame::new(0, 640, 480);

        let first = tracker.update(&frame).expect("first frame").into_raw_tracks();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].class.as_deref(), Some("car"));

        assert!(tracker.update(&frame).expect("blank frame").is_empty());
        assert!(tracker.update(&frame).is_err());
        assert!(!tracker.is_exhausted());

        assert!(tracker.update(&frame).expect("eof").is_empty());
        assert!(tracker.is_exhausted());
        assert_eq!(tracker.frames_read(), 3);
    }

    #[test]
    fn missing_recording_is_an_error() {
        let err = ReplayTracker::open(Path::new("/nonexistent/recording.jsonl"))
            .err()
            .expect("open should fail");
        assert!(err.to_string().contains("tracker recording"));
    }
}
