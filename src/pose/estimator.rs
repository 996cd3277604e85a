//! Seam for the external pose-estimation capability.
//!
//! The model itself lives outside this crate. Anything that can hand back
//! 17 pixel-space keypoints per call plugs in through [`PoseEstimator`].

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

use crate::error::{RelayError, Result};

use super::keypoint::{Keypoint, KeypointIndex};

#[async_trait]
pub trait PoseEstimator: Send {
    /// Run one inference. Raw output, not yet checked for keypoint count.
    async fn estimate(&mut self) -> Result<Vec<Keypoint>>;
}

// --- PoseNet single-pose JSON (`net.estimateSinglePose` output) ---

#[derive(Debug, Deserialize)]
struct PosenetPose {
    keypoints: Vec<PosenetKeypoint>,
}

#[derive(Debug, Deserialize)]
struct PosenetKeypoint {
    score: f32,
    #[serde(default)]
    part: Option<String>,
    position: PosenetPosition,
}

#[derive(Debug, Deserialize)]
struct PosenetPosition {
    x: f32,
    y: f32,
}

/// Parse one PoseNet pose. Named parts must sit at their canonical slot.
pub fn parse_posenet_pose(json: &str) -> Result<Vec<Keypoint>> {
    let pose: PosenetPose = serde_json::from_str(json)
        .map_err(|e| RelayError::Inference(format!("bad pose json: {e}")))?;

    for (i, kp) in pose.keypoints.iter().enumerate() {
        if let (Some(part), Some(expected)) = (&kp.part, KeypointIndex::from_index(i)) {
            if part != expected.part_name() {
                return Err(RelayError::KeypointOrder {
                    index: i,
                    expected: expected.part_name(),
                    actual: part.clone(),
                });
            }
        }
    }

    Ok(pose
        .keypoints
        .iter()
        .map(|kp| Keypoint::new(kp.position.x, kp.position.y, kp.score))
        .collect())
}

/// Plays back recorded poses, one JSON object per line.
pub struct ReplayEstimator {
    lines: Vec<String>,
    cursor: usize,
    looping: bool,
}

impl ReplayEstimator {
    pub fn open<P: AsRef<Path>>(path: P, looping: bool) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_lines(content.lines(), looping))
    }

    pub fn from_lines<'a, I: IntoIterator<Item = &'a str>>(lines: I, looping: bool) -> Self {
        let lines = lines
            .into_iter()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self { lines, cursor: 0, looping }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
impl PoseEstimator for ReplayEstimator {
    async fn estimate(&mut self) -> Result<Vec<Keypoint>> {
        if self.cursor >= self.lines.len() {
            if self.looping && !self.lines.is_empty() {
                self.cursor = 0;
            } else {
                return Err(RelayError::Inference("replay exhausted".into()));
            }
        }
        let line = &self.lines[self.cursor];
        self.cursor += 1;
        parse_posenet_pose(line)
    }
}
