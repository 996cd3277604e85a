//! PoseFrame to 51-float vector: 17 `(x / width, y / height, score)` triples.
//!
//! Coordinates are not clamped; a keypoint estimated outside the frame
//! yields values outside 0..1.

use crate::error::Result;

use super::keypoint::{Keypoint, KeypointIndex, PoseFrame};

pub const VALUES_PER_KEYPOINT: usize = 3;
pub const VECTOR_LEN: usize = KeypointIndex::COUNT * VALUES_PER_KEYPOINT;

/// Flattened, scale-independent pose. Always exactly 51 values.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedVector {
    values: Vec<f32>,
}

impl NormalizedVector {
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// `(x_norm, y_norm, score)` of one keypoint
    pub fn triple(&self, index: KeypointIndex) -> (f32, f32, f32) {
        let i = index as usize * VALUES_PER_KEYPOINT;
        (self.values[i], self.values[i + 1], self.values[i + 2])
    }
}

/// Pure mapping from pixel space to capture-relative space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    width: f32,
    height: f32,
}

impl Normalizer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
        }
    }

    pub fn normalize(&self, frame: &PoseFrame) -> NormalizedVector {
        let mut values = Vec::with_capacity(VECTOR_LEN);
        for kp in frame.keypoints() {
            values.push(kp.x / self.width);
            values.push(kp.y / self.height);
            values.push(kp.score);
        }
        NormalizedVector { values }
    }

    /// Same as [`normalize`](Self::normalize) for raw estimator output;
    /// anything but 17 keypoints is a `ContractViolation`.
    pub fn normalize_keypoints(&self, keypoints: &[Keypoint]) -> Result<NormalizedVector> {
        let frame = PoseFrame::from_keypoints(keypoints)?;
        Ok(self.normalize(&frame))
    }
}
