use crate::error::{RelayError, Result};

/// The 17 PoseNet/MoveNet keypoints in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;

    pub const ALL: [KeypointIndex; Self::COUNT] = [
        Self::Nose,
        Self::LeftEye,
        Self::RightEye,
        Self::LeftEar,
        Self::RightEar,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Part name as emitted by PoseNet (`"leftShoulder"`, ...)
    pub fn part_name(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::LeftEye => "leftEye",
            Self::RightEye => "rightEye",
            Self::LeftEar => "leftEar",
            Self::RightEar => "rightEar",
            Self::LeftShoulder => "leftShoulder",
            Self::RightShoulder => "rightShoulder",
            Self::LeftElbow => "leftElbow",
            Self::RightElbow => "rightElbow",
            Self::LeftWrist => "leftWrist",
            Self::RightWrist => "rightWrist",
            Self::LeftHip => "leftHip",
            Self::RightHip => "rightHip",
            Self::LeftKnee => "leftKnee",
            Self::RightKnee => "rightKnee",
            Self::LeftAnkle => "leftAnkle",
            Self::RightAnkle => "rightAnkle",
        }
    }
}

/// One landmark estimate in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Confidence (0.0 to 1.0)
    pub score: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Self { x, y, score }
    }
}

/// One inference result: exactly 17 keypoints in canonical order.
///
/// Built once per inference call, consumed by the normalizer and dropped.
#[derive(Debug, Clone)]
pub struct PoseFrame {
    keypoints: [Keypoint; KeypointIndex::COUNT],
}

impl PoseFrame {
    pub fn new(keypoints: [Keypoint; KeypointIndex::COUNT]) -> Self {
        Self { keypoints }
    }

    /// Fails with `ContractViolation` unless exactly 17 keypoints are given.
    pub fn from_keypoints(keypoints: &[Keypoint]) -> Result<Self> {
        let keypoints: [Keypoint; KeypointIndex::COUNT] =
            keypoints.try_into().map_err(|_| RelayError::ContractViolation {
                what: "keypoints",
                expected: KeypointIndex::COUNT,
                actual: keypoints.len(),
            })?;
        Ok(Self::new(keypoints))
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }
}
