pub mod estimator;
pub mod keypoint;
pub mod normalize;

pub use estimator::{parse_posenet_pose, PoseEstimator, ReplayEstimator};
pub use keypoint::{Keypoint, KeypointIndex, PoseFrame};
pub use normalize::{NormalizedVector, Normalizer, VECTOR_LEN};
