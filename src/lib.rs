// gpusift: SIFT keypoint detection, description and matching, entirely on
// the GPU via wgpu compute shaders.
//
// Pipeline: RGBA8 upload → grayscale → Gaussian/DoG pyramids → DoG extrema
// (atomic-counter keypoint buffer) → indirect-dispatch preparation →
// orientation assignment → 128-D descriptors (float or quantized) →
// host readback. A companion brute-force matcher applies Lowe's ratio
// test, optionally gated by epipolar distance under a fundamental matrix.
//
// Reference: Lowe — "Distinctive Image Features from Scale-Invariant
// Keypoints" (IJCV 2004)

pub mod detector;
pub mod device;
pub mod kernel_cache;
pub mod keypoint;
pub mod layout;
pub mod matcher;

mod core;

pub use detector::{Detector, PackedSift, PlanarSift, SiftOptions, SiftProfiling};
pub use device::{GpuDevice, GpuError};
pub use keypoint::Keypoint;
pub use layout::Layout;
pub use matcher::{Match, MatchError, SiftMatcher};

#[cfg(test)]
mod testutil;
