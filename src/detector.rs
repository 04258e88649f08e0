// detector.rs — public detector surface.
//
// `PlanarSift` and `PackedSift` are the two storage-layout variants of the
// same pipeline (see layout.rs). Both wrap the shared `DetectorCore`; the
// `Detector` trait is the seam callers program against so the variants
// stay swappable in benchmarks and tests.

use crate::core::DetectorCore;
use crate::device::{GpuDevice, GpuError};
use crate::keypoint::Keypoint;
use crate::layout::Layout;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Detection options, fixed at construction time.
#[derive(Debug, Clone, Copy)]
pub struct SiftOptions {
    /// Emit descriptors as 128 packed unsigned bytes (32 u32 words) instead
    /// of 128 f32. `read_descriptors` still returns floats — byte values
    /// widened to [0, 255].
    pub quantize_descriptors: bool,
    /// DoG contrast threshold before the per-scale division.
    pub contrast_threshold: f32,
    /// Edge-response rejection ratio r; candidates with
    /// tr²/det ≥ (r+1)²/r are discarded.
    pub edge_threshold: f32,
}

impl Default for SiftOptions {
    fn default() -> Self {
        SiftOptions {
            quantize_descriptors: false,
            contrast_threshold: 0.03,
            edge_threshold: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Profiling
// ---------------------------------------------------------------------------

/// Per-stage GPU timings from timestamp queries, in milliseconds.
///
/// All zero when the device lacks timestamp-query support.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiftProfiling {
    pub grayscale_ms: f64,
    pub pyramids_ms: f64,
    pub extrema_ms: f64,
    pub orientation_ms: f64,
    pub descriptor_ms: f64,
    pub total_ms: f64,
}

// ---------------------------------------------------------------------------
// Detector trait
// ---------------------------------------------------------------------------

/// A GPU SIFT detector instance.
///
/// One detect call at a time per instance; keypoints and descriptors from
/// the previous call stay readable until the next `detect`.
pub trait Detector {
    /// Upload an RGBA8 image and run the full detection pipeline.
    ///
    /// `rgba` must hold exactly `width * height * 4` bytes, row-major.
    fn detect(
        &mut self,
        gpu: &GpuDevice,
        rgba: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), GpuError>;

    /// Keypoints from the last `detect` call, in a stable order
    /// (octave, scale, y, x, orientation).
    fn keypoints(&self) -> &[Keypoint];

    /// Read back descriptors for the last `detect` call: `K × 128` floats
    /// in keypoint order. Quantized mode widens each stored byte to a
    /// float in [0, 255].
    fn read_descriptors(&self, gpu: &GpuDevice) -> Result<Vec<f32>, GpuError>;

    /// Stage timings of the last `detect` call.
    fn profiling(&self) -> SiftProfiling;
}

// ---------------------------------------------------------------------------
// Layout variants
// ---------------------------------------------------------------------------

macro_rules! detector_variant {
    ($(#[$doc:meta])* $name:ident, $layout:expr) => {
        $(#[$doc])*
        pub struct $name {
            core: DetectorCore,
        }

        impl $name {
            /// Compile pipelines and allocate persistent buffers.
            pub fn new(gpu: &GpuDevice, options: SiftOptions) -> Self {
                $name {
                    core: DetectorCore::new(gpu, $layout, options),
                }
            }
        }

        impl Detector for $name {
            fn detect(
                &mut self,
                gpu: &GpuDevice,
                rgba: &[u8],
                width: u32,
                height: u32,
            ) -> Result<(), GpuError> {
                self.core.detect(gpu, rgba, width, height)
            }

            fn keypoints(&self) -> &[Keypoint] {
                self.core.keypoints()
            }

            fn read_descriptors(&self, gpu: &GpuDevice) -> Result<Vec<f32>, GpuError> {
                self.core.read_descriptors(gpu)
            }

            fn profiling(&self) -> SiftProfiling {
                self.core.profiling()
            }
        }
    };
}

detector_variant!(
    /// Detector using the per-pixel (R32Float) scale-space layout.
    PlanarSift,
    Layout::Planar
);

detector_variant!(
    /// Detector using the four-samples-per-texel (RGBA32Float) layout.
    /// Produces keypoint sets equivalent to [`PlanarSift`] with a quarter
    /// of the texel traffic in the image-space passes.
    PackedSift,
    Layout::Packed
);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
