// keypoint.rs — keypoint records and scale-space constants.
//
// The GPU keypoint buffer is a counted array:
//
//   offset  0: u32 count (written with atomic compare-exchange on the GPU)
//   offset  4: 12 bytes reserved padding
//   offset 16: record[0], record[1], ...
//
// Each record is 32 bytes = 8 f32. Octave and scale index are stored as
// floats because the whole record is written from one WGSL struct of f32
// lanes; the host converts on readback.

use bytemuck::{Pod, Zeroable};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of pyramid octaves.
pub const NUM_OCTAVES: u32 = 4;

/// Scale samples per octave (S). The Gaussian stack holds S+3 levels per
/// octave, the DoG stack S+2.
pub const SCALES_PER_OCTAVE: u32 = 3;

/// Base blur of the scale space (σ₀).
pub const SIGMA_BASE: f32 = 1.6;

/// Capacity of the keypoint buffer. Candidates past this are dropped on
/// the GPU (saturating counter); all downstream stages and readbacks
/// operate on at most this many records.
/// 100 000 × 32 bytes ≈ 3 MiB, acceptable as a persistent allocation.
pub const MAX_KEYPOINTS: u32 = 100_000;

/// Byte offset of the first record in the keypoint buffer.
pub const KEYPOINT_HEADER_BYTES: u64 = 16;

/// Size of one GPU keypoint record in bytes.
pub const KEYPOINT_RECORD_BYTES: u64 = 32;

/// Intra-octave blur schedule: σ(s) = σ₀ · 2^(s/S).
///
/// The image-space sigma of a keypoint in octave `o` at scale index `s`
/// is `sigma_for_scale(s) * 2^o`.
pub fn sigma_for_scale(s: u32) -> f32 {
    SIGMA_BASE * 2f32.powf(s as f32 / SCALES_PER_OCTAVE as f32)
}

// ---------------------------------------------------------------------------
// Host keypoint
// ---------------------------------------------------------------------------

/// A detected keypoint in input-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// X position in input-image pixels.
    pub x: f32,
    /// Y position in input-image pixels.
    pub y: f32,
    /// Octave index, 0 = full resolution.
    pub octave: u32,
    /// Intra-octave scale index (1..=S).
    pub scale: u32,
    /// Image-space blur level: σ₀ · 2^(octave + scale/S).
    pub sigma: f32,
    /// Dominant gradient orientation in radians, [0, 2π).
    pub orientation: f32,
}

// ---------------------------------------------------------------------------
// GPU-side record layout (must match WGSL struct Keypoint)
// ---------------------------------------------------------------------------

/// Raw 32-byte keypoint record as the GPU writes it.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct GpuKeypoint {
    pub x: f32,
    pub y: f32,
    pub octave: f32,
    pub scale: f32,
    pub sigma: f32,
    pub orientation: f32,
    pub _pad0: f32,
    pub _pad1: f32,
}

impl From<GpuKeypoint> for Keypoint {
    fn from(r: GpuKeypoint) -> Self {
        Keypoint {
            x: r.x,
            y: r.y,
            octave: r.octave as u32,
            scale: r.scale as u32,
            sigma: r.sigma,
            orientation: r.orientation,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_32_bytes() {
        assert_eq!(
            std::mem::size_of::<GpuKeypoint>() as u64,
            KEYPOINT_RECORD_BYTES
        );
    }

    #[test]
    fn sigma_schedule() {
        // σ(0) = σ₀, σ(S) = 2σ₀ — one full octave of blur.
        assert!((sigma_for_scale(0) - SIGMA_BASE).abs() < 1e-6);
        assert!((sigma_for_scale(SCALES_PER_OCTAVE) - 2.0 * SIGMA_BASE).abs() < 1e-6);
        // Monotonic in between.
        for s in 0..SCALES_PER_OCTAVE + 2 {
            assert!(sigma_for_scale(s + 1) > sigma_for_scale(s));
        }
    }

    #[test]
    fn gpu_record_converts_to_host() {
        let raw = GpuKeypoint {
            x: 12.0,
            y: 34.0,
            octave: 2.0,
            scale: 1.0,
            sigma: 8.06,
            orientation: 1.25,
            _pad0: 0.0,
            _pad1: 0.0,
        };
        let kp: Keypoint = raw.into();
        assert_eq!(kp.octave, 2);
        assert_eq!(kp.scale, 1);
        assert_eq!(kp.x, 12.0);
    }
}
