// layout.rs — scale-space storage layouts.
//
// The detector comes in two texture layouts that produce equivalent
// keypoints:
//
//   Planar — one grayscale sample per R32Float texel. Octave o is stored
//            at (W>>o, H>>o).
//   Packed — a 2×2 tile of samples per RGBA32Float texel
//            (r=top-left, g=top-right, b=bottom-left, a=bottom-right).
//            Octave o is stored at (⌈W/2⌉>>o, ⌈H/2⌉>>o); the effective
//            sample grid stays (W>>o, H>>o). Quarter the texel traffic
//            per image pass.
//
// The polymorphism is pure data: texture format, stored dimensions, and
// which WGSL source implements each stage. All host orchestration in
// `core` is shared.

/// WGSL sources for the nine detection stages of one layout.
pub(crate) struct ShaderSet {
    pub grayscale: &'static str,
    pub blur_h: &'static str,
    pub blur_v: &'static str,
    pub downsample: &'static str,
    pub dog: &'static str,
    pub extrema: &'static str,
    pub orientation: &'static str,
    pub descriptor: &'static str,
    pub descriptor_quantized: &'static str,
}

static PLANAR_SHADERS: ShaderSet = ShaderSet {
    grayscale: include_str!("shaders/planar/grayscale.wgsl"),
    blur_h: include_str!("shaders/planar/blur_horizontal.wgsl"),
    blur_v: include_str!("shaders/planar/blur_vertical.wgsl"),
    downsample: include_str!("shaders/planar/downsample.wgsl"),
    dog: include_str!("shaders/planar/dog.wgsl"),
    extrema: include_str!("shaders/planar/extrema.wgsl"),
    orientation: include_str!("shaders/planar/orientation.wgsl"),
    descriptor: include_str!("shaders/planar/descriptor.wgsl"),
    descriptor_quantized: include_str!("shaders/planar/descriptor_quantized.wgsl"),
};

static PACKED_SHADERS: ShaderSet = ShaderSet {
    grayscale: include_str!("shaders/packed/grayscale.wgsl"),
    blur_h: include_str!("shaders/packed/blur_horizontal.wgsl"),
    blur_v: include_str!("shaders/packed/blur_vertical.wgsl"),
    downsample: include_str!("shaders/packed/downsample.wgsl"),
    dog: include_str!("shaders/packed/dog.wgsl"),
    extrema: include_str!("shaders/packed/extrema.wgsl"),
    orientation: include_str!("shaders/packed/orientation.wgsl"),
    descriptor: include_str!("shaders/packed/descriptor.wgsl"),
    descriptor_quantized: include_str!("shaders/packed/descriptor_quantized.wgsl"),
};

/// Scale-space storage layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One sample per R32Float texel.
    Planar,
    /// Four samples (2×2 tile) per RGBA32Float texel.
    Packed,
}

impl Layout {
    /// Texture format of every working texture in this layout.
    pub(crate) fn format(self) -> wgpu::TextureFormat {
        match self {
            Layout::Planar => wgpu::TextureFormat::R32Float,
            Layout::Packed => wgpu::TextureFormat::Rgba32Float,
        }
    }

    /// Stored texture dimensions of octave 0 for an input of (w, h).
    pub(crate) fn base_dims(self, w: u32, h: u32) -> (u32, u32) {
        match self {
            Layout::Planar => (w, h),
            Layout::Packed => ((w + 1) / 2, (h + 1) / 2),
        }
    }

    /// Stored texture dimensions of octave `o`.
    pub(crate) fn octave_dims(self, w: u32, h: u32, octave: u32) -> (u32, u32) {
        let (bw, bh) = self.base_dims(w, h);
        ((bw >> octave).max(1), (bh >> octave).max(1))
    }

    pub(crate) fn shaders(self) -> &'static ShaderSet {
        match self {
            Layout::Planar => &PLANAR_SHADERS,
            Layout::Packed => &PACKED_SHADERS,
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
    fn planar_octave_dims_halve() {
        assert_eq!(Layout::Planar.octave_dims(640, 480, 0), (640, 480));
        assert_eq!(Layout::Planar.octave_dims(640, 480, 1), (320, 240));
        assert_eq!(Layout::Planar.octave_dims(640, 480, 3), (80, 60));
    }

    #[test]
    fn packed_octave_dims_start_halved() {
        // 2×2 tiles: the stored base is half the input, rounded up.
        assert_eq!(Layout::Packed.octave_dims(640, 480, 0), (320, 240));
        assert_eq!(Layout::Packed.octave_dims(640, 480, 2), (80, 60));
        // Odd input rounds up at the base.
        assert_eq!(Layout::Packed.octave_dims(641, 479, 0), (321, 240));
    }

    #[test]
    fn tiny_octaves_never_collapse_to_zero() {
        assert_eq!(Layout::Packed.octave_dims(16, 16, 3), (1, 1));
        assert_eq!(Layout::Planar.octave_dims(4, 4, 3), (1, 1));
    }

    #[test]
    fn formats_match_layout() {
        assert_eq!(Layout::Planar.format(), wgpu::TextureFormat::R32Float);
        assert_eq!(Layout::Packed.format(), wgpu::TextureFormat::Rgba32Float);
    }
}
