// kernel_cache.rs — memoized separable Gaussian kernels.
//
// Every blur pass needs a 1-D weight buffer for its σ. The pyramid uses a
// small fixed set of sigmas (the base blur plus one incremental σ per
// scale level), so kernels are computed once and the storage buffers are
// reused across octaves and across detect calls. Buffers are write-once,
// read-many; there is no eviction.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::device::GpuDevice;

/// Kernel radius for a given σ: ⌈3σ⌉. The full kernel has 2·radius+1 taps.
pub fn radius_for_sigma(sigma: f32) -> u32 {
    (sigma * 3.0).ceil() as u32
}

/// Compute a normalized 1-D Gaussian kernel of length 2·radius+1.
///
/// w[i] = exp(−(i−radius)² / 2σ²), scaled so Σw = 1.
pub fn gaussian_kernel(sigma: f32, radius: u32) -> Vec<f32> {
    let len = (2 * radius + 1) as usize;
    let mut weights = vec![0.0f32; len];
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut sum = 0.0f32;
    for (i, w) in weights.iter_mut().enumerate() {
        let d = i as f32 - radius as f32;
        *w = (-(d * d) / two_sigma_sq).exp();
        sum += *w;
    }
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

/// Cache of Gaussian weight buffers keyed by (σ, radius).
///
/// σ is keyed by its bit pattern: the pyramid always derives sigmas from
/// the same f32 arithmetic, so exact-match lookup is both correct and the
/// cheapest option (no tolerance comparison needed).
pub struct KernelCache {
    buffers: HashMap<(u32, u32), wgpu::Buffer>,
}

impl KernelCache {
    pub fn new() -> Self {
        KernelCache {
            buffers: HashMap::new(),
        }
    }

    /// Number of distinct kernels resident. Bounded by the pyramid's σ
    /// schedule (≤ NUM_OCTAVES · (S+3) in the worst case, far fewer in
    /// practice since incremental sigmas repeat across octaves).
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Fetch (or build and persist) the weight buffer for (σ, radius).
    pub fn get(&mut self, gpu: &GpuDevice, sigma: f32, radius: u32) -> &wgpu::Buffer {
        self.buffers
            .entry((sigma.to_bits(), radius))
            .or_insert_with(|| {
                let weights = gaussian_kernel(sigma, radius);
                gpu.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("gaussian kernel"),
                        contents: bytemuck::cast_slice(&weights),
                        usage: wgpu::BufferUsages::STORAGE,
                    })
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_formula() {
        assert_eq!(radius_for_sigma(1.6), 5);
        assert_eq!(radius_for_sigma(1.0), 3);
        // Just over an integer boundary rounds up.
        assert_eq!(radius_for_sigma(1.34), 5);
    }

    #[test]
    fn kernel_normalises_to_one() {
        for &sigma in &[0.8f32, 1.2265, 1.6, 2.0123] {
            let r = radius_for_sigma(sigma);
            let k = gaussian_kernel(sigma, r);
            assert_eq!(k.len(), (2 * r + 1) as usize);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "σ={sigma}: sum = {sum}");
        }
    }

    #[test]
    fn kernel_is_symmetric_with_centre_peak() {
        let k = gaussian_kernel(1.6, radius_for_sigma(1.6));
        let n = k.len();
        for i in 0..n / 2 {
            assert!(
                (k[i] - k[n - 1 - i]).abs() < 1e-7,
                "kernel not symmetric at index {i}"
            );
        }
        let centre = k[n / 2];
        assert!(k.iter().all(|&w| w <= centre));
    }
}
