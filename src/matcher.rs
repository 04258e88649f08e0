// matcher.rs — brute-force descriptor matching on the GPU.
//
// One thread per query descriptor scans every train descriptor, tracking
// the best and second-best squared L2 distance. The host applies Lowe's
// ratio test afterwards: the GPU ships (bestIdx, bestDistSq, secondDistSq)
// per query and never needs the ratio itself, so one kernel serves every
// threshold.
//
// Three kernels:
//   matcher.wgsl            — 128 f32 per record.
//   matcher_quantized.wgsl  — 32 u32 words of 4 packed bytes; distance is
//                             computed byte-wise and algebraically equals
//                             float L2 on the 0–255-scaled vectors.
//   matcher_guided.wgsl     — float records plus keypoint positions and a
//                             fundamental matrix; candidates farther than
//                             `threshold` from the epipolar line are
//                             rejected before the best/second tracking.

use wgpu::util::DeviceExt;

use std::fmt;

use crate::device::{GpuDevice, GpuError};

/// Workgroup width of the matcher kernels; dispatch is ⌈Nₐ/64⌉ groups.
const MATCH_WG: u32 = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A surviving nearest-neighbor match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    /// Index into descriptor set A.
    pub query_idx: u32,
    /// Index into descriptor set B.
    pub train_idx: u32,
    /// L2 distance between the two descriptors.
    pub distance: f32,
}

/// Errors from the matcher entry points.
#[derive(Debug)]
pub enum MatchError {
    /// A descriptor array's length is not a multiple of 128.
    DescriptorLength { len: usize },
    /// Keypoint array does not hold one (x, y) pair per descriptor.
    KeypointMismatch { descriptors: usize, keypoints: usize },
    /// Device-side failure during readback.
    Gpu(GpuError),
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchError::DescriptorLength { len } => {
                write!(f, "descriptor array length {len} is not a multiple of 128")
            }
            MatchError::KeypointMismatch {
                descriptors,
                keypoints,
            } => write!(
                f,
                "{descriptors} descriptors but {keypoints} keypoint coordinates (need 2 per descriptor)"
            ),
            MatchError::Gpu(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MatchError::Gpu(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for MatchError {
    fn from(e: GpuError) -> Self {
        MatchError::Gpu(e)
    }
}

// ---------------------------------------------------------------------------
// GPU-side layouts (must match the WGSL structs)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuMatchResult {
    best_idx: i32,
    best_dist_sq: f32,
    second_dist_sq: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MatcherParams {
    count_a: u32,
    count_b: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GuidedParams {
    count_a: u32,
    count_b: u32,
    threshold: f32,
    _pad: u32,
    /// Columns of the fundamental matrix, so the shader computes the
    /// epipolar line as col0·x + col1·y + col2.
    f_col0: [f32; 4],
    f_col1: [f32; 4],
    f_col2: [f32; 4],
}

// ---------------------------------------------------------------------------
// SiftMatcher
// ---------------------------------------------------------------------------

/// GPU brute-force matcher. Create once; each call uploads its inputs,
/// dispatches, and blocks on the result readback.
pub struct SiftMatcher {
    pipeline: wgpu::ComputePipeline,
    pipeline_quantized: wgpu::ComputePipeline,
    pipeline_guided: wgpu::ComputePipeline,
}

impl SiftMatcher {
    pub fn new(gpu: &GpuDevice) -> Self {
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let create = |label: &str, source: &str, entries: &[wgpu::BindGroupLayoutEntry]| {
            let module = gpu
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
            let bgl = gpu
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(label),
                    entries,
                });
            let pipeline_layout =
                gpu.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some(label),
                        bind_group_layouts: &[&bgl],
                        push_constant_ranges: &[],
                    });
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: "main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        let plain_entries = [
            uniform(0),
            storage(1, true),
            storage(2, true),
            storage(3, false),
        ];
        let guided_entries = [
            uniform(0),
            storage(1, true),
            storage(2, true),
            storage(3, true),
            storage(4, true),
            storage(5, false),
        ];

        SiftMatcher {
            pipeline: create(
                "matcher",
                include_str!("shaders/matching/matcher.wgsl"),
                &plain_entries,
            ),
            pipeline_quantized: create(
                "matcher_quantized",
                include_str!("shaders/matching/matcher_quantized.wgsl"),
                &plain_entries,
            ),
            pipeline_guided: create(
                "matcher_guided",
                include_str!("shaders/matching/matcher_guided.wgsl"),
                &guided_entries,
            ),
        }
    }

    /// Brute-force match A against B with Lowe's ratio test.
    ///
    /// `desc_a`/`desc_b` are flat arrays of 128-float records. In quantized
    /// mode the values must be byte-valued floats in [0, 255] (the wide
    /// format produced by quantized descriptor readback); they are packed
    /// four to a word before upload.
    pub fn match_descriptors(
        &self,
        gpu: &GpuDevice,
        desc_a: &[f32],
        desc_b: &[f32],
        ratio: f32,
        quantize: bool,
    ) -> Result<Vec<Match>, MatchError> {
        let (count_a, count_b) = (record_count(desc_a)?, record_count(desc_b)?);
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }

        let (buf_a, buf_b) = if quantize {
            (
                upload_storage(gpu, "matcher descA (packed)", &pack_bytes(desc_a)),
                upload_storage(gpu, "matcher descB (packed)", &pack_bytes(desc_b)),
            )
        } else {
            (
                upload_storage(gpu, "matcher descA", desc_a),
                upload_storage(gpu, "matcher descB", desc_b),
            )
        };

        let params = MatcherParams {
            count_a,
            count_b,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("matcher params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let pipeline = if quantize {
            &self.pipeline_quantized
        } else {
            &self.pipeline
        };

        let results_buf = self.dispatch(
            gpu,
            pipeline,
            count_a,
            &[
                params_buf.as_entire_binding(),
                buf_a.as_entire_binding(),
                buf_b.as_entire_binding(),
            ],
        );

        let results = self.read_results(gpu, &results_buf, count_a)?;
        Ok(ratio_filter(&results, ratio))
    }

    /// Brute-force match constrained by a fundamental matrix.
    ///
    /// `kps_a`/`kps_b` are flattened positions `[x0, y0, x1, y1, …]`, one
    /// pair per descriptor. `f` is row-major. Candidates whose epipolar
    /// distance exceeds `threshold` pixels never enter the best/second
    /// tracking; the ratio test applies on top.
    #[allow(clippy::too_many_arguments)]
    pub fn match_guided(
        &self,
        gpu: &GpuDevice,
        desc_a: &[f32],
        kps_a: &[f32],
        desc_b: &[f32],
        kps_b: &[f32],
        f: &[f32; 9],
        threshold: f32,
        ratio: f32,
    ) -> Result<Vec<Match>, MatchError> {
        let (count_a, count_b) = (record_count(desc_a)?, record_count(desc_b)?);
        check_keypoints(count_a, kps_a)?;
        check_keypoints(count_b, kps_b)?;
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }

        let buf_a = upload_storage(gpu, "guided descA", desc_a);
        let buf_b = upload_storage(gpu, "guided descB", desc_b);
        let buf_ka = upload_storage(gpu, "guided kpsA", kps_a);
        let buf_kb = upload_storage(gpu, "guided kpsB", kps_b);

        let params = GuidedParams {
            count_a,
            count_b,
            threshold,
            _pad: 0,
            f_col0: [f[0], f[3], f[6], 0.0],
            f_col1: [f[1], f[4], f[7], 0.0],
            f_col2: [f[2], f[5], f[8], 0.0],
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("guided params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let results_buf = self.dispatch(
            gpu,
            &self.pipeline_guided,
            count_a,
            &[
                params_buf.as_entire_binding(),
                buf_a.as_entire_binding(),
                buf_b.as_entire_binding(),
                buf_ka.as_entire_binding(),
                buf_kb.as_entire_binding(),
            ],
        );

        let results = self.read_results(gpu, &results_buf, count_a)?;
        Ok(ratio_filter(&results, ratio))
    }

    /// Create the result buffer, bind `resources` (followed by the result
    /// binding), dispatch ⌈count_a/64⌉ workgroups, and return the buffer.
    fn dispatch(
        &self,
        gpu: &GpuDevice,
        pipeline: &wgpu::ComputePipeline,
        count_a: u32,
        resources: &[wgpu::BindingResource],
    ) -> wgpu::Buffer {
        let results_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("matcher results"),
            size: count_a as u64 * std::mem::size_of::<GpuMatchResult>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        // Result buffer binds right after the caller's resources: binding 3
        // for the plain kernels, binding 5 for guided.
        let mut entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .enumerate()
            .map(|(i, r)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: r.clone(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: entries.len() as u32,
            resource: results_buf.as_entire_binding(),
        });

        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matcher"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("matcher"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("matcher"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups((count_a + MATCH_WG - 1) / MATCH_WG, 1, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        results_buf
    }

    fn read_results(
        &self,
        gpu: &GpuDevice,
        results_buf: &wgpu::Buffer,
        count_a: u32,
    ) -> Result<Vec<GpuMatchResult>, MatchError> {
        let raw = gpu.read_buffer(
            results_buf,
            0,
            count_a as u64 * std::mem::size_of::<GpuMatchResult>() as u64,
        )?;
        Ok(bytemuck::pod_collect_to_vec(&raw))
    }
}

// ---------------------------------------------------------------------------
// Host helpers
// ---------------------------------------------------------------------------

fn record_count(desc: &[f32]) -> Result<u32, MatchError> {
    if desc.len() % 128 != 0 {
        return Err(MatchError::DescriptorLength { len: desc.len() });
    }
    Ok((desc.len() / 128) as u32)
}

fn check_keypoints(count: u32, kps: &[f32]) -> Result<(), MatchError> {
    if kps.len() != count as usize * 2 {
        return Err(MatchError::KeypointMismatch {
            descriptors: count as usize,
            keypoints: kps.len(),
        });
    }
    Ok(())
}

fn upload_storage<T: bytemuck::Pod>(gpu: &GpuDevice, label: &str, data: &[T]) -> wgpu::Buffer {
    gpu.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE,
        })
}

/// Pack byte-valued floats into little-endian u32 words, four per word:
/// word = b₀ | b₁<<8 | b₂<<16 | b₃<<24.
fn pack_bytes(desc: &[f32]) -> Vec<u32> {
    desc.chunks_exact(4)
        .map(|c| {
            (c[0] as u32 & 0xFF)
                | (c[1] as u32 & 0xFF) << 8
                | (c[2] as u32 & 0xFF) << 16
                | (c[3] as u32 & 0xFF) << 24
        })
        .collect()
}

/// Lowe's ratio test over the raw GPU results:
/// keep query i iff bestIdx ≥ 0 and bestDistSq < ratio² · secondDistSq.
fn ratio_filter(results: &[GpuMatchResult], ratio: f32) -> Vec<Match> {
    let ratio_sq = ratio * ratio;
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.best_idx >= 0 && r.best_dist_sq < ratio_sq * r.second_dist_sq)
        .map(|(i, r)| Match {
            query_idx: i as u32,
            train_idx: r.best_idx as u32,
            distance: r.best_dist_sq.sqrt(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_and_params_layouts() {
        assert_eq!(std::mem::size_of::<GpuMatchResult>(), 16);
        assert_eq!(std::mem::size_of::<MatcherParams>(), 16);
        assert_eq!(std::mem::size_of::<GuidedParams>(), 64);
    }

    #[test]
    fn record_count_rejects_ragged_input() {
        assert!(matches!(
            record_count(&[0.0; 127]),
            Err(MatchError::DescriptorLength { len: 127 })
        ));
        assert_eq!(record_count(&[0.0; 256]).unwrap(), 2);
        assert_eq!(record_count(&[]).unwrap(), 0);
    }

    #[test]
    fn keypoint_check() {
        assert!(check_keypoints(2, &[0.0; 4]).is_ok());
        assert!(matches!(
            check_keypoints(2, &[0.0; 3]),
            Err(MatchError::KeypointMismatch { .. })
        ));
    }

    #[test]
    fn pack_bytes_is_little_endian() {
        let words = pack_bytes(&[1.0, 2.0, 3.0, 4.0, 255.0, 0.0, 0.0, 128.0]);
        assert_eq!(words, vec![0x04030201, 0x800000FF]);
    }

    #[test]
    fn pack_bytes_clamps_nothing_but_masks() {
        // Values are expected in [0, 255]; the mask only protects the word
        // packing from stray high bits after the cast.
        let words = pack_bytes(&[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(words, vec![0]);
    }

    #[test]
    fn ratio_filter_keeps_clear_winners() {
        let results = vec![
            // Clear winner: 1.0 < 0.5625 * 4.0.
            GpuMatchResult {
                best_idx: 7,
                best_dist_sq: 1.0,
                second_dist_sq: 4.0,
                _pad: 0.0,
            },
            // Ambiguous: 3.9 ≥ 0.5625 * 4.0.
            GpuMatchResult {
                best_idx: 2,
                best_dist_sq: 3.9,
                second_dist_sq: 4.0,
                _pad: 0.0,
            },
            // No candidate at all.
            GpuMatchResult {
                best_idx: -1,
                best_dist_sq: 0.0,
                second_dist_sq: 0.0,
                _pad: 0.0,
            },
        ];
        let matches = ratio_filter(&results, 0.75);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query_idx, 0);
        assert_eq!(matches[0].train_idx, 7);
        assert!((matches[0].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ratio_filter_distance_is_sqrt() {
        let results = vec![GpuMatchResult {
            best_idx: 0,
            best_dist_sq: 9.0,
            second_dist_sq: 100.0,
            _pad: 0.0,
        }];
        let matches = ratio_filter(&results, 0.75);
        assert!((matches[0].distance - 3.0).abs() < 1e-6);
    }

    // ---- GPU integration tests (subprocess-isolated) -----------------------

    #[cfg(test)]
    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--",
                test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("subprocess failed for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    /// Two descriptor records per set: an all-ones record and an all-0.5
    /// record, so pair 0 matches 0 and pair 1 matches 1 exactly.
    fn two_record_sets() -> (Vec<f32>, Vec<f32>) {
        let mut a = vec![1.0f32; 128];
        a.extend(vec![0.5f32; 128]);
        (a.clone(), a)
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_exact_matches_pass_ratio_test() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let matcher = SiftMatcher::new(&gpu);
        let (a, b) = two_record_sets();
        let matches = matcher
            .match_descriptors(&gpu, &a, &b, 0.75, false)
            .expect("match");
        // Distances: 0↔0 is 0, 0↔1 is 128·0.25 = 32. Both queries have an
        // exact best, so both survive any ratio.
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].query_idx, 0);
        assert_eq!(matches[0].train_idx, 0);
        assert_eq!(matches[1].train_idx, 1);
        assert!(matches.iter().all(|m| m.distance < 1e-3));
        println!("GPU_TEST_OK");
        drop(matcher);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_quantized_agrees_with_float() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let matcher = SiftMatcher::new(&gpu);

        // Byte-valued descriptors from an LCG so both paths see identical
        // data (floats hold every u8 exactly).
        let mut rng = 77u32;
        let mut fill = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| {
                    rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
                    (rng >> 24) as f32
                })
                .collect()
        };
        let a = fill(4 * 128);
        let b = fill(6 * 128);

        let float_matches = matcher
            .match_descriptors(&gpu, &a, &b, 0.9, false)
            .expect("float match");
        let quant_matches = matcher
            .match_descriptors(&gpu, &a, &b, 0.9, true)
            .expect("quantized match");

        let key = |ms: &[Match]| -> Vec<(u32, u32)> {
            ms.iter().map(|m| (m.query_idx, m.train_idx)).collect()
        };
        assert_eq!(key(&float_matches), key(&quant_matches));
        for (fm, qm) in float_matches.iter().zip(quant_matches.iter()) {
            let rel = (fm.distance - qm.distance).abs() / fm.distance.max(1.0);
            assert!(rel < 5e-3, "distance diverged: {} vs {}", fm.distance, qm.distance);
        }
        println!("GPU_TEST_OK");
        drop(matcher);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_guided_epipolar_gate() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let matcher = SiftMatcher::new(&gpu);
        let (a, b) = two_record_sets();

        // Pure horizontal translation model: l = F·p = (0, −1, y), so the
        // epipolar distance reduces to |y − y′|.
        let f = [0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0];
        let kps_a = [100.0, 100.0, 200.0, 200.0];
        let kps_b = [150.0, 100.0, 250.0, 220.0];

        // Pair 0: |100−100| = 0 ≤ 5. Pair 1: |200−220| = 20 > 5.
        let tight = matcher
            .match_guided(&gpu, &a, &kps_a, &b, &kps_b, &f, 5.0, 0.9)
            .expect("guided");
        assert_eq!(tight.len(), 1);
        assert_eq!((tight[0].query_idx, tight[0].train_idx), (0, 0));

        // Widening the gate admits pair 1 as well.
        let wide = matcher
            .match_guided(&gpu, &a, &kps_a, &b, &kps_b, &f, 30.0, 0.9)
            .expect("guided wide");
        assert_eq!(wide.len(), 2);
        assert_eq!((wide[1].query_idx, wide[1].train_idx), (1, 1));

        println!("GPU_TEST_OK");
        drop(matcher);
        drop(gpu);
    }

    // ---- Outer wrappers -----------------------------------------------------

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_exact_matches_pass_ratio_test() {
        let out = run_gpu_test_in_subprocess(
            "matcher::tests::inner_exact_matches_pass_ratio_test",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_quantized_agrees_with_float() {
        let out =
            run_gpu_test_in_subprocess("matcher::tests::inner_quantized_agrees_with_float");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_guided_epipolar_gate() {
        let out = run_gpu_test_in_subprocess("matcher::tests::inner_guided_epipolar_gate");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
