// core.rs — shared detection pipeline orchestration.
//
// One `DetectorCore` drives the full pipeline for either storage layout:
//
//   RGBA8 upload → grayscale → Gaussian/DoG pyramids → extrema →
//   prepare dispatch → orientation → prepare dispatch (re-run) →
//   descriptors → readback
//
//
// OUTPUT STRATEGY: atomic counter + pre-allocated keypoint buffer
// ───────────────────────────────────────────────────────────────
// The number of keypoints is only known on the GPU, so the keypoint buffer
// is a counted array: a u32 counter at offset 0 (12 bytes of padding to
// the first record), then MAX_KEYPOINTS records of 32 bytes. The extrema
// kernel claims slots with a compare-exchange loop that saturates at
// MAX_KEYPOINTS, so the stored counter never exceeds the capacity and
// excess candidates are silently dropped.
//
//
// INDIRECT DISPATCH
// ─────────────────
// Orientation and descriptor workgroup counts depend on that counter, which
// the host must not read back before scheduling (that would stall the
// queue). A single-thread "prepare dispatch" kernel translates the counter
// into two (x, 1, 1) workgroup-count tuples inside a 24-byte indirect
// buffer; the dependent passes launch with `dispatch_workgroups_indirect`
// at offsets 0 and 12. The preparer runs twice: once after extrema, and
// again after orientation so secondary-peak keypoints appended by the
// orientation kernel are covered by the descriptor pass.
//
//
// DETERMINISTIC ORDERING
// ──────────────────────
// Atomic slot assignment races, so raw record order varies run to run.
// Readback sorts keypoints by (octave, scale, y, x, orientation) and keeps
// the slot permutation; descriptor readback applies the same permutation.
// Two runs over identical input then produce identical outputs.

use wgpu::util::DeviceExt;

use crate::detector::{SiftOptions, SiftProfiling};
use crate::device::{GpuDevice, GpuError};
use crate::kernel_cache::{radius_for_sigma, KernelCache};
use crate::keypoint::{
    sigma_for_scale, GpuKeypoint, Keypoint, KEYPOINT_HEADER_BYTES, KEYPOINT_RECORD_BYTES,
    MAX_KEYPOINTS, NUM_OCTAVES, SCALES_PER_OCTAVE, SIGMA_BASE,
};
use crate::layout::Layout;

/// Workgroup side length of every image-space pass (16×16 tiles).
const TILE: u32 = 16;

/// Timestamp query slots: start, grayscale, pyramids, extrema, orientation,
/// descriptor, end.
const QUERY_COUNT: u32 = 7;

fn tiles(extent: u32) -> u32 {
    (extent + TILE - 1) / TILE
}

// ---------------------------------------------------------------------------
// Uniform blocks (must match the WGSL struct layouts exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    width: u32,
    height: u32,
    radius: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DownsampleParams {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtremaParams {
    width: u32,
    height: u32,
    octave: u32,
    scale: u32,
    contrast: f32,
    edge: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct OrientationParams {
    width: u32,
    height: u32,
    octave: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DescriptorParams {
    width: u32,
    height: u32,
    octave: u32,
    _pad: u32,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

struct Pipelines {
    grayscale: wgpu::ComputePipeline,
    blur_h: wgpu::ComputePipeline,
    blur_v: wgpu::ComputePipeline,
    downsample: wgpu::ComputePipeline,
    dog: wgpu::ComputePipeline,
    extrema: wgpu::ComputePipeline,
    orientation: wgpu::ComputePipeline,
    descriptor: wgpu::ComputePipeline,
    prepare_dispatch: wgpu::ComputePipeline,
}

// Bind group layout entry shorthands. Sampled textures are declared
// unfilterable: every working texture is R32Float or RGBA32Float, which
// cannot bind to `filterable: true` entries without extra device features.
// (RGBA8Unorm inputs bind to unfilterable entries too — only textureLoad
// is used.)

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}

fn storage_texture_entry(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

impl Pipelines {
    fn new(gpu: &GpuDevice, layout: Layout, options: &SiftOptions) -> Self {
        let fmt = layout.format();

        let create = |label: &str, source: &str, entries: &[wgpu::BindGroupLayoutEntry]| {
            // Host-owned constants are baked into the shader source before
            // compilation; the placeholder is absent from most stages.
            let source = source.replace("{{MAX_KEYPOINTS}}", &MAX_KEYPOINTS.to_string());
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

        let s = layout.shaders();
        let descriptor_src = if options.quantize_descriptors {
            s.descriptor_quantized
        } else {
            s.descriptor
        };

        let blur_entries = [
            uniform_entry(0),
            texture_entry(1),
            storage_texture_entry(2, fmt),
            storage_entry(3, true),
        ];

        Pipelines {
            grayscale: create(
                "grayscale",
                s.grayscale,
                &[texture_entry(0), storage_texture_entry(1, fmt)],
            ),
            blur_h: create("blur_horizontal", s.blur_h, &blur_entries),
            blur_v: create("blur_vertical", s.blur_v, &blur_entries),
            downsample: create(
                "downsample",
                s.downsample,
                &[uniform_entry(0), texture_entry(1), storage_texture_entry(2, fmt)],
            ),
            dog: create(
                "dog",
                s.dog,
                &[texture_entry(0), texture_entry(1), storage_texture_entry(2, fmt)],
            ),
            extrema: create(
                "extrema",
                s.extrema,
                &[
                    uniform_entry(0),
                    texture_entry(1),
                    texture_entry(2),
                    texture_entry(3),
                    storage_entry(4, false),
                ],
            ),
            orientation: create(
                "orientation",
                s.orientation,
                &[
                    uniform_entry(0),
                    storage_entry(1, false),
                    texture_entry(2),
                    texture_entry(3),
                    texture_entry(4),
                ],
            ),
            descriptor: create(
                "descriptor",
                descriptor_src,
                &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, false),
                    texture_entry(3),
                    texture_entry(4),
                    texture_entry(5),
                ],
            ),
            prepare_dispatch: create(
                "prepare_dispatch",
                include_str!("shaders/common/prepare_dispatch.wgsl"),
                &[storage_entry(0, true), storage_entry(1, false)],
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Pyramid cache
// ---------------------------------------------------------------------------

/// Scale-space textures, cached across detect calls with identical input
/// dimensions and rebuilt on resize.
struct PyramidCache {
    width: u32,
    height: u32,
    base: wgpu::Texture,
    scratch: wgpu::Texture,
    /// gaussian[o][s], s ∈ [0, S+3)
    gaussian: Vec<Vec<wgpu::Texture>>,
    /// dog[o][s], s ∈ [0, S+2)
    dog: Vec<Vec<wgpu::Texture>>,
    /// Stored texture dimensions per octave.
    octave_sizes: Vec<(u32, u32)>,
}

fn create_working_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    label: &str,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING,
        view_formats: &[],
    })
}

impl PyramidCache {
    fn build(gpu: &GpuDevice, layout: Layout, width: u32, height: u32) -> Self {
        let format = layout.format();
        let (bw, bh) = layout.base_dims(width, height);

        let base = create_working_texture(&gpu.device, bw, bh, format, "sift base");
        let scratch = create_working_texture(&gpu.device, bw, bh, format, "sift scratch");

        let mut gaussian = Vec::with_capacity(NUM_OCTAVES as usize);
        let mut dog = Vec::with_capacity(NUM_OCTAVES as usize);
        let mut octave_sizes = Vec::with_capacity(NUM_OCTAVES as usize);

        for o in 0..NUM_OCTAVES {
            let (w, h) = layout.octave_dims(width, height, o);
            octave_sizes.push((w, h));

            let gauss_octave = (0..SCALES_PER_OCTAVE + 3)
                .map(|s| {
                    create_working_texture(
                        &gpu.device,
                        w,
                        h,
                        format,
                        &format!("sift gaussian o{o} s{s}"),
                    )
                })
                .collect();
            let dog_octave = (0..SCALES_PER_OCTAVE + 2)
                .map(|s| {
                    create_working_texture(&gpu.device, w, h, format, &format!("sift dog o{o} s{s}"))
                })
                .collect();

            gaussian.push(gauss_octave);
            dog.push(dog_octave);
        }

        PyramidCache {
            width,
            height,
            base,
            scratch,
            gaussian,
            dog,
            octave_sizes,
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp queries
// ---------------------------------------------------------------------------

struct StageTimer {
    set: wgpu::QuerySet,
    resolve_buf: wgpu::Buffer,
}

impl StageTimer {
    fn new(gpu: &GpuDevice) -> Option<Self> {
        if !gpu.timestamps_supported {
            return None;
        }
        let set = gpu.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("sift stage timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: QUERY_COUNT,
        });
        let resolve_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sift timestamp resolve"),
            size: QUERY_COUNT as u64 * 8,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Some(StageTimer { set, resolve_buf })
    }
}

// ---------------------------------------------------------------------------
// DetectorCore
// ---------------------------------------------------------------------------

pub(crate) struct DetectorCore {
    layout: Layout,
    options: SiftOptions,
    pipelines: Pipelines,
    kernel_cache: KernelCache,

    /// [u32 count][12 B reserved][MAX_KEYPOINTS × 32 B records]
    keypoints_buf: wgpu::Buffer,
    /// MAX_KEYPOINTS descriptor records (512 B float / 128 B quantized).
    descriptors_buf: wgpu::Buffer,
    /// Two (x, y, z) workgroup-count tuples: orientation at offset 0,
    /// descriptor at offset 12.
    indirect_buf: wgpu::Buffer,

    timer: Option<StageTimer>,
    profiling: SiftProfiling,

    pyramid: Option<PyramidCache>,

    keypoints: Vec<Keypoint>,
    /// keypoints[i] came from GPU record slot slots[i]; descriptor
    /// readback applies the same permutation.
    slots: Vec<u32>,
}

impl DetectorCore {
    pub fn new(gpu: &GpuDevice, layout: Layout, options: SiftOptions) -> Self {
        let pipelines = Pipelines::new(gpu, layout, &options);

        let kp_size = KEYPOINT_HEADER_BYTES + MAX_KEYPOINTS as u64 * KEYPOINT_RECORD_BYTES;
        let keypoints_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sift keypoints"),
            size: kp_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let descriptors_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sift descriptors"),
            size: MAX_KEYPOINTS as u64 * descriptor_record_bytes(&options),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let indirect_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sift indirect dispatch"),
            size: 24,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });

        DetectorCore {
            layout,
            options,
            pipelines,
            kernel_cache: KernelCache::new(),
            keypoints_buf,
            descriptors_buf,
            indirect_buf,
            timer: StageTimer::new(gpu),
            profiling: SiftProfiling::default(),
            pyramid: None,
            keypoints: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn profiling(&self) -> SiftProfiling {
        self.profiling
    }

    // -----------------------------------------------------------------------
    // Detect
    // -----------------------------------------------------------------------

    pub fn detect(
        &mut self,
        gpu: &GpuDevice,
        rgba: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        assert!(width > 0 && height > 0, "image must be non-empty");
        assert_eq!(
            rgba.len(),
            width as usize * height as usize * 4,
            "rgba buffer must be width*height*4 bytes"
        );

        self.keypoints.clear();
        self.slots.clear();
        self.profiling = SiftProfiling::default();

        // Per-call input texture; pyramid textures are reused on identical
        // dimensions.
        let input_tex = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("sift input"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &input_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        let rebuild = match &self.pyramid {
            Some(p) => p.width != width || p.height != height,
            None => true,
        };
        if rebuild {
            self.pyramid = Some(PyramidCache::build(gpu, self.layout, width, height));
        }

        // Reset the keypoint counter.
        gpu.queue
            .write_buffer(&self.keypoints_buf, 0, bytemuck::bytes_of(&0u32));

        self.write_timestamp(gpu, 0);
        self.run_grayscale(gpu, &input_tex);
        self.write_timestamp(gpu, 1);
        self.build_pyramids(gpu);
        self.write_timestamp(gpu, 2);
        self.detect_extrema(gpu);
        self.run_prepare_dispatch(gpu);
        self.write_timestamp(gpu, 3);
        self.compute_orientations(gpu);
        self.write_timestamp(gpu, 4);
        // Orientation may have appended secondary-peak records; refresh the
        // descriptor workgroup count so they are described too.
        self.run_prepare_dispatch(gpu);
        self.compute_descriptors(gpu);
        self.write_timestamp(gpu, 5);
        self.write_timestamp(gpu, 6);

        self.readback_keypoints(gpu)
    }

    // -----------------------------------------------------------------------
    // Stage dispatchers
    // -----------------------------------------------------------------------

    fn run_grayscale(&self, gpu: &GpuDevice, input_tex: &wgpu::Texture) {
        let pyramid = self.pyramid.as_ref().expect("pyramid built in detect");
        let (bw, bh) = pyramid.octave_sizes[0];

        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("grayscale"),
            layout: &self.pipelines.grayscale.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(
                        &input_tex.create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(
                        &pyramid
                            .base
                            .create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
            ],
        });

        self.dispatch_tiled(gpu, &self.pipelines.grayscale, &bind, "grayscale", bw, bh);
    }

    fn build_pyramids(&mut self, gpu: &GpuDevice) {
        for o in 0..NUM_OCTAVES as usize {
            let (w, h) = self.pyramid.as_ref().unwrap().octave_sizes[o];

            if o == 0 {
                self.run_blur(gpu, PyramidTex::Base, PyramidTex::Gaussian(0, 0), w, h, SIGMA_BASE);
            } else {
                let (pw, ph) = self.pyramid.as_ref().unwrap().octave_sizes[o - 1];
                self.run_downsample(
                    gpu,
                    PyramidTex::Gaussian(o - 1, SCALES_PER_OCTAVE as usize),
                    PyramidTex::Gaussian(o, 0),
                    (pw, ph),
                    (w, h),
                );
            }

            for s in 1..(SCALES_PER_OCTAVE + 3) as usize {
                let sigma = sigma_for_scale(s as u32);
                let prev = sigma_for_scale(s as u32 - 1);
                let sigma_inc = (sigma * sigma - prev * prev).sqrt();
                self.run_blur(
                    gpu,
                    PyramidTex::Gaussian(o, s - 1),
                    PyramidTex::Gaussian(o, s),
                    w,
                    h,
                    sigma_inc,
                );
            }

            for s in 0..(SCALES_PER_OCTAVE + 2) as usize {
                self.run_dog(
                    gpu,
                    PyramidTex::Gaussian(o, s),
                    PyramidTex::Gaussian(o, s + 1),
                    s,
                    o,
                    (w, h),
                );
            }
        }
    }

    /// Separable blur: horizontal pass into the scratch texture, vertical
    /// pass into the destination. Edge samples clamp to the boundary
    /// inside the shader.
    fn run_blur(
        &mut self,
        gpu: &GpuDevice,
        src: PyramidTex,
        dst: PyramidTex,
        w: u32,
        h: u32,
        sigma: f32,
    ) {
        let radius = radius_for_sigma(sigma);

        // Split borrows: the kernel cache hands out a buffer reference while
        // the pyramid textures are borrowed for the bind groups.
        let DetectorCore {
            kernel_cache,
            pyramid,
            pipelines,
            ..
        } = self;
        let kernel_buf = kernel_cache.get(gpu, sigma, radius);
        let pyramid = pyramid.as_ref().expect("pyramid built in detect");

        let params = BlurParams {
            width: w,
            height: h,
            radius,
            _pad: 0,
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("blur params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let src_view = pyramid.view(src);
        let scratch_view = pyramid
            .scratch
            .create_view(&wgpu::TextureViewDescriptor::default());
        let dst_view = pyramid.view(dst);

        let make_bind = |pipeline: &wgpu::ComputePipeline,
                         input: &wgpu::TextureView,
                         output: &wgpu::TextureView| {
            gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("blur"),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(input),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(output),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: kernel_buf.as_entire_binding(),
                    },
                ],
            })
        };

        let bind_h = make_bind(&pipelines.blur_h, &src_view, &scratch_view);
        let bind_v = make_bind(&pipelines.blur_v, &scratch_view, &dst_view);

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("blur"),
            });
        for (pipeline, bind) in [(&pipelines.blur_h, &bind_h), (&pipelines.blur_v, &bind_v)] {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("blur pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind, &[]);
            pass.dispatch_workgroups(tiles(w), tiles(h), 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// 2× downsample: destination sample (x, y) takes source sample
    /// (2x, 2y).
    fn run_downsample(
        &self,
        gpu: &GpuDevice,
        src: PyramidTex,
        dst: PyramidTex,
        src_dims: (u32, u32),
        dst_dims: (u32, u32),
    ) {
        let params = DownsampleParams {
            src_width: src_dims.0,
            src_height: src_dims.1,
            dst_width: dst_dims.0,
            dst_height: dst_dims.1,
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("downsample params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let pyramid = self.pyramid.as_ref().unwrap();
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("downsample"),
            layout: &self.pipelines.downsample.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&pyramid.view(src)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&pyramid.view(dst)),
                },
            ],
        });

        self.dispatch_tiled(
            gpu,
            &self.pipelines.downsample,
            &bind,
            "downsample",
            dst_dims.0,
            dst_dims.1,
        );
    }

    /// DoG[o][s] = Gaussian[o][s+1] − Gaussian[o][s].
    fn run_dog(
        &self,
        gpu: &GpuDevice,
        lower: PyramidTex,
        upper: PyramidTex,
        s: usize,
        o: usize,
        dims: (u32, u32),
    ) {
        let pyramid = self.pyramid.as_ref().unwrap();
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dog"),
            layout: &self.pipelines.dog.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&pyramid.view(lower)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&pyramid.view(upper)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(
                        &pyramid.dog[o][s].create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
            ],
        });

        self.dispatch_tiled(gpu, &self.pipelines.dog, &bind, "dog", dims.0, dims.1);
    }

    fn detect_extrema(&self, gpu: &GpuDevice) {
        let pyramid = self.pyramid.as_ref().unwrap();

        for o in 0..NUM_OCTAVES {
            let (w, h) = pyramid.octave_sizes[o as usize];
            for s in 1..=SCALES_PER_OCTAVE {
                let params = ExtremaParams {
                    width: w,
                    height: h,
                    octave: o,
                    scale: s,
                    contrast: self.options.contrast_threshold / SCALES_PER_OCTAVE as f32,
                    edge: self.options.edge_threshold,
                };
                let params_buf = gpu
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("extrema params"),
                        contents: bytemuck::bytes_of(&params),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });

                let view = |t: &wgpu::Texture| t.create_view(&wgpu::TextureViewDescriptor::default());
                let dog = &pyramid.dog[o as usize];
                let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("extrema"),
                    layout: &self.pipelines.extrema.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params_buf.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&view(
                                &dog[(s - 1) as usize],
                            )),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(&view(&dog[s as usize])),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::TextureView(&view(
                                &dog[(s + 1) as usize],
                            )),
                        },
                        wgpu::BindGroupEntry {
                            binding: 4,
                            resource: self.keypoints_buf.as_entire_binding(),
                        },
                    ],
                });

                self.dispatch_tiled(gpu, &self.pipelines.extrema, &bind, "extrema", w, h);
            }
        }
    }

    /// Single-thread kernel: translate the (clamped) keypoint count into
    /// the two indirect workgroup-count tuples.
    fn run_prepare_dispatch(&self, gpu: &GpuDevice) {
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("prepare dispatch"),
            layout: &self.pipelines.prepare_dispatch.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.keypoints_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.indirect_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("prepare dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("prepare_dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines.prepare_dispatch);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// One 64-wide workgroup per keypoint, launched indirectly per octave.
    /// Keypoints in other octaves return immediately inside the shader.
    fn compute_orientations(&self, gpu: &GpuDevice) {
        self.run_per_keypoint_stage(
            gpu,
            &self.pipelines.orientation,
            0,
            "orientation",
            /* with_descriptors */ false,
        );
    }

    fn compute_descriptors(&self, gpu: &GpuDevice) {
        self.run_per_keypoint_stage(
            gpu,
            &self.pipelines.descriptor,
            12,
            "descriptor",
            /* with_descriptors */ true,
        );
    }

    fn run_per_keypoint_stage(
        &self,
        gpu: &GpuDevice,
        pipeline: &wgpu::ComputePipeline,
        indirect_offset: u64,
        label: &str,
        with_descriptors: bool,
    ) {
        let pyramid = self.pyramid.as_ref().unwrap();

        for o in 0..NUM_OCTAVES {
            let (w, h) = pyramid.octave_sizes[o as usize];

            // Orientation params are 12 bytes, descriptor params 16; both
            // start (width, height, octave).
            let params_buf = if with_descriptors {
                let p = DescriptorParams {
                    width: w,
                    height: h,
                    octave: o,
                    _pad: 0,
                };
                gpu.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("descriptor params"),
                        contents: bytemuck::bytes_of(&p),
                        usage: wgpu::BufferUsages::UNIFORM,
                    })
            } else {
                let p = OrientationParams {
                    width: w,
                    height: h,
                    octave: o,
                };
                gpu.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("orientation params"),
                        contents: bytemuck::bytes_of(&p),
                        usage: wgpu::BufferUsages::UNIFORM,
                    })
            };

            let view = |t: &wgpu::Texture| t.create_view(&wgpu::TextureViewDescriptor::default());
            let gauss = &pyramid.gaussian[o as usize];

            let mut entries = vec![
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.keypoints_buf.as_entire_binding(),
                },
            ];
            if with_descriptors {
                entries.push(wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.descriptors_buf.as_entire_binding(),
                });
            }
            // Gaussian levels 1..=S — one per candidate scale index; the
            // shader selects by the record's scale field.
            let g1 = view(&gauss[1]);
            let g2 = view(&gauss[2]);
            let g3 = view(&gauss[3]);
            let base = entries.len() as u32;
            entries.push(wgpu::BindGroupEntry {
                binding: base,
                resource: wgpu::BindingResource::TextureView(&g1),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: base + 1,
                resource: wgpu::BindingResource::TextureView(&g2),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: base + 2,
                resource: wgpu::BindingResource::TextureView(&g3),
            });

            let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });

            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind, &[]);
                pass.dispatch_workgroups_indirect(&self.indirect_buf, indirect_offset);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn dispatch_tiled(
        &self,
        gpu: &GpuDevice,
        pipeline: &wgpu::ComputePipeline,
        bind: &wgpu::BindGroup,
        label: &str,
        w: u32,
        h: u32,
    ) {
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind, &[]);
            pass.dispatch_workgroups(tiles(w), tiles(h), 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Submit an empty compute pass whose only effect is a timestamp write.
    /// No-op when the device lacks timestamp queries.
    fn write_timestamp(&self, gpu: &GpuDevice, index: u32) {
        let Some(timer) = &self.timer else {
            return;
        };
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("timestamp"),
            });
        {
            let _pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("timestamp"),
                timestamp_writes: Some(wgpu::ComputePassTimestampWrites {
                    query_set: &timer.set,
                    beginning_of_pass_write_index: Some(index),
                    end_of_pass_write_index: None,
                }),
            });
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    // -----------------------------------------------------------------------
    // Readback
    // -----------------------------------------------------------------------

    fn readback_keypoints(&mut self, gpu: &GpuDevice) -> Result<(), GpuError> {
        // Resolve stage timestamps alongside the counter copy so one poll
        // covers both.
        if let Some(timer) = &self.timer {
            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("resolve timestamps"),
                });
            encoder.resolve_query_set(&timer.set, 0..QUERY_COUNT, &timer.resolve_buf, 0);
            gpu.queue.submit(std::iter::once(encoder.finish()));
        }

        let count_bytes = gpu.read_buffer(&self.keypoints_buf, 0, 4)?;
        let count = u32::from_le_bytes(count_bytes[0..4].try_into().unwrap()).min(MAX_KEYPOINTS);

        if let Some(timer) = &self.timer {
            let raw = gpu.read_buffer(&timer.resolve_buf, 0, QUERY_COUNT as u64 * 8)?;
            // pod_collect_to_vec realigns — the readback Vec<u8> carries no
            // alignment guarantee.
            let ts: Vec<u64> = bytemuck::pod_collect_to_vec(&raw);
            let ms = |a: u64, b: u64| {
                // Guard against wrap/reset between queries.
                if b < a {
                    0.0
                } else {
                    (b - a) as f64 * gpu.timestamp_period as f64 * 1e-6
                }
            };
            self.profiling = SiftProfiling {
                grayscale_ms: ms(ts[0], ts[1]),
                pyramids_ms: ms(ts[1], ts[2]),
                extrema_ms: ms(ts[2], ts[3]),
                orientation_ms: ms(ts[3], ts[4]),
                descriptor_ms: ms(ts[4], ts[5]),
                total_ms: ms(ts[0], ts[6]),
            };
        }

        if count == 0 {
            return Ok(());
        }

        let raw = gpu.read_buffer(
            &self.keypoints_buf,
            KEYPOINT_HEADER_BYTES,
            count as u64 * KEYPOINT_RECORD_BYTES,
        )?;
        let records: Vec<GpuKeypoint> = bytemuck::pod_collect_to_vec(&raw);

        let (keypoints, slots) = sort_keypoints(&records);
        self.keypoints = keypoints;
        self.slots = slots;
        Ok(())
    }

    pub fn read_descriptors(&self, gpu: &GpuDevice) -> Result<Vec<f32>, GpuError> {
        let count = self.keypoints.len();
        if count == 0 {
            return Ok(Vec::new());
        }

        let record_bytes = descriptor_record_bytes(&self.options) as usize;
        let raw = gpu.read_buffer(&self.descriptors_buf, 0, (count * record_bytes) as u64)?;

        let mut out = Vec::with_capacity(count * 128);
        if self.options.quantize_descriptors {
            // 128 bytes per record, widened to floats in [0, 255].
            for &slot in &self.slots {
                let rec = &raw[slot as usize * record_bytes..][..record_bytes];
                out.extend(rec.iter().map(|&b| b as f32));
            }
        } else {
            let floats: Vec<f32> = bytemuck::pod_collect_to_vec(&raw);
            for &slot in &self.slots {
                out.extend_from_slice(&floats[slot as usize * 128..][..128]);
            }
        }
        Ok(out)
    }
}

/// Bytes per descriptor record: 128 f32, or 32 u32 words of packed bytes.
fn descriptor_record_bytes(options: &SiftOptions) -> u64 {
    if options.quantize_descriptors {
        32 * 4
    } else {
        128 * 4
    }
}

/// Sort raw records into the stable public order and return the slot
/// permutation (keypoints[i] ← records[slots[i]]).
fn sort_keypoints(records: &[GpuKeypoint]) -> (Vec<Keypoint>, Vec<u32>) {
    let mut order: Vec<u32> = (0..records.len() as u32).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&records[a as usize], &records[b as usize]);
        (ra.octave as u32, ra.scale as u32)
            .cmp(&(rb.octave as u32, rb.scale as u32))
            .then(ra.y.total_cmp(&rb.y))
            .then(ra.x.total_cmp(&rb.x))
            .then(ra.orientation.total_cmp(&rb.orientation))
    });
    let keypoints = order
        .iter()
        .map(|&i| records[i as usize].into())
        .collect();
    (keypoints, order)
}

// ---------------------------------------------------------------------------
// Pyramid texture addressing
// ---------------------------------------------------------------------------

/// Names one texture of the pyramid cache for the stage dispatchers.
#[derive(Clone, Copy)]
enum PyramidTex {
    Base,
    Gaussian(usize, usize),
}

impl PyramidCache {
    fn view(&self, t: PyramidTex) -> wgpu::TextureView {
        let tex = match t {
            PyramidTex::Base => &self.base,
            PyramidTex::Gaussian(o, s) => &self.gaussian[o][s],
        };
        tex.create_view(&wgpu::TextureViewDescriptor::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_layouts() {
        // Sizes must match the WGSL uniform structs byte for byte.
        assert_eq!(std::mem::size_of::<BlurParams>(), 16);
        assert_eq!(std::mem::size_of::<DownsampleParams>(), 16);
        assert_eq!(std::mem::size_of::<ExtremaParams>(), 24);
        assert_eq!(std::mem::size_of::<OrientationParams>(), 12);
        assert_eq!(std::mem::size_of::<DescriptorParams>(), 16);
    }

    #[test]
    fn tile_counts_cover_every_pixel() {
        assert_eq!(tiles(256), 16);
        assert_eq!(tiles(257), 17);
        assert_eq!(tiles(1), 1);
    }

    #[test]
    fn incremental_sigma_is_real() {
        // σ(s) is strictly increasing, so σ_inc = √(σ(s)² − σ(s−1)²) is
        // always well-defined.
        for s in 1..(SCALES_PER_OCTAVE + 3) {
            let a = sigma_for_scale(s - 1);
            let b = sigma_for_scale(s);
            assert!(b * b - a * a > 0.0, "scale {s}");
        }
    }

    #[test]
    fn sort_is_stable_and_permutation_is_consistent() {
        let rec = |x: f32, y: f32, o: f32, s: f32| GpuKeypoint {
            x,
            y,
            octave: o,
            scale: s,
            sigma: 1.6,
            orientation: 0.5,
            _pad0: 0.0,
            _pad1: 0.0,
        };
        // Deliberately shuffled input.
        let records = vec![
            rec(50.0, 10.0, 1.0, 1.0),
            rec(5.0, 2.0, 0.0, 2.0),
            rec(9.0, 2.0, 0.0, 1.0),
            rec(3.0, 2.0, 0.0, 1.0),
        ];
        let (kps, slots) = sort_keypoints(&records);

        // Octave/scale dominate, then y, then x.
        assert_eq!(slots, vec![3, 2, 1, 0]);
        assert_eq!(kps[0].x, 3.0);
        assert_eq!(kps[1].x, 9.0);
        assert_eq!(kps[2].scale, 2);
        assert_eq!(kps[3].octave, 1);

        // Permutation agreement: kps[i] equals records[slots[i]].
        for (i, kp) in kps.iter().enumerate() {
            assert_eq!(kp.x, records[slots[i] as usize].x);
        }
    }

    #[test]
    fn descriptor_record_sizes() {
        let float = SiftOptions::default();
        let quant = SiftOptions {
            quantize_descriptors: true,
            ..Default::default()
        };
        assert_eq!(descriptor_record_bytes(&float), 512);
        assert_eq!(descriptor_record_bytes(&quant), 128);
    }
}
