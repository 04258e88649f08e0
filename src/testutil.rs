// testutil.rs — synthetic RGBA test images.
//
// Deterministic generators only: the LCG keeps noise images reproducible
// without pulling in a rand dependency.

/// Solid RGBA image, alpha 255.
pub fn uniform_image(width: u32, height: u32, value: u8) -> Vec<u8> {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        rgba.extend_from_slice(&[value, value, value, 255]);
    }
    rgba
}

/// White filled disc on black, alpha 255.
pub fn disc_image(width: u32, height: u32, cx: f32, cy: f32, radius: f32) -> Vec<u8> {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let v = if dx * dx + dy * dy <= radius * radius {
                255u8
            } else {
                0u8
            };
            rgba.extend_from_slice(&[v, v, v, 255]);
        }
    }
    rgba
}

/// Dense grid of white discs on black: one disc every `pitch` pixels in
/// both axes, each of the given radius. Every disc is an isolated blob at
/// the fine end of the scale space, so the candidate count scales with
/// (width/pitch) · (height/pitch).
pub fn disc_grid_image(width: u32, height: u32, pitch: u32, radius: f32) -> Vec<u8> {
    let mut rgba = vec![0u8; (width * height * 4) as usize];
    let mut cy = pitch / 2;
    while cy < height {
        let mut cx = pitch / 2;
        while cx < width {
            let r = radius.ceil() as i32;
            for dy in -r..=r {
                for dx in -r..=r {
                    if (dx * dx + dy * dy) as f32 > radius * radius {
                        continue;
                    }
                    let x = cx as i32 + dx;
                    let y = cy as i32 + dy;
                    if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
                        continue;
                    }
                    let i = ((y as u32 * width + x as u32) * 4) as usize;
                    rgba[i] = 255;
                    rgba[i + 1] = 255;
                    rgba[i + 2] = 255;
                }
            }
            cx += pitch;
        }
        cy += pitch;
    }
    // Alpha everywhere.
    for px in rgba.chunks_exact_mut(4) {
        px[3] = 255;
    }
    rgba
}

/// Grayscale LCG noise, alpha 255.
pub fn noise_image(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut rng = seed;
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        let v = (rng >> 24) as u8;
        rgba.extend_from_slice(&[v, v, v, 255]);
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_produce_correct_sizes() {
        assert_eq!(uniform_image(8, 4, 128).len(), 8 * 4 * 4);
        assert_eq!(disc_image(16, 16, 8.0, 8.0, 4.0).len(), 16 * 16 * 4);
        assert_eq!(noise_image(8, 8, 1).len(), 8 * 8 * 4);
    }

    #[test]
    fn disc_is_white_inside_black_outside() {
        let img = disc_image(32, 32, 16.0, 16.0, 5.0);
        let px = |x: usize, y: usize| img[(y * 32 + x) * 4];
        assert_eq!(px(16, 16), 255);
        assert_eq!(px(0, 0), 0);
        assert_eq!(px(16, 24), 0);
    }

    #[test]
    fn disc_grid_count_scales_with_pitch() {
        let img = disc_grid_image(60, 60, 6, 2.0);
        // 10×10 discs; centre pixels are white.
        let px = |x: usize, y: usize| img[(y * 60 + x) * 4];
        assert_eq!(px(3, 3), 255);
        assert_eq!(px(9, 3), 255);
        // Gap between discs stays black.
        assert_eq!(px(6, 3), 0);
    }

    #[test]
    fn noise_is_deterministic_per_seed() {
        assert_eq!(noise_image(16, 16, 42), noise_image(16, 16, 42));
        assert_ne!(noise_image(16, 16, 42), noise_image(16, 16, 43));
    }
}
