//! Synthetic diffraction frames for running without recorded data.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Generates one photon-counting frame.
///
/// The frame is mostly empty background with sparse single-photon noise,
/// two powder rings around the beam center and a handful of Bragg spots whose
/// positions rotate with `frame_num`, so consecutive frames differ the way a
/// rotation series does.
///
/// Values stay well below `max_count`, which callers set to the saturation
/// value of the simulated detector.
pub fn generate_diffraction_pattern(width: usize, height: usize, frame_num: u64, max_count: u32) -> Vec<u32> {
    let mut buffer = vec![0u32; width * height];
    if width == 0 || height == 0 {
        return buffer;
    }

    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let r_max = cx.min(cy);
    let rings = [0.35 * r_max, 0.7 * r_max];
    let ring_width = (r_max / 40.0).max(1.0);
    let peak = (max_count / 4).max(1) as f64;

    // Spot positions rotate by ~0.1 rad per frame
    let angle0 = frame_num as f64 * 0.1;
    let spots: Vec<(f64, f64)> = (0..8)
        .map(|k| {
            let a = angle0 + k as f64 * std::f64::consts::FRAC_PI_4;
            let r = rings[k % 2];
            (cx + r * a.cos(), cy + r * a.sin())
        })
        .collect();
    let spot_sigma = (r_max / 30.0).max(0.75);

    let frame_seed = frame_num.wrapping_mul(2654435761);

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let noise = prng(frame_seed ^ idx as u64);

            // Sparse background: roughly one pixel in sixteen sees a photon
            let mut value = if noise & 0xF == 0 { 1.0 } else { 0.0 };

            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let r = (dx * dx + dy * dy).sqrt();
            for ring in rings {
                let d = (r - ring) / ring_width;
                value += 0.05 * peak * (-0.5 * d * d).exp();
            }

            for (sx, sy) in &spots {
                let ddx = (x as f64 - sx) / spot_sigma;
                let ddy = (y as f64 - sy) / spot_sigma;
                value += peak * (-0.5 * (ddx * ddx + ddy * ddy)).exp();
            }

            buffer[idx] = (value.round() as u32).min(max_count);
        }
    }

    buffer
}
