//! CPU reference smoothing for per-pixel buffers.
//!
//! Buffers are `(n_pix, channels)` with pixels in row-major image order. Each
//! channel is reshaped to an image plane and blurred with a separable Gaussian
//! (truncated at 4 sigma, reflect boundary).
//!
//! ## Performance Notes
//!
//! - Lines are pre-padded so the convolution loop has no boundary branches
//! - Lines along either axis are processed in parallel with Rayon

use ndarray::{Array2, ArrayView1, ArrayViewMut2, Axis, Zip};

use crate::accumulators::ImageDims;

/// Gaussian support in units of sigma.
const GAUSSIAN_TRUNCATE: f32 = 4.0;

/// Smallest sigma used for hole filling.
const MIN_FILL_SIGMA: f32 = 0.5;

/// Normalized 1D Gaussian kernel of length `2 * ceil(4 * sigma) + 1`.
fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }

    let radius = (GAUSSIAN_TRUNCATE * sigma).ceil() as usize;
    let mut kernel: Vec<f32> = (0..2 * radius + 1)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    let inv_sum = 1.0 / kernel.iter().sum::<f32>();
    for k in kernel.iter_mut() {
        *k *= inv_sum;
    }
    kernel
}

/// Reflect an out-of-range index back into `[0, len)`.
/// reflect(-1) = 0, reflect(-2) = 1, reflect(len) = len - 1
#[inline(always)]
fn reflect_index(idx: isize, len: usize) -> usize {
    let n = len as isize;
    if idx < 0 {
        (-idx - 1).min(n - 1) as usize
    } else if idx >= n {
        let excess = idx - n;
        (n - 1 - excess).max(0) as usize
    } else {
        idx as usize
    }
}

/// Fill `padded` with `input` plus `radius` reflected samples on each side.
fn fill_padded_line(input: ArrayView1<f32>, radius: usize, padded: &mut Vec<f32>) {
    let n = input.len();
    padded.clear();
    padded.extend((0..radius).rev().map(|i| input[reflect_index(-(i as isize) - 1, n)]));
    padded.extend(input.iter().copied());
    padded.extend((0..radius).map(|i| input[reflect_index((n + i) as isize, n)]));
}

/// Convolve every lane of `plane` along `axis`.
fn blur_axis(plane: &Array2<f32>, axis: Axis, kernel: &[f32]) -> Array2<f32> {
    let radius = kernel.len() / 2;
    let mut output = Array2::zeros(plane.raw_dim());

    Zip::from(output.lanes_mut(axis))
        .and(plane.lanes(axis))
        .par_for_each(|mut dst, src| {
            let mut padded = Vec::with_capacity(src.len() + 2 * radius);
            fill_padded_line(src, radius, &mut padded);
            for (i, out) in dst.iter_mut().enumerate() {
                let mut sum = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    sum += padded[i + k] * w;
                }
                *out = sum;
            }
        });

    output
}

/// Separable 2D Gaussian blur of one image plane.
pub fn gaussian_blur_plane(plane: &Array2<f32>, sigma: f32) -> Array2<f32> {
    let kernel = gaussian_kernel_1d(sigma);
    if kernel.len() == 1 || plane.is_empty() {
        return plane.clone();
    }
    let blurred_x = blur_axis(plane, Axis(1), &kernel);
    blur_axis(&blurred_x, Axis(0), &kernel)
}

/// Blur every channel of `buffer` in place. `sigma <= 0` leaves it unchanged.
pub fn gaussian_smooth(mut buffer: ArrayViewMut2<f32>, dims: ImageDims, sigma: f32) {
    if sigma <= 0.0 {
        return;
    }
    let width = dims.width;
    for mut channel in buffer.axis_iter_mut(Axis(1)) {
        let plane = Array2::from_shape_fn(dims.shape(), |(y, x)| channel[y * width + x]);
        let blurred = gaussian_blur_plane(&plane, sigma);
        for (dst, &src) in channel.iter_mut().zip(blurred.iter()) {
            *dst = src;
        }
    }
}

/// Replace pixels without still samples by a Gaussian-weighted average of
/// sampled neighbours inside the half window.
///
/// Pixels with `still_counts > 0` are never modified; a hole with no sampled
/// neighbour keeps its value.
pub fn fill_holes(
    mut buffer: ArrayViewMut2<f32>,
    still_counts: ArrayView1<u32>,
    dims: ImageDims,
    half_window: usize,
) {
    let source = buffer.to_owned();
    let sigma = (half_window as f32 * 0.5).max(MIN_FILL_SIGMA);
    let inv_two_sigma2 = 1.0 / (2.0 * sigma * sigma);
    let (width, height) = (dims.width, dims.height);
    let r = half_window as isize;

    Zip::indexed(buffer.rows_mut()).par_for_each(|i, mut row| {
        if still_counts[i] > 0 {
            return;
        }
        let (x, y) = ((i % width) as isize, (i / width) as isize);
        let mut weight_sum = 0.0f32;
        let mut acc = vec![0.0f32; row.len()];

        for dy in -r..=r {
            let ny = y + dy;
            if ny < 0 || ny >= height as isize {
                continue;
            }
            for dx in -r..=r {
                let nx = x + dx;
                if nx < 0 || nx >= width as isize {
                    continue;
                }
                let j = ny as usize * width + nx as usize;
                if still_counts[j] == 0 {
                    continue;
                }
                let w = (-((dx * dx + dy * dy) as f32) * inv_two_sigma2).exp();
                weight_sum += w;
                for (a, &v) in acc.iter_mut().zip(source.row(j).iter()) {
                    *a += w * v;
                }
            }
        }

        if weight_sum > 0.0 {
            for (dst, a) in row.iter_mut().zip(acc) {
                *dst = a / weight_sum;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(2, 5), 2);
        assert_eq!(reflect_index(-1, 5), 0);
        assert_eq!(reflect_index(-2, 5), 1);
        assert_eq!(reflect_index(5, 5), 4);
        assert_eq!(reflect_index(6, 5), 3);
        // Tiny lines clamp instead of reflecting past the far edge.
        assert_eq!(reflect_index(-4, 2), 1);
        assert_eq!(reflect_index(7, 1), 0);
    }

    #[test]
    fn test_gaussian_kernel_sums_to_one() {
        for sigma in [0.5f32, 1.0, 2.5] {
            let kernel = gaussian_kernel_1d(sigma);
            let sum: f32 = kernel.iter().sum();
            assert!(approx_eq(sum, 1.0, 1e-5), "sigma {sigma}: sum {sum}");
            assert_eq!(kernel.len() % 2, 1);
        }
        assert_eq!(gaussian_kernel_1d(0.0), vec![1.0]);
    }

    #[test]
    fn test_smooth_zero_sigma_is_identity() {
        let dims = ImageDims::new(4, 3).unwrap();
        let original = Array2::from_shape_fn((12, 3), |(i, c)| (i * 3 + c) as f32);
        let mut buffer = original.clone();
        gaussian_smooth(buffer.view_mut(), dims, 0.0);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_smooth_preserves_constant() {
        let dims = ImageDims::new(9, 7).unwrap();
        let mut buffer = Array2::from_elem((63, 3), 0.75f32);
        gaussian_smooth(buffer.view_mut(), dims, 1.0);
        assert!(buffer.iter().all(|&v| approx_eq(v, 0.75, 1e-5)));
    }

    #[test]
    fn test_smooth_spreads_impulse() {
        let dims = ImageDims::new(11, 11).unwrap();
        let mut buffer = Array2::zeros((121, 1));
        buffer[[60, 0]] = 1.0;
        gaussian_smooth(buffer.view_mut(), dims, 1.0);

        let total: f32 = buffer.iter().sum();
        assert!(approx_eq(total, 1.0, 1e-4));
        assert!(buffer[[60, 0]] < 1.0);
        // Symmetric neighbours receive equal weight.
        assert!(approx_eq(buffer[[59, 0]], buffer[[61, 0]], 1e-6));
        assert!(approx_eq(buffer[[49, 0]], buffer[[71, 0]], 1e-6));
    }

    #[test]
    fn test_smooth_channels_independent() {
        let dims = ImageDims::new(6, 6).unwrap();
        let mut buffer = Array2::zeros((36, 3));
        buffer.column_mut(1).fill(2.0);
        gaussian_smooth(buffer.view_mut(), dims, 1.5);
        assert!(buffer.column(0).iter().all(|&v| v == 0.0));
        assert!(buffer.column(1).iter().all(|&v| approx_eq(v, 2.0, 1e-5)));
    }

    #[test]
    fn test_fill_holes_leaves_sampled_pixels() {
        let dims = ImageDims::new(5, 5).unwrap();
        let original = Array2::from_shape_fn((25, 1), |(i, _)| i as f32);
        let mut counts = Array1::from_elem(25, 3u32);
        counts[12] = 0;
        let mut buffer = original.clone();

        fill_holes(buffer.view_mut(), counts.view(), dims, 1);

        for i in 0..25 {
            if i != 12 {
                assert_eq!(buffer[[i, 0]], original[[i, 0]]);
            }
        }
        // Symmetric 3x3 neighbourhood of a linear ramp averages to the centre.
        assert!(approx_eq(buffer[[12, 0]], 12.0, 1e-4));
    }

    #[test]
    fn test_fill_holes_uses_only_sampled_neighbours() {
        let dims = ImageDims::new(3, 1).unwrap();
        let mut buffer = Array2::from_shape_vec((3, 3), vec![
            1.0, 1.0, 1.0, //
            9.0, 9.0, 9.0, //
            9.0, 9.0, 9.0,
        ])
        .unwrap();
        let counts = Array1::from_vec(vec![4u32, 0, 0]);

        fill_holes(buffer.view_mut(), counts.view(), dims, 2);

        assert!(buffer.iter().all(|&v| approx_eq(v, 1.0, 1e-6)));
    }

    #[test]
    fn test_fill_holes_isolated_hole_keeps_value() {
        let dims = ImageDims::new(2, 1).unwrap();
        let mut buffer = Array2::from_elem((2, 1), 5.0f32);
        let counts = Array1::from_vec(vec![0u32, 0]);
        fill_holes(buffer.view_mut(), counts.view(), dims, 3);
        assert!(buffer.iter().all(|&v| v == 5.0));
    }
}
