//! Figures of merit for reconstructed images.

use ndarray::ArrayView2;

use crate::Intensityf32;

const MSE_FLOOR: f32 = 1e-12;

/// Peak signal-to-noise ratio in dB, with the peak taken from the dynamic
/// range of the ground truth.
pub fn psnr(image: ArrayView2<Intensityf32>, ground_truth: ArrayView2<Intensityf32>) -> f32 {
    let mse = image.iter().zip(ground_truth.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>() / image.len() as f32;
    let lo = ground_truth.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = ground_truth.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let data_range = (hi - lo).max(MSE_FLOOR);
    10.0 * (data_range * data_range / mse.max(MSE_FLOOR)).log10()
}

/// Structural similarity index, mean over 7x7 uniform windows. Images
/// smaller than the window fall back to a single global-statistics window.
pub fn ssim(image: ArrayView2<Intensityf32>, ground_truth: ArrayView2<Intensityf32>) -> f32 {
    let lo = ground_truth.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = ground_truth.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let data_range = (hi - lo).max(MSE_FLOOR);
    let c1 = (0.01 * data_range).powi(2);
    let c2 = (0.03 * data_range).powi(2);

    const WIN: usize = 7;
    let (h, w) = image.dim();
    if h < WIN || w < WIN {
        return ssim_window(image, ground_truth, c1, c2);
    }

    let windows_a = image.windows((WIN, WIN));
    let windows_b = ground_truth.windows((WIN, WIN));
    let mut total = 0.0;
    let mut count = 0usize;
    for (wa, wb) in windows_a.into_iter().zip(windows_b) {
        total += ssim_window(wa, wb, c1, c2);
        count += 1;
    }
    total / count as f32
}

fn ssim_window(a: ArrayView2<Intensityf32>, b: ArrayView2<Intensityf32>, c1: f32, c2: f32) -> f32 {
    let n = a.len() as f32;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;
    let var_a = a.iter().map(|v| (v - mean_a) * (v - mean_a)).sum::<f32>() / n;
    let var_b = b.iter().map(|v| (v - mean_b) * (v - mean_b)).sum::<f32>() / n;
    let cov = a.iter().zip(b.iter())
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f32>() / n;
    ((2.0 * mean_a * mean_b + c1) * (2.0 * cov + c2))
        / ((mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2))
}
