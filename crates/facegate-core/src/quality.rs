//! Face quality gate: rejects regions too small or too flat to encode
//! reliably (motion blur, low light, partial occlusion).

use crate::types::{FaceRegion, FrameView};

/// Thresholds for the quality gate.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Minimum face width and height in pixels.
    pub min_face_size: u32,
    /// Minimum grayscale standard deviation inside the region.
    pub min_contrast: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_face_size: 50,
            min_contrast: 30.0,
        }
    }
}

/// Pure predicate: does this region hold a usable face crop?
///
/// Any internal failure (empty region, region fully outside the frame)
/// counts as rejection; nothing panics and no error escapes.
pub fn check(frame: FrameView<'_>, region: &FaceRegion, cfg: &QualityConfig) -> bool {
    if region.is_empty() {
        return false;
    }
    if region.width() < cfg.min_face_size as i32 || region.height() < cfg.min_face_size as i32 {
        return false;
    }

    let Some(std_dev) = region_std_dev(frame, region) else {
        return false;
    };
    std_dev >= cfg.min_contrast
}

/// Grayscale standard deviation of the region clamped to frame bounds.
/// Returns `None` when the clamped region contains no readable pixels.
fn region_std_dev(frame: FrameView<'_>, region: &FaceRegion) -> Option<f32> {
    let x0 = region.left.max(0) as u32;
    let y0 = region.top.max(0) as u32;
    let x1 = (region.right.max(0) as u32).min(frame.width);
    let y1 = (region.bottom.max(0) as u32).min(frame.height);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let mut n = 0.0f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in y0..y1 {
        let row = (y * frame.width) as usize;
        for x in x0..x1 {
            // A short buffer truncates the region instead of panicking.
            let Some(&px) = frame.data.get(row + x as usize) else {
                continue;
            };
            let p = px as f64;
            n += 1.0;
            sum += p;
            sum_sq += p * p;
        }
    }
    if n == 0.0 {
        return None;
    }

    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    Some(variance.sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 200;
    const H: u32 = 200;

    /// Frame whose left half is dark and right half bright, so high contrast
    /// for any region straddling the boundary.
    fn split_frame() -> Vec<u8> {
        let mut data = vec![20u8; (W * H) as usize];
        for y in 0..H {
            for x in W / 2..W {
                data[(y * W + x) as usize] = 220;
            }
        }
        data
    }

    fn flat_frame(value: u8) -> Vec<u8> {
        vec![value; (W * H) as usize]
    }

    #[test]
    fn test_small_region_rejected_regardless_of_contrast() {
        let data = split_frame();
        let frame = FrameView::new(&data, W, H);
        // 30x30 region over the contrast boundary, still too small
        let region = FaceRegion::new(50, 115, 80, 85);
        assert!(!check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_low_contrast_rejected() {
        let data = flat_frame(128);
        let frame = FrameView::new(&data, W, H);
        let region = FaceRegion::new(20, 120, 120, 20);
        assert!(!check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_good_region_passes() {
        let data = split_frame();
        let frame = FrameView::new(&data, W, H);
        // 100x100 region centered on the boundary: stddev = 100
        let region = FaceRegion::new(50, 150, 150, 50);
        assert!(check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_empty_region_rejected() {
        let data = split_frame();
        let frame = FrameView::new(&data, W, H);
        assert!(!check(
            frame,
            &FaceRegion::new(50, 50, 50, 50),
            &QualityConfig::default()
        ));
        // Inverted region
        assert!(!check(
            frame,
            &FaceRegion::new(100, 20, 20, 100),
            &QualityConfig::default()
        ));
    }

    #[test]
    fn test_region_outside_frame_rejected() {
        let data = split_frame();
        let frame = FrameView::new(&data, W, H);
        let region = FaceRegion::new(300, 400, 380, 320);
        assert!(!check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_region_partially_outside_is_clamped() {
        let data = split_frame();
        let frame = FrameView::new(&data, W, H);
        // Extends 40 px past the right edge, but the in-frame part is large
        // and high-contrast.
        let region = FaceRegion::new(40, W as i32 + 40, 160, 60);
        assert!(check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_undersized_buffer_rejected_without_panic() {
        // Frame claims 200x200 but the buffer holds only one row.
        let data = vec![128u8; W as usize];
        let frame = FrameView::new(&data, W, H);
        let region = FaceRegion::new(20, 120, 120, 20);
        assert!(!check(frame, &region, &QualityConfig::default()));
    }

    #[test]
    fn test_std_dev_known_value() {
        // Half 0s, half 200s → mean 100, stddev 100
        let mut data = vec![0u8; (W * H) as usize];
        for v in data.iter_mut().skip((W * H / 2) as usize) {
            *v = 200;
        }
        let frame = FrameView::new(&data, W, H);
        let sd = region_std_dev(frame, &FaceRegion::new(0, W as i32, H as i32, 0)).unwrap();
        assert!((sd - 100.0).abs() < 0.01, "stddev = {sd}");
    }
}
