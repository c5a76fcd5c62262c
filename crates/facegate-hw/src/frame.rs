//! Frame type and kiosk image preprocessing: YUYV conversion, mirroring,
//! dark detection, CLAHE contrast enhancement and sharpening.

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Flip the frame left-to-right in place.
///
/// Kiosk cameras face the subject; mirroring the selfie view makes
/// "turn your head to the left" mean the subject's left on screen.
pub fn mirror_horizontal(gray: &mut [u8], width: u32, height: u32) {
    let w = width as usize;
    for y in 0..height as usize {
        gray[y * w..(y + 1) * w].reverse();
    }
}

/// Check if a frame is dark: true when more than `threshold_pct` of the
/// pixels fall in the darkest histogram bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in place.
///
/// Divides the image into a square grid of tiles, computes a clipped
/// histogram per tile, builds CDFs, and bilinearly interpolates between
/// tile CDFs for smooth output.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles_x: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || gray.len() < w * h {
        return;
    }

    let tx = tiles_x as usize;
    let ty = tx; // square grid
    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;

    // Per-tile clipped CDFs
    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let clip = (clip_limit * tile_pixels as f32) as u32;
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            cdf[0] = hist[0] as f32;
            for i in 1..256 {
                cdf[i] = cdf[i - 1] + hist[i] as f32;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = (tile_pixels as f32) - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    // Map every pixel through bilinear interpolation between tile CDFs
    for y in 0..h {
        for x in 0..w {
            let pixel = gray[y * w + x] as usize;

            let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (ty - 1) as f32);
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = cdfs[r0 * tx + c0][pixel];
            let tr = cdfs[r0 * tx + c1][pixel];
            let bl = cdfs[r1 * tx + c0][pixel];
            let br = cdfs[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Sharpen with the 3×3 kernel [[0,-1,0],[-1,5,-1],[0,-1,0]].
///
/// Edge pixels are left untouched. Applied after CLAHE to recover edge
/// definition the equalization softens.
pub fn sharpen(gray: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut out = gray.to_vec();
    if w < 3 || h < 3 || gray.len() < w * h {
        return out;
    }

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray[y * w + x] as i32;
            let sum = 5 * center
                - gray[(y - 1) * w + x] as i32
                - gray[(y + 1) * w + x] as i32
                - gray[y * w + x - 1] as i32
                - gray[y * w + x + 1] as i32;
            out[y * w + x] = sum.clamp(0, 255) as u8;
        }
    }
    out
}
