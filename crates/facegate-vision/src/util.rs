//! Shared raster helpers for model preprocessing.

use ndarray::Array4;

/// Bilinear resize of a grayscale image.
pub fn bilinear_resize(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return out;
    }

    let sx = src_w as f32 / dst_w as f32;
    let sy = src_h as f32 / dst_h as f32;

    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * sy - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * sx - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Extract a square grayscale crop centered at (`cx`, `cy`) with side `size`,
/// filling out-of-bounds pixels with 0.
pub fn square_crop(src: &[u8], src_w: usize, src_h: usize, cx: f32, cy: f32, size: f32) -> Vec<u8> {
    let side = size.round().max(1.0) as usize;
    let x0 = (cx - size / 2.0).round() as i64;
    let y0 = (cy - size / 2.0).round() as i64;

    let mut out = vec![0u8; side * side];
    for dy in 0..side {
        let sy = y0 + dy as i64;
        if sy < 0 || sy >= src_h as i64 {
            continue;
        }
        for dx in 0..side {
            let sx = x0 + dx as i64;
            if sx < 0 || sx >= src_w as i64 {
                continue;
            }
            out[dy * side + dx] = src[sy as usize * src_w + sx as usize];
        }
    }
    out
}

/// Build a NCHW float tensor from a square grayscale image, replicating the
/// single channel three times and normalizing with `(pixel - mean) / std`.
pub fn nchw_from_gray(gray: &[u8], size: usize, mean: f32, std: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = gray.get(y * size + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - mean) / std;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }
    tensor
}
