//! Layout conversion, bicubic resampling, and batch reassembly.

use anyhow::{bail, Result};
use ndarray::{concatenate, s, Array4, Axis};

use crate::types::ImageBatch;

/// Convert an NHWC host batch into the NCHW layout inference expects.
pub fn nhwc_to_nchw(batch: &ImageBatch) -> Result<Array4<f32>> {
    let (b, h, w, c) = (batch.batch, batch.height, batch.width, batch.channels);
    if c != 3 {
        bail!("expected 3-channel images, got {c} channels");
    }

    let mut nchw = Array4::<f32>::zeros((b, c, h, w));
    {
        let slice = nchw.as_slice_mut().expect("freshly allocated array is contiguous");
        let hw = h * w;
        for n in 0..b {
            let src_img = &batch.data[n * hw * c..(n + 1) * hw * c];
            let dst_img = &mut slice[n * c * hw..(n + 1) * c * hw];
            for i in 0..hw {
                let src = i * c;
                dst_img[i] = src_img[src];
                dst_img[hw + i] = src_img[src + 1];
                dst_img[2 * hw + i] = src_img[src + 2];
            }
        }
    }
    Ok(nchw)
}

/// Convert an NCHW result back to the NHWC layout of the host image socket.
pub fn nchw_to_nhwc(arr: &Array4<f32>) -> Result<ImageBatch> {
    let (b, c, h, w) = arr.dim();
    let owned_contig;
    let slice = if let Some(s) = arr.as_slice() {
        s
    } else {
        owned_contig = arr.as_standard_layout().into_owned();
        owned_contig.as_slice().expect("standard layout is contiguous")
    };

    let hw = h * w;
    let mut data = vec![0.0f32; b * hw * c];
    for n in 0..b {
        let src_img = &slice[n * c * hw..(n + 1) * c * hw];
        let dst_img = &mut data[n * hw * c..(n + 1) * hw * c];
        for i in 0..hw {
            let dst = i * c;
            dst_img[dst] = src_img[i];
            dst_img[dst + 1] = src_img[hw + i];
            dst_img[dst + 2] = src_img[2 * hw + i];
        }
    }

    ImageBatch::new(data, b, h, w, c)
}

/// Catmull-Rom cubic kernel (a = -0.5), the kernel bicubic resamplers use.
fn cubic_weight(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        (A + 2.0) * x * x * x - (A + 3.0) * x * x + 1.0
    } else if x < 2.0 {
        A * x * x * x - 5.0 * A * x * x + 8.0 * A * x - 4.0 * A
    } else {
        0.0
    }
}

/// Bicubic resize of an NCHW batch with half-pixel center mapping.
pub fn resize_bicubic(arr: &Array4<f32>, out_h: usize, out_w: usize) -> Array4<f32> {
    let (b, c, in_h, in_w) = arr.dim();
    if in_h == out_h && in_w == out_w {
        return arr.clone();
    }

    let mut out = Array4::<f32>::zeros((b, c, out_h, out_w));
    let scale_y = in_h as f64 / out_h as f64;
    let scale_x = in_w as f64 / out_w as f64;

    // Precompute per-row and per-column taps; the kernel is separable.
    let taps_y = resample_taps(out_h, in_h, scale_y);
    let taps_x = resample_taps(out_w, in_w, scale_x);

    for n in 0..b {
        for ch in 0..c {
            for (dy, (ys, wys)) in taps_y.iter().enumerate() {
                for (dx, (xs, wxs)) in taps_x.iter().enumerate() {
                    let mut acc = 0.0f64;
                    for (yi, wy) in ys.iter().zip(wys) {
                        for (xi, wx) in xs.iter().zip(wxs) {
                            acc += arr[[n, ch, *yi, *xi]] as f64 * wy * wx;
                        }
                    }
                    out[[n, ch, dy, dx]] = acc as f32;
                }
            }
        }
    }

    out
}

type Taps = Vec<([usize; 4], [f64; 4])>;

/// Source indices (edge-clamped) and kernel weights for each output position.
fn resample_taps(out_dim: usize, in_dim: usize, scale: f64) -> Taps {
    (0..out_dim)
        .map(|d| {
            // Map destination pixel center to source coordinates.
            let src = (d as f64 + 0.5) * scale - 0.5;
            let base = src.floor() as i64;
            let frac = src - base as f64;

            let mut idx = [0usize; 4];
            let mut weights = [0.0f64; 4];
            for t in 0..4 {
                let raw = base - 1 + t as i64;
                idx[t] = raw.clamp(0, in_dim as i64 - 1) as usize;
                weights[t] = cubic_weight(t as f64 - 1.0 - frac);
            }
            (idx, weights)
        })
        .collect()
}

/// Reflection-pad an NCHW batch so H and W are multiples of `align`.
///
/// Used for edge tiles in chopped inference; whole-batch padding goes
/// through [`resize_bicubic`] instead so the output can be resized back.
pub fn pad_reflect(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (b, c, h, w) = arr.dim();
    let pad_h = (align - (h % align)) % align;
    let pad_w = (align - (w % align)) % align;

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((b, c, new_h, new_w));

    padded
        .slice_mut(s![.., .., ..h, ..w])
        .assign(&arr.slice(s![.., .., ..h, ..w]));

    // Reflection excludes the edge row itself, clamped so pads larger than
    // the source degrade to edge repeat instead of indexing out of range.
    for y in 0..pad_h {
        let src_y = h - 1 - (y + 1).min(h - 1);
        for n in 0..b {
            for ch in 0..c {
                for x in 0..w {
                    padded[[n, ch, h + y, x]] = arr[[n, ch, src_y, x]];
                }
            }
        }
    }

    for x in 0..pad_w {
        let src_x = w - 1 - (x + 1).min(w - 1);
        for n in 0..b {
            for ch in 0..c {
                for y in 0..new_h {
                    let src_y = if y < h {
                        y
                    } else {
                        h - 1 - (y - h + 1).min(h - 1)
                    };
                    padded[[n, ch, y, w + x]] = arr[[n, ch, src_y, src_x]];
                }
            }
        }
    }

    padded
}

/// Concatenate per-sub-batch outputs back into one batch, in order.
pub fn concat_batches(parts: Vec<Array4<f32>>) -> Result<Array4<f32>> {
    if parts.is_empty() {
        bail!("no sub-batch results to concatenate");
    }

    let (_, c0, h0, w0) = parts[0].dim();
    for (i, part) in parts.iter().enumerate().skip(1) {
        let (_, c, h, w) = part.dim();
        if (c, h, w) != (c0, h0, w0) {
            bail!(
                "sub-batch {i} shape mismatch: expected [_, {c0}, {h0}, {w0}], got [_, {c}, {h}, {w}]"
            );
        }
    }

    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| anyhow::anyhow!("failed to concatenate sub-batches: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_batch(b: usize, h: usize, w: usize, value: f32) -> ImageBatch {
        ImageBatch::new(vec![value; b * h * w * 3], b, h, w, 3).unwrap()
    }

    #[test]
    fn test_nhwc_nchw_roundtrip() {
        let mut data = Vec::new();
        for i in 0..(2 * 3 * 4 * 3) {
            data.push(i as f32 / 100.0);
        }
        let batch = ImageBatch::new(data.clone(), 2, 3, 4, 3).unwrap();
        let nchw = nhwc_to_nchw(&batch).unwrap();
        assert_eq!(nchw.dim(), (2, 3, 3, 4));

        let back = nchw_to_nhwc(&nchw).unwrap();
        assert_eq!(back.data, data);
        assert_eq!(back.height, 3);
        assert_eq!(back.width, 4);
    }

    #[test]
    fn test_nhwc_to_nchw_channel_order() {
        // One pixel: R=0.1, G=0.2, B=0.3.
        let batch = ImageBatch::new(vec![0.1, 0.2, 0.3], 1, 1, 1, 3).unwrap();
        let nchw = nhwc_to_nchw(&batch).unwrap();
        assert_eq!(nchw[[0, 0, 0, 0]], 0.1);
        assert_eq!(nchw[[0, 1, 0, 0]], 0.2);
        assert_eq!(nchw[[0, 2, 0, 0]], 0.3);
    }

    #[test]
    fn test_nhwc_to_nchw_rejects_non_rgb() {
        let batch = ImageBatch::new(vec![0.0; 4], 1, 2, 2, 1).unwrap();
        assert!(nhwc_to_nchw(&batch).is_err());
    }

    #[test]
    fn test_resize_identity() {
        let batch = solid_batch(1, 8, 8, 0.25);
        let nchw = nhwc_to_nchw(&batch).unwrap();
        let resized = resize_bicubic(&nchw, 8, 8);
        assert_eq!(resized, nchw);
    }

    #[test]
    fn test_resize_preserves_constant_images() {
        let batch = solid_batch(2, 7, 9, 0.5);
        let nchw = nhwc_to_nchw(&batch).unwrap();
        let resized = resize_bicubic(&nchw, 16, 16);
        assert_eq!(resized.dim(), (2, 3, 16, 16));
        for v in resized.iter() {
            assert!((v - 0.5).abs() < 1e-5, "constant image should stay constant, got {v}");
        }
    }

    #[test]
    fn test_resize_downscale_dims() {
        let batch = solid_batch(1, 64, 48, 1.0);
        let nchw = nhwc_to_nchw(&batch).unwrap();
        let resized = resize_bicubic(&nchw, 16, 12);
        assert_eq!(resized.dim(), (1, 3, 16, 12));
    }

    #[test]
    fn test_pad_reflect_dims_and_interior() {
        let mut arr = Array4::<f32>::zeros((1, 3, 5, 7));
        arr[[0, 1, 4, 6]] = 2.0;
        let padded = pad_reflect(&arr, 16);
        assert_eq!(padded.dim(), (1, 3, 16, 16));
        assert_eq!(padded[[0, 1, 4, 6]], 2.0);
        // First reflected row mirrors the last real row.
        assert_eq!(padded[[0, 1, 5, 6]], arr[[0, 1, 3, 6]]);
    }

    #[test]
    fn test_pad_reflect_noop_when_aligned() {
        let arr = Array4::<f32>::zeros((1, 3, 16, 32));
        let padded = pad_reflect(&arr, 16);
        assert_eq!(padded.dim(), (1, 3, 16, 32));
    }

    #[test]
    fn test_concat_batches_preserves_order() {
        let a = Array4::<f32>::from_elem((2, 3, 4, 4), 1.0);
        let b = Array4::<f32>::from_elem((1, 3, 4, 4), 2.0);
        let merged = concat_batches(vec![a, b]).unwrap();
        assert_eq!(merged.dim(), (3, 3, 4, 4));
        assert_eq!(merged[[0, 0, 0, 0]], 1.0);
        assert_eq!(merged[[2, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_concat_batches_shape_mismatch_errors() {
        let a = Array4::<f32>::zeros((1, 3, 4, 4));
        let b = Array4::<f32>::zeros((1, 3, 8, 8));
        let err = concat_batches(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_concat_batches_empty_errors() {
        assert!(concat_batches(vec![]).is_err());
    }
}
