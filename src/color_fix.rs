//! Post-sampling color correction against the bicubic-upscaled source.
//!
//! Diffusion samplers can drift in global color; both fixes transfer
//! low-frequency color statistics from the reference (the upscaled input)
//! onto the sampled output.

use anyhow::{bail, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFix {
    #[default]
    None,
    Wavelet,
    Ycbcr,
}

impl ColorFix {
    /// Parse the socket string. The host sends `"none"` for disabled;
    /// an empty string means the same thing.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "wavelet" => Ok(Self::Wavelet),
            "ycbcr" => Ok(Self::Ycbcr),
            other => bail!("unsupported color_fix '{other}', expected one of none|wavelet|ycbcr"),
        }
    }

    /// Apply the fix to `output` in place. `reference` must have the same
    /// shape (the bicubic-upscaled input batch).
    pub fn apply(&self, output: &mut Array4<f32>, reference: &Array4<f32>) -> Result<()> {
        if *self == Self::None {
            return Ok(());
        }
        if output.dim() != reference.dim() {
            bail!(
                "color fix shape mismatch: output {:?} vs reference {:?}",
                output.dim(),
                reference.dim()
            );
        }

        match self {
            Self::None => {}
            Self::Wavelet => wavelet_fix(output, reference),
            Self::Ycbcr => ycbcr_fix(output, reference),
        }
        Ok(())
    }
}

impl std::fmt::Display for ColorFix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Wavelet => write!(f, "wavelet"),
            Self::Ycbcr => write!(f, "ycbcr"),
        }
    }
}

/// Low-frequency swap: keep the output's detail, take the reference's base.
fn wavelet_fix(output: &mut Array4<f32>, reference: &Array4<f32>) {
    let low_out = blur(output);
    let low_ref = blur(reference);
    ndarray::Zip::from(&mut *output)
        .and(&low_out)
        .and(&low_ref)
        .for_each(|o, lo, lr| *o = (*o - lo + lr).clamp(0.0, 1.0));
}

const BLUR_RADIUS: usize = 8;
const BLUR_PASSES: usize = 3;

/// Gaussian approximation via repeated separable box blurs.
fn blur(arr: &Array4<f32>) -> Array4<f32> {
    let mut current = arr.clone();
    for _ in 0..BLUR_PASSES {
        current = box_blur(&current, BLUR_RADIUS);
    }
    current
}

fn box_blur(arr: &Array4<f32>, radius: usize) -> Array4<f32> {
    let (b, c, h, w) = arr.dim();
    let mut horiz = Array4::<f32>::zeros((b, c, h, w));
    let r = radius as i64;

    for n in 0..b {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    let mut acc = 0.0f32;
                    let mut count = 0.0f32;
                    for dx in -r..=r {
                        let sx = x as i64 + dx;
                        if sx >= 0 && sx < w as i64 {
                            acc += arr[[n, ch, y, sx as usize]];
                            count += 1.0;
                        }
                    }
                    horiz[[n, ch, y, x]] = acc / count;
                }
            }
        }
    }

    let mut out = Array4::<f32>::zeros((b, c, h, w));
    for n in 0..b {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    let mut acc = 0.0f32;
                    let mut count = 0.0f32;
                    for dy in -r..=r {
                        let sy = y as i64 + dy;
                        if sy >= 0 && sy < h as i64 {
                            acc += horiz[[n, ch, sy as usize, x]];
                            count += 1.0;
                        }
                    }
                    out[[n, ch, y, x]] = acc / count;
                }
            }
        }
    }

    out
}

/// Per-image mean/std matching in YCbCr space.
fn ycbcr_fix(output: &mut Array4<f32>, reference: &Array4<f32>) {
    let (b, _c, h, w) = output.dim();
    let hw = h * w;

    for n in 0..b {
        let mut out_ycc = vec![0.0f32; 3 * hw];
        let mut ref_ycc = vec![0.0f32; 3 * hw];

        for i in 0..hw {
            let (y, x) = (i / w, i % w);
            let o = rgb_to_ycbcr(
                output[[n, 0, y, x]],
                output[[n, 1, y, x]],
                output[[n, 2, y, x]],
            );
            let rf = rgb_to_ycbcr(
                reference[[n, 0, y, x]],
                reference[[n, 1, y, x]],
                reference[[n, 2, y, x]],
            );
            for ch in 0..3 {
                out_ycc[ch * hw + i] = o[ch];
                ref_ycc[ch * hw + i] = rf[ch];
            }
        }

        for ch in 0..3 {
            let out_chan = &mut out_ycc[ch * hw..(ch + 1) * hw];
            let ref_chan = &ref_ycc[ch * hw..(ch + 1) * hw];
            let (om, os) = mean_std(out_chan);
            let (rm, rs) = mean_std(ref_chan);
            let scale = if os > 1e-6 { rs / os } else { 1.0 };
            for v in out_chan.iter_mut() {
                *v = (*v - om) * scale + rm;
            }
        }

        for i in 0..hw {
            let (y, x) = (i / w, i % w);
            let rgb = ycbcr_to_rgb(out_ycc[i], out_ycc[hw + i], out_ycc[2 * hw + i]);
            output[[n, 0, y, x]] = rgb[0].clamp(0.0, 1.0);
            output[[n, 1, y, x]] = rgb[1].clamp(0.0, 1.0);
            output[[n, 2, y, x]] = rgb[2].clamp(0.0, 1.0);
        }
    }
}

fn mean_std(data: &[f32]) -> (f32, f32) {
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let var = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.sqrt())
}

fn rgb_to_ycbcr(r: f32, g: f32, b: f32) -> [f32; 3] {
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = (b - y) / 1.772 + 0.5;
    let cr = (r - y) / 1.402 + 0.5;
    [y, cb, cr]
}

fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> [f32; 3] {
    let r = y + 1.402 * (cr - 0.5);
    let b = y + 1.772 * (cb - 0.5);
    let g = (y - 0.299 * r - 0.114 * b) / 0.587;
    [r, g, b]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_known_values() {
        assert_eq!(ColorFix::parse("none").unwrap(), ColorFix::None);
        assert_eq!(ColorFix::parse("").unwrap(), ColorFix::None);
        assert_eq!(ColorFix::parse("Wavelet").unwrap(), ColorFix::Wavelet);
        assert_eq!(ColorFix::parse("ycbcr").unwrap(), ColorFix::Ycbcr);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = ColorFix::parse("adain").unwrap_err();
        assert!(err.to_string().contains("unsupported color_fix"));
    }

    #[test]
    fn test_display_roundtrip() {
        for fix in [ColorFix::None, ColorFix::Wavelet, ColorFix::Ycbcr] {
            assert_eq!(ColorFix::parse(&fix.to_string()).unwrap(), fix);
        }
    }

    #[test]
    fn test_none_is_identity() {
        let reference = Array4::<f32>::from_elem((1, 3, 8, 8), 0.4);
        let mut output = Array4::<f32>::from_elem((1, 3, 8, 8), 0.9);
        ColorFix::None.apply(&mut output, &reference).unwrap();
        assert_eq!(output, Array4::from_elem((1, 3, 8, 8), 0.9));
    }

    #[test]
    fn test_shape_mismatch_errors() {
        let reference = Array4::<f32>::zeros((1, 3, 8, 8));
        let mut output = Array4::<f32>::zeros((1, 3, 16, 16));
        let err = ColorFix::Wavelet.apply(&mut output, &reference).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_wavelet_self_reference_is_identity() {
        let mut data = Array4::<f32>::zeros((1, 3, 12, 12));
        for (i, v) in data.iter_mut().enumerate() {
            *v = (i % 97) as f32 / 96.0;
        }
        let reference = data.clone();
        ColorFix::Wavelet.apply(&mut data, &reference).unwrap();
        for (a, b) in data.iter().zip(reference.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ycbcr_matches_reference_mean() {
        let reference = Array4::<f32>::from_elem((1, 3, 8, 8), 0.2);
        let mut output = Array4::<f32>::from_elem((1, 3, 8, 8), 0.8);
        ColorFix::Ycbcr.apply(&mut output, &reference).unwrap();
        // Constant channels have zero std; means must be pulled to the reference.
        for v in output.iter() {
            assert!((v - 0.2).abs() < 1e-4, "expected 0.2, got {v}");
        }
    }
}
