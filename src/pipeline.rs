//! Pipeline handle over the exported InvSR ONNX graphs.
//!
//! The sampler itself lives inside two opaque graphs: the noise predictor
//! (image -> sampling start) and the sd-turbo diffusion pipeline
//! (start + image -> 4x image). This module owns argument marshaling only:
//! session construction, input naming, dtype conversion, chopped inference,
//! and the optional color fix.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batching::{sub_batch_ranges, PAD_ALIGN};
use crate::color_fix::ColorFix;
use crate::image_ops::{pad_reflect, resize_bicubic};
use crate::nodes::backend::{build_session, InferenceBackend, SessionConfig};

/// Fixed upscale factor of the InvSR sd-turbo export.
pub const SCALE_FACTOR: usize = 4;

/// Tile overlap in pixels per side for chopped inference.
const TILE_OVERLAP: usize = 16;

/// Tensor precision of the graph I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Fp16,
    Fp32,
    /// bf16-weight exports keep f32 graph I/O; treated as fp32 on the wire.
    Bf16,
}

impl DType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fp16" => Ok(Self::Fp16),
            "fp32" => Ok(Self::Fp32),
            "bf16" => Ok(Self::Bf16),
            other => bail!("unsupported dtype '{other}', expected one of fp16|fp32|bf16"),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp16 => write!(f, "fp16"),
            Self::Fp32 => write!(f, "fp32"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Effective sampler configuration: the base config file merged with per-run
/// socket overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub num_steps: u32,
    /// Explicit sampling timesteps; derived from `num_steps` when absent.
    pub timesteps: Option<Vec<i64>>,
    pub cfg_scale: f64,
    pub batch_size: usize,
    pub chopping_batch_size: usize,
    pub chopping_size: usize,
    pub tiled_vae: bool,
    pub color_fix: ColorFix,
    pub dtype: DType,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_steps: 1,
            timesteps: None,
            cfg_scale: 1.0,
            batch_size: 1,
            chopping_batch_size: 8,
            chopping_size: 128,
            tiled_vae: true,
            color_fix: ColorFix::None,
            dtype: DType::Fp16,
        }
    }
}

pub const CHOPPING_SIZES: [usize; 3] = [128, 256, 512];
pub const MAX_NUM_STEPS: u32 = 5;

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 || self.num_steps > MAX_NUM_STEPS {
            bail!(
                "num_steps must be between 1 and {MAX_NUM_STEPS}, got {}",
                self.num_steps
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.chopping_batch_size == 0 {
            bail!("chopping_batch_size must be positive");
        }
        if !CHOPPING_SIZES.contains(&self.chopping_size) {
            bail!(
                "chopping_size must be one of {CHOPPING_SIZES:?}, got {}",
                self.chopping_size
            );
        }
        if let Some(ts) = &self.timesteps {
            if ts.len() != self.num_steps as usize {
                bail!(
                    "timesteps length {} does not match num_steps {}",
                    ts.len(),
                    self.num_steps
                );
            }
        }
        Ok(())
    }

    /// Timesteps fed to the diffusion graph: the explicit list when the base
    /// config provides one, otherwise evenly spaced descending from 250.
    pub fn effective_timesteps(&self) -> Vec<i64> {
        match &self.timesteps {
            Some(ts) => ts.clone(),
            None => default_timesteps(self.num_steps),
        }
    }
}

pub fn default_timesteps(num_steps: u32) -> Vec<i64> {
    let n = i64::from(num_steps.max(1));
    (1..=n).rev().map(|i| 250 * i / n).collect()
}

/// Load the base sampler config file. A missing file means defaults, the
/// same way the host treats a missing data-dir config.
pub fn load_sampler_config(path: &Path) -> Result<SamplerConfig> {
    if !path.exists() {
        return Ok(SamplerConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sampler config: {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse sampler config TOML: {}", path.display()))
}

/// Merge the base config file with socket overrides. Overrides win for every
/// socket-exposed field; `timesteps` only ever comes from the base file.
pub fn build_sampler_config(
    base_path: &Path,
    overrides: &SamplerConfig,
    log: bool,
) -> Result<SamplerConfig> {
    let mut config = load_sampler_config(base_path)?;

    config.num_steps = overrides.num_steps;
    config.cfg_scale = overrides.cfg_scale;
    config.batch_size = overrides.batch_size;
    config.chopping_batch_size = overrides.chopping_batch_size;
    config.chopping_size = overrides.chopping_size;
    config.tiled_vae = overrides.tiled_vae;
    config.color_fix = overrides.color_fix;
    config.dtype = overrides.dtype;

    config.validate()?;

    if log {
        info!(
            num_steps = config.num_steps,
            cfg_scale = config.cfg_scale,
            batch_size = config.batch_size,
            chopping_batch_size = config.chopping_batch_size,
            chopping_size = config.chopping_size,
            tiled_vae = config.tiled_vae,
            color_fix = %config.color_fix,
            dtype = %config.dtype,
            "Effective sampler configuration"
        );
    }

    Ok(config)
}

/// Resolved on-disk locations of the two graphs.
#[derive(Debug, Clone)]
pub struct PipelineModelPaths {
    pub noise_predictor: PathBuf,
    pub diffusion: PathBuf,
}

/// Optional scalar conditioning inputs a diffusion export may declare
/// beyond the two tensor inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarInput {
    Timesteps,
    CfgScale,
    Seed,
}

fn classify_scalar_input(name: &str) -> Option<ScalarInput> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("timestep") {
        Some(ScalarInput::Timesteps)
    } else if lower.contains("cfg") || lower.contains("guidance") {
        Some(ScalarInput::CfgScale)
    } else if lower.contains("seed") || lower.contains("noise") {
        Some(ScalarInput::Seed)
    } else {
        None
    }
}

/// Map every input after `(start, image)` to a scalar role by name. Binding
/// is name-based, so export input order beyond the first two is free.
fn classify_extra_inputs(names: &[String]) -> Result<Vec<(String, ScalarInput)>> {
    names
        .iter()
        .map(|name| match classify_scalar_input(name) {
            Some(role) => Ok((name.clone(), role)),
            None => bail!(
                "diffusion graph input '{name}' is not a recognized scalar input \
                 (timesteps, cfg_scale, or seed/noise)"
            ),
        })
        .collect()
}

/// Declared I/O of one session, captured once at load.
struct SessionIo {
    input_names: Vec<String>,
    /// Scalar roles of `input_names[2..]`; empty for the noise predictor.
    scalar_inputs: Vec<(String, ScalarInput)>,
    output_name: String,
    fp16_io: bool,
}

fn inspect_io(session: &Session, label: &str) -> Result<SessionIo> {
    let inputs = session.inputs();
    if inputs.is_empty() {
        bail!("{label} graph declares no inputs");
    }
    let input_names: Vec<String> = inputs.iter().map(|i| i.name().to_string()).collect();
    let output_name = session
        .outputs()
        .first()
        .with_context(|| format!("{label} graph declares no outputs"))?
        .name()
        .to_string();

    let fp16_io = match inputs[0].dtype() {
        ort::value::ValueType::Tensor { ty, .. } => *ty == ort::tensor::TensorElementType::Float16,
        _ => false,
    };

    debug!(
        label,
        inputs = ?input_names,
        output = %output_name,
        fp16_io,
        "Detected model IO"
    );

    Ok(SessionIo {
        input_names,
        scalar_inputs: Vec::new(),
        output_name,
        fp16_io,
    })
}

/// Reusable pipeline handle: loaded sessions plus run configuration.
pub struct InvSrPipeline {
    noise_predictor: Session,
    np_io: SessionIo,
    diffusion: Session,
    sd_io: SessionIo,
    config: SamplerConfig,
    seed: u64,
}

impl InvSrPipeline {
    pub fn load(
        paths: &PipelineModelPaths,
        config: SamplerConfig,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        config.validate()?;

        let noise_predictor = build_session(&SessionConfig {
            model_path: &paths.noise_predictor,
            backend,
            trt_cache_dir,
        })?;
        let np_io = inspect_io(&noise_predictor, "noise predictor")?;
        if np_io.input_names.len() != 1 {
            bail!(
                "noise predictor graph declares {} inputs, expected 1 (image)",
                np_io.input_names.len()
            );
        }

        let diffusion = build_session(&SessionConfig {
            model_path: &paths.diffusion,
            backend,
            trt_cache_dir,
        })?;
        let mut sd_io = inspect_io(&diffusion, "diffusion pipeline")?;
        if sd_io.input_names.len() < 2 {
            bail!(
                "diffusion graph declares {} inputs, expected at least 2 (start, image)",
                sd_io.input_names.len()
            );
        }
        sd_io.scalar_inputs = classify_extra_inputs(&sd_io.input_names[2..])?;

        if (config.dtype == DType::Fp16) != np_io.fp16_io {
            warn!(
                requested = %config.dtype,
                graph_fp16 = np_io.fp16_io,
                "Requested dtype does not match graph I/O; graph precision wins"
            );
        }

        info!(
            noise_predictor = %paths.noise_predictor.display(),
            diffusion = %paths.diffusion.display(),
            dtype = %config.dtype,
            tiled_vae = config.tiled_vae,
            "InvSR pipeline loaded"
        );

        Ok(Self {
            noise_predictor,
            np_io,
            diffusion,
            sd_io,
            config,
            seed: 0,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Swap in a freshly merged per-run configuration.
    pub fn replace_config(&mut self, config: SamplerConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        debug!(seed, "Reseeded sampler");
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run the sampler over one NCHW sub-batch, returning the 4x result.
    ///
    /// Inputs of any spatial size are accepted; non-aligned dimensions are
    /// reflection-padded for the graphs and the output cropped back, so the
    /// result is always exactly `(4h, 4w)`.
    pub fn infer(&mut self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        let (_b, c, h, w) = batch.dim();
        if c != 3 {
            bail!("expected 3-channel NCHW input, got {c} channels");
        }

        let chop = self.config.chopping_size;
        let mut output = if self.config.tiled_vae && (h > chop || w > chop) {
            self.infer_chopped(batch)?
        } else {
            self.infer_direct(batch)?
        };

        if self.config.color_fix != ColorFix::None {
            let reference = resize_bicubic(batch, h * SCALE_FACTOR, w * SCALE_FACTOR);
            self.config.color_fix.apply(&mut output, &reference)?;
        }

        Ok(output)
    }

    /// Single-call path: pad, run both graphs, crop.
    fn infer_direct(&mut self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, _c, h, w) = batch.dim();
        let padded = pad_reflect(batch, PAD_ALIGN);
        let (ph, pw) = (padded.dim().2, padded.dim().3);
        let padded = padded.into_dyn();

        let start = run_single_input(&mut self.noise_predictor, &self.np_io, &padded)
            .context("noise predictor inference failed")?;

        let timesteps = self.config.effective_timesteps();
        let out = run_diffusion(
            &mut self.diffusion,
            &self.sd_io,
            &start,
            &padded,
            &timesteps,
            self.config.cfg_scale as f32,
            self.seed,
        )
        .context("diffusion pipeline inference failed")?;

        let expected = [b, 3, ph * SCALE_FACTOR, pw * SCALE_FACTOR];
        if out.shape() != expected {
            bail!(
                "diffusion graph returned shape {:?}, expected {:?}",
                out.shape(),
                expected
            );
        }

        let out_h = h * SCALE_FACTOR;
        let out_w = w * SCALE_FACTOR;
        let cropped = if ph > h || pw > w {
            out.slice(s![.., .., ..out_h, ..out_w]).to_owned().into_dyn()
        } else {
            out
        };

        cropped
            .into_dimensionality::<ndarray::Ix4>()
            .context("diffusion output is not a 4-D tensor")
    }

    /// Chopped path: overlapping spatial tiles of `chopping_size`, each run
    /// through the direct path in groups of `chopping_batch_size` images,
    /// stitched into the 4x output.
    fn infer_chopped(&mut self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, _c, h, w) = batch.dim();
        let out_h = h * SCALE_FACTOR;
        let out_w = w * SCALE_FACTOR;
        let mut output = Array4::<f32>::zeros((b, 3, out_h, out_w));

        let tile_size = self.config.chopping_size;
        let overlap = TILE_OVERLAP;
        let step = tile_size.saturating_sub(overlap * 2);
        if step == 0 {
            bail!("chopping_size ({tile_size}) is too small for overlap ({overlap})");
        }

        debug!(tile_size, overlap, step, h, w, "Starting chopped inference");

        let groups = sub_batch_ranges(b, self.config.chopping_batch_size)?;

        let mut y = 0usize;
        while y < h {
            let mut x = 0usize;
            while x < w {
                let in_y0 = y.saturating_sub(overlap);
                let in_x0 = x.saturating_sub(overlap);
                let in_y1 = (y + tile_size).min(h);
                let in_x1 = (x + tile_size).min(w);

                let tile_h = in_y1 - in_y0;
                let tile_w = in_x1 - in_x0;

                for (g0, g1) in &groups {
                    let tile = batch
                        .slice(s![*g0..*g1, .., in_y0..in_y1, in_x0..in_x1])
                        .to_owned();
                    let tile_out = self.infer_direct(&tile)?;

                    let out_y0 = y * SCALE_FACTOR;
                    let out_x0 = x * SCALE_FACTOR;
                    let crop_y0 = (y - in_y0) * SCALE_FACTOR;
                    let crop_x0 = (x - in_x0) * SCALE_FACTOR;

                    let usable_h = (tile_h - (y - in_y0)).min(h - y);
                    let usable_w = (tile_w - (x - in_x0)).min(w - x);
                    let end_y = (out_y0 + usable_h * SCALE_FACTOR).min(out_h);
                    let end_x = (out_x0 + usable_w * SCALE_FACTOR).min(out_w);
                    let actual_h = end_y - out_y0;
                    let actual_w = end_x - out_x0;

                    output
                        .slice_mut(s![*g0..*g1, .., out_y0..end_y, out_x0..end_x])
                        .assign(&tile_out.slice(s![
                            ..,
                            ..,
                            crop_y0..crop_y0 + actual_h,
                            crop_x0..crop_x0 + actual_w
                        ]));
                }

                x += step;
            }
            y += step;
        }

        Ok(output)
    }
}

fn arrayd_to_f16(arr: &ArrayD<f32>) -> Result<ArrayD<f16>> {
    let owned_contig;
    let slice = if let Some(s) = arr.as_slice() {
        s
    } else {
        owned_contig = arr.as_standard_layout().into_owned();
        owned_contig.as_slice().expect("standard layout is contiguous")
    };

    let mut data = vec![f16::ZERO; slice.len()];
    data.convert_from_f32_slice(slice);
    ArrayD::from_shape_vec(arr.shape().to_vec(), data)
        .context("failed to reshape f16 input tensor")
}

fn f16_to_arrayd(arr: ArrayD<f16>) -> ArrayD<f32> {
    let shape = arr.shape().to_vec();
    let owned_contig;
    let slice = if let Some(s) = arr.as_slice() {
        s
    } else {
        owned_contig = arr.as_standard_layout().into_owned();
        owned_contig.as_slice().expect("standard layout is contiguous")
    };

    let mut data = vec![0.0f32; slice.len()];
    slice.convert_to_f32_slice(&mut data);
    ArrayD::from_shape_vec(shape, data).expect("shape preserved by conversion")
}

/// Run a one-input graph (the noise predictor) with dtype-matched I/O.
fn run_single_input(
    session: &mut Session,
    io: &SessionIo,
    input: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let input_name = io.input_names[0].as_str();
    let output_name = io.output_name.as_str();

    if io.fp16_io {
        let input_tensor = Tensor::from_array(arrayd_to_f16(input)?)?;
        let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
        let view = outputs[output_name].try_extract_array::<f16>()?;
        Ok(f16_to_arrayd(view.to_owned()))
    } else {
        let input_tensor = Tensor::from_array(input.clone())?;
        let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
        let view = outputs[output_name].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }
}

/// Run the diffusion graph. The first two inputs are always the sampling
/// start and the image; scalar conditioning tensors (timesteps, cfg_scale,
/// seed) are bound by name and only for the inputs the graph declares.
#[allow(clippy::too_many_arguments)]
fn run_diffusion(
    session: &mut Session,
    io: &SessionIo,
    start: &ArrayD<f32>,
    image: &ArrayD<f32>,
    timesteps: &[i64],
    cfg_scale: f32,
    seed: u64,
) -> Result<ArrayD<f32>> {
    let output_name = io.output_name.as_str();

    let ts_tensor = Tensor::from_array(ndarray::arr1(timesteps))?;
    let cfg_tensor = Tensor::from_array(ndarray::arr1(&[cfg_scale]))?;
    let seed_tensor = Tensor::from_array(ndarray::arr1(&[seed as i64]))?;

    if io.fp16_io {
        let start_tensor = Tensor::from_array(arrayd_to_f16(start)?)?;
        let image_tensor = Tensor::from_array(arrayd_to_f16(image)?)?;

        let mut binding = session.create_binding()?;
        binding.bind_input(io.input_names[0].as_str(), &start_tensor)?;
        binding.bind_input(io.input_names[1].as_str(), &image_tensor)?;
        for (name, role) in &io.scalar_inputs {
            match role {
                ScalarInput::Timesteps => binding.bind_input(name.as_str(), &ts_tensor)?,
                ScalarInput::CfgScale => binding.bind_input(name.as_str(), &cfg_tensor)?,
                ScalarInput::Seed => binding.bind_input(name.as_str(), &seed_tensor)?,
            };
        }
        binding.bind_output_to_device(output_name, &session.allocator().memory_info())?;

        let outputs = session.run_binding(&binding)?;
        let view = outputs[output_name].try_extract_array::<f16>()?;
        Ok(f16_to_arrayd(view.to_owned()))
    } else {
        let start_tensor = Tensor::from_array(start.clone())?;
        let image_tensor = Tensor::from_array(image.clone())?;

        let mut binding = session.create_binding()?;
        binding.bind_input(io.input_names[0].as_str(), &start_tensor)?;
        binding.bind_input(io.input_names[1].as_str(), &image_tensor)?;
        for (name, role) in &io.scalar_inputs {
            match role {
                ScalarInput::Timesteps => binding.bind_input(name.as_str(), &ts_tensor)?,
                ScalarInput::CfgScale => binding.bind_input(name.as_str(), &cfg_tensor)?,
                ScalarInput::Seed => binding.bind_input(name.as_str(), &seed_tensor)?,
            };
        }
        binding.bind_output_to_device(output_name, &session.allocator().memory_info())?;

        let outputs = session.run_binding(&binding)?;
        let view = outputs[output_name].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }
}
