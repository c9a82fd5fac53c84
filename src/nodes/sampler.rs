//! InvSRSampler node: runs the diffusion sampler over an image batch.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use ndarray::s;
use tracing::{debug, info};

use crate::batching::{padded_dims, sub_batch_ranges};
use crate::color_fix::ColorFix;
use crate::config::{self, AppConfig};
use crate::image_ops::{concat_batches, nchw_to_nhwc, nhwc_to_nchw, resize_bicubic};
use crate::memory;
use crate::node::{ExecutionContext, Node, PortDefinition};
use crate::pipeline::{build_sampler_config, SamplerConfig, SCALE_FACTOR};
use crate::types::{PortData, PortType};

pub const MAX_SEED: i64 = u32::MAX as i64;

pub struct InvSRSamplerNode {
    base_config_path: PathBuf,
}

impl InvSRSamplerNode {
    pub fn new() -> Self {
        let data_dir = config::data_dir(None);
        let app_config =
            AppConfig::load_from_path(&config::config_path(&data_dir)).unwrap_or_default();
        let base_config_path =
            config::resolve_relative_to(&data_dir, &app_config.paths.sampler_config);
        Self::with_base_config(base_config_path)
    }

    pub fn with_base_config(base_config_path: PathBuf) -> Self {
        Self { base_config_path }
    }

    fn run(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        memory::log_memory_stats("sampler start");

        let images = match inputs.get("images") {
            Some(PortData::Image(batch)) => batch,
            Some(_) => bail!("images must be an Image batch"),
            None => bail!("images input is required"),
        };

        let num_steps = match inputs.get("num_steps") {
            Some(PortData::Int(v)) => u32::try_from(*v)
                .map_err(|_| anyhow!("num_steps must be a positive integer, got {v}"))?,
            Some(_) => bail!("num_steps must be an Int"),
            None => 1,
        };

        let cfg_scale = match inputs.get("cfg") {
            Some(PortData::Float(v)) => *v,
            Some(_) => bail!("cfg must be a Float"),
            None => 1.0,
        };

        let batch_size = match inputs.get("batch_size") {
            Some(PortData::Int(v)) if *v > 0 => *v as usize,
            Some(PortData::Int(v)) => bail!("batch_size must be positive, got {v}"),
            Some(_) => bail!("batch_size must be an Int"),
            None => 1,
        };

        let chopping_batch_size = match inputs.get("chopping_batch_size") {
            Some(PortData::Int(v)) if *v > 0 => *v as usize,
            Some(PortData::Int(v)) => bail!("chopping_batch_size must be positive, got {v}"),
            Some(_) => bail!("chopping_batch_size must be an Int"),
            None => 8,
        };

        let chopping_size = match inputs.get("chopping_size") {
            Some(PortData::Int(v)) if *v > 0 => *v as usize,
            Some(PortData::Int(v)) => bail!("chopping_size must be positive, got {v}"),
            Some(_) => bail!("chopping_size must be an Int"),
            None => 128,
        };

        let color_fix = match inputs.get("color_fix") {
            Some(PortData::Str(s)) => ColorFix::parse(s)?,
            Some(_) => bail!("color_fix must be a Str"),
            None => ColorFix::None,
        };

        let seed = match inputs.get("seed") {
            Some(PortData::Int(v)) if (0..=MAX_SEED).contains(v) => *v as u64,
            Some(PortData::Int(v)) => bail!("seed must be between 0 and {MAX_SEED}, got {v}"),
            Some(_) => bail!("seed must be an Int"),
            None => 123,
        };

        let mut overrides = SamplerConfig {
            num_steps,
            cfg_scale,
            batch_size,
            chopping_batch_size,
            chopping_size,
            color_fix,
            timesteps: None,
            ..SamplerConfig::default()
        };
        // Socket ranges are checked before the pipeline is touched so a bad
        // value never leaves it with a half-applied configuration.
        overrides.validate()?;

        let pipeline = match inputs.get("invsr_pipe") {
            Some(PortData::Pipeline(p)) => p.clone(),
            Some(_) => bail!("invsr_pipe must be a Pipeline"),
            None => bail!("invsr_pipe input is required"),
        };
        let mut pipe = pipeline
            .lock()
            .map_err(|_| anyhow!("pipeline mutex poisoned"))?;

        // tiled_vae and dtype are load-time choices; carry them over from the
        // loaded pipeline rather than re-exposing them here.
        overrides.tiled_vae = pipe.config().tiled_vae;
        overrides.dtype = pipe.config().dtype;

        let merged = build_sampler_config(&self.base_config_path, &overrides, true)?;
        pipe.replace_config(merged)?;
        pipe.set_seed(seed);

        let mut nchw = nhwc_to_nchw(images)?;
        let (total, _c, og_h, og_w) = nchw.dim();

        let (pad_h, pad_w) = padded_dims(og_h, og_w);
        let resized = (pad_h, pad_w) != (og_h, og_w);
        if resized {
            info!(
                from = format!("{og_h}x{og_w}"),
                to = format!("{pad_h}x{pad_w}"),
                "Image dimensions not divisible by 16; resizing before sampling"
            );
            nchw = resize_bicubic(&nchw, pad_h, pad_w);
        }

        let ranges = sub_batch_ranges(total, batch_size)?;
        let mut results = Vec::with_capacity(ranges.len());
        for (i, (start, end)) in ranges.iter().enumerate() {
            debug!(
                sub_batch = i + 1,
                total_sub_batches = ranges.len(),
                images = end - start,
                "Running sampler sub-batch"
            );
            let sub = nchw.slice(s![*start..*end, .., .., ..]).to_owned();
            let out = pipe.infer(&sub)?;
            results.push(out);

            memory::release_memory();
            memory::log_memory_stats("sub-batch done");
            info!(
                sub_batch = i + 1,
                total_sub_batches = ranges.len(),
                progress = format!("{:.0}%", run_progress(ctx, i + 1, ranges.len()) * 100.0),
                "Sub-batch complete"
            );
        }
        drop(pipe);

        let mut output = concat_batches(results)?;
        if resized {
            output = resize_bicubic(&output, SCALE_FACTOR * og_h, SCALE_FACTOR * og_w);
        }

        let out_batch = nchw_to_nhwc(&output)?;
        memory::release_memory();
        memory::log_memory_stats("sampler done");

        let mut outputs = HashMap::new();
        outputs.insert("image".to_string(), PortData::Image(out_batch));
        Ok(outputs)
    }
}

impl Default for InvSRSamplerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for InvSRSamplerNode {
    fn node_type(&self) -> &str {
        "InvSRSampler"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition {
                name: "invsr_pipe".to_string(),
                port_type: PortType::Pipeline,
                required: true,
                default_value: None,
            },
            PortDefinition {
                name: "images".to_string(),
                port_type: PortType::Image,
                required: true,
                default_value: None,
            },
            PortDefinition {
                name: "num_steps".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(1)),
            },
            PortDefinition {
                name: "cfg".to_string(),
                port_type: PortType::Float,
                required: false,
                default_value: Some(serde_json::json!(1.0)),
            },
            PortDefinition {
                name: "batch_size".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(1)),
            },
            PortDefinition {
                name: "chopping_batch_size".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(8)),
            },
            PortDefinition {
                name: "chopping_size".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(128)),
            },
            PortDefinition {
                name: "color_fix".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!("none")),
            },
            PortDefinition {
                name: "seed".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(123)),
            },
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition {
            name: "image".to_string(),
            port_type: PortType::Image,
            required: true,
            default_value: None,
        }]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        memory::with_cleanup(|| self.run(inputs, ctx))
    }
}

/// Overall progress for the host log: its coarse per-item position refined by
/// the sub-batch fraction within the current item, or just the local fraction
/// when the host reports nothing.
fn run_progress(ctx: &ExecutionContext, completed: usize, total: usize) -> f32 {
    let local = if total == 0 {
        1.0
    } else {
        completed as f32 / total as f32
    };

    match (ctx.progress(), ctx.total_items) {
        (Some(base), Some(items)) if items > 0 => (base + local / items as f32).clamp(0.0, 1.0),
        _ => local,
    }
}
