//! LoadInvSRModels node: resolves checkpoints and builds the pipeline handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::config::{self, AppConfig};
use crate::memory;
use crate::model_registry::{ModelRegistry, ModelType, DIFFUSION_CATEGORY, INVSR_CATEGORY};
use crate::node::{ExecutionContext, Node, PortDefinition};
use crate::nodes::backend::InferenceBackend;
use crate::pipeline::{build_sampler_config, DType, InvSrPipeline, PipelineModelPaths, SamplerConfig};
use crate::types::{PortData, PortType};

pub const DEFAULT_SD_MODEL: &str = "stabilityai/sd-turbo";
pub const DEFAULT_INVSR_MODEL: &str = "noise_predictor_sd_turbo_v5.onnx";

pub struct LoadInvSRModelsNode {
    config: AppConfig,
    data_dir: PathBuf,
    trt_cache_dir: Option<PathBuf>,
}

impl LoadInvSRModelsNode {
    pub fn new() -> Self {
        let data_dir = config::data_dir(None);
        let app_config =
            AppConfig::load_from_path(&config::config_path(&data_dir)).unwrap_or_default();
        Self::with_config(app_config, data_dir)
    }

    pub fn with_config(config: AppConfig, data_dir: PathBuf) -> Self {
        Self {
            config,
            data_dir,
            trt_cache_dir: None,
        }
    }

    pub fn set_trt_cache_dir(&mut self, dir: PathBuf) {
        self.trt_cache_dir = Some(dir);
    }

    fn build_registry(&self) -> Result<ModelRegistry> {
        let base = &self.data_dir;
        let mut registry = ModelRegistry::with_builtin_models(config::resolve_relative_to(
            base,
            &self.config.paths.models_dir,
        ));
        registry.register_folder(
            DIFFUSION_CATEGORY,
            config::resolve_relative_to(base, &self.config.paths.diffusion_dir),
        );
        registry.register_folder(
            INVSR_CATEGORY,
            config::resolve_relative_to(base, &self.config.paths.invsr_dir),
        );

        // Pick up exports dropped into the folders without catalog entries.
        registry.discover(DIFFUSION_CATEGORY, ModelType::Diffusion)?;
        registry.discover(INVSR_CATEGORY, ModelType::NoisePredictor)?;

        Ok(registry)
    }

    fn load(&mut self, inputs: &HashMap<String, PortData>) -> Result<HashMap<String, PortData>> {
        let sd_model = match inputs.get("sd_model") {
            Some(PortData::Str(s)) => s.as_str(),
            Some(_) => bail!("sd_model must be a Str"),
            None => DEFAULT_SD_MODEL,
        };

        let invsr_model = match inputs.get("invsr_model") {
            Some(PortData::Str(s)) => s.as_str(),
            Some(_) => bail!("invsr_model must be a Str"),
            None => DEFAULT_INVSR_MODEL,
        };

        let dtype = match inputs.get("dtype") {
            Some(PortData::Str(s)) => DType::parse(s)?,
            Some(_) => bail!("dtype must be a Str"),
            None => DType::Fp16,
        };

        let tiled_vae = match inputs.get("tiled_vae") {
            Some(PortData::Bool(b)) => *b,
            Some(_) => bail!("tiled_vae must be a Bool"),
            None => true,
        };

        let backend = match inputs.get("backend") {
            Some(PortData::Str(s)) => InferenceBackend::from_str_lossy(s),
            Some(_) => bail!("backend must be a Str"),
            None => InferenceBackend::default(),
        };

        let registry = self.build_registry()?;

        let Some(sd_entry) = registry.get(sd_model) else {
            bail!("unknown sd_model '{sd_model}'");
        };
        let diffusion = registry.resolve_file(DIFFUSION_CATEGORY, &sd_entry.filename)?;

        let noise_predictor = match registry.resolve_file(INVSR_CATEGORY, invsr_model) {
            Ok(path) => path,
            Err(resolve_err) => {
                // The started checkpoint is fetchable when it's a catalog
                // entry with a configured URL.
                let fetchable = registry
                    .list_by_type(ModelType::NoisePredictor)
                    .into_iter()
                    .find(|e| e.filename == invsr_model && e.url.is_some())
                    .map(|e| e.name.clone());
                match fetchable {
                    Some(name) => {
                        warn!(model = %name, "Checkpoint not found locally; downloading");
                        registry.download(&name)?
                    }
                    None => return Err(resolve_err),
                }
            }
        };

        let overrides = SamplerConfig {
            tiled_vae,
            dtype,
            ..SamplerConfig::default()
        };
        let base_config =
            config::resolve_relative_to(&self.data_dir, &self.config.paths.sampler_config);
        let sampler_config = build_sampler_config(&base_config, &overrides, false)?;

        let trt_cache_dir = self.trt_cache_dir.clone().unwrap_or_else(|| {
            config::resolve_relative_to(&self.data_dir, &self.config.paths.trt_cache_dir)
        });

        info!(
            sd_model,
            invsr_model,
            dtype = %dtype,
            tiled_vae,
            backend = %backend,
            "Loading InvSR pipeline"
        );

        let paths = PipelineModelPaths {
            noise_predictor,
            diffusion,
        };
        let pipeline =
            InvSrPipeline::load(&paths, sampler_config, &backend, Some(trt_cache_dir.as_path()))?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "invsr_pipe".to_string(),
            PortData::Pipeline(Arc::new(Mutex::new(pipeline))),
        );
        Ok(outputs)
    }
}

impl Default for LoadInvSRModelsNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for LoadInvSRModelsNode {
    fn node_type(&self) -> &str {
        "LoadInvSRModels"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition {
                name: "sd_model".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!(DEFAULT_SD_MODEL)),
            },
            PortDefinition {
                name: "invsr_model".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!(DEFAULT_INVSR_MODEL)),
            },
            PortDefinition {
                name: "dtype".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!("fp16")),
            },
            PortDefinition {
                name: "tiled_vae".to_string(),
                port_type: PortType::Bool,
                required: false,
                default_value: Some(serde_json::json!(true)),
            },
            PortDefinition {
                name: "backend".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!("cuda")),
            },
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition {
            name: "invsr_pipe".to_string(),
            port_type: PortType::Pipeline,
            required: true,
            default_value: None,
        }]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        _ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        memory::with_cleanup(|| self.load(inputs))
    }
}
