//! Checkpoint catalog and category-based path resolution.
//!
//! The host exposes named model folders ("diffusion", "invsr"); when a
//! category was never registered we fall back to `<models_dir>/<category>`.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const DIFFUSION_CATEGORY: &str = "diffusion";
pub const INVSR_CATEGORY: &str = "invsr";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// Exported sd-turbo diffusion pipeline graph.
    Diffusion,
    /// InvSR noise-predictor graph that produces the sampling start.
    NoisePredictor,
}

impl ModelType {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Diffusion => DIFFUSION_CATEGORY,
            Self::NoisePredictor => INVSR_CATEGORY,
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diffusion => write!(f, "Diffusion"),
            Self::NoisePredictor => write!(f, "NoisePredictor"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub model_type: ModelType,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "stabilityai/sd-turbo".into(),
            model_type: ModelType::Diffusion,
            filename: "sd_turbo_pipeline.onnx".into(),
            url: None,
            sha256: None,
            description: "sd-turbo single-step diffusion pipeline export".into(),
        },
        ModelEntry {
            name: "noise_predictor_sd_turbo_v5".into(),
            model_type: ModelType::NoisePredictor,
            filename: "noise_predictor_sd_turbo_v5.onnx".into(),
            url: Some(
                "https://huggingface.co/OAOA/InvSR/resolve/main/noise_predictor_sd_turbo_v5.onnx"
                    .into(),
            ),
            sha256: None,
            description: "InvSR noise predictor for sd-turbo (v5)".into(),
        },
    ]
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    folders: HashMap<String, Vec<PathBuf>>,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            folders: HashMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            folders: HashMap::new(),
            entries: builtin_catalog(),
        }
    }

    /// Register a host-provided folder for a category. Lookup order follows
    /// registration order.
    pub fn register_folder(&mut self, category: &str, dir: PathBuf) {
        self.folders.entry(category.to_string()).or_default().push(dir);
    }

    /// First registered folder for the category, or the hardcoded fallback
    /// `<models_dir>/<category>`.
    pub fn folder_or_fallback(&self, category: &str) -> PathBuf {
        self.folders
            .get(category)
            .and_then(|dirs| dirs.first().cloned())
            .unwrap_or_else(|| self.models_dir.join(category))
    }

    /// Resolve a file within a category, searching registered folders first
    /// and the fallback directory last.
    pub fn resolve_file(&self, category: &str, filename: &str) -> Result<PathBuf> {
        let mut searched = Vec::new();

        if let Some(dirs) = self.folders.get(category) {
            for dir in dirs {
                let candidate = dir.join(filename);
                if candidate.is_file() {
                    return Ok(candidate);
                }
                searched.push(dir.clone());
            }
        }

        let fallback = self.models_dir.join(category);
        let candidate = fallback.join(filename);
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(fallback);

        bail!(
            "model file '{filename}' not found in {category} folders: {}",
            searched
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    /// Scan a category folder for ONNX files the catalog doesn't know about.
    pub fn discover(&mut self, category: &str, model_type: ModelType) -> Result<()> {
        let dir = self.folder_or_fallback(category);
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, category, "Discovered unknown ONNX model");

            self.entries.push(ModelEntry {
                name,
                model_type: model_type.clone(),
                filename,
                url: None,
                sha256: None,
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn list_by_type(&self, model_type: ModelType) -> Vec<&ModelEntry> {
        self.entries
            .iter()
            .filter(|e| e.model_type == model_type)
            .collect()
    }

    /// Fetch a catalog entry's file into its category folder, verifying the
    /// SHA-256 hash when one is configured.
    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;

        let dest_dir = self.folder_or_fallback(entry.model_type.category());
        fs::create_dir_all(&dest_dir).with_context(|| {
            format!("Failed to create models directory: {}", dest_dir.display())
        })?;

        let final_path = dest_dir.join(&entry.filename);
        let tmp_path = dest_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading model");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {name}"))?;

        if !response.status().is_success() {
            let _ = fs::remove_file(&tmp_path);
            bail!(
                "Download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        if let Err(err) = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("Failed while downloading model {name} from {url}"))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = tmp_file
            .sync_all()
            .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = &entry.sha256 {
            info!(model = %name, "Verifying SHA256 hash");
            let actual_hash = sha256_file(&tmp_path)?;
            if actual_hash != *expected_hash {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
            }
            info!(model = %name, "Hash verified OK");
        } else {
            warn!(model = %name, "No SHA256 hash configured — skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
