use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::InvSrPipeline;

/// Image batch in NHWC layout, values normalized to [0, 1].
///
/// This is the shape the host hands to image sockets; inference code
/// converts to NCHW internally.
#[derive(Debug)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageBatch {
    pub fn new(
        data: Vec<f32>,
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
    ) -> Result<Self> {
        if batch == 0 {
            bail!("image batch must contain at least one image");
        }
        let expected = batch * height * width * channels;
        if data.len() != expected {
            bail!(
                "image data length mismatch: expected {expected} ({batch}x{height}x{width}x{channels}), got {}",
                data.len()
            );
        }
        Ok(Self {
            data,
            batch,
            height,
            width,
            channels,
        })
    }
}

/// Port type identifier for connection validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Image,
    Pipeline,
    Int,
    Float,
    Str,
    Bool,
    Path,
}

impl PortType {
    pub fn is_compatible(&self, other: &PortType) -> bool {
        self == other
    }
}

/// Data types that can flow between node ports.
pub enum PortData {
    Image(ImageBatch),
    /// Opaque pipeline handle produced by `LoadInvSRModels`.
    Pipeline(Arc<Mutex<InvSrPipeline>>),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Path(PathBuf),
}

impl std::fmt::Debug for PortData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortData::Image(batch) => f.debug_tuple("Image").field(batch).finish(),
            PortData::Pipeline(_) => f.debug_tuple("Pipeline").field(&"<pipeline>").finish(),
            PortData::Int(v) => f.debug_tuple("Int").field(v).finish(),
            PortData::Float(v) => f.debug_tuple("Float").field(v).finish(),
            PortData::Str(v) => f.debug_tuple("Str").field(v).finish(),
            PortData::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            PortData::Path(v) => f.debug_tuple("Path").field(v).finish(),
        }
    }
}
