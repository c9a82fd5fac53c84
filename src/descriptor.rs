//! Node descriptors: static metadata for the InvSR node types.
//!
//! Descriptors feed the host's graph editor with display names, categories,
//! and full port definitions. They are a separate data path from the runtime
//! `Node::input_ports()`/`output_ports()` and are hardcoded to match them.

use serde::Serialize;

use crate::pipeline::{CHOPPING_SIZES, MAX_NUM_STEPS};

#[derive(Debug, Clone, Serialize)]
pub struct NodeDescriptor {
    pub node_type: String,
    pub display_name: String,
    pub category: String,
    /// Hex color, e.g. "#F97316"
    pub accent_color: String,
    /// Icon name, e.g. "microscope", "sparkles"
    pub icon: String,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDescriptor {
    pub name: String,
    /// "Image", "Pipeline", "Int", "Str", etc.
    pub port_type: String,
    /// "stream" or "param"
    pub direction: String,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
    /// "model_selector", "enum", etc.
    pub ui_hint: Option<String>,
    pub enum_options: Option<Vec<String>>,
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
}

/// Helper to build a stream port descriptor.
fn stream(name: &str, port_type: &str) -> PortDescriptor {
    PortDescriptor {
        name: name.to_string(),
        port_type: port_type.to_string(),
        direction: "stream".to_string(),
        required: true,
        default_value: None,
        ui_hint: None,
        enum_options: None,
        min: None,
        max: None,
    }
}

/// Helper to build an optional param port descriptor with a default value.
fn param_opt(name: &str, port_type: &str, default: serde_json::Value) -> PortDescriptor {
    PortDescriptor {
        name: name.to_string(),
        port_type: port_type.to_string(),
        direction: "param".to_string(),
        required: false,
        default_value: Some(default),
        ui_hint: None,
        enum_options: None,
        min: None,
        max: None,
    }
}

/// Returns descriptors for both InvSR node types.
pub fn invsr_node_descriptors() -> Vec<NodeDescriptor> {
    vec![
        NodeDescriptor {
            node_type: "LoadInvSRModels".to_string(),
            display_name: "Load InvSR Models".to_string(),
            category: "INVSR".to_string(),
            accent_color: "#A855F7".to_string(),
            icon: "download".to_string(),
            inputs: vec![
                PortDescriptor {
                    ui_hint: Some("model_selector".to_string()),
                    enum_options: Some(vec!["stabilityai/sd-turbo".to_string()]),
                    ..param_opt("sd_model", "Str", serde_json::json!("stabilityai/sd-turbo"))
                },
                PortDescriptor {
                    ui_hint: Some("model_selector".to_string()),
                    ..param_opt(
                        "invsr_model",
                        "Str",
                        serde_json::json!("noise_predictor_sd_turbo_v5.onnx"),
                    )
                },
                PortDescriptor {
                    enum_options: Some(vec![
                        "fp16".to_string(),
                        "fp32".to_string(),
                        "bf16".to_string(),
                    ]),
                    ..param_opt("dtype", "Str", serde_json::json!("fp16"))
                },
                param_opt("tiled_vae", "Bool", serde_json::json!(true)),
                PortDescriptor {
                    enum_options: Some(vec!["cuda".to_string(), "tensorrt".to_string()]),
                    ..param_opt("backend", "Str", serde_json::json!("cuda"))
                },
            ],
            outputs: vec![stream("invsr_pipe", "Pipeline")],
        },
        NodeDescriptor {
            node_type: "InvSRSampler".to_string(),
            display_name: "InvSR Sampler".to_string(),
            category: "INVSR".to_string(),
            accent_color: "#F97316".to_string(),
            icon: "sparkles".to_string(),
            inputs: vec![
                stream("invsr_pipe", "Pipeline"),
                stream("images", "Image"),
                PortDescriptor {
                    min: Some(serde_json::json!(1)),
                    max: Some(serde_json::json!(MAX_NUM_STEPS)),
                    ..param_opt("num_steps", "Int", serde_json::json!(1))
                },
                PortDescriptor {
                    min: Some(serde_json::json!(1.0)),
                    ..param_opt("cfg", "Float", serde_json::json!(1.0))
                },
                PortDescriptor {
                    min: Some(serde_json::json!(1)),
                    ..param_opt("batch_size", "Int", serde_json::json!(1))
                },
                PortDescriptor {
                    min: Some(serde_json::json!(1)),
                    ..param_opt("chopping_batch_size", "Int", serde_json::json!(8))
                },
                PortDescriptor {
                    enum_options: Some(CHOPPING_SIZES.iter().map(|s| s.to_string()).collect()),
                    ..param_opt("chopping_size", "Int", serde_json::json!(128))
                },
                PortDescriptor {
                    enum_options: Some(vec![
                        "none".to_string(),
                        "wavelet".to_string(),
                        "ycbcr".to_string(),
                    ]),
                    ..param_opt("color_fix", "Str", serde_json::json!("none"))
                },
                PortDescriptor {
                    min: Some(serde_json::json!(0)),
                    max: Some(serde_json::json!(u32::MAX)),
                    ..param_opt("seed", "Int", serde_json::json!(123))
                },
            ],
            outputs: vec![stream("image", "Image")],
        },
    ]
}
