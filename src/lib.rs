//! InvSR super-resolution nodes for a node-graph image runtime.
//!
//! Two nodes are exported to the host: `LoadInvSRModels` builds a reusable
//! pipeline handle around the exported InvSR ONNX graphs, and `InvSRSampler`
//! runs batched inference with padding, chopping, and memory bookkeeping
//! around every call into `ort`.

pub mod batching;
pub mod color_fix;
pub mod config;
pub mod descriptor;
pub mod image_ops;
pub mod logging;
pub mod memory;
pub mod model_registry;
pub mod node;
pub mod nodes;
pub mod pipeline;
pub mod registry;
pub mod types;
