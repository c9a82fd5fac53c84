use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::config::{self, AppConfig};
use crate::node::Node;
use crate::nodes::load_model::LoadInvSRModelsNode;
use crate::nodes::sampler::InvSRSamplerNode;

type NodeFactory =
    dyn Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync;

pub struct NodeRegistry {
    factories: HashMap<String, Box<NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.factories
            .insert(node_type.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        node_type: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<Box<dyn Node>> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?;

        factory(params)
    }

    pub fn list_node_types(&self) -> Vec<&str> {
        let mut node_types: Vec<&str> = self.factories.keys().map(|v| v.as_str()).collect();
        node_types.sort_unstable();
        node_types
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register both InvSR node types.
///
/// The keys match the node type names the host shows in its graph editor.
/// A `data_dir` param redirects model and config resolution, which is how
/// hosts with their own storage layout mount us.
pub fn register_invsr_nodes(registry: &mut NodeRegistry) {
    registry.register("LoadInvSRModels", |params| {
        let node = match params.get("data_dir").and_then(|v| v.as_str()) {
            Some(dir) => {
                let data_dir = PathBuf::from(dir);
                let app_config = AppConfig::load_from_path(&config::config_path(&data_dir))?;
                LoadInvSRModelsNode::with_config(app_config, data_dir)
            }
            None => LoadInvSRModelsNode::new(),
        };
        Ok(Box::new(node))
    });
    registry.register("InvSRSampler", |params| {
        let node = match params.get("data_dir").and_then(|v| v.as_str()) {
            Some(dir) => {
                let data_dir = PathBuf::from(dir);
                let app_config = AppConfig::load_from_path(&config::config_path(&data_dir))?;
                InvSRSamplerNode::with_base_config(config::resolve_relative_to(
                    &data_dir,
                    &app_config.paths.sampler_config,
                ))
            }
            None => InvSRSamplerNode::new(),
        };
        Ok(Box::new(node))
    });
}

pub fn build_default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_invsr_nodes(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ExecutionContext, PortDefinition};
    use crate::types::{PortData, PortType};

    struct DummyNode;

    impl Node for DummyNode {
        fn node_type(&self) -> &str {
            "dummy"
        }

        fn input_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition {
                name: "in".to_string(),
                port_type: PortType::Str,
                required: true,
                default_value: None,
            }]
        }

        fn output_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition {
                name: "out".to_string(),
                port_type: PortType::Str,
                required: true,
                default_value: None,
            }]
        }

        fn execute(
            &mut self,
            _inputs: &HashMap<String, PortData>,
            _ctx: &ExecutionContext,
        ) -> Result<HashMap<String, PortData>> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn test_node_registry_register_and_create() {
        let mut registry = NodeRegistry::new();
        registry.register("dummy", |_| Ok(Box::new(DummyNode)));

        let node = registry
            .create("dummy", HashMap::new())
            .expect("dummy node should be created");

        assert_eq!(node.node_type(), "dummy");
        assert_eq!(node.input_ports().len(), 1);
        assert_eq!(node.output_ports().len(), 1);
        assert_eq!(registry.list_node_types(), vec!["dummy"]);
    }

    #[test]
    fn test_node_registry_unknown_type_errors() {
        let registry = build_default_registry();

        for node_type in ["unknown", "InvSRLoader", "invsrsampler"] {
            let err = match registry.create(node_type, HashMap::new()) {
                Ok(_) => panic!("unknown node type should error"),
                Err(err) => err,
            };

            assert_eq!(err.to_string(), format!("unknown node type: {node_type}"));
        }
    }

    #[test]
    fn test_register_invsr_nodes_expected_set() {
        let registry = build_default_registry();
        assert_eq!(
            registry.list_node_types(),
            vec!["InvSRSampler", "LoadInvSRModels"]
        );
    }

    #[test]
    fn test_create_load_node() {
        let registry = build_default_registry();
        let node = registry
            .create("LoadInvSRModels", HashMap::new())
            .expect("load node should be created");
        assert_eq!(node.node_type(), "LoadInvSRModels");
    }

    #[test]
    fn test_create_sampler_node_with_data_dir_param() {
        let registry = build_default_registry();
        let params = HashMap::from([("data_dir".to_string(), serde_json::json!("/tmp/invsr"))]);
        let node = registry
            .create("InvSRSampler", params)
            .expect("sampler node should be created");
        assert_eq!(node.node_type(), "InvSRSampler");
    }
}
