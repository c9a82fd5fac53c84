use std::collections::HashMap;

use anyhow::Result;

use crate::types::{PortData, PortType};

#[derive(Debug, Clone, PartialEq)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
}

/// Per-run context handed down by the host executor.
#[derive(Default)]
pub struct ExecutionContext {
    pub total_items: Option<u64>,
    pub current_item: u64,
}

impl ExecutionContext {
    pub fn progress(&self) -> Option<f32> {
        let total = self.total_items?;
        if total == 0 {
            return Some(0.0);
        }

        Some((self.current_item as f32 / total as f32).clamp(0.0, 1.0))
    }
}

/// Core node trait that all nodes implement.
pub trait Node: Send + Sync {
    fn node_type(&self) -> &str;
    fn input_ports(&self) -> Vec<PortDefinition>;
    fn output_ports(&self) -> Vec<PortDefinition>;
    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_definition_creation() {
        let input = PortDefinition {
            name: "images".to_string(),
            port_type: PortType::Image,
            required: true,
            default_value: None,
        };

        let param = PortDefinition {
            name: "cfg".to_string(),
            port_type: PortType::Float,
            required: false,
            default_value: Some(serde_json::json!(1.0)),
        };

        assert_eq!(input.name, "images");
        assert_eq!(input.port_type, PortType::Image);
        assert!(input.required);
        assert!(input.default_value.is_none());

        assert_eq!(param.name, "cfg");
        assert_eq!(param.port_type, PortType::Float);
        assert!(!param.required);
        assert_eq!(param.default_value, Some(serde_json::json!(1.0)));
    }

    #[test]
    fn test_progress_clamped() {
        let ctx = ExecutionContext {
            total_items: Some(4),
            current_item: 2,
        };
        assert_eq!(ctx.progress(), Some(0.5));

        let over = ExecutionContext {
            total_items: Some(4),
            current_item: 9,
        };
        assert_eq!(over.progress(), Some(1.0));

        let unknown = ExecutionContext::default();
        assert_eq!(unknown.progress(), None);

        let zero = ExecutionContext {
            total_items: Some(0),
            current_item: 0,
        };
        assert_eq!(zero.progress(), Some(0.0));
    }
}
