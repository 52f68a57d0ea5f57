//! Device capability limits

use serde::{Deserialize, Serialize};

/// Limits that size the binding-slot groups of every queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    /// Simultaneous render targets
    pub max_render_targets: u32,
    /// Vertex-buffer slots
    pub max_vertex_buffer_slots: u32,
    /// Constant-buffer slots per stage
    pub max_constant_buffer_slots: u32,
    /// Shader-resource slots per stage
    pub max_shader_resource_slots: u32,
    /// Sampler slots per stage
    pub max_sampler_slots: u32,
    /// Unordered-access slots
    pub max_unordered_access_slots: u32,
    /// Maximum dispatch size per axis (X, Y, Z)
    pub max_compute_groups: [u32; 3],
    /// Largest texture width or height
    pub max_texture_dimension: u32,
}

impl DeviceCapabilities {
    /// Set the dispatch limits
    pub fn with_max_compute_groups(mut self, groups: [u32; 3]) -> Self {
        self.max_compute_groups = groups;
        self
    }

    /// Set the render-target limit
    pub fn with_max_render_targets(mut self, count: u32) -> Self {
        self.max_render_targets = count;
        self
    }

    /// Set the vertex-buffer slot limit
    pub fn with_max_vertex_buffer_slots(mut self, count: u32) -> Self {
        self.max_vertex_buffer_slots = count;
        self
    }

    /// Validate that every limit is usable
    pub fn validate(&self) -> Result<(), String> {
        if self.max_render_targets == 0 {
            return Err("At least one render target is required".to_string());
        }
        if self.max_vertex_buffer_slots == 0 {
            return Err("At least one vertex buffer slot is required".to_string());
        }
        if self.max_compute_groups.contains(&0) {
            return Err(format!("Compute group limits must be non-zero: {:?}", self.max_compute_groups));
        }
        Ok(())
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_render_targets: 8,
            max_vertex_buffer_slots: 32,
            max_constant_buffer_slots: 14,
            max_shader_resource_slots: 128,
            max_sampler_slots: 16,
            max_unordered_access_slots: 8,
            max_compute_groups: [65535, 65535, 65535],
            max_texture_dimension: 16384,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities_valid() {
        assert!(DeviceCapabilities::default().validate().is_ok());
    }

    #[test]
    fn test_zero_compute_limit_rejected() {
        let caps = DeviceCapabilities::default().with_max_compute_groups([16, 0, 1]);
        assert!(caps.validate().is_err());
    }
}
