//! Draw and dispatch validation

use std::fmt;

use bitflags::bitflags;

use crate::device::DeviceCapabilities;

bitflags! {
    /// Outcome of binding the pipeline for a draw or dispatch
    ///
    /// An empty set means success. Several failures can be reported at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindResult: u32 {
        /// No shader is bound
        const NO_SHADER = 1 << 0;
        /// Vertex-buffer slot 0 is empty
        const MISSING_VERTEX_SEGMENT = 1 << 1;
        /// No index buffer is bound
        const MISSING_INDEX_SEGMENT = 1 << 2;
        /// Instanced draw with an input layout that has no per-instance slot
        const NON_INSTANCED_VERTEX_LAYOUT = 1 << 3;
        /// A dispatch axis exceeds the device limit
        const INVALID_COMPUTE_GROUP_DIMENSION = 1 << 4;
        /// The render pass has no primitive topology
        const UNDEFINED_TOPOLOGY = 1 << 5;
    }
}

impl BindResult {
    /// Everything was bound
    pub const SUCCESSFUL: Self = Self::empty();

    /// Whether no failure was reported
    pub const fn is_successful(self) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for BindResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Successful");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" | "))
    }
}

/// Which checks run on top of "is a shader bound"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueValidationMode {
    /// Plain draw
    Unindexed,
    /// Needs vertex-buffer slot 0 and an index buffer
    Indexed,
    /// Needs vertex-buffer slot 0 and an instanced input layout
    Instanced,
    /// Indexed and instanced checks combined
    InstancedIndexed,
    /// Dispatch size must fit the device limits
    Compute,
}

impl QueueValidationMode {
    /// Whether the mode issues a compute dispatch
    pub const fn is_compute(self) -> bool {
        matches!(self, Self::Compute)
    }

    const fn is_indexed(self) -> bool {
        matches!(self, Self::Indexed | Self::InstancedIndexed)
    }

    const fn is_instanced(self) -> bool {
        matches!(self, Self::Instanced | Self::InstancedIndexed)
    }
}

impl fmt::Display for QueueValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unindexed => "Draw",
            Self::Indexed => "DrawIndexed",
            Self::Instanced => "DrawInstanced",
            Self::InstancedIndexed => "DrawIndexedInstanced",
            Self::Compute => "Dispatch",
        };
        f.write_str(name)
    }
}

/// Input-assembler state a render validation looks at
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DrawBindings {
    pub has_vertex_buffer: bool,
    pub has_index_buffer: bool,
    pub instanced_layout: bool,
}

pub(crate) fn validate_draw(mode: QueueValidationMode, bindings: DrawBindings) -> BindResult {
    let mut result = BindResult::SUCCESSFUL;
    if mode.is_indexed() {
        if !bindings.has_vertex_buffer {
            result |= BindResult::MISSING_VERTEX_SEGMENT;
        }
        if !bindings.has_index_buffer {
            result |= BindResult::MISSING_INDEX_SEGMENT;
        }
    }
    if mode.is_instanced() {
        if !bindings.has_vertex_buffer {
            result |= BindResult::MISSING_VERTEX_SEGMENT;
        }
        if !bindings.instanced_layout {
            result |= BindResult::NON_INSTANCED_VERTEX_LAYOUT;
        }
    }
    result
}

pub(crate) fn validate_compute(groups: [u32; 3], caps: &DeviceCapabilities) -> BindResult {
    let mut result = BindResult::SUCCESSFUL;
    for ((axis, requested), max) in ["X", "Y", "Z"].iter().zip(groups).zip(caps.max_compute_groups) {
        if requested > max {
            log::error!(
                "Unable to dispatch compute shader. {axis} dimension ({requested}) is greater than supported ({max})."
            );
            result |= BindResult::INVALID_COMPUTE_GROUP_DIMENSION;
        }
    }
    result
}

/// Replace zero axes with the pass default
///
/// A zero request cannot be told apart from "not set", so a dispatch of zero
/// groups on an axis is not expressible through an override.
pub(crate) fn resolve_compute_groups(requested: [u32; 3], pass_default: [u32; 3]) -> [u32; 3] {
    let mut groups = requested;
    for (group, default) in groups.iter_mut().zip(pass_default) {
        if *group == 0 {
            *group = default;
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unindexed_needs_nothing() {
        let result = validate_draw(QueueValidationMode::Unindexed, DrawBindings::default());
        assert!(result.is_successful());
    }

    #[test]
    fn test_indexed_without_index_buffer() {
        let bindings = DrawBindings { has_vertex_buffer: true, ..DrawBindings::default() };
        let result = validate_draw(QueueValidationMode::Indexed, bindings);
        assert_eq!(result, BindResult::MISSING_INDEX_SEGMENT);
    }

    #[test]
    fn test_instanced_indexed_reports_every_failure() {
        let result = validate_draw(QueueValidationMode::InstancedIndexed, DrawBindings::default());
        assert_eq!(
            result,
            BindResult::MISSING_VERTEX_SEGMENT | BindResult::MISSING_INDEX_SEGMENT | BindResult::NON_INSTANCED_VERTEX_LAYOUT
        );
    }

    #[test]
    fn test_compute_limits_checked_per_axis() {
        let caps = DeviceCapabilities::default().with_max_compute_groups([16, 16, 1]);
        assert!(validate_compute([16, 16, 1], &caps).is_successful());
        assert_eq!(validate_compute([1, 1, 2], &caps), BindResult::INVALID_COMPUTE_GROUP_DIMENSION);
    }

    #[test]
    fn test_zero_axis_uses_pass_default() {
        assert_eq!(resolve_compute_groups([0, 4, 0], [8, 8, 1]), [8, 4, 1]);
    }

    #[test]
    fn test_display_lists_flags() {
        assert_eq!(BindResult::SUCCESSFUL.to_string(), "Successful");
        let text = (BindResult::NO_SHADER | BindResult::UNDEFINED_TOPOLOGY).to_string();
        assert_eq!(text, "NO_SHADER | UNDEFINED_TOPOLOGY");
    }
}
