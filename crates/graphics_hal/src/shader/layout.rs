//! Vertex formats and input layouts

use std::sync::Weak;

use serde::{Deserialize, Serialize};

use crate::backend::{NativeHandle, NativeObject};
use crate::binding::Bindable;
use crate::device::GraphicsDevice;

/// Format of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexElementFormat {
    /// f32
    Float,
    /// 2 x f32
    Float2,
    /// 3 x f32
    Float3,
    /// 4 x f32
    Float4,
    /// 4 x u8, normalized
    UByte4Norm,
    /// u32
    UInt,
    /// i32
    Int,
}

impl VertexElementFormat {
    /// Size in bytes
    pub const fn size(self) -> u32 {
        match self {
            Self::Float | Self::UByte4Norm | Self::UInt | Self::Int => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }
}

/// One attribute of a vertex format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexElement {
    /// Semantic name, e.g. `POSITION`
    pub semantic: String,
    /// Semantic index
    pub semantic_index: u32,
    /// Attribute format
    pub format: VertexElementFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Layout of the data in one vertex buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexFormat {
    elements: Vec<VertexElement>,
    stride: u32,
    per_instance: bool,
}

impl VertexFormat {
    /// Empty per-vertex format; add attributes with [`Self::with_element`]
    pub const fn new() -> Self {
        Self {
            elements: Vec::new(),
            stride: 0,
            per_instance: false,
        }
    }

    /// Append an attribute at the current end of the vertex
    pub fn with_element(mut self, semantic: impl Into<String>, semantic_index: u32, format: VertexElementFormat) -> Self {
        self.elements.push(VertexElement {
            semantic: semantic.into(),
            semantic_index,
            format,
            offset: self.stride,
        });
        self.stride += format.size();
        self
    }

    /// Mark the buffer as per-instance data
    pub fn per_instance(mut self) -> Self {
        self.per_instance = true;
        self
    }

    /// Attributes in declaration order
    pub fn elements(&self) -> &[VertexElement] {
        &self.elements
    }

    /// Bytes per vertex
    pub const fn stride(&self) -> u32 {
        self.stride
    }

    /// Whether the buffer advances per instance
    pub const fn is_per_instance(&self) -> bool {
        self.per_instance
    }
}

impl Default for VertexFormat {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribute as the native input-assembler sees it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputElement {
    /// Semantic name
    pub semantic: String,
    /// Semantic index
    pub semantic_index: u32,
    /// Attribute format
    pub format: VertexElementFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
    /// Vertex-buffer slot the attribute is read from
    pub slot: u32,
    /// Whether the slot advances per instance
    pub per_instance: bool,
}

/// Flatten per-slot vertex formats into input elements
pub fn input_elements(formats: &[Option<VertexFormat>]) -> Vec<InputElement> {
    formats
        .iter()
        .enumerate()
        .filter_map(|(slot, format)| format.as_ref().map(|f| (slot as u32, f)))
        .flat_map(|(slot, format)| {
            format.elements().iter().map(move |e| InputElement {
                semantic: e.semantic.clone(),
                semantic_index: e.semantic_index,
                format: e.format,
                offset: e.offset,
                slot,
                per_instance: format.is_per_instance(),
            })
        })
        .collect()
}

/// Drop trailing empty slots so equal signatures compare equal
pub(crate) fn trim_signature(mut formats: Vec<Option<VertexFormat>>) -> Vec<Option<VertexFormat>> {
    while matches!(formats.last(), Some(None)) {
        formats.pop();
    }
    formats
}

/// Native input layout for one vertex shader and vertex-buffer signature
#[derive(Debug)]
pub struct VertexInputLayout {
    native: NativeHandle,
    vertex_shader: NativeHandle,
    signature: Vec<Option<VertexFormat>>,
    instanced: bool,
    device: Weak<GraphicsDevice>,
}

impl VertexInputLayout {
    pub(crate) fn new(
        native: NativeHandle,
        vertex_shader: NativeHandle,
        signature: Vec<Option<VertexFormat>>,
        device: Weak<GraphicsDevice>,
    ) -> Self {
        let instanced = signature.iter().flatten().any(VertexFormat::is_per_instance);
        Self { native, vertex_shader, signature, instanced, device }
    }

    /// Whether this layout was built for `vertex_shader` and exactly `signature`
    pub fn is_match(&self, vertex_shader: NativeHandle, signature: &[Option<VertexFormat>]) -> bool {
        self.vertex_shader == vertex_shader && self.signature.as_slice() == signature
    }

    /// Whether any slot carries per-instance data
    pub const fn is_instanced(&self) -> bool {
        self.instanced
    }

    /// Vertex formats per slot
    pub fn signature(&self) -> &[Option<VertexFormat>] {
        &self.signature
    }
}

impl Bindable for VertexInputLayout {
    fn native_handle(&self) -> NativeHandle {
        self.native
    }
}

impl Drop for VertexInputLayout {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.mark_for_release(NativeObject::Object(self.native));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_color() -> VertexFormat {
        VertexFormat::new()
            .with_element("POSITION", 0, VertexElementFormat::Float3)
            .with_element("COLOR", 0, VertexElementFormat::UByte4Norm)
    }

    #[test]
    fn test_offsets_and_stride() {
        let format = position_color();
        assert_eq!(format.stride(), 16);
        assert_eq!(format.elements()[1].offset, 12);
    }

    #[test]
    fn test_input_elements_skip_empty_slots() {
        let instance = VertexFormat::new()
            .with_element("TRANSFORM", 0, VertexElementFormat::Float4)
            .per_instance();
        let elements = input_elements(&[Some(position_color()), None, Some(instance)]);

        assert_eq!(elements.len(), 3);
        assert_eq!(elements[2].slot, 2);
        assert!(elements[2].per_instance);
        assert!(!elements[0].per_instance);
    }

    #[test]
    fn test_layout_match_and_instancing() {
        let instance = VertexFormat::new()
            .with_element("OFFSET", 0, VertexElementFormat::Float2)
            .per_instance();
        let signature = vec![Some(position_color()), Some(instance)];
        let layout = VertexInputLayout::new(NativeHandle(1), NativeHandle(9), signature.clone(), Weak::new());

        assert!(layout.is_instanced());
        assert!(layout.is_match(NativeHandle(9), &signature));
        assert!(!layout.is_match(NativeHandle(8), &signature));
        assert!(!layout.is_match(NativeHandle(9), &signature[..1]));
    }

    #[test]
    fn test_trim_signature() {
        let trimmed = trim_signature(vec![Some(position_color()), None, None]);
        assert_eq!(trimmed.len(), 1);
    }
}
