//! Geometry build inputs.

use crate::flags::BuildFlags;

/// Vertex position format for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    Rgba16Float,
}

/// Index buffer type for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    /// Non-indexed triangle list.
    #[default]
    None,
    U16,
    U32,
}

/// Geometry payload referenced by device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryData {
    Triangles {
        vertex_format: VertexFormat,
        vertex_address: u64,
        vertex_stride: u64,
        max_vertex: u32,
        index_type: IndexType,
        index_address: u64,
        /// Optional 3x4 row-major transform applied at build time.
        transform_address: Option<u64>,
    },
    /// Axis-aligned boxes for procedural geometry.
    Aabbs { address: u64, stride: u64 },
}

/// One geometry of a build input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDesc {
    pub data: GeometryData,
    /// Skip any-hit shaders for this geometry.
    pub opaque: bool,
}

impl GeometryDesc {
    /// Non-indexed triangle geometry.
    pub fn triangles(
        vertex_format: VertexFormat,
        vertex_address: u64,
        vertex_stride: u64,
        max_vertex: u32,
    ) -> Self {
        Self {
            data: GeometryData::Triangles {
                vertex_format,
                vertex_address,
                vertex_stride,
                max_vertex,
                index_type: IndexType::None,
                index_address: 0,
                transform_address: None,
            },
            opaque: true,
        }
    }

    /// Procedural AABB geometry.
    pub fn aabbs(address: u64, stride: u64) -> Self {
        Self {
            data: GeometryData::Aabbs { address, stride },
            opaque: true,
        }
    }

    /// Attach an index buffer. Ignored for AABB geometry.
    #[must_use]
    pub fn with_indices(mut self, ty: IndexType, address: u64) -> Self {
        if let GeometryData::Triangles {
            index_type,
            index_address,
            ..
        } = &mut self.data
        {
            *index_type = ty;
            *index_address = address;
        }
        self
    }

    /// Attach a build-time transform. Ignored for AABB geometry.
    #[must_use]
    pub fn with_transform(mut self, address: u64) -> Self {
        if let GeometryData::Triangles {
            transform_address, ..
        } = &mut self.data
        {
            *transform_address = Some(address);
        }
        self
    }

    /// Set whether the geometry is opaque.
    #[must_use]
    pub fn opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }
}

/// Build range for one geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildRange {
    /// Number of triangles or boxes.
    pub primitive_count: u32,
    /// Byte offset into the index (or vertex/AABB) data.
    pub primitive_offset: u32,
    pub first_vertex: u32,
    /// Byte offset into the transform data.
    pub transform_offset: u32,
}

impl BuildRange {
    /// Range covering `primitive_count` primitives from the start of the data.
    pub fn new(primitive_count: u32) -> Self {
        Self {
            primitive_count,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_primitive_offset(mut self, offset: u32) -> Self {
        self.primitive_offset = offset;
        self
    }

    #[must_use]
    pub fn with_first_vertex(mut self, first_vertex: u32) -> Self {
        self.first_vertex = first_vertex;
        self
    }

    #[must_use]
    pub fn with_transform_offset(mut self, offset: u32) -> Self {
        self.transform_offset = offset;
        self
    }
}

/// One BLAS to be built: geometries, their ranges, and build flags.
///
/// Geometries and ranges are pushed in pairs so there is always exactly one
/// range per geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryBuildInput {
    label: String,
    geometries: Vec<GeometryDesc>,
    ranges: Vec<BuildRange>,
    flags: BuildFlags,
}

impl GeometryBuildInput {
    /// Create an input with no geometry.
    pub fn new(label: impl Into<String>, flags: BuildFlags) -> Self {
        Self {
            label: label.into(),
            geometries: Vec::new(),
            ranges: Vec::new(),
            flags,
        }
    }

    /// Append a geometry with its build range.
    pub fn push_geometry(&mut self, geometry: GeometryDesc, range: BuildRange) -> &mut Self {
        self.geometries.push(geometry);
        self.ranges.push(range);
        self
    }

    /// Builder-style variant of [`Self::push_geometry`].
    #[must_use]
    pub fn with_geometry(mut self, geometry: GeometryDesc, range: BuildRange) -> Self {
        self.push_geometry(geometry, range);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn geometries(&self) -> &[GeometryDesc] {
        &self.geometries
    }

    pub fn ranges(&self) -> &[BuildRange] {
        &self.ranges
    }

    /// The item's own flags, before batch-wide flags are applied.
    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    /// Whether the input has no geometry at all.
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Maximum primitive count of each geometry, in geometry order.
    ///
    /// One entry per geometry taken from its range; not a running total.
    pub fn max_primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|r| r.primitive_count).collect()
    }

    /// Total primitives across all geometries.
    pub fn total_primitives(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.primitive_count)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_counts_are_per_geometry() {
        let input = GeometryBuildInput::new("mesh", BuildFlags::empty())
            .with_geometry(
                GeometryDesc::triangles(VertexFormat::Rgb32Float, 0x100, 12, 8),
                BuildRange::new(12),
            )
            .with_geometry(GeometryDesc::aabbs(0x200, 24), BuildRange::new(3));

        assert_eq!(input.max_primitive_counts(), vec![12, 3]);
        assert_eq!(input.total_primitives(), 15);
        assert_eq!(input.geometries().len(), input.ranges().len());
    }

    #[test]
    fn indices_only_apply_to_triangles() {
        let tri = GeometryDesc::triangles(VertexFormat::Rgb32Float, 0x100, 12, 8)
            .with_indices(IndexType::U32, 0x400)
            .with_transform(0x800);
        match tri.data {
            GeometryData::Triangles {
                index_type,
                index_address,
                transform_address,
                ..
            } => {
                assert_eq!(index_type, IndexType::U32);
                assert_eq!(index_address, 0x400);
                assert_eq!(transform_address, Some(0x800));
            }
            GeometryData::Aabbs { .. } => panic!("expected triangles"),
        }

        let boxes = GeometryDesc::aabbs(0x200, 24).with_indices(IndexType::U16, 0x400);
        assert_eq!(boxes, GeometryDesc::aabbs(0x200, 24));
    }

    #[test]
    fn empty_input() {
        let input = GeometryBuildInput::new("empty", BuildFlags::ALLOW_COMPACTION);
        assert!(input.is_empty());
        assert!(input.max_primitive_counts().is_empty());
    }
}
