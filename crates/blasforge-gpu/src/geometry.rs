//! Conversion of build inputs to Vulkan structures.

use ash::vk;
use blasforge_core::{BuildFlags, BuildRange, GeometryData, GeometryDesc, IndexType, VertexFormat};

/// Axis-aligned box in the layout `VK_GEOMETRY_TYPE_AABBS_KHR` reads (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl AabbPositions {
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }
}

/// Acceleration structure offsets and sizes must be multiples of this.
pub const STRUCTURE_SIZE_ALIGNMENT: u64 = 256;

/// Round `value` up to a multiple of `alignment` (a power of two, or zero for none).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Build flags share their bit values with Vulkan.
pub fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::from_raw(flags.bits())
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
        VertexFormat::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
    }
}

pub fn index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::None => vk::IndexType::NONE_KHR,
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

fn address(device_address: u64) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR { device_address }
}

/// Vulkan geometry description for one input geometry.
pub fn geometry(desc: &GeometryDesc) -> vk::AccelerationStructureGeometryKHR<'static> {
    let flags = if desc.opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };

    let geometry = vk::AccelerationStructureGeometryKHR::default().flags(flags);
    match desc.data {
        GeometryData::Triangles {
            vertex_format: format,
            vertex_address,
            vertex_stride,
            max_vertex,
            index_type: ty,
            index_address,
            transform_address,
        } => geometry
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format(format))
                    .vertex_data(address(vertex_address))
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(index_type(ty))
                    .index_data(address(index_address))
                    .transform_data(address(transform_address.unwrap_or(0))),
            }),
        GeometryData::Aabbs {
            address: aabb_address,
            stride,
        } => geometry
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(address(aabb_address))
                    .stride(stride),
            }),
    }
}

pub fn build_range(range: &BuildRange) -> vk::AccelerationStructureBuildRangeInfoKHR {
    vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(range.primitive_count)
        .primitive_offset(range.primitive_offset)
        .first_vertex(range.first_vertex)
        .transform_offset(range.transform_offset)
}

/// Bottom-level build info in `BUILD` mode, without destination or scratch.
pub fn build_info<'a>(
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
    flags: BuildFlags,
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(build_flags(flags))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_layout() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
        assert_eq!(AabbPositions::STRIDE, 24);
        let aabb = AabbPositions::new([0.0, 1.0, 2.0], [3.0, 4.0, 5.0]);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&aabb));
        assert_eq!(floats, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn flags_keep_vulkan_bits() {
        let flags = BuildFlags::ALLOW_COMPACTION | BuildFlags::PREFER_FAST_TRACE;
        assert_eq!(
            build_flags(flags),
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        );
        assert_eq!(
            build_flags(BuildFlags::LOW_MEMORY),
            vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY
        );
        assert_eq!(
            build_flags(BuildFlags::ALLOW_UPDATE | BuildFlags::PREFER_FAST_BUILD),
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        );
    }

    #[test]
    fn formats_and_index_types() {
        assert_eq!(vertex_format(VertexFormat::Rgb32Float), vk::Format::R32G32B32_SFLOAT);
        assert_eq!(vertex_format(VertexFormat::Rgba16Float), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(index_type(IndexType::None), vk::IndexType::NONE_KHR);
        assert_eq!(index_type(IndexType::U16), vk::IndexType::UINT16);
    }

    #[test]
    fn aabb_geometry() {
        let desc = GeometryDesc::aabbs(0x4000, 24).opaque(false);
        let geometry = geometry(&desc);
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::AABBS);
        assert_eq!(geometry.flags, vk::GeometryFlagsKHR::empty());

        let aabbs = unsafe { geometry.geometry.aabbs };
        assert_eq!(aabbs.stride, 24);
        assert_eq!(unsafe { aabbs.data.device_address }, 0x4000);
    }

    #[test]
    fn range_is_copied() {
        let range = build_range(&BuildRange::new(12).with_primitive_offset(48));
        assert_eq!(range.primitive_count, 12);
        assert_eq!(range.primitive_offset, 48);
        assert_eq!(range.first_vertex, 0);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 128), 384);
        assert_eq!(align_up(77, 0), 77);
    }
}
