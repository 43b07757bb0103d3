//! Procedural box geometry for the batch.

use blasforge_core::{BuildFlags, BuildRange, GeometryBuildInput, GeometryDesc};
use blasforge_gpu::AabbPositions;
use glam::Vec3;

use crate::options::Options;

/// Boxes of every item, laid out back-to-back in one buffer.
pub struct BoxScene {
    pub boxes: Vec<AabbPositions>,
    /// First box and box count of each item.
    pub items: Vec<(u32, u32)>,
}

impl BoxScene {
    /// Item `i` gets `boxes * (i % 4 + 1)` unit boxes on a helix.
    pub fn generate(options: &Options) -> Self {
        let mut boxes = Vec::new();
        let mut items = Vec::with_capacity(options.items);

        for item in 0..options.items {
            let first = u32::try_from(boxes.len()).unwrap_or(u32::MAX);
            let count = options.boxes * (item as u32 % 4 + 1);
            let origin = Vec3::new(item as f32 * 16.0, 0.0, 0.0);
            let half = Vec3::splat(0.4);

            for j in 0..count {
                let t = j as f32 * 0.25;
                let center = origin + Vec3::new(t.cos() * 4.0, j as f32 * 0.1, t.sin() * 4.0);
                boxes.push(AabbPositions::new(
                    (center - half).to_array(),
                    (center + half).to_array(),
                ));
            }
            items.push((first, count));
        }

        Self { boxes, items }
    }

    /// Build inputs reading the boxes from `address`.
    pub fn inputs(&self, options: &Options, address: u64) -> Vec<GeometryBuildInput> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, &(first, count))| {
                let flags = if options.wants_compaction(index) {
                    BuildFlags::ALLOW_COMPACTION
                } else {
                    BuildFlags::empty()
                };
                let byte_offset = first * AabbPositions::STRIDE as u32;
                GeometryBuildInput::new(format!("helix {index}"), flags).with_geometry(
                    GeometryDesc::aabbs(address, AabbPositions::STRIDE),
                    BuildRange::new(count).with_primitive_offset(byte_offset),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_sizes_cycle() {
        let options = Options {
            items: 5,
            boxes: 2,
            ..Options::default()
        };
        let scene = BoxScene::generate(&options);
        assert_eq!(scene.items, vec![(0, 2), (2, 4), (6, 6), (12, 8), (20, 2)]);
        assert_eq!(scene.boxes.len(), 22);
    }

    #[test]
    fn inputs_point_into_shared_buffer() {
        let options = Options {
            items: 3,
            boxes: 1,
            compact_every: 2,
            ..Options::default()
        };
        let scene = BoxScene::generate(&options);
        let inputs = scene.inputs(&options, 0x1000);

        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[1].ranges()[0].primitive_offset, 24);
        assert_eq!(inputs[2].ranges()[0].primitive_offset, 72);
        assert!(inputs[0].flags().allows_compaction());
        assert!(!inputs[1].flags().allows_compaction());
        assert!(inputs[2].flags().allows_compaction());
    }

    #[test]
    fn boxes_are_well_formed() {
        let scene = BoxScene::generate(&Options::default());
        for aabb in &scene.boxes {
            for axis in 0..3 {
                assert!(aabb.min[axis] < aabb.max[axis]);
            }
        }
    }
}
