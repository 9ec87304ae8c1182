//! Descriptor set layouts, pooled allocation, and per-frame set caching.
//!
//! Layouts keep their own copy of the binding metadata
//! ([`BindingInfo`]) so the recording layer can tell dynamic from
//! static buffer bindings at flush time. [`DescriptorPool`] grows by
//! whole `vk::DescriptorPool`s sized for one layout; [`DescriptorCache`]
//! sits on top and hands out content-addressed sets, so a draw loop
//! that binds the same resources every frame reuses one set instead of
//! allocating thousands.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::binding::{ResourceBinding, ResourceSet};
use crate::device::Device;
use crate::error::RhiResult;

/// Sets allocated from each native pool before a new one is created.
const SETS_PER_POOL: u32 = 16;

/// Metadata for one binding of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl BindingInfo {
    /// True for dynamic uniform/storage buffer descriptors, whose byte
    /// offsets are supplied at bind time instead of at write time.
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        )
    }
}

/// Descriptor set layout wrapper.
///
/// Owns the native layout and the [`BindingInfo`] list it was created
/// from, sorted by binding number.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<BindingInfo>,
}

impl DescriptorSetLayout {
    /// Creates a descriptor set layout from binding metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if native layout creation fails.
    pub fn new(device: Arc<Device>, mut bindings: Vec<BindingInfo>) -> RhiResult<Arc<Self>> {
        bindings.sort_by_key(|info| info.binding);

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|info| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(info.binding)
                    .descriptor_type(info.descriptor_type)
                    .descriptor_count(info.descriptor_count)
                    .stage_flags(info.stage_flags)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!("Created descriptor set layout with {} binding(s)", bindings.len());

        Ok(Arc::new(Self {
            device,
            layout,
            bindings,
        }))
    }

    /// Returns the native layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Returns the binding metadata, sorted by binding number.
    #[inline]
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.bindings
    }

    /// Looks up the metadata for one binding number.
    pub fn binding(&self, binding: u32) -> Option<&BindingInfo> {
        self.bindings
            .binary_search_by_key(&binding, |info| info.binding)
            .ok()
            .map(|index| &self.bindings[index])
    }

    /// Number of dynamic buffer descriptors across all bindings, which
    /// is the number of dynamic offsets a bind of this set expects.
    pub fn dynamic_descriptor_count(&self) -> u32 {
        self.bindings
            .iter()
            .filter(|info| info.is_dynamic())
            .map(|info| info.descriptor_count)
            .sum()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Computes the pool sizes needed for `sets_per_pool` sets of a layout.
fn pool_sizes_for(bindings: &[BindingInfo], sets_per_pool: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
    for info in bindings {
        *counts.entry(info.descriptor_type).or_insert(0) += info.descriptor_count * sets_per_pool;
    }
    counts
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect()
}

/// Growable descriptor pool dedicated to one set layout.
///
/// Allocation never fails for pool exhaustion: when the active native
/// pool runs out, a fresh pool is appended and allocation retried.
/// `reset` rewinds every native pool at once; individual set free is
/// not supported.
pub struct DescriptorPool {
    device: Arc<Device>,
    layout: Arc<DescriptorSetLayout>,
    pools: Vec<vk::DescriptorPool>,
    /// Sets handed out from the pool at the same index.
    allocated: Vec<u32>,
    active_pool: usize,
}

impl DescriptorPool {
    /// Creates an empty pool for `layout`. Native pools are created
    /// lazily on first allocation.
    pub fn new(device: Arc<Device>, layout: Arc<DescriptorSetLayout>) -> Self {
        Self {
            device,
            layout,
            pools: Vec::new(),
            allocated: Vec::new(),
            active_pool: 0,
        }
    }

    /// Allocates one descriptor set, growing by a new native pool if the
    /// active one is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if native pool creation or set allocation fails
    /// for a reason other than pool exhaustion.
    pub fn allocate(&mut self) -> RhiResult<vk::DescriptorSet> {
        loop {
            if self.active_pool == self.pools.len() {
                self.push_pool()?;
            }
            if self.allocated[self.active_pool] < SETS_PER_POOL {
                match self.try_allocate(self.pools[self.active_pool]) {
                    Ok(set) => {
                        self.allocated[self.active_pool] += 1;
                        return Ok(set);
                    }
                    // Fragmentation can exhaust a pool before the set
                    // count does; fall through to the next pool.
                    Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                    | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.active_pool += 1;
        }
    }

    fn try_allocate(&self, pool: vk::DescriptorPool) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [self.layout.handle()];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&allocate_info)? };
        Ok(sets[0])
    }

    fn push_pool(&mut self) -> RhiResult<()> {
        let sizes = pool_sizes_for(self.layout.bindings(), SETS_PER_POOL);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);
        let pool = unsafe { self.device.handle().create_descriptor_pool(&create_info, None)? };
        debug!(
            "Created descriptor pool #{} ({} sets)",
            self.pools.len(),
            SETS_PER_POOL
        );
        self.pools.push(pool);
        self.allocated.push(0);
        Ok(())
    }

    /// Rewinds every native pool, invalidating all sets allocated from
    /// this pool. The caller must ensure the GPU is done with them.
    ///
    /// # Errors
    ///
    /// Returns an error if a native pool reset fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        for (pool, allocated) in self.pools.iter().zip(self.allocated.iter_mut()) {
            unsafe {
                self.device
                    .handle()
                    .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())?;
            }
            *allocated = 0;
        }
        self.active_pool = 0;
        Ok(())
    }

    /// Number of native pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        for pool in &self.pools {
            unsafe {
                self.device.handle().destroy_descriptor_pool(*pool, None);
            }
        }
    }
}

/// Cache key: layout handle plus the normalized set contents.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SetKey {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<((u32, u32), ResourceBinding)>,
}

/// Content-addressed descriptor set cache.
///
/// Frame-owned: each in-flight frame keeps its own cache and calls
/// [`reset`](Self::reset) once the frame's fence has signalled.
/// Requesting a set with the same layout and the same resource contents
/// returns the previously written set without touching the driver.
pub struct DescriptorCache {
    device: Arc<Device>,
    pools: HashMap<vk::DescriptorSetLayout, DescriptorPool>,
    sets: HashMap<SetKey, vk::DescriptorSet>,
}

impl DescriptorCache {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            pools: HashMap::new(),
            sets: HashMap::new(),
        }
    }

    /// Returns a descriptor set whose writes match `resources`,
    /// allocating and writing one if no cached set matches.
    ///
    /// Dynamic buffer bindings are written with offset zero; the actual
    /// byte offsets travel as dynamic offsets at bind time, so sets stay
    /// shareable across ring-buffer sub-allocations.
    ///
    /// # Errors
    ///
    /// Returns an error if set allocation or pool growth fails.
    pub fn request_descriptor_set(
        &mut self,
        layout: &Arc<DescriptorSetLayout>,
        resources: &ResourceSet,
    ) -> RhiResult<vk::DescriptorSet> {
        let key = Self::make_key(layout, resources);
        if let Some(set) = self.sets.get(&key) {
            return Ok(*set);
        }

        let pool = self
            .pools
            .entry(layout.handle())
            .or_insert_with(|| DescriptorPool::new(self.device.clone(), layout.clone()));
        let set = pool.allocate()?;

        self.write_set(set, layout, &key.bindings);
        self.sets.insert(key, set);
        Ok(set)
    }

    /// Builds the cache key, zeroing offsets of dynamic buffer bindings.
    fn make_key(layout: &Arc<DescriptorSetLayout>, resources: &ResourceSet) -> SetKey {
        let bindings = resources
            .iter()
            .filter_map(|(&(binding, array_element), resource)| {
                let info = layout.binding(binding)?;
                let resource = match resource {
                    ResourceBinding::Buffer(buffer) if info.is_dynamic() => {
                        ResourceBinding::Buffer(crate::binding::BufferBinding {
                            offset: 0,
                            ..*buffer
                        })
                    }
                    other => *other,
                };
                Some(((binding, array_element), resource))
            })
            .collect();
        SetKey {
            layout: layout.handle(),
            bindings,
        }
    }

    fn write_set(
        &self,
        set: vk::DescriptorSet,
        layout: &Arc<DescriptorSetLayout>,
        bindings: &[((u32, u32), ResourceBinding)],
    ) {
        // The info structs must outlive the writes that point at them.
        let mut buffer_infos = Vec::with_capacity(bindings.len());
        let mut image_infos = Vec::with_capacity(bindings.len());
        for (_, resource) in bindings {
            match resource {
                ResourceBinding::Buffer(buffer) => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset: buffer.offset,
                    range: buffer.range,
                }),
                ResourceBinding::Image(image) => image_infos.push(vk::DescriptorImageInfo {
                    sampler: image.sampler,
                    image_view: image.image_view,
                    image_layout: image.layout,
                }),
            }
        }

        let mut writes = Vec::with_capacity(bindings.len());
        let mut buffer_cursor = 0;
        let mut image_cursor = 0;
        for ((binding, array_element), resource) in bindings {
            let Some(info) = layout.binding(*binding) else {
                continue;
            };
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .dst_array_element(*array_element)
                .descriptor_type(info.descriptor_type);
            let write = match resource {
                ResourceBinding::Buffer(_) => {
                    let slot = std::slice::from_ref(&buffer_infos[buffer_cursor]);
                    buffer_cursor += 1;
                    write.buffer_info(slot)
                }
                ResourceBinding::Image(_) => {
                    let slot = std::slice::from_ref(&image_infos[image_cursor]);
                    image_cursor += 1;
                    write.image_info(slot)
                }
            };
            writes.push(write);
        }

        unsafe {
            self.device.handle().update_descriptor_sets(&writes, &[]);
        }
    }

    /// Rewinds all pools and forgets every cached set. Call only once
    /// the frame's submissions have completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool reset fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        for pool in self.pools.values_mut() {
            pool.reset()?;
        }
        self.sets.clear();
        Ok(())
    }

    /// Number of distinct cached sets.
    pub fn cached_set_count(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_scale_with_sets_per_pool() {
        let bindings = [
            BindingInfo {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
            },
            BindingInfo {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 4,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
            },
        ];

        let sizes = pool_sizes_for(&bindings, 8);
        assert_eq!(sizes.len(), 2);

        let uniform = sizes
            .iter()
            .find(|size| size.ty == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 8);

        let sampler = sizes
            .iter()
            .find(|size| size.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(sampler.descriptor_count, 32);
    }

    #[test]
    fn test_pool_sizes_merge_same_type() {
        let bindings = [
            BindingInfo {
                binding: 0,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::COMPUTE,
            },
            BindingInfo {
                binding: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 2,
                stage_flags: vk::ShaderStageFlags::COMPUTE,
            },
        ];

        let sizes = pool_sizes_for(&bindings, 1);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 3);
    }

    #[test]
    fn test_binding_info_dynamic_detection() {
        let dynamic = BindingInfo {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::ALL,
        };
        assert!(dynamic.is_dynamic());

        let plain = BindingInfo {
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            ..dynamic
        };
        assert!(!plain.is_dynamic());
    }
}
