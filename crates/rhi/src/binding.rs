//! CPU-side tracking of descriptor resource bindings.
//!
//! A command buffer records `bind_buffer`/`bind_image` calls into a
//! [`ResourceBindingState`] instead of touching descriptor sets
//! directly. The state keeps one [`ResourceSet`] per set number, each
//! with its own dirty flag, so the flush path only materializes the
//! sets that actually changed since the last draw. The binding maps are
//! `BTreeMap`s: iteration order is deterministic, which makes a set's
//! contents usable as a descriptor cache key.

use std::collections::BTreeMap;

use ash::vk;

/// A buffer region bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// An image view (with optional sampler) bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub image_view: vk::ImageView,
    /// Null for storage/sampled images bound without a sampler.
    pub sampler: vk::Sampler,
    pub layout: vk::ImageLayout,
}

/// One bound resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceBinding {
    Buffer(BufferBinding),
    Image(ImageBinding),
}

/// The bindings of a single descriptor set, keyed by
/// `(binding, array_element)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceSet {
    bindings: BTreeMap<(u32, u32), ResourceBinding>,
}

impl ResourceSet {
    /// Stores a binding, returning true if the slot's content changed.
    pub fn bind(&mut self, binding: u32, array_element: u32, resource: ResourceBinding) -> bool {
        match self.bindings.get(&(binding, array_element)) {
            Some(existing) if *existing == resource => false,
            _ => {
                self.bindings.insert((binding, array_element), resource);
                true
            }
        }
    }

    /// Returns the binding at the slot, if any.
    pub fn get(&self, binding: u32, array_element: u32) -> Option<&ResourceBinding> {
        self.bindings.get(&(binding, array_element))
    }

    /// Iterates `((binding, array_element), resource)` in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&(u32, u32), &ResourceBinding)> {
        self.bindings.iter()
    }

    /// Returns true if no resources are bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Tracked resource bindings across all descriptor sets.
///
/// Dirtiness is per set: rebinding set 2 does not force set 0 to be
/// rewritten at the next flush.
#[derive(Clone, Debug, Default)]
pub struct ResourceBindingState {
    sets: BTreeMap<u32, ResourceSet>,
    dirty_sets: BTreeMap<u32, bool>,
}

impl ResourceBindingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a buffer region to `(set, binding, array_element)`.
    pub fn bind_buffer(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        buffer: BufferBinding,
    ) {
        self.bind(set, binding, array_element, ResourceBinding::Buffer(buffer));
    }

    /// Binds an image (and optional sampler) to `(set, binding, array_element)`.
    pub fn bind_image(&mut self, set: u32, binding: u32, array_element: u32, image: ImageBinding) {
        self.bind(set, binding, array_element, ResourceBinding::Image(image));
    }

    fn bind(&mut self, set: u32, binding: u32, array_element: u32, resource: ResourceBinding) {
        let resource_set = self.sets.entry(set).or_default();
        if resource_set.bind(binding, array_element, resource) {
            self.dirty_sets.insert(set, true);
        }
    }

    /// Returns the tracked contents of `set`, if anything was bound.
    pub fn set(&self, set: u32) -> Option<&ResourceSet> {
        self.sets.get(&set)
    }

    /// Returns true if `set` changed since the last [`clear_dirty`].
    ///
    /// [`clear_dirty`]: Self::clear_dirty
    pub fn is_set_dirty(&self, set: u32) -> bool {
        self.dirty_sets.get(&set).copied().unwrap_or(false)
    }

    /// Returns true if any set changed since its last flush.
    pub fn has_dirty_sets(&self) -> bool {
        self.dirty_sets.values().any(|dirty| *dirty)
    }

    /// Iterates the set numbers that are currently dirty, in order.
    pub fn dirty_sets(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirty_sets
            .iter()
            .filter(|(_, dirty)| **dirty)
            .map(|(set, _)| *set)
    }

    /// Marks `set` clean. Called by the flush path after the set's
    /// descriptors have been written and bound.
    pub fn clear_dirty(&mut self, set: u32) {
        if let Some(dirty) = self.dirty_sets.get_mut(&set) {
            *dirty = false;
        }
    }

    /// Forces every tracked set dirty, e.g. after the pipeline layout
    /// changed and all sets must be rebound.
    pub fn mark_all_dirty(&mut self) {
        for set in self.sets.keys() {
            self.dirty_sets.insert(*set, true);
        }
    }

    /// Drops all bindings and dirty flags.
    pub fn reset(&mut self) {
        self.sets.clear();
        self.dirty_sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_binding(id: u64) -> BufferBinding {
        BufferBinding {
            buffer: vk::Buffer::from_raw(id),
            offset: 0,
            range: 256,
        }
    }

    use ash::vk::Handle;

    #[test]
    fn test_bind_marks_only_that_set_dirty() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(0, 0, 0, buffer_binding(1));
        state.bind_buffer(2, 1, 0, buffer_binding(2));

        assert!(state.has_dirty_sets());
        assert!(state.is_set_dirty(0));
        assert!(!state.is_set_dirty(1));
        assert!(state.is_set_dirty(2));
        assert_eq!(state.dirty_sets().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_rebinding_same_resource_stays_clean() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(0, 0, 0, buffer_binding(1));
        state.clear_dirty(0);

        state.bind_buffer(0, 0, 0, buffer_binding(1));
        assert!(!state.is_set_dirty(0));

        state.bind_buffer(0, 0, 0, buffer_binding(9));
        assert!(state.is_set_dirty(0));
    }

    #[test]
    fn test_array_elements_are_distinct_slots() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(0, 3, 0, buffer_binding(1));
        state.bind_buffer(0, 3, 1, buffer_binding(2));

        let set = state.set(0).unwrap();
        assert_eq!(
            set.get(3, 0),
            Some(&ResourceBinding::Buffer(buffer_binding(1)))
        );
        assert_eq!(
            set.get(3, 1),
            Some(&ResourceBinding::Buffer(buffer_binding(2)))
        );
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn test_mark_all_dirty_touches_only_tracked_sets() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(1, 0, 0, buffer_binding(1));
        state.clear_dirty(1);

        state.mark_all_dirty();
        assert!(state.is_set_dirty(1));
        assert!(!state.is_set_dirty(0));
    }

    #[test]
    fn test_reset_drops_everything() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(0, 0, 0, buffer_binding(1));
        state.reset();

        assert!(state.set(0).is_none());
        assert!(!state.is_set_dirty(0));
        assert_eq!(state.dirty_sets().count(), 0);
    }

    #[test]
    fn test_image_binding_replaces_buffer_binding() {
        let mut state = ResourceBindingState::new();
        state.bind_buffer(0, 0, 0, buffer_binding(1));
        state.clear_dirty(0);

        state.bind_image(
            0,
            0,
            0,
            ImageBinding {
                image_view: vk::ImageView::from_raw(7),
                sampler: vk::Sampler::null(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );
        assert!(state.is_set_dirty(0));
        assert!(matches!(
            state.set(0).unwrap().get(0, 0),
            Some(ResourceBinding::Image(_))
        ));
    }
}
