//! GPU buffer management and transient sub-allocation.
//!
//! This module provides:
//! - [`BufferUsage`] - usage classes mapped to Vulkan flags and memory
//!   locations
//! - [`Buffer`] - a VkBuffer with gpu-allocator managed memory
//! - [`BufferBlock`] / [`BufferPool`] - ring-buffer sub-allocation for
//!   per-frame transient data
//!
//! # Ring-buffer semantics
//!
//! A [`BufferPool`] owns fixed-size blocks for one usage class. Allocation
//! bump-allocates from the active block and rolls over to the next block
//! (creating one if needed) when the active block cannot satisfy the
//! request. `reset()` rewinds every block to offset zero in one step;
//! there are no per-allocation frees, so a frame's worth of transient
//! allocations is reclaimed wholesale once its fence has signaled.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vkforge_rhi::device::Device;
//! use vkforge_rhi::buffer::{BufferPool, BufferUsage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), vkforge_rhi::RhiError> {
//! let mut pool = BufferPool::new(device, BufferUsage::Uniform, 256 * 1024);
//! let allocation = pool.request_buffer(128)?;
//! allocation.write(0, &[0u8; 128])?;
//! // ... bind allocation.buffer() at allocation.offset() ...
//! pool.reset(); // next frame starts from offset 0 again
//! # Ok(())
//! # }
//! ```

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::physical_device::DeviceLimits;

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which affects Vulkan usage
/// flags, memory allocation strategy, and sub-allocation alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex buffer - stores vertex data
    Vertex,
    /// Index buffer - stores index data
    Index,
    /// Uniform buffer - stores shader uniform data
    Uniform,
    /// Storage buffer - general-purpose GPU storage
    Storage,
    /// Staging buffer - CPU-writable for data upload
    Staging,
}

impl BufferUsage {
    /// All usage classes a frame keeps transient pools for.
    pub const ALL: [BufferUsage; 5] = [
        BufferUsage::Vertex,
        BufferUsage::Index,
        BufferUsage::Uniform,
        BufferUsage::Storage,
        BufferUsage::Staging,
    ];

    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Returns the preferred memory location for this buffer type.
    ///
    /// Transient per-frame data is CPU-written every frame, so everything
    /// except general storage lives in CpuToGpu memory.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Vertex | BufferUsage::Index => MemoryLocation::CpuToGpu,
            BufferUsage::Uniform => MemoryLocation::CpuToGpu,
            BufferUsage::Storage => MemoryLocation::GpuOnly,
            BufferUsage::Staging => MemoryLocation::CpuToGpu,
        }
    }

    /// Sub-allocation offset alignment for this usage class.
    ///
    /// Uniform and storage bindings must honor the device's minimum
    /// offset alignments; vertex/index/staging data only needs scalar
    /// alignment.
    pub fn offset_alignment(self, limits: &DeviceLimits) -> vk::DeviceSize {
        match self {
            BufferUsage::Uniform => limits.min_uniform_buffer_offset_alignment.max(16),
            BufferUsage::Storage => limits.min_storage_buffer_offset_alignment.max(16),
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Staging => 16,
        }
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// GPU buffer wrapper with managed memory.
///
/// This struct wraps a Vulkan buffer and its associated memory
/// allocation. Memory is managed by gpu-allocator, which handles
/// suballocation and memory type selection.
///
/// # Thread Safety
///
/// The buffer itself is not thread-safe. Synchronize access externally
/// when sharing between threads.
pub struct Buffer {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan buffer handle.
    buffer: vk::Buffer,
    /// GPU memory allocation.
    allocation: Option<Allocation>,
    /// Buffer size in bytes.
    size: vk::DeviceSize,
    /// Buffer usage type.
    usage: BufferUsage,
}

impl Buffer {
    /// Creates a new buffer with the specified size.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer or memory allocation fails.
    pub fn new(device: Arc<Device>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = device.allocator().lock().unwrap();
            allocator.allocate(&AllocationCreateDesc {
                name: usage.name(),
                requirements,
                location: usage.memory_location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?
        };

        unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        debug!("Created {} buffer: {} bytes", usage.name(), size);

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
        })
    }

    /// Writes data to the buffer at the specified offset.
    ///
    /// The buffer must use CPU-visible memory (CpuToGpu or similar).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer memory is not mapped
    /// - The write would exceed the buffer size
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset + data.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RhiError::InvalidHandle(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        let mapped_ptr = self.mapped_ptr().ok_or_else(|| {
            RhiError::InvalidHandle("Buffer memory is not mapped".to_string())
        })?;

        unsafe {
            let dst = mapped_ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(())
    }

    /// Returns the mapped CPU pointer, if the memory is host-visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast())
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the buffer usage type.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Free allocation first, then destroy buffer
        if let Some(allocation) = self.allocation.take() {
            let mut allocator = self.device.allocator().lock().unwrap();
            if let Err(e) = allocator.free(allocation) {
                tracing::error!("Failed to free buffer allocation: {:?}", e);
            }
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
    }
}

/// Aligns `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub(crate) fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Pure bump-allocation cursor over a fixed capacity.
///
/// Separated from [`BufferBlock`] so the arithmetic is testable without a
/// device.
#[derive(Clone, Copy, Debug)]
struct BumpCursor {
    /// Next unallocated byte.
    offset: vk::DeviceSize,
    /// Total capacity in bytes.
    capacity: vk::DeviceSize,
    /// Offset alignment for every allocation.
    alignment: vk::DeviceSize,
}

impl BumpCursor {
    fn new(capacity: vk::DeviceSize, alignment: vk::DeviceSize) -> Self {
        Self {
            offset: 0,
            capacity,
            alignment,
        }
    }

    /// Reserves `size` bytes, returning the aligned offset, or `None`
    /// when the remaining capacity cannot hold the request.
    fn allocate(&mut self, size: vk::DeviceSize) -> Option<vk::DeviceSize> {
        let aligned = align_up(self.offset, self.alignment);
        if aligned + size > self.capacity {
            return None;
        }
        self.offset = aligned + size;
        Some(aligned)
    }

    fn reset(&mut self) {
        self.offset = 0;
    }
}

/// A sub-range of a pooled buffer handed out for one frame.
///
/// Carries everything a caller needs to bind and fill the range. The
/// allocation is only valid until the owning pool's next `reset()`.
#[derive(Clone, Copy, Debug)]
pub struct BufferAllocation {
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    /// Mapped pointer to the start of this range, when host-visible.
    mapped: Option<NonNull<u8>>,
}

impl BufferAllocation {
    /// Returns the underlying buffer handle.
    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the byte offset of this range within the buffer.
    #[inline]
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Returns the size of this range in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Writes `data` at `offset` bytes into this range.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not host-visible or the write
    /// would run past the end of the range.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if offset + data.len() as vk::DeviceSize > self.size {
            return Err(RhiError::InvalidHandle(format!(
                "Write of {} bytes at offset {} exceeds allocation of {} bytes",
                data.len(),
                offset,
                self.size
            )));
        }
        let mapped = self.mapped.ok_or_else(|| {
            RhiError::InvalidHandle("Allocation memory is not mapped".to_string())
        })?;
        unsafe {
            let dst = mapped.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Writes a plain-old-data value at `offset` bytes into this range.
    ///
    /// # Errors
    ///
    /// Same conditions as [`write`](Self::write).
    pub fn write_typed<T: bytemuck::NoUninit>(
        &self,
        offset: vk::DeviceSize,
        value: &T,
    ) -> RhiResult<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }
}

/// One fixed-size block inside a [`BufferPool`].
///
/// Bump-allocates aligned sub-ranges from a single [`Buffer`]; reset
/// rewinds the cursor without touching the memory.
pub struct BufferBlock {
    buffer: Buffer,
    cursor: BumpCursor,
}

impl BufferBlock {
    /// Creates a block of `size` bytes for `usage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing buffer cannot be created.
    pub fn new(device: Arc<Device>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        let alignment = usage.offset_alignment(device.limits());
        let buffer = Buffer::new(device, usage, size)?;
        Ok(Self {
            buffer,
            cursor: BumpCursor::new(size, alignment),
        })
    }

    /// Bump-allocates `size` bytes, or `None` if the block is full.
    pub fn allocate(&mut self, size: vk::DeviceSize) -> Option<BufferAllocation> {
        let offset = self.cursor.allocate(size)?;
        let mapped = self.buffer.mapped_ptr().map(|ptr| {
            // Safety: offset is within the mapped buffer range.
            unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) }
        });
        Some(BufferAllocation {
            buffer: self.buffer.handle(),
            offset,
            size,
            mapped,
        })
    }

    /// Rewinds the cursor to offset zero.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    /// Returns the block capacity in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.cursor.capacity
    }
}

/// A ring-allocating pool of fixed-size [`BufferBlock`]s for one usage
/// class.
///
/// Owned per `(usage class, thread)` by a render frame; never shared
/// between threads. The block size is fixed at construction - the
/// allocation strategy is a per-frame setting, not a per-allocation one.
pub struct BufferPool {
    device: Arc<Device>,
    usage: BufferUsage,
    block_size: vk::DeviceSize,
    blocks: Vec<BufferBlock>,
    /// Index of the block currently being bump-allocated from.
    active_block: usize,
}

impl BufferPool {
    /// Creates an empty pool; blocks are created on first use.
    pub fn new(device: Arc<Device>, usage: BufferUsage, block_size: vk::DeviceSize) -> Self {
        Self {
            device,
            usage,
            block_size,
            blocks: Vec::new(),
            active_block: 0,
        }
    }

    /// Allocates `size` bytes from the active block, rolling over to the
    /// next (possibly new) block when the active one is full.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationTooLarge`] without mutating the pool
    /// if `size` exceeds the block size, or a creation error if a new
    /// block is needed and cannot be built.
    pub fn request_buffer(&mut self, size: vk::DeviceSize) -> RhiResult<BufferAllocation> {
        if size > self.block_size {
            return Err(RhiError::AllocationTooLarge {
                requested: size,
                block_size: self.block_size,
            });
        }

        loop {
            if self.active_block == self.blocks.len() {
                let block =
                    BufferBlock::new(self.device.clone(), self.usage, self.block_size)?;
                debug!(
                    "Buffer pool ({}) grew to {} block(s) of {} bytes",
                    self.usage.name(),
                    self.blocks.len() + 1,
                    self.block_size
                );
                self.blocks.push(block);
            }

            if let Some(allocation) = self.blocks[self.active_block].allocate(size) {
                return Ok(allocation);
            }

            // Active block is full; move on. The next block is either
            // freshly created or was rewound by the last reset, so the
            // retry is guaranteed to fit (size <= block_size).
            self.active_block += 1;
        }
    }

    /// Rewinds every block and restarts allocation from the first one.
    ///
    /// No per-allocation frees happen; the caller must guarantee the GPU
    /// is done with the previous cycle's allocations (the render frame
    /// does this with its fence wait).
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
        self.active_block = 0;
    }

    /// Returns the usage class this pool serves.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Returns the fixed block size in bytes.
    #[inline]
    pub fn block_size(&self) -> vk::DeviceSize {
        self.block_size
    }

    /// Number of blocks currently owned.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_bump_cursor_aligns_offsets() {
        let mut cursor = BumpCursor::new(1024, 64);
        assert_eq!(cursor.allocate(10), Some(0));
        // 10 rounds up to the next 64-byte boundary.
        assert_eq!(cursor.allocate(10), Some(64));
        assert_eq!(cursor.allocate(64), Some(128));
    }

    #[test]
    fn test_bump_cursor_rejects_overflow() {
        let mut cursor = BumpCursor::new(128, 16);
        assert_eq!(cursor.allocate(100), Some(0));
        // 100 aligns to 112; 112 + 32 > 128.
        assert_eq!(cursor.allocate(32), None);
        // A fitting request still succeeds after a failed one.
        assert_eq!(cursor.allocate(16), Some(112));
    }

    #[test]
    fn test_bump_cursor_reset_restarts_at_zero() {
        let mut cursor = BumpCursor::new(256, 16);
        assert_eq!(cursor.allocate(200), Some(0));
        cursor.reset();
        assert_eq!(cursor.allocate(200), Some(0));
    }

    #[test]
    fn test_usage_alignment_honors_limits() {
        let limits = DeviceLimits {
            max_push_constants_size: 128,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            max_bound_descriptor_sets: 4,
            timestamp_period: 1.0,
        };
        assert_eq!(BufferUsage::Uniform.offset_alignment(&limits), 256);
        assert_eq!(BufferUsage::Storage.offset_alignment(&limits), 64);
        assert_eq!(BufferUsage::Vertex.offset_alignment(&limits), 16);
    }
}
