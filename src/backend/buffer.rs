// Buffer utilities for staging, uniform, vertex, index and readback buffers
//
// Each buffer owns one dedicated VkDeviceMemory allocation bound at offset 0.
// Size and usage are fixed at creation; to grow, create a new buffer.
//
// Host-visible kinds (staging, uniform, readback) can be mapped. Device-local
// kinds (vertex, index) are filled with a copy command from a staging buffer
// and expose no mapping API at all.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;

use super::pipeline::Vertex;
use super::VulkanDevice;

/// What a buffer is for. Decides usage flags and where its memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU-written source of transfer copies
    Staging,
    /// CPU-written uniform data read by shaders
    Uniform,
    /// Device-local vertex data, written by copy
    Vertex,
    /// Device-local index data, written by copy
    Index,
    /// CPU-readable destination of transfer copies
    Readback,
}

impl BufferUsage {
    pub fn flags(self) -> vk::BufferUsageFlags {
        match self {
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            // TRANSFER_SRC so device-local contents can be read back
            Self::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            Self::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            Self::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    /// Memory properties the backing allocation must have
    pub fn memory_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::Staging | Self::Uniform | Self::Readback => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Self::Vertex | Self::Index => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    pub fn is_host_visible(self) -> bool {
        self.memory_properties().contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// A buffer handle plus its dedicated memory allocation
pub struct Buffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: BufferUsage,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer of exactly `size` bytes with memory chosen for `usage`
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize, usage: BufferUsage) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Cannot create a zero-sized {:?} buffer", usage);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let memory = match Self::allocate_and_bind(device, handle, usage) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        log::debug!("Created {:?} buffer ({} bytes)", usage, size);

        Ok(Self {
            handle,
            memory,
            size,
            usage,
            device: device.clone(),
        })
    }

    fn allocate_and_bind(
        device: &VulkanDevice,
        buffer: vk::Buffer,
        usage: BufferUsage,
    ) -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory_types = &device.memory_properties.memory_types
            [..device.memory_properties.memory_type_count as usize];
        let memory_type_index = find_memory_type_index(
            memory_types,
            requirements.memory_type_bits,
            usage.memory_properties(),
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(memory)
    }

    /// Map the whole allocation, copy `data` to its start, unmap.
    fn upload_memory(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(self.usage.is_host_visible(), "upload to {:?} buffer", self.usage);

        if data.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Upload of {} bytes exceeds {:?} buffer of {} bytes",
                data.len(),
                self.usage,
                self.size
            );
        }

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Map the whole allocation and copy the buffer's bytes out.
    fn download_memory(&self) -> Result<Vec<u8>> {
        debug_assert!(self.usage.is_host_visible(), "download from {:?} buffer", self.usage);

        let mut out = vec![0u8; self.size as usize];
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *const u8;

            ptr.copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(out)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size in bytes (the allocation may be larger)
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

impl AsRef<Buffer> for Buffer {
    fn as_ref(&self) -> &Buffer {
        self
    }
}

/// Lowest-indexed memory type whose bit is set in `supported_bits` and whose
/// flags contain every flag in `required`.
pub fn find_memory_type_index(
    memory_types: &[vk::MemoryType],
    supported_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .position(|(i, memory_type)| {
            supported_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|i| i as u32)
        .with_context(|| {
            format!(
                "No suitable memory type for bits {:#b} and flags {:?}",
                supported_bits, required
            )
        })
}

// =============================================================================
// TYPED BUFFERS
// =============================================================================

/// Host-visible transfer source
pub struct StagingBuffer(Buffer);

impl StagingBuffer {
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        Ok(Self(Buffer::new(device, size, BufferUsage::Staging)?))
    }

    /// Copy `data` to the start of the buffer
    pub fn upload<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.0.upload_memory(bytemuck::cast_slice(data))
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.0.size()
    }
}

/// Host-visible uniform storage for `count` values of `T`
pub struct UniformBuffer<T: Pod> {
    buffer: Buffer,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> UniformBuffer<T> {
    pub fn new(device: &Arc<VulkanDevice>, count: usize) -> Result<Self> {
        let size = (std::mem::size_of::<T>() * count) as vk::DeviceSize;
        Ok(Self {
            buffer: Buffer::new(device, size, BufferUsage::Uniform)?,
            count,
            _marker: PhantomData,
        })
    }

    pub fn upload(&mut self, values: &[T]) -> Result<()> {
        self.buffer.upload_memory(bytemuck::cast_slice(values))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Device-local storage for `count` vertices of `V`
pub struct VertexBuffer<V: Vertex> {
    buffer: Buffer,
    count: usize,
    _marker: PhantomData<V>,
}

impl<V: Vertex> VertexBuffer<V> {
    pub fn new(device: &Arc<VulkanDevice>, count: usize) -> Result<Self> {
        let size = (std::mem::size_of::<V>() * count) as vk::DeviceSize;
        Ok(Self {
            buffer: Buffer::new(device, size, BufferUsage::Vertex)?,
            count,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drop the vertex type, keeping the buffer
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Device-local 16-bit index storage
pub struct IndexBuffer {
    buffer: Buffer,
    count: usize,
}

impl IndexBuffer {
    pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;

    pub fn new(device: &Arc<VulkanDevice>, count: usize) -> Result<Self> {
        let size = (std::mem::size_of::<Index>() * count) as vk::DeviceSize;
        Ok(Self {
            buffer: Buffer::new(device, size, BufferUsage::Index)?,
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Index element type stored in an [`IndexBuffer`]
pub type Index = u16;

/// Host-visible transfer destination, used to read GPU data back
pub struct ReadbackBuffer(Buffer);

impl ReadbackBuffer {
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        Ok(Self(Buffer::new(device, size, BufferUsage::Readback)?))
    }

    pub fn download(&self) -> Result<Vec<u8>> {
        self.0.download_memory()
    }
}

impl AsRef<Buffer> for StagingBuffer {
    fn as_ref(&self) -> &Buffer {
        &self.0
    }
}

impl<T: Pod> AsRef<Buffer> for UniformBuffer<T> {
    fn as_ref(&self) -> &Buffer {
        &self.buffer
    }
}

impl<V: Vertex> AsRef<Buffer> for VertexBuffer<V> {
    fn as_ref(&self) -> &Buffer {
        &self.buffer
    }
}

impl AsRef<Buffer> for IndexBuffer {
    fn as_ref(&self) -> &Buffer {
        &self.buffer
    }
}

impl AsRef<Buffer> for ReadbackBuffer {
    fn as_ref(&self) -> &Buffer {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    fn mem(flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags: flags,
            heap_index: 0,
        }
    }

    /// Typical discrete GPU: device-local, host, host+cached, device+host (BAR)
    fn discrete_table() -> Vec<vk::MemoryType> {
        vec![
            mem(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            mem(HOST),
            mem(HOST | vk::MemoryPropertyFlags::HOST_CACHED),
            mem(vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST),
        ]
    }

    #[test]
    fn picks_lowest_matching_index() {
        let table = discrete_table();
        assert_eq!(find_memory_type_index(&table, 0b1111, HOST).unwrap(), 1);
        assert_eq!(
            find_memory_type_index(&table, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_supported_bits() {
        let table = discrete_table();
        // Type 1 not allowed by the resource: next host-visible type is 2
        assert_eq!(find_memory_type_index(&table, 0b1100, HOST).unwrap(), 2);
        assert_eq!(
            find_memory_type_index(&table, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            3
        );
    }

    #[test]
    fn requires_full_property_mask() {
        let table = discrete_table();
        let both = vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type_index(&table, 0b1111, both).unwrap(), 3);

        // Without the BAR type nothing is both device-local and host-visible
        assert!(find_memory_type_index(&table[..3], 0b0111, both).is_err());
    }

    #[test]
    fn fails_when_bits_exclude_everything() {
        let table = discrete_table();
        assert!(find_memory_type_index(&table, 0, vk::MemoryPropertyFlags::empty()).is_err());
        assert!(find_memory_type_index(&[], u32::MAX, HOST).is_err());
    }

    #[test]
    fn usage_maps_to_memory_kind() {
        assert!(BufferUsage::Staging.is_host_visible());
        assert!(BufferUsage::Uniform.is_host_visible());
        assert!(BufferUsage::Readback.is_host_visible());
        assert!(!BufferUsage::Vertex.is_host_visible());
        assert!(!BufferUsage::Index.is_host_visible());

        assert!(BufferUsage::Vertex.flags().contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(BufferUsage::Staging.flags().contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert_eq!(
            BufferUsage::Index.memory_properties(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
    }
}
