// Mesh store
//
// Device-local vertex + index buffers handed out as small integer keys. Keys
// stay valid until released; released slots are reused, most recent first.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::backend::{
    Buffer, CommandPool, Index, IndexBuffer, StagingBuffer, Vertex, VertexBuffer, VulkanDevice,
};
use crate::slab::{Slab, SlabKey};

/// Handle to a mesh in a [`MeshStore`]
pub type MeshKey = SlabKey;

/// Uploaded geometry, ready to draw
pub struct Mesh {
    vertices: Buffer,
    indices: IndexBuffer,
}

impl Mesh {
    /// Upload `vertices` and `indices` through a transient staging buffer
    pub fn upload<V: Vertex>(
        device: &Arc<VulkanDevice>,
        command_pool: &CommandPool,
        vertices: &[V],
        indices: &[Index],
    ) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            anyhow::bail!("Mesh needs at least one vertex and one index");
        }

        let vertex_buffer = VertexBuffer::<V>::new(device, vertices.len())?;
        let index_buffer = IndexBuffer::new(device, indices.len())?;

        // One staging buffer big enough for either upload
        let vertex_bytes = std::mem::size_of_val(vertices);
        let index_bytes = std::mem::size_of_val(indices);
        let mut staging = StagingBuffer::new(device, vertex_bytes.max(index_bytes) as u64)?;

        staging.upload(vertices)?;
        command_pool
            .buffer_copy(staging.as_ref(), vertex_buffer.as_ref())
            .context("Failed to upload mesh vertices")?;

        staging.upload(indices)?;
        command_pool
            .buffer_copy(staging.as_ref(), index_buffer.as_ref())
            .context("Failed to upload mesh indices")?;

        Ok(Self {
            vertices: vertex_buffer.into_buffer(),
            indices: index_buffer,
        })
    }

    pub fn vertices(&self) -> &Buffer {
        &self.vertices
    }

    pub fn indices(&self) -> &IndexBuffer {
        &self.indices
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }
}

#[derive(Default)]
pub struct MeshStore {
    meshes: Slab<Mesh>,
}

impl MeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mesh: Mesh) -> MeshKey {
        let key = self.meshes.emplace(mesh);
        log::debug!("Stored mesh {} ({} live)", key, self.meshes.len());
        key
    }

    /// Panics if `key` was released or never issued
    pub fn get(&self, key: MeshKey) -> &Mesh {
        self.meshes.get(key)
    }

    /// Destroy the mesh's buffers. The GPU must no longer be using them.
    pub fn release(&mut self, key: MeshKey) {
        drop(self.meshes.release(key));
        log::debug!("Released mesh {} ({} live)", key, self.meshes.len());
    }

    pub fn contains(&self, key: MeshKey) -> bool {
        self.meshes.contains(key)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}
