// GPU round trips on a headless device (no window, no surface).
//
// Skipped with a note when the machine has no Vulkan driver or GPU.

use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use villa::backend::{
    CommandPool, IndexBuffer, ReadbackBuffer, StagingBuffer, Vertex, VertexAttribute,
    VertexBuffer, VulkanDevice,
};
use villa::mesh::{Mesh, MeshStore};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Scalar(f32);

impl Vertex for Scalar {
    const ATTRIBUTES: &'static [VertexAttribute] = &[VertexAttribute::float(0)];
}

fn headless_device() -> Option<Arc<VulkanDevice>> {
    match VulkanDevice::new("villa-test", &[], false) {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({:#})", e);
            None
        }
    }
}

#[test]
fn staging_to_device_local_and_back_is_byte_identical() {
    let Some(device) = headless_device() else {
        return;
    };
    let pool = CommandPool::new(&device).unwrap();

    let floats: Vec<Scalar> = (0..1024).map(|i| Scalar(i as f32 * 0.25 - 17.0)).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&floats);

    let mut staging = StagingBuffer::new(&device, 64 * 1024).unwrap();
    let vertices = VertexBuffer::<Scalar>::new(&device, floats.len()).unwrap();
    let readback = ReadbackBuffer::new(&device, bytes.len() as u64).unwrap();

    staging.upload(&floats).unwrap();
    // Larger staging buffer: the copy is clamped to the vertex buffer
    pool.buffer_copy(staging.as_ref(), vertices.as_ref()).unwrap();
    pool.buffer_copy(vertices.as_ref(), readback.as_ref()).unwrap();

    assert_eq!(readback.download().unwrap(), bytes);
}

#[test]
fn index_upload_round_trips() {
    let Some(device) = headless_device() else {
        return;
    };
    let pool = CommandPool::new(&device).unwrap();

    let indices: [u16; 6] = [0, 1, 2, 2, 3, 0];
    let mut staging = StagingBuffer::new(&device, 12).unwrap();
    let index_buffer = IndexBuffer::new(&device, indices.len()).unwrap();
    let readback = ReadbackBuffer::new(&device, 12).unwrap();

    staging.upload(&indices).unwrap();
    pool.buffer_copy(staging.as_ref(), index_buffer.as_ref()).unwrap();
    pool.buffer_copy(index_buffer.as_ref(), readback.as_ref()).unwrap();

    let downloaded = readback.download().unwrap();
    assert_eq!(downloaded, bytemuck::cast_slice::<u16, u8>(&indices));
}

#[test]
fn oversized_upload_is_rejected() {
    let Some(device) = headless_device() else {
        return;
    };

    let mut staging = StagingBuffer::new(&device, 8).unwrap();
    assert!(staging.upload(&[1.0f32, 2.0, 3.0]).is_err());
    assert!(staging.upload(&[1.0f32, 2.0]).is_ok());
}

#[test]
fn zero_sized_buffers_are_rejected() {
    let Some(device) = headless_device() else {
        return;
    };

    assert!(StagingBuffer::new(&device, 0).is_err());
    assert!(VertexBuffer::<Scalar>::new(&device, 0).is_err());
}

#[test]
fn mesh_store_reuses_released_keys() {
    let Some(device) = headless_device() else {
        return;
    };
    let pool = CommandPool::new(&device).unwrap();
    let vertices = [Scalar(0.0), Scalar(1.0), Scalar(2.0)];
    let indices = [0, 1, 2];

    let mut store = MeshStore::new();
    let first = store.insert(Mesh::upload(&device, &pool, &vertices, &indices).unwrap());
    let second = store.insert(Mesh::upload(&device, &pool, &vertices, &indices).unwrap());
    assert_ne!(first, second);
    assert_eq!(store.get(second).index_count(), 3);

    store.release(first);
    assert!(!store.contains(first));
    assert_eq!(store.len(), 1);

    let third = store.insert(Mesh::upload(&device, &pool, &vertices, &indices).unwrap());
    assert_eq!(third, first);
    assert_eq!(store.len(), 2);
}

#[test]
fn empty_mesh_is_rejected() {
    let Some(device) = headless_device() else {
        return;
    };
    let pool = CommandPool::new(&device).unwrap();

    assert!(Mesh::upload::<Scalar>(&device, &pool, &[], &[0]).is_err());
    assert!(Mesh::upload(&device, &pool, &[Scalar(1.0)], &[]).is_err());
}
