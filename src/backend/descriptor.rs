// Descriptor pools and sets
//
// A pool is created for one pipeline's descriptor set layout and holds a
// fixed number of sets. Each allocation wires one uniform buffer into the
// layout's first uniform binding. Running out of sets is an error; pools do
// not grow.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::buffer::UniformBuffer;
use super::pipeline::{Pipeline, UniformBinding};
use super::VulkanDevice;

/// Allocated descriptor set. Valid while its pool is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet(vk::DescriptorSet);

impl DescriptorSet {
    pub fn handle(self) -> vk::DescriptorSet {
        self.0
    }
}

/// Fixed-capacity pool of descriptor sets for one pipeline layout
pub struct DescriptorPool {
    handle: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
    binding: UniformBinding,
    budget: SetBudget,
    device: Arc<VulkanDevice>,
}

impl DescriptorPool {
    /// Create a pool holding `capacity` sets of `pipeline`'s layout.
    /// The pipeline must outlive the pool.
    pub fn new(device: &Arc<VulkanDevice>, pipeline: &Pipeline, capacity: u32) -> Result<Self> {
        let binding = *pipeline
            .uniforms()
            .first()
            .context("Pipeline declares no uniform bindings")?;

        if capacity == 0 {
            anyhow::bail!("Descriptor pool capacity must be at least 1");
        }

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: capacity * pipeline.uniforms().len() as u32,
        }];

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(capacity)
            .pool_sizes(&pool_sizes);

        let handle = unsafe { device.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")?;

        log::debug!("Created descriptor pool ({} sets)", capacity);

        Ok(Self {
            handle,
            set_layout: pipeline.descriptor_set_layout(),
            binding,
            budget: SetBudget::new(capacity),
            device: device.clone(),
        })
    }

    /// Allocate a set whose uniform binding points at `uniform_buffer`
    pub fn allocate<T: Pod>(&mut self, uniform_buffer: &UniformBuffer<T>) -> Result<DescriptorSet> {
        self.budget.take()?;

        let set_layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.handle)
            .set_layouts(&set_layouts);

        let set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?
            .into_iter()
            .next()
            .context("Driver returned no descriptor set")?;

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: uniform_buffer.as_ref().handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(self.binding.binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };

        Ok(DescriptorSet(set))
    }

    pub fn capacity(&self) -> u32 {
        self.budget.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.budget.remaining()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // Frees every set allocated from the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.handle, None) };
    }
}

/// Count of sets handed out against a fixed capacity
#[derive(Debug)]
struct SetBudget {
    capacity: u32,
    allocated: u32,
}

impl SetBudget {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    fn take(&mut self) -> Result<()> {
        if self.allocated >= self.capacity {
            anyhow::bail!("Descriptor pool exhausted: all {} sets allocated", self.capacity);
        }
        self.allocated += 1;
        Ok(())
    }

    fn remaining(&self) -> u32 {
        self.capacity - self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_exactly_capacity() {
        let mut budget = SetBudget::new(3);
        for expected_remaining in [2, 1, 0] {
            budget.take().unwrap();
            assert_eq!(budget.remaining(), expected_remaining);
        }

        let err = budget.take().unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        assert_eq!(budget.remaining(), 0);
    }
}
