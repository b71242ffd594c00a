// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Modules are loaded from precompiled .spv
// files at runtime; build.rs compiles the GLSL sources under shaders/.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;

/// Owned VkShaderModule
pub struct Shader {
    module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl Shader {
    /// Load a SPIR-V file and create a shader module from it
    pub fn load<P: AsRef<Path>>(device: &Arc<VulkanDevice>, path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader {:?}", path))?;
        Self::from_bytes(device, &bytes).with_context(|| format!("Invalid shader {:?}", path))
    }

    /// Create a shader module from SPIR-V bytes
    pub fn from_bytes(device: &Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let code = read_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            module,
            device: device.clone(),
        })
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

/// Reinterpret bytes as aligned SPIR-V words, validating length and magic
fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Malformed SPIR-V")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn rejects_truncated_bytecode() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(read_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(read_spirv(&bytes).is_err());
    }

    #[test]
    fn reads_words() {
        let words = [SPIRV_MAGIC, 0x0001_0000, 7];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(read_spirv(&bytes).unwrap(), words);
    }
}
