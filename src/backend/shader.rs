// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The build script compiles the GLSL in
// shaders/ and we read the result at run time.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Turn raw bytes into SPIR-V words, checking length and magic number
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("SPIR-V size {} is not a multiple of 4", bytes.len());
    }

    // read_spv copies into properly aligned words and fixes endianness
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Failed to read SPIR-V")?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => anyhow::bail!("Bad SPIR-V magic number {:#010x}", other),
        None => anyhow::bail!("SPIR-V is empty"),
    }
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to open shader file {:?} (was glslc run?)", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid shader file {:?}", path))
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_little_endian_magic() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_unaligned_length() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(parse_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = 0xdead_beefu32.to_le_bytes();
        let err = parse_spirv(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("exist.spv"));
    }
}
