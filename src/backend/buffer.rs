// Buffer utilities
//
// Raw vk::DeviceMemory allocation with explicit memory-type selection, and a
// staging upload path for device-local vertex data.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;

/// A buffer together with the memory bound to it
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// First memory type allowed by `type_filter` that has all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = memory_properties.memory_type_count as usize;

    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|&(i, memory_type)| {
            (type_filter & (1 << i)) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(i, _)| i as u32)
}

/// Helper to create a GPU buffer with specified usage and memory properties
pub fn create_buffer(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<Buffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let handle = unsafe { device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    let requirements = unsafe { device.get_buffer_memory_requirements(handle) };

    let memory = find_memory_type(memory_properties, requirements.memory_type_bits, properties)
        .context("Failed to find suitable memory type")
        .and_then(|memory_type_index| {
            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index);
            unsafe { device.allocate_memory(&alloc_info, None) }
                .context("Failed to allocate buffer memory")
        });

    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(handle, None) };
            return Err(e);
        }
    };

    let buffer = Buffer {
        handle,
        memory,
        size,
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(handle, memory, 0) } {
        buffer.destroy(device);
        return Err(e).context("Failed to bind buffer memory");
    }

    Ok(buffer)
}

/// Copy `data` into a host-visible, host-coherent buffer
fn write_host_visible<T: Pod>(device: &ash::Device, buffer: &Buffer, data: &[T]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(data);

    unsafe {
        let ptr = device
            .map_memory(buffer.memory, 0, buffer.size, vk::MemoryMapFlags::empty())
            .context("Failed to map buffer memory")? as *mut u8;
        ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        device.unmap_memory(buffer.memory);
    }

    Ok(())
}

/// Record and submit a one-shot buffer copy, then wait for it to finish
pub fn copy_buffer(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate transfer command buffer")?;
    let cmd = command_buffers[0];

    let result = unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        device
            .begin_command_buffer(cmd, &begin_info)
            .and_then(|_| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
                device.end_command_buffer(cmd)
            })
            .and_then(|_| {
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device.queue_submit(queue, &[submit_info.build()], vk::Fence::null())
            })
            .and_then(|_| device.queue_wait_idle(queue))
    };

    unsafe { device.free_command_buffers(command_pool, &command_buffers) };

    result.context("Failed to copy buffer")
}

/// Upload `data` into a device-local buffer through a temporary staging buffer
pub fn create_device_local_buffer<T: Pod>(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<Buffer> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    if size == 0 {
        anyhow::bail!("Cannot create an empty buffer");
    }

    let staging = create_buffer(
        device,
        memory_properties,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let result = write_host_visible(device, &staging, data).and_then(|_| {
        let buffer = create_buffer(
            device,
            memory_properties,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        match copy_buffer(device, command_pool, queue, staging.handle, buffer.handle, size) {
            Ok(()) => Ok(buffer),
            Err(e) => {
                buffer.destroy(device);
                Err(e)
            }
        }
    });

    staging.destroy(device);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_type_with_all_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b111, wanted), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
    }

    #[test]
    fn respects_type_filter() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
