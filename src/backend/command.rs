// Command pool and the pre-recorded draw command buffers
//
// The triangle never changes, so each framebuffer gets one command buffer
// recorded up front and resubmitted every frame.

use anyhow::{Context, Result};
use ash::vk;

pub fn create_command_pool(device: &ash::Device, queue_family: u32) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::empty());

    unsafe { device.create_command_pool(&pool_info, None) }.context("Failed to create command pool")
}

/// Everything a draw recording needs besides the target framebuffer
pub struct DrawInfo {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
    pub vertex_buffer: vk::Buffer,
    pub vertex_count: u32,
    pub clear_color: [f32; 4],
}

/// Allocate one primary command buffer per framebuffer and record the draw
pub fn create_command_buffers(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    framebuffers: &[vk::Framebuffer],
    draw: &DrawInfo,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(framebuffers.len() as u32);

    let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffers")?;

    for (&cmd, &framebuffer) in command_buffers.iter().zip(framebuffers) {
        if let Err(e) = record_draw(device, cmd, framebuffer, draw) {
            unsafe { device.free_command_buffers(command_pool, &command_buffers) };
            return Err(e);
        }
    }

    log::debug!("Recorded {} command buffers", command_buffers.len());
    Ok(command_buffers)
}

fn record_draw(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    draw: &DrawInfo,
) -> Result<()> {
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: draw.clear_color,
        },
    }];

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(draw.render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: draw.extent,
        })
        .clear_values(&clear_values);

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder();
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin recording command buffer")?;

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
        device.cmd_draw(cmd, draw.vertex_count, 1, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .context("Failed to record command buffer")?;
    }

    Ok(())
}
