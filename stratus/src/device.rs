// Vulkan device representation
//
// This stores per-GPU state: the vulkan device objects, the memory
// type table, and the logic to allocate and fill memory on this GPU.
//
// Austin Shafer - 2024

use ash::extensions::khr;
use ash::vk;

extern crate utils as st_utils;
use crate::instance::Instance;
use crate::{Result, StratusError};
use st_utils::log;
use st_utils::MemImage;

use std::sync::Arc;

/// Stratus Device
///
/// This holds all of the Vulkan logic for one GPU. One queue is
/// created from one queue family that can run every kind of work
/// we submit: graphics, compute, and transfer.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    /// The memory type table for pdev. Queried once at creation and
    /// valid for the life of this Device, so lookups never touch the
    /// driver. Would need requerying if we ever switched pdev.
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// index of the queue family all our work is submitted on
    pub(crate) queue_family: u32,
    /// our one queue. graphics, transfer, and present all go here
    pub(crate) queue: vk::Queue,
    /// dispatch table for VK_KHR_dynamic_rendering
    pub(crate) dynamic_rendering_loader: khr::DynamicRendering,

    /// pool for the copy cbuf below
    pub(crate) copy_cmd_pool: vk::CommandPool,
    /// command buffer for filling images from staging buffers
    pub(crate) copy_cbuf: vk::CommandBuffer,
}

/// One memory block backing a group of images
///
/// Offsets record where each image was bound, in the order the
/// images were handed to `alloc_images_memory`. Freeing this memory
/// invalidates every image bound into it, so the images have to be
/// destroyed first.
#[derive(Debug)]
pub struct Allocation {
    pub a_memory: vk::DeviceMemory,
    pub a_size: vk::DeviceSize,
    pub a_offsets: Vec<vk::DeviceSize>,
}

/// Computes a packed layout for resources with these requirements
///
/// The running offset starts at zero and gets padded up to each
/// resource's alignment before that resource is placed, so every
/// offset is a multiple of its own alignment. Nothing is added after
/// the final resource. Also returns the OR of all the type bitmasks,
/// since a single memory type has to back the lot.
pub(crate) fn plan_image_packing(
    reqs: &[vk::MemoryRequirements],
) -> (vk::DeviceSize, Vec<vk::DeviceSize>, u32) {
    let mut offsets = Vec::with_capacity(reqs.len());
    let mut total: vk::DeviceSize = 0;
    let mut type_bits: u32 = 0;

    for req in reqs.iter() {
        let rem = total % req.alignment;
        if rem != 0 {
            total += req.alignment - rem;
        }
        offsets.push(total);
        total += req.size;
        type_bits |= req.memory_type_bits;
    }

    (total, offsets, type_bits)
}

impl Device {
    /// Choose a queue family
    ///
    /// returns an index into the array of queue types. The family
    /// has to be a superset of `flags` and actually contain queues.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> Option<u32> {
        // get the properties per queue family
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            // for each property info
            .iter()
            .enumerate()
            .filter_map(|(index, info)| {
                match info.queue_flags.contains(flags) && info.queue_count > 0 {
                    // return the index of the first valid one
                    true => Some(index as u32),
                    false => None,
                }
            })
            .nth(0)
    }

    /// Choose a vkPhysicalDevice and queue family index.
    ///
    /// Takes the first physical device offering a queue family that
    /// can run all of our work.
    fn select_pdev(
        inst: &ash::Instance,
        flags: vk::QueueFlags,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(StratusError::NO_SUITABLE_DEVICE))?
        };

        // for each physical device
        pdevices
            .iter()
            .filter_map(|pdev| {
                Self::select_queue_family(inst, *pdev, flags).map(|family| (*pdev, family))
            })
            .nth(0)
            .ok_or(StratusError::NO_SUITABLE_DEVICE)
    }

    /// get the vkPhysicalDeviceMemoryProperties structure for a vkPhysicalDevice
    pub(crate) fn get_pdev_mem_properties(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        unsafe { inst.get_physical_device_memory_properties(pdev) }
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// Create a logical device for interfacing with the physical device.
    /// once again we specify any device extensions we need, the swapchain
    /// being the most important one.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = [
            khr::Swapchain::name().as_ptr(),
            khr::DynamicRendering::name().as_ptr(),
        ];

        let features = vk::PhysicalDeviceFeatures::builder().build();
        let mut dr_features = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::builder()
            .dynamic_rendering(true)
            .build();

        // we only have one queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&dev_extension_names)
            .enabled_features(&features)
            .push_next(&mut dr_features)
            .build();

        // return a newly created device
        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_DEVICE))
        }
    }

    /// Create a new default Device
    ///
    /// This picks the first physical device with a queue family that
    /// supports graphics, compute, and transfer together, and makes
    /// one queue out of that family.
    pub fn new(instance: Arc<Instance>) -> Result<Self> {
        let required_flags =
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let (pdev, queue_family) = Self::select_pdev(&instance.inst, required_flags)?;
        log::debug!("Selected queue family {} for all work", queue_family);

        let mem_props = Self::get_pdev_mem_properties(&instance.inst, pdev);
        let dev = Self::create_device(&instance.inst, pdev, queue_family)?;
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };
        let dr_loader = khr::DynamicRendering::new(&instance.inst, &dev);

        let mut ret = Self {
            inst: instance,
            dev: dev,
            pdev: pdev,
            mem_props: mem_props,
            queue_family: queue_family,
            queue: queue,
            dynamic_rendering_loader: dr_loader,
            copy_cmd_pool: vk::CommandPool::null(),
            copy_cbuf: vk::CommandBuffer::null(),
        };

        // If either of these fails ret is dropped, which tears down
        // the device and whatever of the pool exists
        ret.copy_cmd_pool = ret.create_command_pool(ret.queue_family)?;
        ret.copy_cbuf = ret.create_command_buffers(ret.copy_cmd_pool, 1)?[0];

        Ok(ret)
    }

    /// returns a new vkCommandPool
    ///
    /// Command buffers are allocated from command pools. That's about
    /// all they do. They just manage memory. Command buffers will be allocated
    /// as part of the queue_family specified.
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .or(Err(StratusError::INVALID))
        }
    }

    /// Allocate a vec of vkCommandBuffers
    ///
    /// Command buffers are constructed once, and can be executed
    /// many times. Command buffer is shortened to `cbuf` in
    /// many areas of the code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .or(Err(StratusError::INVALID))
        }
    }

    /// Records but does not submit a command buffer.
    ///
    /// cbuf - the command buffer to use
    /// flags - the usage flags for the buffer
    pub(crate) fn cbuf_begin_recording(
        &self,
        cbuf: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        unsafe {
            // first reset the cbuf so we know it is empty
            self.dev
                .reset_command_buffer(cbuf, vk::CommandBufferResetFlags::RELEASE_RESOURCES)
                .or(Err(StratusError::INVALID))?;

            let record_info = vk::CommandBufferBeginInfo::builder().flags(flags);

            self.dev
                .begin_command_buffer(cbuf, &record_info)
                .or(Err(StratusError::INVALID))?;
        }
        Ok(())
    }

    /// Closes recording on a command buffer.
    ///
    /// cbuf - the command buffer to use
    pub(crate) fn cbuf_end_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.dev
                .end_command_buffer(cbuf)
                .or(Err(StratusError::INVALID))
        }
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory. Device
    /// local memory is resident on the GPU, while host visible memory can be
    /// read from the system side. Both of these are part of the
    /// vk::MemoryPropertyFlags type.
    ///
    /// The winning index has to have its bit set in the resource's
    /// type bitmask AND carry at least the requested property flags.
    /// None means no entry qualified, and the caller must treat that
    /// as a failure rather than picking some index anyway.
    pub(crate) fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        // for each valid memory type
        for (i, mem_type) in props.memory_types[..props.memory_type_count as usize]
            .iter()
            .enumerate()
        {
            // Bit i of memory_type_bits will be set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                // return the index into the memory type array
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocates and binds memory for `buffer`
    ///
    /// One allocation backs the buffer, bound at offset 0. If the bind
    /// fails the fresh allocation is freed before returning, leaving
    /// nothing attached to the buffer.
    pub(crate) fn alloc_buffer_memory(
        &self,
        buffer: vk::Buffer,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let req = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
        // find the memory type that suits our requirements
        let index = Self::find_memory_type_index(&self.mem_props, &req, flags)
            .ok_or(StratusError::NO_COMPATIBLE_MEMORY)?;

        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: req.size,
            memory_type_index: index,
            ..Default::default()
        };

        unsafe {
            let memory = self
                .dev
                .allocate_memory(&alloc_info, None)
                .or(Err(StratusError::OUT_OF_MEMORY))?;

            if self.dev.bind_buffer_memory(buffer, memory, 0).is_err() {
                self.free_memory(memory);
                return Err(StratusError::OUT_OF_MEMORY);
            }

            Ok(memory)
        }
    }

    /// Allocates one memory block backing every image in `images`
    ///
    /// The images are bound at packed offsets within a single
    /// allocation, each offset aligned to that image's own alignment
    /// requirement. The type search runs on the OR of the per-image
    /// type bitmasks, since one type must back them all. If any bind
    /// fails partway through, the whole block is freed before the
    /// error comes back. No partially bound allocation survives.
    pub(crate) fn alloc_images_memory(
        &self,
        images: &[vk::Image],
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        if images.is_empty() {
            return Err(StratusError::INVALID);
        }

        let reqs: Vec<vk::MemoryRequirements> = images
            .iter()
            .map(|image| unsafe { self.dev.get_image_memory_requirements(*image) })
            .collect();
        let (total, offsets, type_bits) = plan_image_packing(&reqs);
        log::debug!(
            "Packing {} images into one {} byte allocation",
            images.len(),
            total
        );

        let combined = vk::MemoryRequirements {
            size: total,
            alignment: 1,
            memory_type_bits: type_bits,
        };
        let index = Self::find_memory_type_index(&self.mem_props, &combined, flags)
            .ok_or(StratusError::NO_COMPATIBLE_MEMORY)?;

        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: total,
            memory_type_index: index,
            ..Default::default()
        };

        unsafe {
            let memory = self
                .dev
                .allocate_memory(&alloc_info, None)
                .or(Err(StratusError::OUT_OF_MEMORY))?;

            for (image, offset) in images.iter().zip(offsets.iter()) {
                if self.dev.bind_image_memory(*image, memory, *offset).is_err() {
                    // a half bound group is useless, throw the block out
                    self.free_memory(memory);
                    return Err(StratusError::OUT_OF_MEMORY);
                }
            }

            Ok(Allocation {
                a_memory: memory,
                a_size: total,
                a_offsets: offsets,
            })
        }
    }

    /// Wrapper for freeing device memory
    ///
    /// Having this in one place lets us quickly handle any additional
    /// allocation tracking
    pub(crate) unsafe fn free_memory(&self, mem: vk::DeviceMemory) {
        self.dev.free_memory(mem, None);
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// This is just a helper for `create_buffer`. It does not fill
    /// the buffer with anything.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        mode: vk::SharingMode,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(mode)
            .build();

        let buffer = unsafe {
            self.dev
                .create_buffer(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_BUFFER))?
        };

        match self.alloc_buffer_memory(buffer, flags) {
            Ok(memory) => Ok((buffer, memory)),
            Err(e) => {
                unsafe { self.dev.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    /// Writes `data` to `memory`
    ///
    /// This is a helper method for mapping and updating the value stored
    /// in device memory. Memory needs to be host visible and coherent.
    /// This does not flush after writing.
    pub(crate) fn update_memory<T: Copy>(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        if data.len() == 0 {
            return Ok(());
        }

        // Now we copy our data into the buffer
        let data_size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data_size, vk::MemoryMapFlags::empty())
                .or(Err(StratusError::OUT_OF_MEMORY))?;

            // rust doesn't have a raw memcpy, so we need to transform the void
            // ptr to a slice. This is unsafe as the length needs to be correct
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
        Ok(())
    }

    /// allocates a buffer/memory pair and fills it with `data`
    ///
    /// There are two components to a memory backed resource in vulkan:
    /// vkBuffer which is the actual buffer itself, and vkDeviceMemory which
    /// represents a region of allocated memory to hold the buffer contents.
    ///
    /// Both are returned, as both need to be destroyed when they are done.
    pub(crate) fn create_buffer<T: Copy>(
        &self,
        usage: vk::BufferUsageFlags,
        mode: vk::SharingMode,
        flags: vk::MemoryPropertyFlags,
        data: &[T],
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let size = std::mem::size_of_val(data) as u64;
        let (buffer, memory) = self.create_buffer_with_size(usage, mode, flags, size)?;

        if let Err(e) = self.update_memory(memory, 0, data) {
            unsafe {
                self.dev.destroy_buffer(buffer, None);
                self.free_memory(memory);
            }
            return Err(e);
        }

        Ok((buffer, memory))
    }

    /// Create a vkImage with no memory behind it
    ///
    /// The caller is responsible for getting the image backed, most
    /// likely by packing a group of these through `alloc_images_memory`,
    /// and for destroying it.
    pub(crate) fn create_unbacked_image(
        &self,
        resolution: &vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        tiling: vk::ImageTiling,
    ) -> Result<vk::Image> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: resolution.width,
                height: resolution.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            self.dev
                .create_image(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))
        }
    }

    /// Make a 2D color view into `image`
    pub(crate) fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .image(image)
            .format(format)
            .view_type(vk::ImageViewType::TYPE_2D);

        unsafe {
            self.dev
                .create_image_view(&view_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))
        }
    }

    /// Transitions `image` to the `new` layout using `cbuf`
    ///
    /// Images need to be manually transitioned between layouts. A
    /// normal use case is transitioning an image from an undefined
    /// layout to the transfer layout, filling it, and moving it to
    /// the optimal shader access layout. This handles exactly that
    /// pair of transitions.
    pub(crate) unsafe fn transition_image_layout(
        &self,
        image: vk::Image,
        cbuf: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) {
        // use defaults here, and set them in the next section
        let mut layout_barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .level_count(1)
                    .build(),
            )
            .build();
        let src_stage;
        let dst_stage;

        // automatically detect the pipeline src/dest stages to use
        if old == vk::ImageLayout::UNDEFINED {
            layout_barrier.src_access_mask = vk::AccessFlags::default();
            layout_barrier.dst_access_mask = vk::AccessFlags::TRANSFER_WRITE;

            src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
            dst_stage = vk::PipelineStageFlags::TRANSFER;
        } else {
            layout_barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            layout_barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

            src_stage = vk::PipelineStageFlags::TRANSFER;
            dst_stage = vk::PipelineStageFlags::FRAGMENT_SHADER;
        }

        // process the barrier we created, which will perform
        // the actual transition.
        self.dev.cmd_pipeline_barrier(
            cbuf,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[layout_barrier],
        );
    }

    /// Submits the copy command buffer and waits for it to complete
    ///
    /// The buffer MUST have been recorded before this
    pub(crate) fn copy_cbuf_submit_and_wait(&self) -> Result<()> {
        let cbufs = [self.copy_cbuf];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

        unsafe {
            let fence = self
                .dev
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .or(Err(StratusError::INVALID))?;

            if self.dev.queue_submit(self.queue, &[submit_info], fence).is_err() {
                self.dev.destroy_fence(fence, None);
                return Err(StratusError::SUBMIT_FAILED);
            }

            let ret = self
                .dev
                .wait_for_fences(&[fence], true, std::u64::MAX)
                .or(Err(StratusError::WAIT_FAILED));
            self.dev.destroy_fence(fence, None);
            ret
        }
    }

    /// Update a Vulkan image from a raw memory region
    ///
    /// This makes a staging buffer out of the MemImage contents, copies
    /// it into the image, and performs the needed layout conversions
    /// along the way. Blocks until the copy has finished, so the image
    /// is ready to sample when this returns.
    ///
    /// A stride of zero implies the data is tightly packed.
    pub(crate) fn update_image_from_data(
        &self,
        image: vk::Image,
        data: &MemImage,
    ) -> Result<()> {
        let width = data.width as u32;
        let height = data.height as u32;
        log::debug!("Using {}x{} buffer with stride {}", width, height, data.stride);

        // Adjust our stride. If the special value zero is specified then we
        // should default to tightly packed, aka the width
        let stride = match data.stride {
            0 => width,
            s => s,
        };

        // Verify our size does not overflow the data
        if stride < width
            || (stride as u64) * (height as u64) * (data.element_size as u64)
                > data.as_slice().len() as u64
        {
            return Err(StratusError::INVALID_STRIDE);
        }

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            // 0 means tightly packed.
            .buffer_row_length(data.stride)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: width,
                height: height,
                depth: 1,
            })
            .build();

        // A throwaway staging buffer that lives for this one upload
        let (transfer_buf, transfer_mem) = self.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.as_slice(),
        )?;

        let ret = self.record_and_run_image_copy(image, transfer_buf, &region);

        unsafe {
            self.dev.destroy_buffer(transfer_buf, None);
            self.free_memory(transfer_mem);
        }

        ret
    }

    fn record_and_run_image_copy(
        &self,
        image: vk::Image,
        transfer_buf: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) -> Result<()> {
        self.cbuf_begin_recording(self.copy_cbuf, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        unsafe {
            // get the image ready to be filled
            self.transition_image_layout(
                image,
                self.copy_cbuf,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            self.dev.cmd_copy_buffer_to_image(
                self.copy_cbuf,
                transfer_buf,
                image,
                // this is the layout the image is currently using
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[*region],
            );

            // now transition us into the appropriate layout for shaders
            self.transition_image_layout(
                image,
                self.copy_cbuf,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }

        self.cbuf_end_recording(self.copy_cbuf)?;
        self.copy_cbuf_submit_and_wait()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            self.dev.device_wait_idle().unwrap();

            self.dev.destroy_command_pool(self.copy_cmd_pool, None);
            self.dev.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_props(type_flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = type_flags.len() as u32;
        for (i, flags) in type_flags.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    fn make_reqs(size: u64, alignment: u64, bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: size,
            alignment: alignment,
            memory_type_bits: bits,
        }
    }

    #[test]
    fn memory_type_needs_flag_superset_and_bit() {
        // index 0 has its bit set but the wrong flags, index 1 has the
        // right flags but no bit, index 2 satisfies both
        let props = make_props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let reqs = make_reqs(64, 64, 0b101);

        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
    }

    #[test]
    fn memory_type_takes_first_match() {
        let props = make_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let reqs = make_reqs(64, 64, 0b11);

        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn memory_type_flags_may_be_a_strict_superset() {
        let props = make_props(&[vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED]);
        let reqs = make_reqs(64, 64, 0b1);

        let flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, flags),
            Some(0)
        );
    }

    #[test]
    fn memory_type_miss_is_none() {
        let props = make_props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // nothing device local in the table
        let reqs = make_reqs(64, 64, 0b11);
        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );

        // right flags exist but the bitmask rules them all out
        let reqs = make_reqs(64, 64, 0);
        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn memory_type_ignores_entries_past_count() {
        // entries beyond memory_type_count are garbage and must never
        // be considered, even if the raw array has something there
        let mut props = make_props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let reqs = make_reqs(64, 64, 0b10);
        assert_eq!(
            Device::find_memory_type_index(&props, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn packing_pads_to_each_images_alignment() {
        let reqs = [
            make_reqs(100, 64, 0b1),
            make_reqs(250, 256, 0b1),
            make_reqs(64, 16, 0b1),
        ];

        let (total, offsets, _) = plan_image_packing(&reqs);
        assert_eq!(offsets, vec![0, 256, 512]);
        // 512 + 64, with nothing after the last image
        assert_eq!(total, 576);
    }

    #[test]
    fn packing_obeys_alignment_and_never_overlaps() {
        let reqs = [
            make_reqs(1, 1, 0b1),
            make_reqs(3, 4, 0b1),
            make_reqs(17, 128, 0b1),
            make_reqs(4096, 4096, 0b1),
            make_reqs(5, 2, 0b1),
        ];

        let (total, offsets, _) = plan_image_packing(&reqs);
        for (i, req) in reqs.iter().enumerate() {
            assert_eq!(offsets[i] % req.alignment, 0);
            if i > 0 {
                assert!(offsets[i] >= offsets[i - 1] + reqs[i - 1].size);
            }
        }
        // the block ends exactly at the last image, no trailing pad
        assert_eq!(total, offsets[4] + reqs[4].size);
    }

    #[test]
    fn packing_combines_type_bits() {
        let reqs = [
            make_reqs(16, 16, 0b001),
            make_reqs(16, 16, 0b010),
            make_reqs(16, 16, 0b100),
        ];

        let (_, _, bits) = plan_image_packing(&reqs);
        assert_eq!(bits, 0b111);
    }

    #[test]
    fn packing_single_image_starts_at_zero() {
        let reqs = [make_reqs(1234, 256, 0b1)];

        let (total, offsets, bits) = plan_image_packing(&reqs);
        assert_eq!(offsets, vec![0]);
        assert_eq!(total, 1234);
        assert_eq!(bits, 0b1);
    }

    #[test]
    fn packing_empty_list_is_empty() {
        let (total, offsets, bits) = plan_image_packing(&[]);
        assert_eq!(total, 0);
        assert!(offsets.is_empty());
        assert_eq!(bits, 0);
    }
}
