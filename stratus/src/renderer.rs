// A vulkan frame runner
//
// This layer is very low, and as a result is mostly unsafe. Nothing
// in here knows about scenes or geometry, it just drives the per
// frame record/submit/present cycle against the display's images.
//
// Austin Shafer - 2020
use ash::vk;

extern crate utils as st_utils;
use crate::device::Device;
use crate::display::Display;
use crate::{Result, StratusError};
use st_utils::log;

use std::sync::Arc;

/// Parameters for a pipeline's draw hook
///
/// This is the recording state for one frame. The command buffer is
/// open for recording inside a rendering pass when the hook runs.
#[derive(Debug, Copy, Clone)]
pub struct RecordParams {
    pub cbuf: vk::CommandBuffer,
    /// index of the swapchain image being drawn into
    pub image_num: usize,
    /// the current size of that image
    pub resolution: vk::Extent2D,
}

/// A pipeline draws the actual frame contents
///
/// Stratus clears the image and handles all the ordering around it.
/// Anything that wants pixels beyond the clear color implements this
/// and gets called inside the rendering pass.
pub trait Pipeline {
    fn draw(&mut self, dev: &Device, params: &RecordParams);

    /// Tear down any vulkan objects before the device goes away
    fn destroy(&mut self, dev: &Device);
}

/// The slot after `cur` in the rotation
fn next_slot(cur: usize, count: usize) -> usize {
    (cur + 1) % count
}

/// One frame's worth of reusable recording state
///
/// Everything the cpu side needs to run one in-flight frame: the
/// cbuf we record into and the primitives fencing its reuse. A
/// slot's pieces always travel together, they are never mixed with
/// another slot's.
struct FrameSlot {
    /// commands for this slot, re-recorded every time around
    fs_cbuf: vk::CommandBuffer,
    /// signaled when the acquired image is really free to write
    fs_image_acquired: vk::Semaphore,
    /// signaled when our color output is done. present waits on it
    fs_render_finished: vk::Semaphore,
    /// cpu-visible completion flag for this slot's last submission
    fs_submit_fence: vk::Fence,
}

/// Runs frames
///
/// This owns the frame slots and the two counters driving the loop:
/// the slot counter, which wraps modulo the slot count and advances
/// only after a successful present, and the last acquired image
/// index, which the presentation engine hands out on its own
/// schedule. The two are unrelated and must never be conflated.
pub struct Renderer {
    /// The vulkan device this renderer submits on
    pub(crate) r_dev: Arc<Device>,
    /// pool the slot cbufs come from
    r_cmd_pool: vk::CommandPool,
    r_slots: Vec<FrameSlot>,
    /// index into r_slots for the frame being built
    r_current_slot: usize,
    /// index the last acquire returned
    r_current_image: u32,
    /// set between a submission and its present, gates present
    r_draw_call_submitted: bool,
}

impl Renderer {
    /// Create a new Renderer with `frames_in_flight` slots
    ///
    /// The slot count bounds how far the cpu can run ahead of the
    /// gpu and has nothing to do with how many images the display's
    /// swapchain holds.
    pub fn new(dev: Arc<Device>, frames_in_flight: usize) -> Result<Self> {
        let count = frames_in_flight.max(1);

        let mut ret = Self {
            r_dev: dev,
            r_cmd_pool: vk::CommandPool::null(),
            r_slots: Vec::with_capacity(count),
            r_current_slot: 0,
            r_current_image: 0,
            r_draw_call_submitted: false,
        };

        // on any failure from here ret is dropped, cleaning up the
        // pool and however many slots were finished
        ret.r_cmd_pool = ret.r_dev.create_command_pool(ret.r_dev.queue_family)?;
        let cbufs = ret.r_dev.create_command_buffers(ret.r_cmd_pool, count as u32)?;
        for cbuf in cbufs {
            let slot = ret.create_slot(cbuf)?;
            ret.r_slots.push(slot);
        }

        log::debug!("Renderer running with {} frame slots", count);

        Ok(ret)
    }

    /// Make the sync primitives for one slot
    ///
    /// The fence starts out signaled so the first wait on this slot
    /// falls straight through.
    fn create_slot(&self, cbuf: vk::CommandBuffer) -> Result<FrameSlot> {
        let sema_create_info = vk::SemaphoreCreateInfo::default();

        unsafe {
            let image_acquired = self
                .r_dev
                .dev
                .create_semaphore(&sema_create_info, None)
                .or(Err(StratusError::INVALID))?;

            let render_finished = match self.r_dev.dev.create_semaphore(&sema_create_info, None) {
                Ok(sema) => sema,
                Err(_) => {
                    self.r_dev.dev.destroy_semaphore(image_acquired, None);
                    return Err(StratusError::INVALID);
                }
            };

            let fence = match self.r_dev.dev.create_fence(
                &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            ) {
                Ok(fence) => fence,
                Err(_) => {
                    self.r_dev.dev.destroy_semaphore(image_acquired, None);
                    self.r_dev.dev.destroy_semaphore(render_finished, None);
                    return Err(StratusError::INVALID);
                }
            };

            Ok(FrameSlot {
                fs_cbuf: cbuf,
                fs_image_acquired: image_acquired,
                fs_render_finished: render_finished,
                fs_submit_fence: fence,
            })
        }
    }

    /// Wait for the current slot's previous submission
    ///
    /// This is the backpressure bounding cpu run-ahead: the slot
    /// cannot be touched again until the gpu reports it retired.
    pub fn wait_for_prev_submit(&self) -> Result<()> {
        let fence = self.r_slots[self.r_current_slot].fs_submit_fence;

        unsafe {
            match self.r_dev.dev.wait_for_fences(
                &[fence],
                true,          // wait for all
                std::u64::MAX, // timeout
            ) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    log::error!("GPU lost while waiting on a frame slot");
                    Err(StratusError::WAIT_FAILED)
                }
                Err(_) => Err(StratusError::WAIT_FAILED),
            }
        }
    }

    /// Start a frame on the current slot
    ///
    /// Waits out the slot's previous use, then acquires the next
    /// swapchain image, signaling this slot's image_acquired
    /// semaphore once the image is writable. An out of date surface
    /// propagates up from the acquire for the caller to handle.
    pub fn begin_frame(&mut self, display: &mut Display) -> Result<()> {
        self.wait_for_prev_submit()?;
        self.r_draw_call_submitted = false;

        // the slot is ours now. put the fence back to unsignaled for
        // the submission at the end of recording
        let fence = self.r_slots[self.r_current_slot].fs_submit_fence;
        unsafe {
            self.r_dev
                .dev
                .reset_fences(&[fence])
                .or(Err(StratusError::INVALID))?;
        }

        let image_acquired = self.r_slots[self.r_current_slot].fs_image_acquired;
        self.r_current_image = display.get_next_swapchain_image(image_acquired)?;

        Ok(())
    }

    /// Record and submit the current frame
    ///
    /// Re-records the slot's cbuf from scratch: transition the
    /// acquired image into the renderable layout, clear it inside a
    /// rendering pass (running the pipeline hook if there is one),
    /// then transition it into the presentable layout. The
    /// submission waits on image_acquired at the color output stage
    /// and signals render_finished plus the slot's fence.
    pub fn draw_frame(
        &mut self,
        display: &Display,
        clear: [f32; 4],
        mut pipe: Option<&mut Box<dyn Pipeline>>,
    ) -> Result<()> {
        let slot = &self.r_slots[self.r_current_slot];
        let cbuf = slot.fs_cbuf;
        let image_num = self.r_current_image as usize;
        let image = display.d_images[image_num];
        let view = display.d_views[image_num];
        let resolution = display.get_resolution();

        self.r_dev
            .cbuf_begin_recording(cbuf, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        unsafe {
            // acquired images come back in an undefined layout, get
            // this one ready for color output. Keeping the source
            // stage at color output chains this transition behind
            // the image_acquired wait below.
            let to_renderable = vk::ImageMemoryBarrier::builder()
                .image(image)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
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
            self.r_dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_renderable],
            );

            let clear_value = vk::ClearValue {
                color: vk::ClearColorValue { float32: clear },
            };
            let color_attachments = [vk::RenderingAttachmentInfoKHR::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear_value)
                .build()];
            let rendering_info = vk::RenderingInfoKHR::builder()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: resolution,
                })
                .layer_count(1)
                .color_attachments(&color_attachments);

            self.r_dev
                .dynamic_rendering_loader
                .cmd_begin_rendering(cbuf, &rendering_info);

            if let Some(ref mut pipeline) = pipe {
                let params = RecordParams {
                    cbuf: cbuf,
                    image_num: image_num,
                    resolution: resolution,
                };
                pipeline.draw(&self.r_dev, &params);
            }

            self.r_dev.dynamic_rendering_loader.cmd_end_rendering(cbuf);

            // done drawing, make the image presentable
            let to_presentable = vk::ImageMemoryBarrier::builder()
                .image(image)
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
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
            self.r_dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_presentable],
            );
        }

        self.r_dev.cbuf_end_recording(cbuf)?;

        // submit, waiting for the image and flagging both the gpu
        // side (render_finished) and cpu side (fence) completions
        let wait_semas = [slot.fs_image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cbufs = [cbuf];
        let signal_semas = [slot.fs_render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build();

        unsafe {
            self.r_dev
                .dev
                .queue_submit(self.r_dev.queue, &[submit_info], slot.fs_submit_fence)
                .or(Err(StratusError::SUBMIT_FAILED))?;
        }
        self.r_draw_call_submitted = true;

        Ok(())
    }

    /// Present the submitted frame
    ///
    /// Flips the acquired image onto the screen once render_finished
    /// signals. The slot counter advances only when the present
    /// actually went through; a failed present leaves it put so the
    /// frame can be retried after the swapchain is rebuilt.
    pub fn present(&mut self, display: &Display) -> Result<()> {
        if !self.r_draw_call_submitted {
            log::error!("present called with no submitted frame");
            return Err(StratusError::INVALID);
        }

        let slot = &self.r_slots[self.r_current_slot];
        display.present(self.r_current_image, slot.fs_render_finished)?;

        self.r_draw_call_submitted = false;
        self.r_current_slot = next_slot(self.r_current_slot, self.r_slots.len());

        Ok(())
    }

    /// Throw out and rebuild every slot's sync primitives
    ///
    /// After the surface goes out of date an acquire can leave a
    /// signal pending on an image_acquired semaphore with nobody
    /// left to consume it. Fresh semaphores put each slot back in a
    /// known state, and the fences come back signaled just like at
    /// creation since nothing is in flight once the device idled.
    pub fn reset_sync_primitives(&mut self) -> Result<()> {
        let dev = &self.r_dev;
        let sema_create_info = vk::SemaphoreCreateInfo::default();

        for slot in self.r_slots.iter_mut() {
            unsafe {
                dev.dev.destroy_semaphore(slot.fs_image_acquired, None);
                slot.fs_image_acquired = vk::Semaphore::null();
                dev.dev.destroy_semaphore(slot.fs_render_finished, None);
                slot.fs_render_finished = vk::Semaphore::null();
                dev.dev.destroy_fence(slot.fs_submit_fence, None);
                slot.fs_submit_fence = vk::Fence::null();

                slot.fs_image_acquired = dev
                    .dev
                    .create_semaphore(&sema_create_info, None)
                    .or(Err(StratusError::INVALID))?;
                slot.fs_render_finished = dev
                    .dev
                    .create_semaphore(&sema_create_info, None)
                    .or(Err(StratusError::INVALID))?;
                slot.fs_submit_fence = dev
                    .dev
                    .create_fence(
                        &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                        None,
                    )
                    .or(Err(StratusError::INVALID))?;
            }
        }

        self.r_draw_call_submitted = false;

        Ok(())
    }
}

// This is pretty straightforward, things are destroyed in roughly
// the reverse order that they were created in. Don't forget to add
// new fields of Renderer here if needed.
impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            log::profiling!("Stopping the renderer");

            // first wait for the device to finish working
            self.r_dev.dev.device_wait_idle().unwrap();

            for slot in self.r_slots.iter() {
                self.r_dev.dev.destroy_semaphore(slot.fs_image_acquired, None);
                self.r_dev
                    .dev
                    .destroy_semaphore(slot.fs_render_finished, None);
                self.r_dev.dev.destroy_fence(slot.fs_submit_fence, None);
            }
            self.r_dev.dev.destroy_command_pool(self.r_cmd_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn slot_rotation_wraps() {
        assert_eq!(next_slot(0, 2), 1);
        assert_eq!(next_slot(1, 2), 0);
        assert_eq!(next_slot(2, 4), 3);
        assert_eq!(next_slot(3, 4), 0);
        // a single slot always maps to itself
        assert_eq!(next_slot(0, 1), 0);
    }

    #[test]
    fn slot_and_image_counters_wrap_independently() {
        // 2 slots rotating against 3 images: the pairing drifts each
        // frame and only realigns after lcm(2, 3) frames
        let slots = 2;
        let images = 3;

        let mut slot = 0;
        let mut image = 0;
        let mut pairs = Vec::new();
        for _ in 0..6 {
            pairs.push((slot, image));
            slot = next_slot(slot, slots);
            image = (image + 1) % images;
        }

        assert_eq!(pairs, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1), (1, 2)]);
    }

    #[derive(Debug, PartialEq)]
    enum Ev {
        Record(usize),
        Retire(usize),
    }

    // Drives the loop's gating policy against a gpu that retires
    // work as late as it possibly can, and checks that no slot is
    // ever re-recorded while its previous submission is still out.
    #[test]
    fn slot_never_rerecorded_before_fence_observed() {
        let slot_count = 2;
        // fences start signaled, same as FrameSlot creation
        let mut fence_signaled = vec![true; slot_count];
        let mut in_flight: VecDeque<usize> = VecDeque::new();
        let mut events = Vec::new();

        let mut cur = 0;
        for _frame in 0..100 {
            // wait_for_prev_submit: the gpu retires oldest-first
            // until this slot's fence reads signaled
            while !fence_signaled[cur] {
                let done = in_flight.pop_front().unwrap();
                fence_signaled[done] = true;
                events.push(Ev::Retire(done));
            }
            // reset + re-record + submit
            fence_signaled[cur] = false;
            events.push(Ev::Record(cur));
            in_flight.push_back(cur);

            assert!(
                in_flight.len() <= slot_count,
                "cpu ran ahead of the slot pool"
            );

            cur = next_slot(cur, slot_count);
        }

        // replay the log: a second Record on a slot must come after
        // a Retire of that slot's earlier submission
        let mut outstanding = vec![false; slot_count];
        for ev in events.iter() {
            match ev {
                Ev::Record(slot) => {
                    assert!(
                        !outstanding[*slot],
                        "slot {} re-recorded while still in flight",
                        slot
                    );
                    outstanding[*slot] = true;
                }
                Ev::Retire(slot) => outstanding[*slot] = false,
            }
        }
    }
}
