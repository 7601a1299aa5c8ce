// Display handling
//
// The display is the surface and swapchain for one window. This owns
// picking the format and size, handing out swapchain image indices,
// and flipping finished frames onto the screen.
//
// Austin Shafer - 2020

use ash::extensions::khr;
use ash::vk;

extern crate utils as st_utils;
use crate::device::Device;
use crate::{CreateInfo, Result, StratusError, SurfaceType};
use st_utils::log;
use st_utils::{partial_max, partial_min};

use std::sync::Arc;

/// The only format we will render to. If the surface cannot do
/// sRGB BGRA we report it instead of silently picking something
/// with different color reproduction.
const PREFERRED_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;
const PREFERRED_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// How many images we ask the swapchain for. The surface gets the
/// final say through its min/max bounds.
const TARGET_IMAGE_COUNT: u32 = 4;

/// A presentation target
///
/// This encapsulates the surface for one window and the swapchain
/// attached to it. The swapchain's images are the things we record
/// draw commands against, indexed by whatever the presentation
/// engine hands back during acquire. That index is not the frame
/// slot number, the two advance independently.
pub struct Display {
    d_dev: Arc<Device>,
    d_surface_loader: khr::Surface,
    d_surface: vk::SurfaceKHR,
    /// caps are requeried on every recreation, the size lives here
    d_surface_caps: vk::SurfaceCapabilitiesKHR,
    d_surface_format: vk::SurfaceFormatKHR,
    d_present_mode: vk::PresentModeKHR,
    /// the current size of the chain's images
    d_resolution: vk::Extent2D,
    d_swapchain_loader: khr::Swapchain,
    d_swapchain: vk::SwapchainKHR,
    /// images presented by the swapchain
    pub(crate) d_images: Vec<vk::Image>,
    /// views for recording into the images
    pub(crate) d_views: Vec<vk::ImageView>,
}

impl Display {
    /// The list of instance extensions this surface type needs
    pub(crate) fn extension_names(info: &CreateInfo) -> Result<Vec<*const i8>> {
        let SurfaceType::Window(display_handle, _) = info.surface_type;

        Ok(ash_window::enumerate_required_extensions(display_handle)
            .or(Err(StratusError::SURFACE_NOT_FOUND))?
            .to_vec())
    }

    /// Picks the format we insist on out of the supported list
    ///
    /// There is deliberately no fallback path. Rendering into some
    /// other format would change what colors end up on screen, so a
    /// surface that can't do this pair is an error.
    fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
        formats
            .iter()
            .find(|f| f.format == PREFERRED_FORMAT && f.color_space == PREFERRED_COLOR_SPACE)
            .copied()
            .ok_or(StratusError::INVALID_FORMAT)
    }

    /// Clamp our target image count into the surface's bounds
    ///
    /// A max of zero means the surface doesn't cap the count.
    fn clamp_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
        let mut count = partial_max(TARGET_IMAGE_COUNT, caps.min_image_count);
        if caps.max_image_count > 0 {
            count = partial_min(count, caps.max_image_count);
        }
        count
    }

    /// Gets a physical resolution for the swapchain
    ///
    /// The presentation engine can pin the size through
    /// current_extent. The special value u32::MAX there means we
    /// choose, with each axis clamped into the supported range on
    /// its own.
    fn select_resolution(
        caps: &vk::SurfaceCapabilitiesKHR,
        requested: vk::Extent2D,
    ) -> vk::Extent2D {
        match caps.current_extent.width {
            std::u32::MAX => vk::Extent2D {
                width: partial_min(
                    partial_max(requested.width, caps.min_image_extent.width),
                    caps.max_image_extent.width,
                ),
                height: partial_min(
                    partial_max(requested.height, caps.min_image_extent.height),
                    caps.max_image_extent.height,
                ),
            },
            _ => caps.current_extent,
        }
    }

    /// Create an on screen Display
    ///
    /// This makes the vulkan surface for the window handles in
    /// `info` and brings up a swapchain on it. The swapchain comes
    /// up through the same path used to recreate it later.
    pub fn new(info: &CreateInfo, dev: Arc<Device>) -> Result<Self> {
        let SurfaceType::Window(display_handle, window_handle) = info.surface_type;

        let surface_loader = khr::Surface::new(&dev.inst.loader, &dev.inst.inst);
        let surface = unsafe {
            ash_window::create_surface(
                &dev.inst.loader,
                &dev.inst.inst,
                display_handle,
                window_handle,
                None,
            )
            .or(Err(StratusError::SURFACE_NOT_FOUND))?
        };

        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        // From here on `ret`'s drop cleans up the surface and any
        // part of the chain that made it up before a failure
        let mut ret = Self {
            d_dev: dev,
            d_surface_loader: surface_loader,
            d_surface: surface,
            d_surface_caps: vk::SurfaceCapabilitiesKHR::default(),
            d_surface_format: vk::SurfaceFormatKHR::default(),
            d_present_mode: vk::PresentModeKHR::FIFO,
            d_resolution: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            d_swapchain_loader: swapchain_loader,
            d_swapchain: vk::SwapchainKHR::null(),
            d_images: Vec::new(),
            d_views: Vec::new(),
        };

        // our one queue must be able to present this surface
        let supported = unsafe {
            ret.d_surface_loader
                .get_physical_device_surface_support(
                    ret.d_dev.pdev,
                    ret.d_dev.queue_family,
                    ret.d_surface,
                )
                .unwrap_or(false)
        };
        if !supported {
            return Err(StratusError::VK_SURF_NOT_SUPPORTED);
        }

        let formats = unsafe {
            ret.d_surface_loader
                .get_physical_device_surface_formats(ret.d_dev.pdev, ret.d_surface)
                .or(Err(StratusError::INVALID_FORMAT))?
        };
        ret.d_surface_format = Self::select_surface_format(&formats)?;

        let present_modes = unsafe {
            ret.d_surface_loader
                .get_physical_device_surface_present_modes(ret.d_dev.pdev, ret.d_surface)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        // fifo is the vsynced mode every implementation carries
        ret.d_present_mode = present_modes
            .iter()
            .find(|&&mode| mode == vk::PresentModeKHR::FIFO)
            .copied()
            .unwrap_or(vk::PresentModeKHR::FIFO);

        ret.recreate_swapchain()?;

        Ok(ret)
    }

    /// create a new swapchain
    ///
    /// A swapchain contains multiple images to enable presentation
    /// while the next frame is being drawn. The old chain, if any,
    /// is handed to the driver while the new one comes up and then
    /// destroyed.
    fn create_swapchain(&mut self) -> Result<()> {
        let desired_image_count = Self::clamp_image_count(&self.d_surface_caps);
        log::debug!(
            "Creating a swapchain with {} images at {}x{}",
            desired_image_count,
            self.d_resolution.width,
            self.d_resolution.height
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .flags(vk::SwapchainCreateFlagsKHR::empty())
            .surface(self.d_surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.d_surface_format.color_space)
            .image_format(self.d_surface_format.format)
            .image_extent(self.d_resolution)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(self.d_surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.d_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.d_swapchain);

        let new_swapchain = unsafe {
            self.d_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // the old chain and its views can go now
        self.destroy_swapchain();
        self.d_swapchain = new_swapchain;

        Ok(())
    }

    /// Get the vkImages representing the swapchain and create views
    /// for rendering into them
    ///
    /// Each view is a plain 2D color view with every channel mapped
    /// to itself.
    fn select_images_and_views(&mut self) -> Result<()> {
        let images = unsafe {
            self.d_swapchain_loader
                .get_swapchain_images(self.d_swapchain)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?
        };

        let mut views = Vec::with_capacity(images.len());
        for image in images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.d_surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);

            match unsafe { self.d_dev.dev.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(_) => {
                    for view in views.drain(..) {
                        unsafe { self.d_dev.dev.destroy_image_view(view, None) };
                    }
                    return Err(StratusError::COULD_NOT_CREATE_IMAGE);
                }
            }
        }

        self.d_images = images;
        self.d_views = views;

        Ok(())
    }

    /// Tear down the swapchain images/views and the chain itself
    fn destroy_swapchain(&mut self) {
        unsafe {
            for view in self.d_views.drain(..) {
                self.d_dev.dev.destroy_image_view(view, None);
            }
            // the images belong to the swapchain, they go with it
            self.d_images.clear();

            self.d_swapchain_loader
                .destroy_swapchain(self.d_swapchain, None);
            self.d_swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Recreate our swapchain.
    ///
    /// This will be done on VK_ERROR_OUT_OF_DATE_KHR, as the
    /// swapchain can no longer be used. The caps get requeried since
    /// the window size most likely changed.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        unsafe {
            self.d_dev
                .dev
                .device_wait_idle()
                .or(Err(StratusError::WAIT_FAILED))?;
        }

        self.d_surface_caps = unsafe {
            self.d_surface_loader
                .get_physical_device_surface_capabilities(self.d_dev.pdev, self.d_surface)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        self.d_resolution = Self::select_resolution(&self.d_surface_caps, self.d_resolution);

        self.create_swapchain()?;
        self.select_images_and_views()
    }

    /// Get the next available image in the swapchain
    ///
    /// The returned index picks which swapchain image to record
    /// against. `image_acquired` gets signaled once the presentation
    /// engine is done reading the image. This waits as long as it
    /// takes; the only early exit is the surface going out of date,
    /// which the caller handles by recreating the chain.
    pub fn get_next_swapchain_image(&mut self, image_acquired: vk::Semaphore) -> Result<u32> {
        loop {
            match unsafe {
                self.d_swapchain_loader.acquire_next_image(
                    self.d_swapchain,
                    std::u64::MAX,
                    image_acquired,
                    vk::Fence::null(),
                )
            } {
                // suboptimal gets folded into out of date. either way the
                // chain needs rebuilding before this index is usable
                Ok((_, true)) => return Err(StratusError::OUT_OF_DATE),
                Ok((index, false)) => {
                    log::debug!("vkAcquireNextImageKHR: got image {}", index);
                    return Ok(index);
                }
                Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                    log::debug!("vkAcquireNextImageKHR: not ready, trying again");
                    continue;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                    return Err(StratusError::OUT_OF_DATE)
                }
                Err(_) => return Err(StratusError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    /// Present image `image_index` to the screen
    ///
    /// The flip waits on `render_finished` so it can never outrun
    /// the color output for that image.
    pub fn present(&self, image_index: u32, render_finished: vk::Semaphore) -> Result<()> {
        let wait_semas = [render_finished];
        let swapchains = [self.d_swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe {
            self.d_swapchain_loader
                .queue_present(self.d_dev.queue, &info)
        } {
            Ok(false) => Ok(()),
            Ok(true) => Err(StratusError::OUT_OF_DATE),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                Err(StratusError::OUT_OF_DATE)
            }
            Err(_) => Err(StratusError::PRESENT_FAILED),
        }
    }

    /// The current size of the swapchain images
    pub fn get_resolution(&self) -> vk::Extent2D {
        self.d_resolution
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        log::debug!("Destroying display");
        unsafe {
            self.d_dev.dev.device_wait_idle().unwrap();
        }
        self.destroy_swapchain();
        unsafe {
            self.d_surface_loader.destroy_surface(self.d_surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: format,
            color_space: color_space,
        }
    }

    fn make_caps(
        min_count: u32,
        max_count: u32,
        current: (u32, u32),
        min_ext: (u32, u32),
        max_ext: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min_ext.0,
                height: min_ext.1,
            },
            max_image_extent: vk::Extent2D {
                width: max_ext.0,
                height: max_ext.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn format_selection_has_no_fallback() {
        // a surface that only offers linear rgba must be refused,
        // not silently rendered to
        let formats = [make_format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];

        assert_eq!(
            Display::select_surface_format(&formats).err(),
            Some(StratusError::INVALID_FORMAT)
        );
    }

    #[test]
    fn format_selection_finds_the_pair() {
        let formats = [
            make_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            make_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];

        let chosen = Display::select_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn format_selection_needs_matching_color_space() {
        // right pixel format, wrong color space
        let formats = [make_format(
            vk::Format::B8G8R8A8_SRGB,
            vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        )];

        assert_eq!(
            Display::select_surface_format(&formats).err(),
            Some(StratusError::INVALID_FORMAT)
        );
    }

    #[test]
    fn image_count_clamps_into_surface_bounds() {
        // target of 4 capped by a max of 3
        let caps = make_caps(1, 3, (0, 0), (0, 0), (0, 0));
        assert_eq!(Display::clamp_image_count(&caps), 3);

        // raised to meet a min of 5
        let caps = make_caps(5, 8, (0, 0), (0, 0), (0, 0));
        assert_eq!(Display::clamp_image_count(&caps), 5);

        // max of zero means unbounded above
        let caps = make_caps(1, 0, (0, 0), (0, 0), (0, 0));
        assert_eq!(Display::clamp_image_count(&caps), 4);

        // inside the range already
        let caps = make_caps(2, 16, (0, 0), (0, 0), (0, 0));
        assert_eq!(Display::clamp_image_count(&caps), 4);
    }

    #[test]
    fn resolution_uses_pinned_extent() {
        let caps = make_caps(1, 0, (640, 480), (1, 1), (4096, 4096));
        let requested = vk::Extent2D {
            width: 1920,
            height: 1080,
        };

        let res = Display::select_resolution(&caps, requested);
        assert_eq!((res.width, res.height), (640, 480));
    }

    #[test]
    fn resolution_clamps_each_axis_independently() {
        let unset = std::u32::MAX;
        let caps = make_caps(1, 0, (unset, unset), (200, 100), (800, 600));

        // width over the max, height under the min
        let requested = vk::Extent2D {
            width: 1000,
            height: 50,
        };
        let res = Display::select_resolution(&caps, requested);
        assert_eq!((res.width, res.height), (800, 100));

        // both in range pass through untouched
        let requested = vk::Extent2D {
            width: 300,
            height: 300,
        };
        let res = Display::select_resolution(&caps, requested);
        assert_eq!((res.width, res.height), (300, 300));
    }
}
