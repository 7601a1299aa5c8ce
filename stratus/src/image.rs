// Gpu images uploaded from cpu memory
//
// These are sampled textures a pipeline can read from. Nothing here
// is wired into the clear pass itself, images exist for whatever the
// installed pipeline wants to draw with them.
//
// Austin Shafer - 2020
extern crate utils as st_utils;

use crate::device::{Allocation, Device};
use crate::{Result, StratusError};
use st_utils::log;
use st_utils::MemImage;

use std::sync::Arc;

use ash::vk;

// For now we only support one format.
const TARGET_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// One filled, sampleable gpu image
///
/// Always lives inside an ImageGroup, which owns the device memory
/// backing it.
pub struct Image {
    i_image: vk::Image,
    i_view: vk::ImageView,
    /// byte offset of this image inside its group's memory block
    i_offset: vk::DeviceSize,
    i_resolution: vk::Extent2D,
}

impl Image {
    pub fn get_view(&self) -> vk::ImageView {
        self.i_view
    }

    pub fn get_resolution(&self) -> vk::Extent2D {
        self.i_resolution
    }

    /// Where this image was bound inside its group's allocation
    pub fn get_offset(&self) -> vk::DeviceSize {
        self.i_offset
    }
}

/// A set of images packed into one device memory block
///
/// Creating the group allocates a single block sized for all the
/// members, binds each member at its packed offset, and uploads the
/// provided bits. The group owns the block, so dropping it releases
/// every image at once. Single images are just a group of one.
pub struct ImageGroup {
    ig_dev: Arc<Device>,
    ig_images: Vec<Image>,
    ig_mem: Allocation,
}

impl ImageGroup {
    /// Upload `bits` into a new group of device local images
    ///
    /// One entry in, one image out, in the same order. The data goes
    /// through a staging buffer and the upload blocks, so the images
    /// are ready to sample when this returns.
    pub fn new(dev: Arc<Device>, bits: &[&MemImage]) -> Result<Self> {
        if bits.is_empty() {
            return Err(StratusError::INVALID);
        }

        log::debug!("Creating an image group of {} images", bits.len());

        // make the raw unbacked images first so their combined
        // memory requirements can be measured
        let mut images = Vec::with_capacity(bits.len());
        for data in bits.iter() {
            let resolution = vk::Extent2D {
                width: data.width as u32,
                height: data.height as u32,
            };
            match dev.create_unbacked_image(
                &resolution,
                TARGET_FORMAT,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageTiling::OPTIMAL,
            ) {
                Ok(image) => images.push(image),
                Err(e) => {
                    Self::destroy_raw_images(&dev, &images);
                    return Err(e);
                }
            }
        }

        let mem = match dev.alloc_images_memory(&images, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(mem) => mem,
            Err(e) => {
                Self::destroy_raw_images(&dev, &images);
                return Err(e);
            }
        };

        // from here the group owns whatever has a view, those
        // unwind through its Drop. Raw images that haven't been
        // wrapped yet are still ours to destroy by hand on failure.
        let mut ret = Self {
            ig_dev: dev,
            ig_images: Vec::with_capacity(images.len()),
            ig_mem: mem,
        };

        for (i, data) in bits.iter().enumerate() {
            let image = images[i];
            let view =
                match ret
                    .ig_dev
                    .create_image_view(image, TARGET_FORMAT, vk::ImageAspectFlags::COLOR)
                {
                    Ok(view) => view,
                    Err(e) => {
                        Self::destroy_raw_images(&ret.ig_dev, &images[i..]);
                        return Err(e);
                    }
                };

            ret.ig_images.push(Image {
                i_image: image,
                i_view: view,
                i_offset: ret.ig_mem.a_offsets[i],
                i_resolution: vk::Extent2D {
                    width: data.width as u32,
                    height: data.height as u32,
                },
            });

            if let Err(e) = ret.ig_dev.update_image_from_data(image, data) {
                Self::destroy_raw_images(&ret.ig_dev, &images[i + 1..]);
                return Err(e);
            }
        }

        Ok(ret)
    }

    fn destroy_raw_images(dev: &Device, images: &[vk::Image]) {
        for image in images.iter() {
            unsafe { dev.dev.destroy_image(*image, None) };
        }
    }

    pub fn images(&self) -> &[Image] {
        self.ig_images.as_slice()
    }

    pub fn image_count(&self) -> usize {
        self.ig_images.len()
    }
}

impl Drop for ImageGroup {
    fn drop(&mut self) {
        unsafe {
            self.ig_dev.dev.device_wait_idle().unwrap();

            // views before images, images before the block backing
            // them
            for image in self.ig_images.iter() {
                self.ig_dev.dev.destroy_image_view(image.i_view, None);
                self.ig_dev.dev.destroy_image(image.i_image, None);
            }
            self.ig_dev.free_memory(self.ig_mem.a_memory);
        }
    }
}
