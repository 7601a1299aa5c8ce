//! # The Stratus presentation core.
//!
//! Stratus owns the path from "give me a window sized image" to
//! "that image is on screen". It picks a vulkan device, builds a
//! swapchain over the window's raw handles, rotates a small set of
//! in-flight frame slots, and hands a cleared renderable image to an
//! optional pipeline hook every frame. It knows nothing about
//! scenes, geometry, or windowing toolkits.
//!
//! ## Drawing API
//!
//! The general flow of a stratus client is as follows:
//! * Fill out a `CreateInfo` with the window's raw handles
//!   (`CreateInfo::builder`)
//! * Create the context (`Stratus::new`)
//! * Optionally upload textures (`create_image_group_from_bits`) and
//!   install a `Pipeline` for real drawing (`set_pipeline`)
//! * Every frame: `begin_frame`, `draw_frame` with a clear color,
//!   then `present`
//! * Whenever one of those returns `OUT_OF_DATE`, call `handle_ood`
//!   and run the frame again
//!
//! ```no_run
//! use stratus as st;
//!
//! # fn run(display: raw_window_handle::RawDisplayHandle,
//! #        window: raw_window_handle::RawWindowHandle) {
//! let info = st::CreateInfo::builder(st::SurfaceType::Window(display, window))
//!     .resolution(640, 480)
//!     .build();
//! let mut stratus = st::Stratus::new(&info).unwrap();
//!
//! loop {
//!     match stratus
//!         .begin_frame()
//!         .and_then(|_| stratus.draw_frame([0.0, 0.0, 0.0, 1.0]))
//!         .and_then(|_| stratus.present())
//!     {
//!         Ok(()) => {}
//!         Err(st::StratusError::OUT_OF_DATE) => stratus.handle_ood().unwrap(),
//!         Err(e) => panic!("frame failed: {:?}", e),
//!     }
//! }
//! # }
//! ```
//!
//! ## Requirements
//!
//! Stratus requires a system with vulkan 1.2+ installed. The
//! following extensions are used:
//! * VK_KHR_surface
//! * VK_KHR_swapchain
//! * VK_KHR_dynamic_rendering
//! * VK_EXT_debug_utils (debug builds only)

// Austin Shafer - 2020
#![allow(non_camel_case_types)]

extern crate thiserror;
use thiserror::Error;

extern crate raw_window_handle;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

mod device;
mod display;
mod image;
mod instance;
mod renderer;

#[cfg(test)]
mod tests;

pub use device::Device;
pub use display::Display;
pub use image::{Image, ImageGroup};
pub use instance::Instance;
pub use renderer::{Pipeline, RecordParams, Renderer};

// Re-export some things from utils so clients
// can use them
extern crate utils;
pub use crate::utils::MemImage;

use std::sync::Arc;

/// Stratus error codes
///
/// Most of these wrap the vulkan failure that caused them and are
/// fatal. `OUT_OF_DATE` is the exception: it means the surface
/// changed shape and the caller should run `handle_ood` and retry
/// the frame.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum StratusError {
    // getting a context up
    #[error("Could not load the vulkan library")]
    VULKAN_NOT_AVAILABLE,
    #[error("Could not create a vulkan instance")]
    COULD_NOT_CREATE_INSTANCE,
    #[error("No device offers a graphics+compute+transfer queue")]
    NO_SUITABLE_DEVICE,
    #[error("Could not create a vulkan device")]
    COULD_NOT_CREATE_DEVICE,

    // surface and swapchain
    #[error("Could not create a surface from the window handles")]
    SURFACE_NOT_FOUND,
    #[error("The device queue cannot present to this surface")]
    VK_SURF_NOT_SUPPORTED,
    #[error("The surface does not offer the required format")]
    INVALID_FORMAT,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,

    // memory and resources
    #[error("No memory type satisfies this allocation")]
    NO_COMPATIBLE_MEMORY,
    #[error("Could not allocate or bind device memory")]
    OUT_OF_MEMORY,
    #[error("Could not create a buffer")]
    COULD_NOT_CREATE_BUFFER,
    #[error("Could not create an image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("The image stride does not match the data dimensions")]
    INVALID_STRIDE,

    // running frames
    #[error("Failed to acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("vkQueueSubmit failed")]
    SUBMIT_FAILED,
    #[error("vkQueuePresent failed")]
    PRESENT_FAILED,
    #[error("Waiting on a fence failed")]
    WAIT_FAILED,
    #[error("The swapchain is out of date and needs to be recreated")]
    OUT_OF_DATE,
    #[error("Invalid operation")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, StratusError>;

/// Tells stratus what kind of surface to attach to
///
/// Only windows handed over as raw handles are supported right now,
/// but this leaves room for headless or direct to display backends.
#[derive(Copy, Clone)]
pub enum SurfaceType {
    Window(RawDisplayHandle, RawWindowHandle),
}

/// Parameters for Stratus creation.
///
/// Filled out through `CreateInfo::builder`. The resolution is only
/// a request, the surface may pin its own size, and `handle_ood`
/// will requery it whenever the window changes.
pub struct CreateInfo {
    pub surface_type: SurfaceType,
    pub width: u32,
    pub height: u32,
    /// how many frames the cpu may record before blocking on the
    /// gpu. Unrelated to the swapchain's image count
    pub frames_in_flight: usize,
    pub app_name: String,
}

impl CreateInfo {
    /// The surface is the one thing with no usable default, so the
    /// builder starts from it.
    pub fn builder(surface_type: SurfaceType) -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                surface_type: surface_type,
                width: 640,
                height: 480,
                frames_in_flight: 2,
                app_name: "stratus".to_string(),
            },
        }
    }
}

/// Implements the builder pattern for easier stratus creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}
impl CreateInfoBuilder {
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.ci.width = width;
        self.ci.height = height;
        self
    }

    pub fn frames_in_flight(mut self, count: usize) -> Self {
        self.ci.frames_in_flight = count;
        self
    }

    pub fn app_name(mut self, name: &str) -> Self {
        self.ci.app_name = name.to_string();
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// The stratus context
///
/// One of these per window. Holds the whole vulkan stack, the
/// instance rides along inside the device and outlives it.
pub struct Stratus {
    /// Application specific draw code, installed by the app
    st_pipe: Option<Box<dyn Pipeline>>,

    // field order matters from here down, these are dropped
    // top to bottom
    st_rend: Renderer,
    st_display: Display,
    st_dev: Arc<Device>,
}

// This is the public facing stratus api. Don't change it
impl Stratus {
    pub fn new(info: &CreateInfo) -> Result<Stratus> {
        let instance = Arc::new(Instance::new(info)?);
        let dev = Arc::new(Device::new(instance)?);
        let display = Display::new(info, dev.clone())?;
        let rend = Renderer::new(dev.clone(), info.frames_in_flight)?;

        Ok(Stratus {
            st_pipe: None,
            st_rend: rend,
            st_display: display,
            st_dev: dev,
        })
    }

    /// The current size of the images being presented
    pub fn get_resolution(&self) -> (u32, u32) {
        let res = self.st_display.get_resolution();
        (res.width, res.height)
    }

    /// Get a handle to the device backing this context
    ///
    /// Pipelines need this to make their own vulkan objects.
    pub fn get_dev(&self) -> Arc<Device> {
        self.st_dev.clone()
    }

    /// Install the pipeline that draws frame contents
    ///
    /// Replaces and tears down any previously installed pipeline.
    /// Without one, frames are just the clear color.
    pub fn set_pipeline(&mut self, pipe: Box<dyn Pipeline>) {
        if let Some(mut old) = self.st_pipe.replace(pipe) {
            old.destroy(&self.st_dev);
        }
    }

    /// Upload one texture from raw bits
    ///
    /// A group of one. See `create_image_group_from_bits`.
    pub fn create_image_from_bits(&mut self, img: &MemImage) -> Result<ImageGroup> {
        self.create_image_group_from_bits(&[img])
    }

    /// Upload a set of textures into one device memory block
    ///
    /// The returned group owns the images and their backing memory.
    /// The upload blocks until the contents are ready to sample.
    pub fn create_image_group_from_bits(&mut self, bits: &[&MemImage]) -> Result<ImageGroup> {
        ImageGroup::new(self.st_dev.clone(), bits)
    }

    /// Start the next frame
    ///
    /// Waits until the frame slot is free again and acquires the
    /// image this frame will draw into.
    pub fn begin_frame(&mut self) -> Result<()> {
        self.st_rend.begin_frame(&mut self.st_display)
    }

    /// Record and submit the frame
    ///
    /// The acquired image is cleared to `clear` and the installed
    /// pipeline, if any, draws on top of it.
    pub fn draw_frame(&mut self, clear: [f32; 4]) -> Result<()> {
        self.st_rend
            .draw_frame(&self.st_display, clear, self.st_pipe.as_mut())
    }

    /// Put the submitted frame on screen
    pub fn present(&mut self) -> Result<()> {
        self.st_rend.present(&self.st_display)
    }

    /// Recover from an out of date surface
    ///
    /// Rebuilds the swapchain against the window's current state and
    /// resets the frame slots. Call this when any of the frame calls
    /// return `OUT_OF_DATE`, then run the frame again.
    pub fn handle_ood(&mut self) -> Result<()> {
        self.st_display.recreate_swapchain()?;
        self.st_rend.reset_sync_primitives()?;
        Ok(())
    }
}

impl Drop for Stratus {
    fn drop(&mut self) {
        // give the pipeline a chance to free its vulkan objects
        // while the device is still alive
        if let Some(mut pipe) = self.st_pipe.take() {
            pipe.destroy(&self.st_dev);
        }
        // the remaining fields drop themselves, in order
    }
}
