/// Stratus tests
///
/// These talk to the real vulkan loader, so on machines without an
/// icd (most ci runners) each test skips itself instead of failing.
/// Nothing in here makes a swapchain, that needs a live window.
///
/// Austin Shafer - 2024
use crate as st;

use ash::vk;
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, XlibDisplayHandle, XlibWindowHandle,
};
use std::sync::Arc;

/// A CreateInfo that never touches a real window
///
/// The handles are only dereferenced when a surface is made, which
/// these tests never do.
fn test_create_info() -> st::CreateInfo {
    let display = RawDisplayHandle::Xlib(XlibDisplayHandle::empty());
    let window = RawWindowHandle::Xlib(XlibWindowHandle::empty());

    st::CreateInfo::builder(st::SurfaceType::Window(display, window))
        .app_name("stratus-tests")
        .build()
}

/// Get a device to run against, or None if this machine can't
fn init_device() -> Option<Arc<st::Device>> {
    let info = test_create_info();

    let inst = match st::Instance::new(&info) {
        Ok(inst) => Arc::new(inst),
        Err(e) => {
            eprintln!("skipping: no usable vulkan instance ({:?})", e);
            return None;
        }
    };

    match st::Device::new(inst) {
        Ok(dev) => Some(Arc::new(dev)),
        Err(e) => {
            eprintln!("skipping: no usable vulkan device ({:?})", e);
            None
        }
    }
}

#[test]
fn debug_utils_extension_follows_build_type() {
    let info = test_create_info();

    // release builds request exactly the surface extension set,
    // debug builds tack the debug utils extension onto it
    let surface_only = st::Display::extension_names(&info).unwrap().len();
    let requested = st::Instance::extension_names(&info).unwrap().len();
    assert_eq!(requested, surface_only + cfg!(debug_assertions) as usize);
}

#[test]
fn device_comes_up() {
    // the value here is Device::new running against a live driver,
    // including queue selection and the copy cbuf setup
    let _ = init_device();
}

#[test]
fn create_filled_buffer() {
    let dev = match init_device() {
        Some(dev) => dev,
        None => return,
    };

    let data: Vec<u32> = (0..256).collect();
    let (buffer, memory) = dev
        .create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.as_slice(),
        )
        .unwrap();

    unsafe {
        dev.dev.destroy_buffer(buffer, None);
        dev.free_memory(memory);
    }
}

#[test]
fn upload_image_group() {
    let dev = match init_device() {
        Some(dev) => dev,
        None => return,
    };

    // ------------ init the images -------------
    let size = 64;
    let pixels: Vec<u8> = std::iter::repeat(128).take(4 * size * size).collect();
    let img = st::MemImage::new(pixels.as_ptr(), 4, size, size);

    let small: Vec<u8> = std::iter::repeat(255).take(4 * 16 * 16).collect();
    let small_img = st::MemImage::new(small.as_ptr(), 4, 16, 16);

    // ------------ upload -------------
    let group = st::ImageGroup::new(dev, &[&img, &small_img]).unwrap();

    assert_eq!(group.image_count(), 2);
    // members are packed in order into one block
    assert_eq!(group.images()[0].get_offset(), 0);
    assert!(group.images()[1].get_offset() > 0);
    assert_eq!(group.images()[0].get_resolution().width, 64);
    assert_eq!(group.images()[1].get_resolution().width, 16);
}

#[test]
fn upload_rejects_bad_stride() {
    let dev = match init_device() {
        Some(dev) => dev,
        None => return,
    };

    let pixels: Vec<u8> = std::iter::repeat(0).take(4 * 16 * 16).collect();
    let mut img = st::MemImage::new(pixels.as_ptr(), 4, 16, 16);
    // a stride smaller than the width can't describe this image
    img.set_stride(8);

    assert_eq!(
        st::ImageGroup::new(dev, &[&img]).err(),
        Some(st::StratusError::INVALID_STRIDE)
    );
}

#[test]
fn empty_image_group_is_invalid() {
    let dev = match init_device() {
        Some(dev) => dev,
        None => return,
    };

    assert_eq!(
        st::ImageGroup::new(dev, &[]).err(),
        Some(st::StratusError::INVALID)
    );
}
