extern crate stratus;
use stratus::{CreateInfo, MemImage, Stratus, StratusError, SurfaceType};

extern crate utils;
use utils::log;
use utils::timing::*;
use utils::{Context, Result};

extern crate winit;
use winit::{
    dpi::LogicalSize,
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    platform::run_return::EventLoopExtRunReturn,
    window::WindowBuilder,
};

extern crate raw_window_handle;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use std::time::Instant;

fn main() -> Result<()> {
    // winit goodies
    let mut event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("stratus-test")
        .with_inner_size(LogicalSize::new(800.0, 600.0))
        .with_resizable(true)
        .build(&event_loop)
        .context("could not create a window")?;

    let surf_type = SurfaceType::Window(
        window.raw_display_handle(),
        window.raw_window_handle(),
    );

    let info = CreateInfo::builder(surf_type)
        .resolution(800, 600)
        .app_name("stratus-test")
        .build();
    let mut stratus = Stratus::new(&info).context("could not bring up the vulkan context")?;

    // ----------- upload a test texture
    // Nothing draws this without a pipeline installed, but it runs
    // the whole upload path against the real device.
    let size = 64;
    let mut pixels: Vec<u8> = Vec::with_capacity(4 * size * size);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / 8) + (y / 8)) % 2 == 0;
            let lum = if on { 0xff } else { 0x22 };
            pixels.extend_from_slice(&[lum, lum, lum, 0xff]);
        }
    }
    let mimg = MemImage::new(pixels.as_slice().as_ptr(), 4, size, size);
    let _textures = stratus
        .create_image_group_from_bits(&[&mimg])
        .context("could not upload the test texture")?;

    let start = Instant::now();
    let mut stop = StopWatch::new();

    // ----------- now draw until the app exits
    event_loop.run_return(|event, _, control_flow| {
        *control_flow = ControlFlow::Poll;

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested
                | WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            virtual_keycode: Some(VirtualKeyCode::Escape),
                            state: ElementState::Pressed,
                            ..
                        },
                    ..
                } => *control_flow = ControlFlow::Exit,
                WindowEvent::Resized { .. } => {
                    stratus.handle_ood().unwrap();
                    let new_res = stratus.get_resolution();
                    log::debug!("resized to {}x{}", new_res.0, new_res.1);
                }
                _ => {}
            },
            Event::MainEventsCleared => {
                // ----------- pulse the clear color
                let s = start.elapsed().as_secs_f32().sin();
                let clear = [s * s, 1.0 - s * s, 0.0, 1.0];

                stop.start();

                match stratus.begin_frame() {
                    Ok(()) => {}
                    Err(StratusError::OUT_OF_DATE) => {
                        stratus.handle_ood().unwrap();
                        return;
                    }
                    Err(e) => panic!("failed to start frame: {:?}", e),
                };

                match stratus.draw_frame(clear) {
                    Ok(()) => {}
                    Err(StratusError::OUT_OF_DATE) => {
                        stratus.handle_ood().unwrap();
                        return;
                    }
                    Err(e) => panic!("failed to draw frame: {:?}", e),
                };

                // ----------- present to screen
                match stratus.present() {
                    Ok(()) => {}
                    Err(StratusError::OUT_OF_DATE) => {
                        stratus.handle_ood().unwrap();
                        return;
                    }
                    Err(e) => panic!("failed to present frame: {:?}", e),
                };

                stop.end();
                log::profiling!(
                    "stratus took {:?} ms this frame",
                    stop.get_duration().as_millis()
                );
            }
            _ => {}
        }
    });

    Ok(())
}
