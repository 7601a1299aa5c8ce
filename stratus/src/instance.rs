// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context

use ash::extensions::ext;
use ash::{vk, Entry};

extern crate utils as st_utils;
use crate::display::Display;
use crate::{CreateInfo, Result, StratusError};
use st_utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    println!();
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which Stratus will use internally to render.
pub struct Instance {
    /// debug callback sugar mentioned earlier. Only wired up on
    /// debug builds, release builds skip the extension entirely
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_INSTANCE))?
        };
        return Ok((dr_loader, callback));
    }

    /// The instance extensions we turn on
    ///
    /// The surface extensions for this window system, plus debug
    /// utils when the validation machinery is in play.
    pub(crate) fn extension_names(info: &CreateInfo) -> Result<Vec<*const i8>> {
        let mut names = Display::extension_names(info)?;
        if cfg!(debug_assertions) {
            names.push(ext::DebugUtils::name().as_ptr());
        }
        Ok(names)
    }

    /// Create a vkInstance
    ///
    ///Akin to a session handle. The entry is loaded from the system's
    /// vulkan library at runtime, so startup on a box with no vulkan
    /// reports an error instead of failing to link.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry =
            unsafe { Entry::load().or(Err(StratusError::VULKAN_NOT_AVAILABLE))? };
        let app_name = CString::new(info.app_name.as_str()).unwrap();

        let layer_names = vec![
            #[cfg(debug_assertions)]
            CString::new("VK_LAYER_KHRONOS_validation").unwrap(),
        ];

        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let extension_names_raw = Self::extension_names(info)?;

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_INSTANCE))?
        };

        let debug = match cfg!(debug_assertions) {
            true => match Self::setup_debug(&entry, &instance) {
                Ok(ret) => Some(ret),
                Err(e) => {
                    // nothing else owns the instance yet, clean it up by hand
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            },
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((ref loader, callback)) = self.debug {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
