// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, require Vulkan 1.2 timeline
//   semaphores and descriptor indexing)
// - Logical device + one queue per role (graphics / compute / transfer)
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::QueueRole;

/// Queue handle and family for one role. Roles may share a queue when the
/// GPU has no dedicated family for them.
#[derive(Debug, Clone, Copy)]
pub struct QueueSlot {
    pub queue: vk::Queue,
    pub family: u32,
}

/// Families chosen for each role, indexed by `QueueRole::index`
#[derive(Debug, Clone, Copy)]
struct QueueFamilies {
    families: [u32; 3],
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Freed before the device in Drop
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles, indexed by QueueRole::index
    queues: [QueueSlot; 3],
    // vkQueueSubmit needs external synchronization; roles may alias one queue
    submit_lock: Mutex<()>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub max_bindless_storage_buffers: u32,
    pub max_bindless_uniform_buffers: u32,
    pub uniform_update_after_bind: bool,
}

impl VulkanDevice {
    /// Create a headless Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU) and queue families per role
        let (physical_device, families) = Self::pick_physical_device(&instance)?;

        // Step 5: Query descriptor indexing support
        let (features12, properties12) = Self::query_vulkan12(&instance, physical_device);
        let uniform_update_after_bind =
            features12.descriptor_binding_uniform_buffer_update_after_bind == vk::TRUE;

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &families,
            uniform_update_after_bind,
        )?;

        let queues = QueueRole::ALL.map(|role| {
            let family = families.families[role.index()];
            QueueSlot {
                queue: unsafe { device.get_device_queue(family, 0) },
                family,
            }
        });

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        for role in QueueRole::ALL {
            log::info!("{} queue -> family {}", role, queues[role.index()].family);
        }

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            queues,
            submit_lock: Mutex::new(()),
            debug_utils,
            properties,
            max_bindless_storage_buffers: properties12
                .max_descriptor_set_update_after_bind_storage_buffers,
            max_bindless_uniform_buffers: properties12
                .max_descriptor_set_update_after_bind_uniform_buffers,
            uniform_update_after_bind,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("render-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Headless: the only instance extension is debug utils
        let extensions = if enable_validation {
            vec![ash::extensions::ext::DebugUtils::name().as_ptr()]
        } else {
            vec![]
        };

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if props.api_version < vk::API_VERSION_1_2 {
                continue;
            }

            let (features12, _) = Self::query_vulkan12(instance, device);
            if !Self::check_device_features(&features12) {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            if let Some(families) = Self::select_queue_families(&queue_families) {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, families));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with timeline semaphores and descriptor indexing found"))
    }

    /// Prefer dedicated compute and transfer families, fall back to graphics
    fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
        let find = |predicate: &dyn Fn(vk::QueueFlags) -> bool| {
            families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_count > 0 && predicate(props.queue_flags))
                .map(|(i, _)| i as u32)
        };

        let graphics = find(&|f| f.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))?;
        let compute = find(&|f| f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS))
            .unwrap_or(graphics);
        let transfer = find(&|f| {
            f.contains(vk::QueueFlags::TRANSFER)
                && !f.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .unwrap_or(compute);

        Some(QueueFamilies {
            families: [graphics, compute, transfer],
        })
    }

    fn query_vulkan12(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> (vk::PhysicalDeviceVulkan12Features, vk::PhysicalDeviceVulkan12Properties) {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .build();
        unsafe { instance.get_physical_device_features2(device, &mut features2) };

        let mut properties12 = vk::PhysicalDeviceVulkan12Properties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut properties12)
            .build();
        unsafe { instance.get_physical_device_properties2(device, &mut properties2) };

        // Chains point at locals; clear them before handing the structs out
        features12.p_next = std::ptr::null_mut();
        properties12.p_next = std::ptr::null_mut();
        (features12, properties12)
    }

    fn check_device_features(features: &vk::PhysicalDeviceVulkan12Features) -> bool {
        // Check all required features are supported
        features.timeline_semaphore == vk::TRUE
            && features.descriptor_indexing == vk::TRUE
            && features.runtime_descriptor_array == vk::TRUE
            && features.descriptor_binding_partially_bound == vk::TRUE
            && features.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
        uniform_update_after_bind: bool,
    ) -> Result<ash::Device> {
        let mut unique_families = families.families.to_vec();
        unique_families.sort_unstable();
        unique_families.dedup();

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(uniform_update_after_bind);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    pub fn queue(&self, role: QueueRole) -> QueueSlot {
        self.queues[role.index()]
    }

    /// Distinct queue families in use, sorted
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.queues.iter().map(|slot| slot.family).collect();
        families.sort_unstable();
        families.dedup();
        families
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Run `f` while holding the queue submission lock
    pub fn with_submit_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.submit_lock.lock();
        f()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _guard = self.submit_lock.lock();
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order; the allocator must go before the device
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
