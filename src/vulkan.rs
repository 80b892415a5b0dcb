use crate::{
    graphics::{
        is_depth_format, DeviceApi, GraphicsDevice, GraphicsFence, GraphicsTexture, SetupError,
        ShareableHandle, SwapchainCreateInfo,
    },
    runtime::RuntimeHooks,
    tracy_span,
};
use ash::vk::{self, Handle};
use log::info;
use openxr_sys as xr;
use std::ffi::CStr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, Mutex,
};

/// Command buffers reused round-robin for inter-texture copies, the same way
/// the submission path reuses per-image buffers.
const COPY_RING_SIZE: u32 = 8;

pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

struct DeviceShared {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    external_semaphore_fd: ash::khr::external_semaphore_fd::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    copy: Mutex<CopyCommands>,
    // Queue submission requires external synchronization; fence hand-offs and
    // copies may target the same queue.
    queue_lock: Mutex<()>,
    owns_device: bool,
}

struct CopyCommands {
    pool: vk::CommandPool,
    bufs: Vec<vk::CommandBuffer>,
    next: usize,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let copy = self.copy.lock().unwrap();
            self.device.destroy_command_pool(copy.pool, None);
        }
        if self.owns_device {
            // Composition device - we created these handles, so destroy them.
            // The application device's handles belong to the application.
            unsafe {
                self.device.destroy_device(None);
                self.instance.destroy_instance(None);
            }
        }
    }
}

impl VulkanDevice {
    /// Wraps the application's device from the session's graphics binding.
    pub fn from_graphics_binding(
        binding: &xr::GraphicsBindingVulkanKHR,
    ) -> Result<Self, SetupError> {
        let entry = load_entry()?;
        let instance = unsafe {
            ash::Instance::load(
                entry.static_fn(),
                vk::Instance::from_raw(binding.instance as _),
            )
        };
        let device = unsafe {
            ash::Device::load(instance.fp_v1_0(), vk::Device::from_raw(binding.device as _))
        };
        let queue =
            unsafe { device.get_device_queue(binding.queue_family_index, binding.queue_index) };

        Self::from_handles(
            entry,
            instance,
            vk::PhysicalDevice::from_raw(binding.physical_device as _),
            device,
            queue,
            binding.queue_family_index,
            false,
        )
    }

    /// Creates the internal composition device on the same GPU the
    /// application renders with.
    pub fn new_composition(application: &VulkanDevice) -> Result<Self, SetupError> {
        let entry = load_entry()?;
        let app = &application.shared;
        let app_props =
            unsafe { app.instance.get_physical_device_properties(app.physical_device) };

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::default().application_info(
                    &vk::ApplicationInfo::default()
                        .api_version(vk::API_VERSION_1_2)
                        .application_name(c"quadrizer composition"),
                ),
                None,
            )
        }?;

        let physical_device = unsafe { instance.enumerate_physical_devices() }?
            .into_iter()
            .find(|pd| {
                let props = unsafe { instance.get_physical_device_properties(*pd) };
                props.vendor_id == app_props.vendor_id && props.device_id == app_props.device_id
            })
            .ok_or(SetupError::UnsupportedDevice(
                "application GPU not visible to the composition instance",
            ))?;

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        if vulkan12.timeline_semaphore == vk::FALSE {
            return Err(SetupError::UnsupportedDevice("timeline semaphores unsupported"));
        }

        // find whatever graphics queue family
        let queue_family_index =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
                .into_iter()
                .enumerate()
                .find_map(|(idx, family)| {
                    (family.queue_flags.contains(vk::QueueFlags::GRAPHICS)).then_some(idx)
                })
                .ok_or(SetupError::UnsupportedDevice("no graphics queue family"))?
                as u32;

        let extensions = [
            ash::khr::external_memory::NAME.as_ptr(),
            ash::khr::external_memory_fd::NAME.as_ptr(),
            ash::khr::external_semaphore::NAME.as_ptr(),
            ash::khr::external_semaphore_fd::NAME.as_ptr(),
        ];
        let mut timeline = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device = unsafe {
            instance.create_device(
                physical_device,
                &vk::DeviceCreateInfo::default()
                    .queue_create_infos(std::slice::from_ref(
                        &vk::DeviceQueueCreateInfo::default()
                            .queue_family_index(queue_family_index)
                            .queue_priorities(&[1.0]),
                    ))
                    .enabled_extension_names(&extensions)
                    .push_next(&mut timeline),
                None,
            )
        }?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let name = unsafe { CStr::from_ptr(app_props.device_name.as_ptr()) };
        info!("Created composition device on {}", name.to_string_lossy());

        Self::from_handles(
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            true,
        )
    }

    fn from_handles(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        owns_device: bool,
    ) -> Result<Self, SetupError> {
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);
        let external_semaphore_fd =
            ash::khr::external_semaphore_fd::Device::new(&instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }?;
        let bufs = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(COPY_RING_SIZE),
            )
        }?;

        Ok(Self {
            shared: Arc::new(DeviceShared {
                _entry: entry,
                instance,
                physical_device,
                device,
                queue,
                queue_family_index,
                external_memory_fd,
                external_semaphore_fd,
                memory_properties,
                copy: Mutex::new(CopyCommands { pool, bufs, next: 0 }),
                queue_lock: Mutex::new(()),
                owns_device,
            }),
        })
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.shared.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.shared.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.shared.queue_family_index
    }
}

impl GraphicsDevice for VulkanDevice {
    fn api(&self) -> DeviceApi {
        DeviceApi::Vulkan
    }

    fn create_fence(&self, shareable: bool) -> Result<Box<dyn GraphicsFence>, SetupError> {
        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut export = vk::ExportSemaphoreCreateInfo::default()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let mut info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
        if shareable {
            info = info.push_next(&mut export);
        }
        let semaphore = unsafe { self.shared.device.create_semaphore(&info, None) }?;
        Ok(Box::new(VulkanFence {
            semaphore,
            shareable,
            device: self.shared.clone(),
        }))
    }

    fn open_fence(&self, handle: &ShareableHandle) -> Result<Box<dyn GraphicsFence>, SetupError> {
        let fd = match handle {
            ShareableHandle::OpaqueFd(fd) => fd.try_clone()?,
            #[cfg(test)]
            ShareableHandle::Fake(_) => return Err(SetupError::NotShareable),
        };

        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore = unsafe {
            self.shared
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline), None)
        }?;

        // The import consumes the duplicated descriptor.
        let import = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
            .fd(fd.into_raw_fd());
        unsafe { self.shared.external_semaphore_fd.import_semaphore_fd(&import) }?;

        Ok(Box::new(VulkanFence {
            semaphore,
            shareable: false,
            device: self.shared.clone(),
        }))
    }

    fn create_texture(
        &self,
        info: &SwapchainCreateInfo,
        shareable: bool,
    ) -> Result<Arc<dyn GraphicsTexture>, SetupError> {
        let device = &self.shared.device;
        let format = vk::Format::from_raw(info.format as i32);

        let mut external = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_count.max(1))
            .array_layers(info.array_size.max(1))
            .samples(vk::SampleCountFlags::from_raw(info.sample_count.max(1)))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage_from_swapchain(info.usage_flags, format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if shareable {
            image_info = image_info.push_next(&mut external);
        }
        let image = unsafe { device.create_image(&image_info, None) }?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = memory_type_index(
            &self.shared.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .or_else(|| {
            memory_type_index(
                &self.shared.memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::empty(),
            )
        })
        .ok_or(SetupError::UnsupportedDevice("no compatible memory type"))?;

        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut export = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut dedicated);
        if shareable {
            alloc = alloc.push_next(&mut export);
        }
        let memory = unsafe { device.allocate_memory(&alloc, None) }?;
        unsafe { device.bind_image_memory(image, memory, 0) }?;

        Ok(Arc::new(VulkanTexture {
            image,
            memory: Some(memory),
            owned: true,
            shareable,
            info: *info,
            layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
            device: self.shared.clone(),
        }))
    }

    fn open_texture(
        &self,
        handle: &ShareableHandle,
        info: &SwapchainCreateInfo,
    ) -> Result<Arc<dyn GraphicsTexture>, SetupError> {
        let fd = match handle {
            ShareableHandle::OpaqueFd(fd) => fd.try_clone()?,
            #[cfg(test)]
            ShareableHandle::Fake(_) => return Err(SetupError::NotShareable),
        };

        let device = &self.shared.device;
        let format = vk::Format::from_raw(info.format as i32);

        let mut external = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_count.max(1))
            .array_layers(info.array_size.max(1))
            .samples(vk::SampleCountFlags::from_raw(info.sample_count.max(1)))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage_from_swapchain(info.usage_flags, format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external);
        let image = unsafe { device.create_image(&image_info, None) }?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = memory_type_index(
            &self.shared.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .or_else(|| {
            memory_type_index(
                &self.shared.memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::empty(),
            )
        })
        .ok_or(SetupError::UnsupportedDevice("no compatible memory type"))?;

        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        // The import consumes the duplicated descriptor.
        let mut import = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(fd.into_raw_fd());
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut dedicated)
            .push_next(&mut import);
        let memory = unsafe { device.allocate_memory(&alloc, None) }?;
        unsafe { device.bind_image_memory(image, memory, 0) }?;

        Ok(Arc::new(VulkanTexture {
            image,
            memory: Some(memory),
            owned: true,
            shareable: false,
            info: *info,
            layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
            device: self.shared.clone(),
        }))
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        hooks: &RuntimeHooks,
        info: &SwapchainCreateInfo,
    ) -> Result<Vec<Arc<dyn GraphicsTexture>>, SetupError> {
        let mut count = 0;
        hooks.enumerate_swapchain_images_raw(swapchain, 0, &mut count, std::ptr::null_mut())?;
        let mut images = vec![
            xr::SwapchainImageVulkanKHR {
                ty: xr::SwapchainImageVulkanKHR::TYPE,
                next: std::ptr::null_mut(),
                image: 0,
            };
            count as usize
        ];
        hooks.enumerate_swapchain_images_raw(
            swapchain,
            count,
            &mut count,
            images.as_mut_ptr().cast(),
        )?;

        let format = vk::Format::from_raw(info.format as i32);
        let layout = if is_depth_format(format) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        Ok(images
            .into_iter()
            .take(count as usize)
            .map(|image| {
                // The runtime owns these images and their memory; there is no
                // exportable handle, so cross-device access goes through a
                // bounce texture.
                Arc::new(VulkanTexture {
                    image: vk::Image::from_raw(image.image),
                    memory: None,
                    owned: false,
                    shareable: false,
                    info: *info,
                    layout: AtomicI32::new(layout.as_raw()),
                    device: self.shared.clone(),
                }) as Arc<dyn GraphicsTexture>
            })
            .collect())
    }

    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture) {
        tracy_span!();
        let from = from
            .as_any()
            .downcast_ref::<VulkanTexture>()
            .expect("copy source is not a texture of this device");
        let to = to
            .as_any()
            .downcast_ref::<VulkanTexture>()
            .expect("copy destination is not a texture of this device");

        let shared = &self.shared;
        let device = &shared.device;
        let buf = {
            let mut copy = shared.copy.lock().unwrap();
            let buf = copy.bufs[copy.next];
            copy.next = (copy.next + 1) % copy.bufs.len();
            buf
        };

        let info = from.info;
        let format = vk::Format::from_raw(info.format as i32);
        let aspect = if is_depth_format(format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let layer_count = info.array_size.max(1);
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count,
        };

        let src_old = vk::ImageLayout::from_raw(from.layout.load(Ordering::Relaxed));
        let dst_old = vk::ImageLayout::from_raw(to.layout.load(Ordering::Relaxed));
        let src_restore = if src_old == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::GENERAL
        } else {
            src_old
        };
        let dst_restore = if dst_old == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::GENERAL
        } else {
            dst_old
        };

        unsafe {
            device
                .begin_command_buffer(
                    buf,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .unwrap();

            device.cmd_pipeline_barrier(
                buf,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::MEMORY_WRITE,
                        dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                        old_layout: src_old,
                        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image: from.image,
                        subresource_range: range,
                        ..Default::default()
                    },
                    vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::MEMORY_READ,
                        dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                        old_layout: dst_old,
                        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image: to.image,
                        subresource_range: range,
                        ..Default::default()
                    },
                ],
            );

            let subresource = vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count,
            };
            device.cmd_copy_image(
                buf,
                from.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                to.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::ImageCopy {
                    src_subresource: subresource,
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: subresource,
                    dst_offset: vk::Offset3D::default(),
                    extent: vk::Extent3D {
                        width: info.width,
                        height: info.height,
                        depth: 1,
                    },
                }],
            );

            device.cmd_pipeline_barrier(
                buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::TRANSFER_READ,
                        dst_access_mask: vk::AccessFlags::MEMORY_READ,
                        old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        new_layout: src_restore,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image: from.image,
                        subresource_range: range,
                        ..Default::default()
                    },
                    vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access_mask: vk::AccessFlags::MEMORY_READ,
                        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        new_layout: dst_restore,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image: to.image,
                        subresource_range: range,
                        ..Default::default()
                    },
                ],
            );

            device.end_command_buffer(buf).unwrap();

            let _queue_guard = shared.queue_lock.lock().unwrap();
            device
                .queue_submit(
                    shared.queue,
                    &[vk::SubmitInfo::default().command_buffers(&[buf])],
                    vk::Fence::null(),
                )
                .unwrap();
        }

        from.layout.store(src_restore.as_raw(), Ordering::Relaxed);
        to.layout.store(dst_restore.as_raw(), Ordering::Relaxed);
    }

    fn translate_to_generic_format(&self, format: i64) -> vk::Format {
        vk::Format::from_raw(format as i32)
    }

    fn translate_from_generic_format(&self, format: vk::Format) -> i64 {
        format.as_raw() as i64
    }
}

struct VulkanFence {
    semaphore: vk::Semaphore,
    shareable: bool,
    device: Arc<DeviceShared>,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

impl GraphicsFence for VulkanFence {
    fn signal(&self, value: u64) {
        let semaphores = [self.semaphore];
        let values = [value];
        let mut timeline =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline);
        let _guard = self.device.queue_lock.lock().unwrap();
        unsafe {
            self.device
                .device
                .queue_submit(self.device.queue, &[submit], vk::Fence::null())
                .unwrap();
        }
    }

    fn wait_on_device(&self, value: u64) {
        let semaphores = [self.semaphore];
        let values = [value];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut timeline =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .push_next(&mut timeline);
        let _guard = self.device.queue_lock.lock().unwrap();
        unsafe {
            self.device
                .device
                .queue_submit(self.device.queue, &[submit], vk::Fence::null())
                .unwrap();
        }
    }

    fn wait_on_cpu(&self, value: u64) {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.device.wait_semaphores(&info, u64::MAX).unwrap() }
    }

    fn handle(&self) -> Result<ShareableHandle, SetupError> {
        if !self.shareable {
            return Err(SetupError::NotShareable);
        }
        let fd = unsafe {
            self.device.external_semaphore_fd.get_semaphore_fd(
                &vk::SemaphoreGetFdInfoKHR::default()
                    .semaphore(self.semaphore)
                    .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD),
            )
        }?;
        Ok(ShareableHandle::OpaqueFd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn is_shareable(&self) -> bool {
        self.shareable
    }
}

struct VulkanTexture {
    image: vk::Image,
    memory: Option<vk::DeviceMemory>,
    owned: bool,
    shareable: bool,
    info: SwapchainCreateInfo,
    layout: AtomicI32,
    device: Arc<DeviceShared>,
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                self.device.device.destroy_image(self.image, None);
                if let Some(memory) = self.memory {
                    self.device.device.free_memory(memory, None);
                }
            }
        }
    }
}

impl GraphicsTexture for VulkanTexture {
    fn handle(&self) -> Result<ShareableHandle, SetupError> {
        let Some(memory) = self.memory.filter(|_| self.shareable) else {
            return Err(SetupError::NotShareable);
        };
        let fd = unsafe {
            self.device.external_memory_fd.get_memory_fd(
                &vk::MemoryGetFdInfoKHR::default()
                    .memory(memory)
                    .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD),
            )
        }?;
        Ok(ShareableHandle::OpaqueFd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn is_shareable(&self) -> bool {
        self.shareable
    }

    fn info(&self) -> SwapchainCreateInfo {
        self.info
    }

    fn native_image(&self) -> u64 {
        self.image.as_raw()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn image_usage_from_swapchain(
    flags: xr::SwapchainUsageFlags,
    format: vk::Format,
) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::SAMPLED;
    if flags.contains(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) && !is_depth_format(format) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if flags.contains(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT) || is_depth_format(format)
    {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if flags.contains(xr::SwapchainUsageFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

fn memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    props.memory_types[..props.memory_type_count as usize]
        .iter()
        .enumerate()
        .find_map(|(index, memory_type)| {
            (type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags))
                .then_some(index as u32)
        })
}

fn load_entry() -> Result<ash::Entry, SetupError> {
    unsafe { ash::Entry::load() }.map_err(|e| SetupError::VulkanLoad(e.to_string()))
}
