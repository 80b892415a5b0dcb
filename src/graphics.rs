use crate::runtime::RuntimeHooks;
use ash::vk;
use openxr_sys as xr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

/// Errors that abort session setup. None of these are retried; a session that
/// fails here never becomes usable.
#[derive(Debug)]
pub enum SetupError {
    MissingRuntimeEntryPoint(&'static str),
    UnsupportedDevice(&'static str),
    NotShareable,
    Vulkan(vk::Result),
    VulkanLoad(String),
    Runtime(xr::Result),
    Io(std::io::Error),
}

impl From<std::io::Error> for SetupError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<vk::Result> for SetupError {
    fn from(value: vk::Result) -> Self {
        Self::Vulkan(value)
    }
}

impl From<xr::Result> for SetupError {
    fn from(value: xr::Result) -> Self {
        Self::Runtime(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceApi {
    Vulkan,
    #[cfg(test)]
    Fake,
}

/// A handle to GPU memory or a fence that can be opened on another device.
#[derive(Debug)]
pub enum ShareableHandle {
    OpaqueFd(OwnedFd),
    #[cfg(test)]
    Fake(u64),
}

impl ShareableHandle {
    pub fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            Self::OpaqueFd(fd) => Ok(Self::OpaqueFd(fd.try_clone()?)),
            #[cfg(test)]
            Self::Fake(value) => Ok(Self::Fake(*value)),
        }
    }
}

/// Swapchain creation parameters, one graphics API's view of them. The same
/// shape as the OpenXR struct minus the extension chain, so it can be stored
/// and sent across threads freely.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub create_flags: xr::SwapchainCreateFlags,
    pub usage_flags: xr::SwapchainUsageFlags,
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

impl SwapchainCreateInfo {
    pub fn from_sys(info: &xr::SwapchainCreateInfo) -> Self {
        Self {
            create_flags: info.create_flags,
            usage_flags: info.usage_flags,
            format: info.format,
            sample_count: info.sample_count,
            width: info.width,
            height: info.height,
            face_count: info.face_count,
            array_size: info.array_size,
            mip_count: info.mip_count,
        }
    }

    pub fn to_sys(self) -> xr::SwapchainCreateInfo {
        xr::SwapchainCreateInfo {
            ty: xr::SwapchainCreateInfo::TYPE,
            next: std::ptr::null(),
            create_flags: self.create_flags,
            usage_flags: self.usage_flags,
            format: self.format,
            sample_count: self.sample_count,
            width: self.width,
            height: self.height,
            face_count: self.face_count,
            array_size: self.array_size,
            mip_count: self.mip_count,
        }
    }
}

/// A fence exposing a monotonically increasing 64-bit counter, signaled and
/// waited on the owning device's queue without blocking the CPU.
pub trait GraphicsFence: Send + Sync {
    /// Enqueues a signal of `value` behind all prior work on the device.
    fn signal(&self, value: u64);
    /// Enqueues a wait for `value` ahead of all later work on the device.
    fn wait_on_device(&self, value: u64);
    /// Blocks the calling thread until the counter reaches `value`.
    fn wait_on_cpu(&self, value: u64);
    fn handle(&self) -> Result<ShareableHandle, SetupError>;
    fn is_shareable(&self) -> bool;
}

pub trait GraphicsTexture: Send + Sync {
    /// Exports a handle another device can open. Fails for textures whose
    /// memory this layer does not own.
    fn handle(&self) -> Result<ShareableHandle, SetupError>;
    fn is_shareable(&self) -> bool;
    fn info(&self) -> SwapchainCreateInfo;
    /// Raw API handle for the composition shaders.
    fn native_image(&self) -> u64;
    fn as_any(&self) -> &dyn std::any::Any;
}

pub trait GraphicsDevice: Send + Sync {
    fn api(&self) -> DeviceApi;

    fn create_fence(&self, shareable: bool) -> Result<Box<dyn GraphicsFence>, SetupError>;
    fn open_fence(&self, handle: &ShareableHandle) -> Result<Box<dyn GraphicsFence>, SetupError>;

    fn create_texture(
        &self,
        info: &SwapchainCreateInfo,
        shareable: bool,
    ) -> Result<Arc<dyn GraphicsTexture>, SetupError>;
    fn open_texture(
        &self,
        handle: &ShareableHandle,
        info: &SwapchainCreateInfo,
    ) -> Result<Arc<dyn GraphicsTexture>, SetupError>;

    /// Enumerates a runtime swapchain's images and wraps each as a texture on
    /// this device. The device knows the image struct layout for its API.
    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        hooks: &RuntimeHooks,
        info: &SwapchainCreateInfo,
    ) -> Result<Vec<Arc<dyn GraphicsTexture>>, SetupError>;

    /// Schedules a full copy between two textures on this device. Ordering
    /// with respect to other devices is the caller's business (fences).
    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture);

    /// Translation between this device's native format values and the generic
    /// currency shared by all devices.
    fn translate_to_generic_format(&self, format: i64) -> vk::Format;
    fn translate_from_generic_format(&self, format: vk::Format) -> i64;
}

pub fn is_srgb_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::BC1_RGB_SRGB_BLOCK
            | vk::Format::BC1_RGBA_SRGB_BLOCK
            | vk::Format::BC2_SRGB_BLOCK
            | vk::Format::BC3_SRGB_BLOCK
            | vk::Format::BC7_SRGB_BLOCK
    )
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// One fence per device, opened from the same underlying object so both sides
/// observe the same counter. Every cross-device hand-off bumps the counter by
/// exactly one and never blocks the CPU.
pub struct FencePair {
    on_application_device: Box<dyn GraphicsFence>,
    on_composition_device: Box<dyn GraphicsFence>,
    value: Mutex<u64>,
}

impl FencePair {
    pub fn new(
        application_device: &dyn GraphicsDevice,
        composition_device: &dyn GraphicsDevice,
    ) -> Result<Self, SetupError> {
        let on_composition_device = composition_device.create_fence(true)?;
        let handle = on_composition_device.handle()?;
        let on_application_device = application_device.open_fence(&handle)?;
        Ok(Self {
            on_application_device,
            on_composition_device,
            value: Mutex::new(0),
        })
    }

    /// Makes application-device work visible to the composition device.
    pub fn serialize_app_to_composition(&self) {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        self.on_application_device.signal(*value);
        self.on_composition_device.wait_on_device(*value);
    }

    /// Makes composition-device work visible to the application device.
    pub fn serialize_composition_to_app(&self) {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        self.on_composition_device.signal(*value);
        self.on_application_device.wait_on_device(*value);
    }

    /// Blocks until both devices have caught up to the last hand-off. Only
    /// used on destruction paths; the frame loop never waits on the CPU.
    pub fn wait_idle(&self) {
        let value = *self.value.lock().unwrap();
        self.on_application_device.wait_on_cpu(value);
        self.on_composition_device.wait_on_cpu(value);
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}
