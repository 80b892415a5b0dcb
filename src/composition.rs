use crate::{
    graphics::{
        is_depth_format, is_srgb_format, FencePair, GraphicsDevice, GraphicsTexture, SetupError,
        SwapchainCreateInfo,
    },
    runtime::RuntimeHooks,
    tracy_span,
};
use ash::vk;
use log::{debug, trace};
use openxr_sys as xr;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Errors surfaced by swapchain operations. Protocol misuse gets its own
/// variants instead of being masked; a silently ignored caller bug here shows
/// up later as visual corruption.
#[derive(Debug, PartialEq, Eq)]
pub enum CompositionError {
    /// Every slot of a bounded ring is already acquired.
    NoImageAvailable,
    /// Release or wait without a matching acquire.
    NoImageAcquired,
    NotReadable,
    NotWritable,
    NotSubmittable,
    /// The wrapped runtime call failed; passed through unmodified.
    Runtime(xr::Result),
}

impl From<xr::Result> for CompositionError {
    fn from(value: xr::Result) -> Self {
        Self::Runtime(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SwapchainMode(u32);

impl SwapchainMode {
    /// The composition stage samples released images.
    pub const READ: Self = Self(1 << 0);
    /// The composition stage writes images back before release.
    pub const WRITE: Self = Self(1 << 1);
    /// Backed by a runtime swapchain that can go into composition layers.
    pub const SUBMIT: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for SwapchainMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One swapchain slot, visible from both devices. Read and write handles are
/// the same resource unless a bounce buffer is bridging the devices; either
/// way callers see the same contract.
pub struct SwapchainImage {
    application: Arc<dyn GraphicsTexture>,
    read: Arc<dyn GraphicsTexture>,
    write: Arc<dyn GraphicsTexture>,
    index: u32,
}

impl SwapchainImage {
    pub fn application_texture(&self) -> &Arc<dyn GraphicsTexture> {
        &self.application
    }

    pub fn texture_for_read(&self) -> &Arc<dyn GraphicsTexture> {
        &self.read
    }

    pub fn texture_for_write(&self) -> &Arc<dyn GraphicsTexture> {
        &self.write
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

pub trait Swapchain: Send + Sync {
    fn acquire_image(&self, wait: bool) -> Result<Arc<SwapchainImage>, CompositionError>;
    fn wait_image(&self) -> Result<(), CompositionError>;
    fn release_image(&self) -> Result<(), CompositionError>;
    fn last_released_image(&self) -> Result<Option<Arc<SwapchainImage>>, CompositionError>;
    fn commit_last_released_image(&self) -> Result<(), CompositionError>;
    fn info_on_composition_device(&self) -> SwapchainCreateInfo;
    fn format_on_application_device(&self) -> i64;
    fn image(&self, index: u32) -> Arc<SwapchainImage>;
    fn image_count(&self) -> u32;
    fn handle(&self) -> Result<xr::Swapchain, CompositionError>;
    fn sub_image(&self) -> Result<xr::SwapchainSubImage, CompositionError>;
}

#[derive(Default)]
struct SubmittableState {
    acquired: VecDeque<u32>,
    last_released: Option<u32>,
}

/// Wraps a runtime swapchain and makes its images usable from the composition
/// device, with the hand-off between devices serialized by a fence pair.
pub struct SubmittableSwapchain {
    hooks: Arc<RuntimeHooks>,
    handle: xr::Swapchain,
    owns_handle: bool,
    info_on_composition_device: SwapchainCreateInfo,
    format_on_application_device: i64,
    access_read: bool,
    access_write: bool,
    images: Vec<Arc<SwapchainImage>>,
    bounce_on_application_device: Option<Arc<dyn GraphicsTexture>>,
    application_device: Arc<dyn GraphicsDevice>,
    fence: FencePair,
    state: Mutex<SubmittableState>,
}

impl SubmittableSwapchain {
    pub fn new(
        hooks: Arc<RuntimeHooks>,
        handle: xr::Swapchain,
        info_on_application_device: &SwapchainCreateInfo,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
        mode: SwapchainMode,
        owns_handle: bool,
    ) -> Result<Self, SetupError> {
        let mut info_on_composition_device = *info_on_application_device;
        info_on_composition_device.format = composition_device.translate_from_generic_format(
            application_device.translate_to_generic_format(info_on_application_device.format),
        );

        let textures = application_device.enumerate_swapchain_images(
            handle,
            &hooks,
            info_on_application_device,
        )?;

        let mut images = Vec::with_capacity(textures.len());
        let mut bounce_on_application_device = None;
        let mut bounce_on_composition_device: Option<Arc<dyn GraphicsTexture>> = None;
        for (index, texture_on_application_device) in textures.into_iter().enumerate() {
            let texture_on_composition_device = if texture_on_application_device.is_shareable() {
                composition_device.open_texture(
                    &texture_on_application_device.handle()?,
                    &info_on_composition_device,
                )?
            } else {
                // The image isn't shareable, so route access through a single
                // bounce texture both devices can see; explicit copies bridge
                // the content as needed.
                match &bounce_on_composition_device {
                    Some(bounce) => bounce.clone(),
                    None => {
                        let bounce =
                            composition_device.create_texture(&info_on_composition_device, true)?;
                        bounce_on_application_device = Some(
                            application_device
                                .open_texture(&bounce.handle()?, info_on_application_device)?,
                        );
                        debug!("Swapchain images not shareable, using a bounce texture");
                        bounce_on_composition_device = Some(bounce.clone());
                        bounce
                    }
                }
            };

            images.push(Arc::new(SwapchainImage {
                application: texture_on_application_device,
                read: texture_on_composition_device.clone(),
                write: texture_on_composition_device,
                index: index as u32,
            }));
        }

        let fence = FencePair::new(application_device.as_ref(), composition_device.as_ref())?;

        Ok(Self {
            hooks,
            handle,
            owns_handle,
            info_on_composition_device,
            format_on_application_device: info_on_application_device.format,
            access_read: mode.contains(SwapchainMode::READ),
            access_write: mode.contains(SwapchainMode::WRITE),
            images,
            bounce_on_application_device,
            application_device,
            fence,
            state: Mutex::default(),
        })
    }

    #[cfg(test)]
    fn fence_value(&self) -> u64 {
        self.fence.value()
    }
}

impl Drop for SubmittableSwapchain {
    fn drop(&mut self) {
        // Outstanding GPU work may still reference the images; drain it
        // before the runtime frees them.
        self.fence.wait_idle();
        if self.owns_handle {
            if let Err(e) = self.hooks.destroy_swapchain(self.handle) {
                log::warn!("Failed to destroy swapchain: {e:?}");
            }
        }
    }
}

impl Swapchain for SubmittableSwapchain {
    fn acquire_image(&self, wait: bool) -> Result<Arc<SwapchainImage>, CompositionError> {
        tracy_span!();
        let mut state = self.state.lock().unwrap();

        let index = self.hooks.acquire_swapchain_image(self.handle)?;
        if wait {
            self.hooks
                .wait_swapchain_image(self.handle, xr::Duration::INFINITE)?;
        }

        // Serialize whatever the runtime did on the application device while
        // acquiring before the composition device touches the image.
        self.fence.serialize_app_to_composition();

        state.acquired.push_back(index);
        trace!("acquired image {index}");
        Ok(self.images[index as usize].clone())
    }

    fn wait_image(&self) -> Result<(), CompositionError> {
        // No acquired-image check here; the runtime validates and errors.
        self.hooks
            .wait_swapchain_image(self.handle, xr::Duration::INFINITE)?;
        Ok(())
    }

    fn release_image(&self) -> Result<(), CompositionError> {
        let mut state = self.state.lock().unwrap();

        // The runtime-level release is deferred so the composition stage gets
        // a window to peek and/or poke the content before the runtime recycles
        // the buffer. Only the most recent release stays deferred; a pending
        // one is flushed out first.
        if !(self.access_read || self.access_write) || state.last_released.is_some() {
            self.hooks.release_swapchain_image(self.handle)?;
        }

        let released = state
            .acquired
            .pop_front()
            .ok_or(CompositionError::NoImageAcquired)?;
        state.last_released = Some(released);
        trace!("released image {released}");
        Ok(())
    }

    fn last_released_image(&self) -> Result<Option<Arc<SwapchainImage>>, CompositionError> {
        if !self.access_read {
            return Err(CompositionError::NotReadable);
        }

        let state = self.state.lock().unwrap();
        // Nothing released since the last commit means no work for the caller.
        let Some(index) = state.last_released else {
            return Ok(None);
        };

        if let Some(bounce) = &self.bounce_on_application_device {
            tracy_span!("bounce copy to composition");
            self.application_device
                .copy_texture(self.images[index as usize].application.as_ref(), bounce.as_ref());
        }

        // Serialize application-device work before the composition device
        // reads the image.
        self.fence.serialize_app_to_composition();

        Ok(Some(self.images[index as usize].clone()))
    }

    fn commit_last_released_image(&self) -> Result<(), CompositionError> {
        if !self.access_write {
            return Err(CompositionError::NotWritable);
        }

        let mut state = self.state.lock().unwrap();
        let Some(index) = state.last_released else {
            return Ok(());
        };

        // Serialize composition-device work before copying back or letting
        // the runtime recycle the image.
        self.fence.serialize_composition_to_app();

        if let Some(bounce) = &self.bounce_on_application_device {
            tracy_span!("bounce copy to application");
            self.application_device
                .copy_texture(bounce.as_ref(), self.images[index as usize].application.as_ref());
        }

        self.hooks.release_swapchain_image(self.handle)?;
        state.last_released = None;
        Ok(())
    }

    fn info_on_composition_device(&self) -> SwapchainCreateInfo {
        self.info_on_composition_device
    }

    fn format_on_application_device(&self) -> i64 {
        self.format_on_application_device
    }

    fn image(&self, index: u32) -> Arc<SwapchainImage> {
        self.images[index as usize].clone()
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn handle(&self) -> Result<xr::Swapchain, CompositionError> {
        Ok(self.handle)
    }

    fn sub_image(&self) -> Result<xr::SwapchainSubImage, CompositionError> {
        Ok(xr::SwapchainSubImage {
            swapchain: self.handle,
            image_rect: xr::Rect2Di {
                offset: xr::Offset2Di { x: 0, y: 0 },
                extent: xr::Extent2Di {
                    width: self.info_on_composition_device.width as i32,
                    height: self.info_on_composition_device.height as i32,
                },
            },
            image_array_index: 0,
        })
    }
}

#[derive(Default)]
struct DoubleBufferedState {
    next: u32,
    acquired: VecDeque<u32>,
    last_released: Option<u32>,
}

/// A purely internal swapchain, never handed to the runtime. Both devices can
/// always see its images because we create them ourselves with sharing in
/// mind, so no fences or copies are needed here; callers bracket composition
/// work with the context-level serialization instead. Two slots suffice with
/// a single frame in flight.
pub struct DoubleBufferedSwapchain {
    info_on_composition_device: SwapchainCreateInfo,
    format_on_application_device: i64,
    access_read: bool,
    access_write: bool,
    images: Vec<Arc<SwapchainImage>>,
    state: Mutex<DoubleBufferedState>,
}

impl DoubleBufferedSwapchain {
    pub fn new(
        info_on_application_device: &SwapchainCreateInfo,
        application_device: &dyn GraphicsDevice,
        composition_device: &dyn GraphicsDevice,
        mode: SwapchainMode,
    ) -> Result<Self, SetupError> {
        let mut info_on_composition_device = *info_on_application_device;
        info_on_composition_device.format = composition_device.translate_from_generic_format(
            application_device.translate_to_generic_format(info_on_application_device.format),
        );

        let mut images = Vec::with_capacity(2);
        for index in 0..2 {
            let texture_on_composition_device =
                composition_device.create_texture(&info_on_composition_device, true)?;
            let texture_on_application_device = application_device.open_texture(
                &texture_on_composition_device.handle()?,
                info_on_application_device,
            )?;
            images.push(Arc::new(SwapchainImage {
                application: texture_on_application_device,
                read: texture_on_composition_device.clone(),
                write: texture_on_composition_device,
                index,
            }));
        }

        Ok(Self {
            info_on_composition_device,
            format_on_application_device: info_on_application_device.format,
            access_read: mode.contains(SwapchainMode::READ),
            access_write: mode.contains(SwapchainMode::WRITE),
            images,
            state: Mutex::default(),
        })
    }
}

impl Swapchain for DoubleBufferedSwapchain {
    fn acquire_image(&self, _wait: bool) -> Result<Arc<SwapchainImage>, CompositionError> {
        let mut state = self.state.lock().unwrap();

        if state.acquired.len() == self.images.len() {
            return Err(CompositionError::NoImageAvailable);
        }

        let index = state.next % self.images.len() as u32;
        state.next = state.next.wrapping_add(1);
        state.acquired.push_back(index);
        Ok(self.images[index as usize].clone())
    }

    fn wait_image(&self) -> Result<(), CompositionError> {
        let state = self.state.lock().unwrap();
        if state.acquired.is_empty() {
            return Err(CompositionError::NoImageAcquired);
        }
        Ok(())
    }

    fn release_image(&self) -> Result<(), CompositionError> {
        let mut state = self.state.lock().unwrap();
        let released = state
            .acquired
            .pop_front()
            .ok_or(CompositionError::NoImageAcquired)?;
        state.last_released = Some(released);
        Ok(())
    }

    fn last_released_image(&self) -> Result<Option<Arc<SwapchainImage>>, CompositionError> {
        if !self.access_read {
            return Err(CompositionError::NotReadable);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .last_released
            .map(|index| self.images[index as usize].clone()))
    }

    fn commit_last_released_image(&self) -> Result<(), CompositionError> {
        if !self.access_write {
            return Err(CompositionError::NotWritable);
        }
        Ok(())
    }

    fn info_on_composition_device(&self) -> SwapchainCreateInfo {
        self.info_on_composition_device
    }

    fn format_on_application_device(&self) -> i64 {
        self.format_on_application_device
    }

    fn image(&self, index: u32) -> Arc<SwapchainImage> {
        self.images[index as usize].clone()
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn handle(&self) -> Result<xr::Swapchain, CompositionError> {
        Err(CompositionError::NotSubmittable)
    }

    fn sub_image(&self) -> Result<xr::SwapchainSubImage, CompositionError> {
        Err(CompositionError::NotSubmittable)
    }
}

/// Per-session home of the composition device: owns the device pair, the
/// session-wide fence pair bracketing the composition pass, and the swapchain
/// factory. One per session; the dispatch layer passes it into every
/// intercepted call that needs it.
pub struct CompositionContext {
    session: xr::Session,
    hooks: Arc<RuntimeHooks>,
    application_device: Arc<dyn GraphicsDevice>,
    composition_device: Arc<dyn GraphicsDevice>,
    fence: FencePair,
    preferred_color_format: vk::Format,
    preferred_srgb_color_format: vk::Format,
    preferred_depth_format: vk::Format,
}

impl CompositionContext {
    pub fn new(
        hooks: Arc<RuntimeHooks>,
        session: xr::Session,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
    ) -> Result<Self, SetupError> {
        let fence = FencePair::new(application_device.as_ref(), composition_device.as_ref())?;

        let mut preferred_color_format = vk::Format::UNDEFINED;
        let mut preferred_srgb_color_format = vk::Format::UNDEFINED;
        let mut preferred_depth_format = vk::Format::UNDEFINED;
        for format_on_application_device in hooks.enumerate_swapchain_formats(session)? {
            let format =
                application_device.translate_to_generic_format(format_on_application_device);
            let is_depth = is_depth_format(format);
            let is_color = !is_depth;
            let is_srgb = is_color && is_srgb_format(format);

            if preferred_color_format == vk::Format::UNDEFINED && is_color && !is_srgb {
                preferred_color_format = format;
            }
            if preferred_srgb_color_format == vk::Format::UNDEFINED && is_srgb {
                preferred_srgb_color_format = format;
            }
            if preferred_depth_format == vk::Format::UNDEFINED && is_depth {
                preferred_depth_format = format;
            }
        }

        Ok(Self {
            session,
            hooks,
            application_device,
            composition_device,
            fence,
            preferred_color_format,
            preferred_srgb_color_format,
            preferred_depth_format,
        })
    }

    pub fn session(&self) -> xr::Session {
        self.session
    }

    pub fn application_device(&self) -> &Arc<dyn GraphicsDevice> {
        &self.application_device
    }

    pub fn composition_device(&self) -> &Arc<dyn GraphicsDevice> {
        &self.composition_device
    }

    pub fn create_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        mode: SwapchainMode,
    ) -> Result<Arc<dyn Swapchain>, SetupError> {
        if mode.contains(SwapchainMode::SUBMIT) {
            let handle = self.hooks.create_swapchain(self.session, &info.to_sys())?;
            match SubmittableSwapchain::new(
                self.hooks.clone(),
                handle,
                info,
                self.application_device.clone(),
                self.composition_device.clone(),
                mode,
                true,
            ) {
                Ok(swapchain) => Ok(Arc::new(swapchain)),
                Err(e) => {
                    let _ = self.hooks.destroy_swapchain(handle);
                    Err(e)
                }
            }
        } else {
            Ok(Arc::new(DoubleBufferedSwapchain::new(
                info,
                self.application_device.as_ref(),
                self.composition_device.as_ref(),
                mode,
            )?))
        }
    }

    /// Wraps a swapchain the application created itself. The handle stays
    /// owned by the application; dropping the wrapper does not destroy it.
    pub fn wrap_swapchain(
        &self,
        handle: xr::Swapchain,
        info: &SwapchainCreateInfo,
        mode: SwapchainMode,
    ) -> Result<Arc<dyn Swapchain>, SetupError> {
        Ok(Arc::new(SubmittableSwapchain::new(
            self.hooks.clone(),
            handle,
            info,
            self.application_device.clone(),
            self.composition_device.clone(),
            mode,
            false,
        )?))
    }

    /// Serializes application-device work ahead of the composition pass.
    pub fn serialize_pre_composition(&self) {
        tracy_span!();
        self.fence.serialize_app_to_composition();
    }

    /// Serializes the composition pass ahead of further application work.
    pub fn serialize_post_composition(&self) {
        tracy_span!();
        self.fence.serialize_composition_to_app();
    }

    pub fn preferred_swapchain_format(
        &self,
        usage_flags: xr::SwapchainUsageFlags,
        prefer_srgb: bool,
    ) -> i64 {
        let format = if usage_flags.contains(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) {
            if prefer_srgb {
                self.preferred_srgb_color_format
            } else {
                self.preferred_color_format
            }
        } else if usage_flags.contains(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            self.preferred_depth_format
        } else {
            vk::Format::UNDEFINED
        };
        self.application_device.translate_from_generic_format(format)
    }
}

impl Drop for CompositionContext {
    fn drop(&mut self) {
        self.fence.wait_idle();
    }
}
