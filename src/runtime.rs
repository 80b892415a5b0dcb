use crate::graphics::SetupError;
use openxr_sys as xr;
use std::ffi::CStr;

pub(crate) fn cvt(result: xr::Result) -> Result<xr::Result, xr::Result> {
    if result.into_raw() >= 0 {
        Ok(result)
    } else {
        Err(result)
    }
}

/// The entry points of the wrapped runtime that this layer calls down into,
/// resolved once per instance. The dispatch layer owns one of these and hands
/// it to every per-session object; nothing here is a process-wide global.
pub struct RuntimeHooks {
    instance: xr::Instance,
    get_instance_properties: xr::pfn::GetInstanceProperties,
    create_swapchain: xr::pfn::CreateSwapchain,
    destroy_swapchain: xr::pfn::DestroySwapchain,
    enumerate_swapchain_images: xr::pfn::EnumerateSwapchainImages,
    enumerate_swapchain_formats: xr::pfn::EnumerateSwapchainFormats,
    acquire_swapchain_image: xr::pfn::AcquireSwapchainImage,
    wait_swapchain_image: xr::pfn::WaitSwapchainImage,
    release_swapchain_image: xr::pfn::ReleaseSwapchainImage,
    wait_frame: xr::pfn::WaitFrame,
    begin_frame: xr::pfn::BeginFrame,
    end_frame: xr::pfn::EndFrame,
}

impl RuntimeHooks {
    pub fn load(
        instance: xr::Instance,
        get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
    ) -> Result<Self, SetupError> {
        macro_rules! hook {
            ($name:ident) => {{
                const NAME: &CStr = match CStr::from_bytes_with_nul(
                    concat!("xr", stringify!($name), "\0").as_bytes(),
                ) {
                    Ok(name) => name,
                    Err(_) => panic!("unterminated function name"),
                };
                let mut function: Option<xr::pfn::VoidFunction> = None;
                let res = unsafe { get_instance_proc_addr(instance, NAME.as_ptr(), &mut function) };
                match (cvt(res), function) {
                    // SAFETY: the runtime advertised this pointer for this name.
                    (Ok(_), Some(function)) => unsafe {
                        std::mem::transmute::<xr::pfn::VoidFunction, xr::pfn::$name>(function)
                    },
                    _ => {
                        return Err(SetupError::MissingRuntimeEntryPoint(concat!(
                            "xr",
                            stringify!($name)
                        )))
                    }
                }
            }};
        }

        Ok(Self {
            instance,
            get_instance_properties: hook!(GetInstanceProperties),
            create_swapchain: hook!(CreateSwapchain),
            destroy_swapchain: hook!(DestroySwapchain),
            enumerate_swapchain_images: hook!(EnumerateSwapchainImages),
            enumerate_swapchain_formats: hook!(EnumerateSwapchainFormats),
            acquire_swapchain_image: hook!(AcquireSwapchainImage),
            wait_swapchain_image: hook!(WaitSwapchainImage),
            release_swapchain_image: hook!(ReleaseSwapchainImage),
            wait_frame: hook!(WaitFrame),
            begin_frame: hook!(BeginFrame),
            end_frame: hook!(EndFrame),
        })
    }

    pub fn instance(&self) -> xr::Instance {
        self.instance
    }

    pub fn runtime_name(&self) -> Result<String, xr::Result> {
        let mut properties = xr::InstanceProperties {
            ty: xr::InstanceProperties::TYPE,
            next: std::ptr::null_mut(),
            runtime_version: xr::Version::new(0, 0, 0),
            runtime_name: [0; xr::MAX_RUNTIME_NAME_SIZE],
        };
        cvt(unsafe { (self.get_instance_properties)(self.instance, &mut properties) })?;
        let name = unsafe { CStr::from_ptr(properties.runtime_name.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    pub fn create_swapchain(
        &self,
        session: xr::Session,
        info: &xr::SwapchainCreateInfo,
    ) -> Result<xr::Swapchain, xr::Result> {
        let mut swapchain = xr::Swapchain::NULL;
        cvt(unsafe { (self.create_swapchain)(session, info, &mut swapchain) })?;
        Ok(swapchain)
    }

    pub fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> Result<(), xr::Result> {
        cvt(unsafe { (self.destroy_swapchain)(swapchain) })?;
        Ok(())
    }

    /// Raw two-call enumeration; the graphics device interprets the image
    /// structs for its own API.
    pub fn enumerate_swapchain_images_raw(
        &self,
        swapchain: xr::Swapchain,
        capacity: u32,
        count: &mut u32,
        images: *mut xr::SwapchainImageBaseHeader,
    ) -> Result<(), xr::Result> {
        cvt(unsafe { (self.enumerate_swapchain_images)(swapchain, capacity, count, images) })?;
        Ok(())
    }

    pub fn enumerate_swapchain_formats(
        &self,
        session: xr::Session,
    ) -> Result<Vec<i64>, xr::Result> {
        let mut count = 0;
        cvt(unsafe {
            (self.enumerate_swapchain_formats)(session, 0, &mut count, std::ptr::null_mut())
        })?;
        let mut formats = vec![0i64; count as usize];
        cvt(unsafe {
            (self.enumerate_swapchain_formats)(session, count, &mut count, formats.as_mut_ptr())
        })?;
        formats.truncate(count as usize);
        Ok(formats)
    }

    pub fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> Result<u32, xr::Result> {
        let mut index = 0;
        cvt(unsafe {
            (self.acquire_swapchain_image)(swapchain, std::ptr::null(), &mut index)
        })?;
        Ok(index)
    }

    pub fn wait_swapchain_image(
        &self,
        swapchain: xr::Swapchain,
        timeout: xr::Duration,
    ) -> Result<(), xr::Result> {
        let info = xr::SwapchainImageWaitInfo {
            ty: xr::SwapchainImageWaitInfo::TYPE,
            next: std::ptr::null_mut(),
            timeout,
        };
        cvt(unsafe { (self.wait_swapchain_image)(swapchain, &info) })?;
        Ok(())
    }

    pub fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> Result<(), xr::Result> {
        cvt(unsafe { (self.release_swapchain_image)(swapchain, std::ptr::null()) })?;
        Ok(())
    }

    pub fn wait_frame(&self, session: xr::Session) -> Result<xr::FrameState, xr::Result> {
        let mut state = xr::FrameState {
            ty: xr::FrameState::TYPE,
            next: std::ptr::null_mut(),
            predicted_display_time: xr::Time::from_nanos(0),
            predicted_display_period: xr::Duration::from_nanos(0),
            should_render: false.into(),
        };
        cvt(unsafe { (self.wait_frame)(session, std::ptr::null(), &mut state) })?;
        Ok(state)
    }

    pub fn begin_frame(&self, session: xr::Session) -> Result<xr::Result, xr::Result> {
        cvt(unsafe { (self.begin_frame)(session, std::ptr::null()) })
    }

    pub fn end_frame(
        &self,
        session: xr::Session,
        info: &xr::FrameEndInfo,
    ) -> Result<(), xr::Result> {
        cvt(unsafe { (self.end_frame)(session, info) })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_runtime;

    #[test]
    fn load_resolves_every_hook() {
        let _guard = fake_runtime::lock_and_reset();
        let hooks = RuntimeHooks::load(
            fake_runtime::instance(),
            fake_runtime::get_instance_proc_addr,
        )
        .unwrap();
        assert_eq!(hooks.instance(), fake_runtime::instance());
        assert_eq!(hooks.runtime_name().unwrap(), "Fake Runtime");
    }

    #[test]
    fn format_enumeration_uses_two_calls() {
        let _guard = fake_runtime::lock_and_reset();
        fake_runtime::set_swapchain_formats(&[40, 50, 60]);
        let hooks = RuntimeHooks::load(
            fake_runtime::instance(),
            fake_runtime::get_instance_proc_addr,
        )
        .unwrap();
        assert_eq!(
            hooks
                .enumerate_swapchain_formats(fake_runtime::session())
                .unwrap(),
            vec![40, 50, 60]
        );
    }
}
