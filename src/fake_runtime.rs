//! A tiny in-process stand-in for an OpenXR runtime, exposed through
//! `xrGetInstanceProcAddr` like the real thing. State lives in statics, so
//! tests serialize themselves with [`lock_and_reset`].

use openxr_sys as xr;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub fn instance() -> xr::Instance {
    xr::Instance::from_raw(1)
}

pub fn session() -> xr::Session {
    xr::Session::from_raw(1)
}

static GUARD: Mutex<()> = Mutex::new(());

/// Serializes access to the fake runtime and resets it to a known state.
pub fn lock_and_reset() -> MutexGuard<'static, ()> {
    let guard = GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    reset();
    guard
}

struct FakeSwapchain {
    image_count: u32,
    next_acquire: u32,
    acquired: VecDeque<u32>,
    release_count: u32,
}

static SWAPCHAINS: LazyLock<Mutex<HashMap<u64, FakeSwapchain>>> =
    LazyLock::new(Mutex::default);
static FORMATS: LazyLock<Mutex<Vec<i64>>> = LazyLock::new(Mutex::default);
static RUNTIME_NAME: LazyLock<Mutex<String>> = LazyLock::new(Mutex::default);

static NEXT_SWAPCHAIN: AtomicU64 = AtomicU64::new(1);
static IMAGE_COUNT: AtomicU32 = AtomicU32::new(3);
static DESTROYED_SWAPCHAINS: AtomicU32 = AtomicU32::new(0);

static WAIT_CALLS: AtomicU32 = AtomicU32::new(0);
static BEGIN_CALLS: AtomicU32 = AtomicU32::new(0);
static END_CALLS: AtomicU32 = AtomicU32::new(0);
static CONCURRENT_WAITS: AtomicI32 = AtomicI32::new(0);
static MAX_CONCURRENT_WAITS: AtomicI32 = AtomicI32::new(0);
static WAIT_DELAY_MS: AtomicU64 = AtomicU64::new(0);
static NEXT_PREDICTED_TIME: AtomicI64 = AtomicI64::new(1000);
static PREDICTED_STEP: AtomicI64 = AtomicI64::new(100);
static PREDICTED_PERIOD: AtomicI64 = AtomicI64::new(100);
static SHOULD_RENDER: AtomicBool = AtomicBool::new(true);
static BEGIN_RESULT: AtomicI32 = AtomicI32::new(0);
static END_RESULT: AtomicI32 = AtomicI32::new(0);

fn reset() {
    SWAPCHAINS.lock().unwrap().clear();
    FORMATS.lock().unwrap().clear();
    *RUNTIME_NAME.lock().unwrap() = "Fake Runtime".to_owned();
    NEXT_SWAPCHAIN.store(1, Ordering::SeqCst);
    IMAGE_COUNT.store(3, Ordering::SeqCst);
    DESTROYED_SWAPCHAINS.store(0, Ordering::SeqCst);
    WAIT_CALLS.store(0, Ordering::SeqCst);
    BEGIN_CALLS.store(0, Ordering::SeqCst);
    END_CALLS.store(0, Ordering::SeqCst);
    CONCURRENT_WAITS.store(0, Ordering::SeqCst);
    MAX_CONCURRENT_WAITS.store(0, Ordering::SeqCst);
    WAIT_DELAY_MS.store(0, Ordering::SeqCst);
    NEXT_PREDICTED_TIME.store(1000, Ordering::SeqCst);
    PREDICTED_STEP.store(100, Ordering::SeqCst);
    PREDICTED_PERIOD.store(100, Ordering::SeqCst);
    SHOULD_RENDER.store(true, Ordering::SeqCst);
    BEGIN_RESULT.store(0, Ordering::SeqCst);
    END_RESULT.store(0, Ordering::SeqCst);
}

pub fn set_swapchain_image_count(count: u32) {
    IMAGE_COUNT.store(count, Ordering::SeqCst);
}

pub fn set_swapchain_formats(formats: &[i64]) {
    *FORMATS.lock().unwrap() = formats.to_vec();
}

pub fn set_runtime_name(name: &str) {
    *RUNTIME_NAME.lock().unwrap() = name.to_owned();
}

pub fn set_wait_delay(delay: Duration) {
    WAIT_DELAY_MS.store(delay.as_millis() as u64, Ordering::SeqCst);
}

pub fn set_predicted_step(step: i64) {
    PREDICTED_STEP.store(step, Ordering::SeqCst);
}

pub fn set_next_predicted_time(time: i64) {
    NEXT_PREDICTED_TIME.store(time, Ordering::SeqCst);
}

pub fn set_begin_result(result: xr::Result) {
    BEGIN_RESULT.store(result.into_raw(), Ordering::SeqCst);
}

pub fn set_end_result(result: xr::Result) {
    END_RESULT.store(result.into_raw(), Ordering::SeqCst);
}

pub fn set_should_render(render: bool) {
    SHOULD_RENDER.store(render, Ordering::SeqCst);
}

pub fn wait_calls() -> u32 {
    WAIT_CALLS.load(Ordering::SeqCst)
}

pub fn begin_calls() -> u32 {
    BEGIN_CALLS.load(Ordering::SeqCst)
}

pub fn end_calls() -> u32 {
    END_CALLS.load(Ordering::SeqCst)
}

pub fn max_concurrent_waits() -> i32 {
    MAX_CONCURRENT_WAITS.load(Ordering::SeqCst)
}

pub fn concurrent_waits() -> i32 {
    CONCURRENT_WAITS.load(Ordering::SeqCst)
}

pub fn release_count(swapchain: xr::Swapchain) -> u32 {
    SWAPCHAINS
        .lock()
        .unwrap()
        .get(&swapchain.into_raw())
        .map(|s| s.release_count)
        .unwrap_or(0)
}

pub fn destroyed_swapchains() -> u32 {
    DESTROYED_SWAPCHAINS.load(Ordering::SeqCst)
}

pub extern "system" fn get_instance_proc_addr(
    _instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<xr::pfn::VoidFunction>,
) -> xr::Result {
    let name = unsafe { CStr::from_ptr(name) };

    macro_rules! fns {
        ($($name:literal => $fn:ident: $pfn:ident),+ $(,)?) => {
            match name.to_bytes() {
                $(
                    $name => Some(unsafe {
                        std::mem::transmute::<xr::pfn::$pfn, xr::pfn::VoidFunction>($fn)
                    }),
                )+
                _ => None,
            }
        }
    }

    let resolved = fns! {
        b"xrGetInstanceProperties" => get_instance_properties: GetInstanceProperties,
        b"xrCreateSwapchain" => create_swapchain: CreateSwapchain,
        b"xrDestroySwapchain" => destroy_swapchain: DestroySwapchain,
        b"xrEnumerateSwapchainImages" => enumerate_swapchain_images: EnumerateSwapchainImages,
        b"xrEnumerateSwapchainFormats" => enumerate_swapchain_formats: EnumerateSwapchainFormats,
        b"xrAcquireSwapchainImage" => acquire_swapchain_image: AcquireSwapchainImage,
        b"xrWaitSwapchainImage" => wait_swapchain_image: WaitSwapchainImage,
        b"xrReleaseSwapchainImage" => release_swapchain_image: ReleaseSwapchainImage,
        b"xrWaitFrame" => wait_frame: WaitFrame,
        b"xrBeginFrame" => begin_frame: BeginFrame,
        b"xrEndFrame" => end_frame: EndFrame,
    };

    match resolved {
        Some(resolved) => {
            unsafe { *function = Some(resolved) };
            xr::Result::SUCCESS
        }
        None => {
            unsafe { *function = None };
            xr::Result::ERROR_FUNCTION_UNSUPPORTED
        }
    }
}

extern "system" fn get_instance_properties(
    _instance: xr::Instance,
    properties: *mut xr::InstanceProperties,
) -> xr::Result {
    let name = RUNTIME_NAME.lock().unwrap();
    let properties = unsafe { &mut *properties };
    properties.runtime_version = xr::Version::new(0, 1, 0);
    properties.runtime_name = [0; xr::MAX_RUNTIME_NAME_SIZE];
    for (dst, src) in properties.runtime_name.iter_mut().zip(name.bytes()) {
        *dst = src as c_char;
    }
    xr::Result::SUCCESS
}

extern "system" fn create_swapchain(
    _session: xr::Session,
    info: *const xr::SwapchainCreateInfo,
    swapchain: *mut xr::Swapchain,
) -> xr::Result {
    let info = unsafe { info.as_ref() }.unwrap();
    if info.width == 0 || info.height == 0 {
        return xr::Result::ERROR_VALIDATION_FAILURE;
    }
    let handle = NEXT_SWAPCHAIN.fetch_add(1, Ordering::SeqCst);
    SWAPCHAINS.lock().unwrap().insert(
        handle,
        FakeSwapchain {
            image_count: IMAGE_COUNT.load(Ordering::SeqCst),
            next_acquire: 0,
            acquired: VecDeque::new(),
            release_count: 0,
        },
    );
    unsafe { swapchain.write(xr::Swapchain::from_raw(handle)) };
    xr::Result::SUCCESS
}

extern "system" fn destroy_swapchain(swapchain: xr::Swapchain) -> xr::Result {
    if SWAPCHAINS.lock().unwrap().remove(&swapchain.into_raw()).is_none() {
        return xr::Result::ERROR_HANDLE_INVALID;
    }
    DESTROYED_SWAPCHAINS.fetch_add(1, Ordering::SeqCst);
    xr::Result::SUCCESS
}

extern "system" fn enumerate_swapchain_images(
    swapchain: xr::Swapchain,
    capacity: u32,
    count: *mut u32,
    images: *mut xr::SwapchainImageBaseHeader,
) -> xr::Result {
    let swapchains = SWAPCHAINS.lock().unwrap();
    let Some(swapchain) = swapchains.get(&swapchain.into_raw()) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    unsafe { *count = swapchain.image_count };
    if capacity == 0 {
        return xr::Result::SUCCESS;
    }
    if capacity < swapchain.image_count {
        return xr::Result::ERROR_SIZE_INSUFFICIENT;
    }
    if !images.is_null() {
        let images = images.cast::<xr::SwapchainImageVulkanKHR>();
        for i in 0..swapchain.image_count {
            unsafe {
                (*images.add(i as usize)).image = 1000 + u64::from(i);
            }
        }
    }
    xr::Result::SUCCESS
}

extern "system" fn enumerate_swapchain_formats(
    _session: xr::Session,
    capacity: u32,
    count: *mut u32,
    formats: *mut i64,
) -> xr::Result {
    let all = FORMATS.lock().unwrap();
    unsafe { *count = all.len() as u32 };
    if capacity == 0 {
        return xr::Result::SUCCESS;
    }
    if (capacity as usize) < all.len() {
        return xr::Result::ERROR_SIZE_INSUFFICIENT;
    }
    for (i, format) in all.iter().enumerate() {
        unsafe { formats.add(i).write(*format) };
    }
    xr::Result::SUCCESS
}

extern "system" fn acquire_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageAcquireInfo,
    index: *mut u32,
) -> xr::Result {
    let mut swapchains = SWAPCHAINS.lock().unwrap();
    let Some(swapchain) = swapchains.get_mut(&swapchain.into_raw()) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    if swapchain.acquired.len() as u32 == swapchain.image_count {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    let acquired = swapchain.next_acquire;
    swapchain.next_acquire = (swapchain.next_acquire + 1) % swapchain.image_count;
    swapchain.acquired.push_back(acquired);
    unsafe { index.write(acquired) };
    xr::Result::SUCCESS
}

extern "system" fn wait_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageWaitInfo,
) -> xr::Result {
    let swapchains = SWAPCHAINS.lock().unwrap();
    let Some(swapchain) = swapchains.get(&swapchain.into_raw()) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    if swapchain.acquired.is_empty() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    xr::Result::SUCCESS
}

extern "system" fn release_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageReleaseInfo,
) -> xr::Result {
    let mut swapchains = SWAPCHAINS.lock().unwrap();
    let Some(swapchain) = swapchains.get_mut(&swapchain.into_raw()) else {
        return xr::Result::ERROR_HANDLE_INVALID;
    };
    if swapchain.acquired.pop_front().is_none() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    swapchain.release_count += 1;
    xr::Result::SUCCESS
}

extern "system" fn wait_frame(
    _session: xr::Session,
    _info: *const xr::FrameWaitInfo,
    state: *mut xr::FrameState,
) -> xr::Result {
    WAIT_CALLS.fetch_add(1, Ordering::SeqCst);
    let concurrent = CONCURRENT_WAITS.fetch_add(1, Ordering::SeqCst) + 1;
    MAX_CONCURRENT_WAITS.fetch_max(concurrent, Ordering::SeqCst);

    let delay = WAIT_DELAY_MS.load(Ordering::SeqCst);
    if delay > 0 {
        std::thread::sleep(Duration::from_millis(delay));
    }
    let time =
        NEXT_PREDICTED_TIME.fetch_add(PREDICTED_STEP.load(Ordering::SeqCst), Ordering::SeqCst);
    CONCURRENT_WAITS.fetch_sub(1, Ordering::SeqCst);

    unsafe {
        state.write(xr::FrameState {
            ty: xr::FrameState::TYPE,
            next: std::ptr::null_mut(),
            predicted_display_time: xr::Time::from_nanos(time),
            predicted_display_period: xr::Duration::from_nanos(
                PREDICTED_PERIOD.load(Ordering::SeqCst),
            ),
            should_render: SHOULD_RENDER.load(Ordering::SeqCst).into(),
        })
    }
    xr::Result::SUCCESS
}

extern "system" fn begin_frame(
    _session: xr::Session,
    _info: *const xr::FrameBeginInfo,
) -> xr::Result {
    BEGIN_CALLS.fetch_add(1, Ordering::SeqCst);
    xr::Result::from_raw(BEGIN_RESULT.load(Ordering::SeqCst))
}

extern "system" fn end_frame(_session: xr::Session, _info: *const xr::FrameEndInfo) -> xr::Result {
    END_CALLS.fetch_add(1, Ordering::SeqCst);
    xr::Result::from_raw(END_RESULT.load(Ordering::SeqCst))
}
