use crate::{runtime::RuntimeHooks, settings::Settings, tracy_span, warn_once};
use log::{debug, error, info, trace};
use openxr_sys as xr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded poll used at the end of a frame; long enough for any healthy wait,
/// short enough to survive a caller that calls the triad out of order.
const END_FRAME_POLL: Duration = Duration::from_secs(1);
const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum TeardownError {
    /// The background frame wait never returned. It holds live runtime
    /// references, so destroying the session now would be a use-after-free.
    BackgroundWaitHung,
}

#[derive(Default)]
struct WaitData {
    completed: bool,
    predicted_display_time: i64,
    predicted_display_period: i64,
}

/// One-shot hand-off between the background wait task (producer) and the
/// frame triad (consumer). Has its own mutex, separate from the triad lock,
/// since the producer publishes from another thread.
#[derive(Default)]
struct WaitCell {
    data: Mutex<WaitData>,
    cond: Condvar,
}

impl WaitCell {
    fn publish(&self, state: &xr::FrameState) {
        let mut data = self.data.lock().unwrap();
        data.predicted_display_time = state.predicted_display_time.as_nanos();
        data.predicted_display_period = state.predicted_display_period.as_nanos();
        data.completed = true;
        drop(data);
        self.cond.notify_all();
    }

    /// Unblocks consumers after a failed wait; the last good values stand.
    fn publish_failed(&self) {
        self.data.lock().unwrap().completed = true;
        self.cond.notify_all();
    }

    /// Stored even in synchronous mode, so a transition into pipelining
    /// starts from real values.
    fn record_synchronous(&self, state: &xr::FrameState) {
        let mut data = self.data.lock().unwrap();
        data.predicted_display_time = state.predicted_display_time.as_nanos();
        data.predicted_display_period = state.predicted_display_period.as_nanos();
    }

    fn begin_cycle(&self) {
        self.data.lock().unwrap().completed = false;
    }

    fn wait_completed(&self) {
        let data = self.data.lock().unwrap();
        let _data = self.cond.wait_while(data, |data| !data.completed).unwrap();
    }

    fn wait_completed_timeout(&self, timeout: Duration) -> bool {
        let data = self.data.lock().unwrap();
        let (_data, result) = self
            .cond
            .wait_timeout_while(data, timeout, |data| !data.completed)
            .unwrap();
        !result.timed_out()
    }
}

#[derive(Default)]
struct FrameLoop {
    background: Option<JoinHandle<()>>,
    background_polled: bool,
    last_wait_instant: Option<Instant>,
    /// Floor for the monotonic clamp, in nanoseconds.
    last_predicted_time: i64,
}

/// The wait/begin/end state machine. Synchronous mode passes the triad
/// through; pipelined ("turbo") mode runs the blocking wait on a background
/// task and lets the application proceed, with at most one frame of
/// look-ahead.
pub struct FramePacer {
    hooks: Arc<RuntimeHooks>,
    session: xr::Session,
    turbo_allowed: bool,
    turbo_enabled: AtomicBool,
    teardown_timeout: Duration,
    frame: Mutex<FrameLoop>,
    wait_cell: Arc<WaitCell>,
}

impl FramePacer {
    pub fn new(
        hooks: Arc<RuntimeHooks>,
        session: xr::Session,
        settings: &Settings,
        runtime_name: &str,
    ) -> Self {
        // Deferring swapchain releases and pipelining the frame wait each hold
        // a resource back by one frame; together they would blow the runtime's
        // budget. Policy decision, not an error.
        let quirked = settings.needs_deferred_swapchain_release(runtime_name);
        let mut turbo = settings.turbo_mode;
        if quirked && turbo {
            info!("Denying turbo mode due to deferred swapchain release");
            turbo = false;
        }
        if turbo {
            info!("Turbo: Enabled");
        }

        Self {
            hooks,
            session,
            turbo_allowed: !quirked,
            turbo_enabled: AtomicBool::new(turbo),
            teardown_timeout: TEARDOWN_WAIT,
            frame: Mutex::default(),
            wait_cell: Arc::default(),
        }
    }

    #[cfg(test)]
    fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn turbo_enabled(&self) -> bool {
        self.turbo_enabled.load(Ordering::Relaxed)
    }

    pub fn set_turbo(&self, enable: bool) {
        if enable && !self.turbo_allowed {
            info!("Denying turbo mode due to deferred swapchain release");
            return;
        }
        if enable != self.turbo_enabled.swap(enable, Ordering::Relaxed) {
            info!("Turbo: {}", if enable { "Enabled" } else { "Disabled" });
        }
    }

    pub fn wait_frame(&self) -> Result<xr::FrameState, xr::Result> {
        tracy_span!();
        let mut frame = self.frame.lock().unwrap();
        let previous_wait = frame.last_wait_instant;
        let now = Instant::now();
        frame.last_wait_instant = Some(now);

        let mut state = if frame.background.is_some() {
            // One frame of pipelining is accepted; a second wait against the
            // same outstanding frame has to block it out.
            if frame.background_polled {
                trace!("second wait against the outstanding frame");
                self.wait_cell.wait_completed();
            }
            frame.background_polled = true;

            // Don't actually wait; make up a predicted time.
            let data = self.wait_cell.data.lock().unwrap();
            let predicted = if data.completed {
                data.predicted_display_time
            } else {
                let elapsed = previous_wait
                    .map(|previous| (now - previous).as_nanos() as i64)
                    .unwrap_or(0);
                data.predicted_display_time + elapsed
            };
            xr::FrameState {
                ty: xr::FrameState::TYPE,
                next: std::ptr::null_mut(),
                predicted_display_time: xr::Time::from_nanos(predicted),
                predicted_display_period: xr::Duration::from_nanos(data.predicted_display_period),
                // The application went unthrottled this frame; have it render.
                should_render: true.into(),
            }
        } else {
            drop(frame);
            let result = {
                tracy_span!("runtime wait frame");
                self.hooks.wait_frame(self.session)
            };
            frame = self.frame.lock().unwrap();
            let state = result?;
            self.wait_cell.record_synchronous(&state);
            state
        };

        // The predicted display time must increase monotonically, including
        // across mode transitions.
        let floor = frame.last_predicted_time + 1;
        if state.predicted_display_time.as_nanos() < floor {
            state.predicted_display_time = xr::Time::from_nanos(floor);
        }
        frame.last_predicted_time = state.predicted_display_time.as_nanos();

        trace!("wait frame: predicted time {}", frame.last_predicted_time);
        Ok(state)
    }

    pub fn begin_frame(&self) -> Result<xr::Result, xr::Result> {
        tracy_span!();
        let frame = self.frame.lock().unwrap();
        if frame.background.is_some() {
            // The real begin was already issued by the previous end.
            trace!("begin absorbed, background wait outstanding");
            return Ok(xr::Result::SUCCESS);
        }
        self.hooks.begin_frame(self.session)
    }

    pub fn end_frame(&self, info: &xr::FrameEndInfo) -> Result<(), xr::Result> {
        tracy_span!();
        let mut frame = self.frame.lock().unwrap();

        if let Some(background) = frame.background.take() {
            // Latest point by which the previous frame must have been fully
            // waited. Bounded: some engine call patterns would otherwise have
            // us attempt a double wait and block here forever.
            let ready = {
                tracy_span!("wait background task");
                self.wait_cell.wait_completed_timeout(END_FRAME_POLL)
            };
            if ready {
                let _ = background.join();
            } else {
                warn_once!("Background frame wait still running at end of frame");
                frame.background = Some(background);
            }

            // Begin the next frame now so the coming end has a valid bracket.
            // Passthrough on failure (eg. the session state machine advanced).
            if let Err(e) = self.hooks.begin_frame(self.session) {
                error!("Deferred begin frame failed: {e:?}");
                return Err(e);
            }
        }

        self.hooks.end_frame(self.session, info)?;

        if self.turbo_enabled.load(Ordering::Relaxed) && frame.background.is_none() {
            frame.background_polled = false;
            self.wait_cell.begin_cycle();

            let hooks = self.hooks.clone();
            let session = self.session;
            let cell = self.wait_cell.clone();
            trace!("starting background frame wait");
            frame.background = Some(std::thread::spawn(move || {
                match hooks.wait_frame(session) {
                    Ok(state) => cell.publish(&state),
                    Err(e) => {
                        error!("Background wait frame failed: {e:?}");
                        cell.publish_failed();
                    }
                }
            }));
        }

        Ok(())
    }

    /// Waits out any outstanding background wait. Called before destroying a
    /// swapchain the pending frame might still hold onto.
    pub fn drain(&self) {
        let frame = self.frame.lock().unwrap();
        if frame.background.is_some() {
            tracy_span!("drain background wait");
            self.wait_cell.wait_completed();
        }
    }

    /// Waits out the background task before the session is destroyed.
    pub fn shutdown(&self) -> Result<(), TeardownError> {
        let mut frame = self.frame.lock().unwrap();
        if let Some(background) = frame.background.take() {
            if !self.wait_cell.wait_completed_timeout(self.teardown_timeout) {
                frame.background = Some(background);
                return Err(TeardownError::BackgroundWaitHung);
            }
            let _ = background.join();
        }
        Ok(())
    }

    /// Forgets per-session pacing state. Call once the session has been
    /// (re)started and any previous background wait was shut down.
    pub fn reset(&self) {
        let mut frame = self.frame.lock().unwrap();
        debug_assert!(frame.background.is_none());
        *frame = FrameLoop::default();
        *self.wait_cell.data.lock().unwrap() = WaitData::default();
    }

    /// The Oculus runtime hangs on the first wait after a session restart;
    /// an extra begin unblocks its state machine.
    pub fn prime_after_session_begin(&self) {
        let result = self.hooks.begin_frame(self.session);
        debug!("Priming begin frame returned {result:?}");
    }
}
