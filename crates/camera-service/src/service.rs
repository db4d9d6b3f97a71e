use anyhow::{Context, Result, bail};
use camera_ipc::{ClientSession, FrameView, IpcError, PixelFormat, SessionState};
use common::retry::retry_with_backoff;

/// Updates a temporary unpause waits before pausing the camera again
const TICKS_BEFORE_REPAUSE: u32 = 3;

/// Delay before the second connection attempt; doubles after that
const INIT_RETRY_DELAY_MS: u64 = 200;

const NS_PER_MS: u64 = 1_000_000;

/// Power state of the camera as tracked by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    WaitingToInit,
    Running,
    WaitingToDelete,
}

/// A frame held by the camera client until it is released.
pub trait CapturedFrame {
    fn frame_id(&self) -> u32;
    /// Capture time, monotonic nanoseconds
    fn timestamp(&self) -> u64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> Option<PixelFormat>;
    fn pixels(&self) -> &[u8];
}

/// The camera client operations the service drives.
pub trait CameraBackend {
    type Frame: CapturedFrame;

    fn status(&self) -> SessionState;
    fn start(&self) -> Result<(), IpcError>;
    fn stop(&self) -> Result<(), IpcError>;
    fn release(&self) -> Result<(), IpcError>;
    fn destroy(&self) -> bool;
    fn pause(&self, paused: bool) -> Result<(), IpcError>;
    fn set_exposure(&self, exposure_ms: u16, gain: f32) -> Result<(), IpcError>;
    fn set_white_balance(&self, r_gain: f32, g_gain: f32, b_gain: f32) -> Result<(), IpcError>;
    fn set_capture_format(&self, format: PixelFormat) -> Result<(), IpcError>;
    fn set_capture_snapshot(&self, start: bool) -> Result<(), IpcError>;
    fn acquire_frame(&self, timestamp_ns: u64) -> Option<Self::Frame>;
    fn release_frame(&self, frame_id: u32) -> bool;
}

impl CapturedFrame for FrameView {
    fn frame_id(&self) -> u32 {
        FrameView::frame_id(self)
    }

    fn timestamp(&self) -> u64 {
        FrameView::timestamp(self)
    }

    fn width(&self) -> u32 {
        FrameView::width(self)
    }

    fn height(&self) -> u32 {
        FrameView::height(self)
    }

    fn format(&self) -> Option<PixelFormat> {
        FrameView::format(self)
    }

    fn pixels(&self) -> &[u8] {
        FrameView::pixels(self)
    }
}

impl CameraBackend for ClientSession {
    type Frame = FrameView;

    fn status(&self) -> SessionState {
        ClientSession::status(self)
    }

    fn start(&self) -> Result<(), IpcError> {
        ClientSession::start(self).map(drop)
    }

    fn stop(&self) -> Result<(), IpcError> {
        ClientSession::stop(self).map(drop)
    }

    fn release(&self) -> Result<(), IpcError> {
        ClientSession::release(self).map(drop)
    }

    fn destroy(&self) -> bool {
        ClientSession::destroy(self)
    }

    fn pause(&self, paused: bool) -> Result<(), IpcError> {
        ClientSession::pause(self, paused)
    }

    fn set_exposure(&self, exposure_ms: u16, gain: f32) -> Result<(), IpcError> {
        ClientSession::set_exposure(self, exposure_ms, gain)
    }

    fn set_white_balance(&self, r_gain: f32, g_gain: f32, b_gain: f32) -> Result<(), IpcError> {
        ClientSession::set_white_balance(self, r_gain, g_gain, b_gain)
    }

    fn set_capture_format(&self, format: PixelFormat) -> Result<(), IpcError> {
        ClientSession::set_capture_format(self, format)
    }

    fn set_capture_snapshot(&self, start: bool) -> Result<(), IpcError> {
        ClientSession::set_capture_snapshot(self, start)
    }

    fn acquire_frame(&self, timestamp_ns: u64) -> Option<FrameView> {
        ClientSession::acquire_frame(self, timestamp_ns)
    }

    fn release_frame(&self, frame_id: u32) -> bool {
        ClientSession::release_frame(self, frame_id)
    }
}

/// An owned copy of a captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub frame_id: u32,
    /// Capture time, monotonic milliseconds
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

/// Monotonic clock in milliseconds, the time base of [`ImageFrame`].
pub fn monotonic_ms() -> u64 {
    use nix::time::{ClockId, clock_gettime};

    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(now) => now.tv_sec() as u64 * 1_000 + now.tv_nsec() as u64 / NS_PER_MS,
        Err(e) => {
            tracing::error!(error = %e, "Monotonic clock unavailable");
            0
        }
    }
}

type Connector<S> = Box<dyn FnMut() -> Result<S, IpcError> + Send>;
type RestartCallback = Box<dyn FnMut() + Send>;

/// Keeps a camera client alive for an application.
///
/// Tracks power state on top of the session state, re-initializes the
/// client when the camera server goes away, and hides the details of
/// pausing: the first frame after a pause change is dropped, and parameter
/// changes briefly wake a paused sensor so they take effect.
pub struct CameraService<S: CameraBackend> {
    connect: Connector<S>,
    init_retries: u32,
    session: Option<S>,
    power: PowerState,
    restarting: bool,
    on_restart: Option<RestartCallback>,
    waiting_for_format_change: bool,
    current_format: Option<PixelFormat>,
    skip_next_image: bool,
    paused: bool,
    temporary_unpause: bool,
    unpause_ticks: u32,
}

impl CameraService<ClientSession> {
    pub fn from_config(config: &crate::config::ServiceConfig) -> Self {
        let client = config.client.clone();
        Self::new(
            Box::new(move || ClientSession::init(client.clone())),
            config.init_retries,
        )
    }
}

impl<S: CameraBackend> CameraService<S> {
    pub fn new(connect: Connector<S>, init_retries: u32) -> Self {
        Self {
            connect,
            init_retries,
            session: None,
            power: PowerState::Off,
            restarting: false,
            on_restart: None,
            waiting_for_format_change: false,
            current_format: None,
            skip_next_image: false,
            paused: false,
            temporary_unpause: false,
            unpause_ticks: 0,
        }
    }

    /// Called each time the camera comes back after the server went away.
    /// Only one callback can be registered.
    pub fn register_on_restart(&mut self, callback: RestartCallback) {
        if self.on_restart.is_some() {
            tracing::warn!("Camera restart callback already registered");
            return;
        }
        self.on_restart = Some(callback);
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_some() && self.power == PowerState::Running
    }

    fn status(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Offline, CameraBackend::status)
    }

    /// Connect to the camera server and request streaming. The camera is
    /// ready once a later [`Self::update`] sees it running.
    pub fn init(&mut self) -> Result<()> {
        let status = self.status();
        if status == SessionState::Running && self.power == PowerState::Running {
            tracing::info!("Camera already initialized");
            return Ok(());
        }
        if status != SessionState::Offline || self.power != PowerState::Off {
            tracing::warn!(
                status = status.as_str(),
                power = ?self.power,
                "Camera still running, not initializing"
            );
            bail!("camera busy: status {}, power {:?}", status.as_str(), self.power);
        }

        tracing::info!("Initializing camera");
        self.power = PowerState::WaitingToInit;

        let session = match self.connect_with_retry() {
            Ok(session) => session,
            Err(e) => {
                self.power = PowerState::Off;
                return Err(e);
            }
        };

        if let Err(e) = session.start() {
            self.power = PowerState::Off;
            return Err(e).context("Failed to start camera");
        }

        self.session = Some(session);
        Ok(())
    }

    fn connect_with_retry(&mut self) -> Result<S> {
        let connect = &mut self.connect;
        retry_with_backoff(
            connect,
            self.init_retries,
            INIT_RETRY_DELAY_MS,
            "Camera init",
        )
        .context("Failed to connect to the camera server")
    }

    /// Stop streaming and unregister. The session is torn down by later
    /// [`Self::update`] calls.
    pub fn delete(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            tracing::info!("Camera already deleted");
            return Ok(());
        };
        match self.power {
            PowerState::Off => {
                tracing::info!("Camera already deleted");
                return Ok(());
            }
            PowerState::Running => {}
            other => bail!("camera not running: power {:?}", other),
        }

        self.power = PowerState::WaitingToDelete;

        let stopped = session
            .stop()
            .context("Failed to stop camera")
            .and_then(|()| session.release().context("Failed to release camera"));
        if stopped.is_err() {
            self.power = PowerState::Running;
        }
        stopped
    }

    /// Drive the session forward. Call periodically.
    pub fn update(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        if self.power == PowerState::WaitingToDelete {
            if session.destroy() {
                tracing::info!("Camera deleted");
                self.power = PowerState::Off;
                self.session = None;
            }
            return Ok(());
        }

        if self.temporary_unpause {
            if self.unpause_ticks >= TICKS_BEFORE_REPAUSE {
                self.pause(true);
                self.temporary_unpause = false;
                self.unpause_ticks = 0;
            } else {
                self.unpause_ticks += 1;
            }
        }

        let status = self.status();

        if self.power == PowerState::WaitingToInit {
            if status == SessionState::Running {
                tracing::info!("Camera running");
                self.power = PowerState::Running;
            }
            return Ok(());
        }

        if self.restarting && status == SessionState::Running {
            tracing::info!("Camera client restarted");
            self.restarting = false;
            self.waiting_for_format_change = false;
            self.current_format = None;
            if let Some(callback) = self.on_restart.as_mut() {
                callback();
            }
        }

        if status != SessionState::Running {
            self.restarting = true;
            self.recover(status)?;
        }

        Ok(())
    }

    fn recover(&mut self, status: SessionState) -> Result<()> {
        let mut status = status;

        if status == SessionState::Offline {
            // The client reconnects on its own while its worker is alive;
            // only a finished worker needs a fresh session
            let finished = self.session.as_ref().is_none_or(CameraBackend::destroy);
            if !finished {
                return Ok(());
            }

            tracing::info!("Camera is offline, re-initializing");
            self.session = None;
            let session = self.connect_with_retry()?;
            status = session.status();
            self.session = Some(session);
        }

        if status == SessionState::Idle {
            tracing::info!("Camera is idle, restarting");
            if let Some(session) = self.session.as_ref() {
                session.start().context("Failed to restart camera")?;
            }
        }

        Ok(())
    }

    /// Put the camera in or out of standby. The next frame is dropped
    /// either way, since it may predate the change.
    pub fn pause(&mut self, paused: bool) {
        if let Some(session) = self.session.as_ref() {
            if let Err(e) = session.pause(paused) {
                tracing::warn!(paused, error = %e, "Failed to change camera standby");
            }
        }
        self.skip_next_image = true;
        self.paused = paused;
    }

    /// Parameters only take effect on a running sensor.
    fn unpause_for_setting(&mut self) {
        if self.paused {
            self.pause(false);
            self.temporary_unpause = true;
        }
    }

    pub fn set_exposure(&mut self, exposure_ms: u16, gain: f32) {
        if !self.is_ready() {
            return;
        }
        if self.waiting_for_format_change {
            tracing::info!("Not setting exposure and gain while format is changing");
            return;
        }

        self.unpause_for_setting();
        self.with_session(|s| s.set_exposure(exposure_ms, gain), "exposure");
    }

    pub fn set_white_balance(&mut self, r_gain: f32, g_gain: f32, b_gain: f32) {
        if !self.is_ready() {
            return;
        }
        if self.waiting_for_format_change {
            tracing::info!("Not setting white balance while format is changing");
            return;
        }

        self.unpause_for_setting();
        self.with_session(
            |s| s.set_white_balance(r_gain, g_gain, b_gain),
            "white balance",
        );
    }

    /// Switch the capture format. Exposure and white balance changes are
    /// ignored until the first frame in the new format arrives.
    pub fn set_capture_format(&mut self, format: PixelFormat) {
        if !self.is_ready() {
            return;
        }

        self.unpause_for_setting();
        self.waiting_for_format_change = true;
        tracing::info!(?format, "Setting capture format");
        self.with_session(|s| s.set_capture_format(format), "capture format");
    }

    pub fn set_capture_snapshot(&mut self, start: bool) {
        if !self.is_ready() {
            return;
        }

        tracing::info!(start, "Changing snapshot mode");
        self.with_session(|s| s.set_capture_snapshot(start), "snapshot mode");
    }

    fn with_session(&self, f: impl FnOnce(&S) -> Result<(), IpcError>, what: &str) {
        if let Some(session) = self.session.as_ref() {
            if let Err(e) = f(session) {
                tracing::warn!(setting = what, error = %e, "Failed to send camera setting");
            }
        }
    }

    /// Copy out the frame closest to, but not after, `at_timestamp_ms`
    /// (0 = newest). The frame stays locked in the client until
    /// [`Self::release_frame`] is called with its id.
    pub fn get_frame(&mut self, at_timestamp_ms: u64) -> Option<ImageFrame> {
        if !self.is_ready() {
            return None;
        }
        let session = self.session.as_ref()?;

        let frame = session.acquire_frame(at_timestamp_ms.saturating_mul(NS_PER_MS))?;

        // Drop it only after acquiring so it is not handed out again
        if self.skip_next_image {
            session.release_frame(frame.frame_id());
            self.skip_next_image = false;
            return None;
        }

        let Some(format) = frame.format() else {
            tracing::warn!(frame_id = frame.frame_id(), "Dropping frame with unknown format");
            session.release_frame(frame.frame_id());
            return None;
        };

        if self.current_format != Some(format) {
            self.waiting_for_format_change = false;
            self.current_format = Some(format);
        }

        let timestamp_ms = match frame.timestamp() {
            0 => monotonic_ms(),
            ns => ns / NS_PER_MS,
        };

        Some(ImageFrame {
            frame_id: frame.frame_id(),
            timestamp_ms,
            width: frame.width(),
            height: frame.height(),
            format,
            pixels: frame.pixels().to_vec(),
        })
    }

    pub fn release_frame(&self, frame_id: u32) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.session
            .as_ref()
            .is_some_and(|s| s.release_frame(frame_id))
    }
}

impl<S: CameraBackend> std::fmt::Debug for CameraService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraService")
            .field("power", &self.power)
            .field("status", &self.status())
            .field("paused", &self.paused)
            .field("restarting", &self.restarting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct FakeFrame {
        frame_id: u32,
        timestamp: u64,
        format: Option<PixelFormat>,
    }

    impl CapturedFrame for FakeFrame {
        fn frame_id(&self) -> u32 {
            self.frame_id
        }

        fn timestamp(&self) -> u64 {
            self.timestamp
        }

        fn width(&self) -> u32 {
            2
        }

        fn height(&self) -> u32 {
            1
        }

        fn format(&self) -> Option<PixelFormat> {
            self.format
        }

        fn pixels(&self) -> &[u8] {
            &[1, 2, 3, 4, 5, 6]
        }
    }

    #[derive(Debug)]
    struct Camera {
        status: SessionState,
        worker_finished: bool,
        calls: Vec<String>,
        frames: VecDeque<FakeFrame>,
        released: Vec<u32>,
    }

    impl Default for Camera {
        fn default() -> Self {
            Self {
                status: SessionState::Offline,
                worker_finished: false,
                calls: Vec::new(),
                frames: VecDeque::new(),
                released: Vec::new(),
            }
        }
    }

    /// Scriptable stand-in for the camera client.
    #[derive(Clone, Default)]
    struct FakeCamera(Arc<Mutex<Camera>>);

    impl FakeCamera {
        fn set_status(&self, status: SessionState) {
            self.0.lock().unwrap().status = status;
        }

        fn push_frame(&self, frame_id: u32, timestamp: u64, format: PixelFormat) {
            self.0.lock().unwrap().frames.push_back(FakeFrame {
                frame_id,
                timestamp,
                format: Some(format),
            });
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().calls.clone()
        }

        fn clear_calls(&self) {
            self.0.lock().unwrap().calls.clear();
        }

        fn record(&self, call: impl Into<String>) -> Result<(), IpcError> {
            self.0.lock().unwrap().calls.push(call.into());
            Ok(())
        }
    }

    impl CameraBackend for FakeCamera {
        type Frame = FakeFrame;

        fn status(&self) -> SessionState {
            self.0.lock().unwrap().status
        }

        fn start(&self) -> Result<(), IpcError> {
            self.record("start")
        }

        fn stop(&self) -> Result<(), IpcError> {
            self.record("stop")
        }

        fn release(&self) -> Result<(), IpcError> {
            self.record("release")
        }

        fn destroy(&self) -> bool {
            let _ = self.record("destroy");
            self.0.lock().unwrap().worker_finished
        }

        fn pause(&self, paused: bool) -> Result<(), IpcError> {
            self.record(format!("pause({paused})"))
        }

        fn set_exposure(&self, exposure_ms: u16, _gain: f32) -> Result<(), IpcError> {
            self.record(format!("exposure({exposure_ms})"))
        }

        fn set_white_balance(&self, _r: f32, _g: f32, _b: f32) -> Result<(), IpcError> {
            self.record("white_balance")
        }

        fn set_capture_format(&self, format: PixelFormat) -> Result<(), IpcError> {
            self.record(format!("format({format:?})"))
        }

        fn set_capture_snapshot(&self, start: bool) -> Result<(), IpcError> {
            self.record(format!("snapshot({start})"))
        }

        fn acquire_frame(&self, timestamp_ns: u64) -> Option<FakeFrame> {
            let _ = self.record(format!("acquire({timestamp_ns})"));
            self.0.lock().unwrap().frames.pop_front()
        }

        fn release_frame(&self, frame_id: u32) -> bool {
            self.0.lock().unwrap().released.push(frame_id);
            true
        }
    }

    /// Service over a fake camera, with the number of connects made.
    fn service(camera: &FakeCamera) -> (CameraService<FakeCamera>, Arc<Mutex<u32>>) {
        let connects = Arc::new(Mutex::new(0));
        let connector = {
            let camera = camera.clone();
            let connects = Arc::clone(&connects);
            Box::new(move || {
                *connects.lock().unwrap() += 1;
                Ok::<_, IpcError>(camera.clone())
            })
        };
        (CameraService::new(connector, 1), connects)
    }

    fn running(camera: &FakeCamera) -> CameraService<FakeCamera> {
        let (mut service, _) = service(camera);
        service.init().unwrap();
        camera.set_status(SessionState::Running);
        service.update().unwrap();
        assert_eq!(service.power_state(), PowerState::Running);
        camera.clear_calls();
        service
    }

    #[test]
    fn test_init_waits_for_running() {
        let camera = FakeCamera::default();
        let (mut service, connects) = service(&camera);

        service.init().unwrap();
        assert_eq!(*connects.lock().unwrap(), 1);
        assert_eq!(camera.calls(), vec!["start"]);
        assert_eq!(service.power_state(), PowerState::WaitingToInit);
        assert!(!service.is_ready());

        service.update().unwrap();
        assert_eq!(service.power_state(), PowerState::WaitingToInit);

        camera.set_status(SessionState::Running);
        service.update().unwrap();
        assert!(service.is_ready());
        service.init().unwrap();
        assert_eq!(*connects.lock().unwrap(), 1, "Already running");
    }

    #[test]
    fn test_init_fails_while_busy() {
        let camera = FakeCamera::default();
        let (mut service, _) = service(&camera);
        service.init().unwrap();
        assert!(service.init().is_err(), "Still waiting for the first init");
    }

    #[test]
    fn test_init_failure_resets_power() {
        let mut service: CameraService<FakeCamera> =
            CameraService::new(Box::new(|| Err(IpcError::Destroyed)), 2);
        assert!(service.init().is_err());
        assert_eq!(service.power_state(), PowerState::Off);
    }

    #[test]
    fn test_delete_then_update_until_destroyed() {
        let camera = FakeCamera::default();
        let mut service = running(&camera);

        service.delete().unwrap();
        assert_eq!(camera.calls(), vec!["stop", "release"]);
        assert_eq!(service.power_state(), PowerState::WaitingToDelete);
        assert!(service.delete().is_err(), "Delete already in progress");

        service.update().unwrap();
        assert_eq!(service.power_state(), PowerState::WaitingToDelete);

        camera.0.lock().unwrap().worker_finished = true;
        service.update().unwrap();
        assert_eq!(service.power_state(), PowerState::Off);
        service.delete().unwrap();
    }

    #[test]
    fn test_restart_after_server_loss() {
        let camera = FakeCamera::default();
        let restarts = Arc::new(Mutex::new(0));
        let mut service = running(&camera);
        {
            let restarts = Arc::clone(&restarts);
            service.register_on_restart(Box::new(move || *restarts.lock().unwrap() += 1));
        }

        // Worker still reconnecting: nothing to do but wait
        camera.set_status(SessionState::Offline);
        service.update().unwrap();
        assert_eq!(camera.calls(), vec!["destroy"]);

        // Server accepted the registration but the start was lost
        camera.set_status(SessionState::Idle);
        camera.clear_calls();
        service.update().unwrap();
        assert_eq!(camera.calls(), vec!["start"]);

        camera.set_status(SessionState::Running);
        service.update().unwrap();
        assert_eq!(*restarts.lock().unwrap(), 1);

        service.update().unwrap();
        assert_eq!(*restarts.lock().unwrap(), 1, "Callback fires once per restart");
    }

    #[test]
    fn test_offline_with_finished_worker_reconnects() {
        let camera = FakeCamera::default();
        let (mut service, connects) = service(&camera);
        service.init().unwrap();
        camera.set_status(SessionState::Running);
        service.update().unwrap();

        camera.set_status(SessionState::Offline);
        camera.0.lock().unwrap().worker_finished = true;
        service.update().unwrap();
        assert_eq!(*connects.lock().unwrap(), 2);
    }

    #[test]
    fn test_frame_after_pause_is_skipped() {
        let camera = FakeCamera::default();
        let mut service = running(&camera);
        camera.push_frame(1, 5 * NS_PER_MS, PixelFormat::Rgb888);
        camera.push_frame(2, 6 * NS_PER_MS, PixelFormat::Rgb888);

        service.pause(true);
        service.pause(false);
        assert!(service.get_frame(0).is_none());
        assert_eq!(camera.0.lock().unwrap().released, vec![1]);

        let frame = service.get_frame(0).expect("second frame");
        assert_eq!(frame.frame_id, 2);
        assert_eq!(frame.timestamp_ms, 6);
        assert_eq!(frame.pixels, vec![1, 2, 3, 4, 5, 6]);
        assert!(service.release_frame(2));
    }

    #[test]
    fn test_frame_timestamp_is_requested_in_ns() {
        let camera = FakeCamera::default();
        let mut service = running(&camera);

        assert!(service.get_frame(1500).is_none());
        assert_eq!(camera.calls(), vec!["acquire(1500000000)"]);
    }

    #[test]
    fn test_setting_temporarily_unpauses() {
        let camera = FakeCamera::default();
        let mut service = running(&camera);
        service.pause(true);
        camera.clear_calls();

        service.set_exposure(20, 1.5);
        assert_eq!(camera.calls(), vec!["pause(false)", "exposure(20)"]);

        camera.clear_calls();
        for _ in 0..TICKS_BEFORE_REPAUSE {
            service.update().unwrap();
        }
        assert!(camera.calls().is_empty(), "Still temporarily unpaused");

        service.update().unwrap();
        assert_eq!(camera.calls(), vec!["pause(true)"]);
    }

    #[test]
    fn test_format_change_blocks_exposure_until_new_frame() {
        let camera = FakeCamera::default();
        let mut service = running(&camera);

        service.set_capture_format(PixelFormat::Yuv420sp);
        service.set_exposure(20, 1.0);
        service.set_white_balance(1.0, 1.0, 1.0);
        assert_eq!(camera.calls(), vec!["format(Yuv420sp)"]);

        camera.push_frame(1, NS_PER_MS, PixelFormat::Yuv420sp);
        let frame = service.get_frame(0).expect("frame in new format");
        assert_eq!(frame.format, PixelFormat::Yuv420sp);

        camera.clear_calls();
        service.set_exposure(20, 1.0);
        assert_eq!(camera.calls(), vec!["exposure(20)"]);
    }

    #[test]
    fn test_settings_ignored_until_ready() {
        let camera = FakeCamera::default();
        let (mut service, _) = service(&camera);
        service.init().unwrap();
        camera.clear_calls();

        service.set_exposure(10, 1.0);
        service.set_capture_snapshot(true);
        assert!(service.get_frame(0).is_none());
        assert!(!service.release_frame(1));
        assert!(camera.calls().is_empty());
    }
}
